//! # Self-Map
//!
//! Identity, belief, value, qualia and archetype nodes, plus the recursive
//! self-model chain:
//!
//! ```text
//! level N --observes--> level N-1 --observes--> ... --observes--> level 0 (base self)
//!    ^
//!    +--summarizes-- meta node (observed_depth = N)
//! ```
//!
//! Levels strictly decrease along `observes` edges and never exceed the
//! configured maximum depth, so the chain is a bounded path, never a loop.
//! Every mutation goes through the Transaction Manager.
//!
//! ## Structural guard
//!
//! Only the chain maintenance in this module writes self-model and meta
//! nodes or `observes`/`summarizes` edges. Every other writer (plugins,
//! `add_node`, `connect`, `update_belief`, retirement) passes through
//! [`check_external_write`], which also keeps memory nodes with the memory
//! subsystem and published archetypes immutable.

use crate::canonical::{Content, ContentHash, hash_canonical};
use crate::clock::Clock;
use crate::config::GnosisConfig;
use crate::primitives::{OBSERVES_RELATION, SUMMARIZES_RELATION};
use crate::store::EntityStore;
use crate::transaction::TransactionManager;
use crate::types::{
    Actor, EdgeData, Entity, EntityId, EntityKind, EntityWrite, GnosisError, NodeData, NodeLabel,
    Payload, Polarity, Provenance, VersionedId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::mem::discriminant;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Edge relations written only by the self-model chain.
pub const RESERVED_RELATIONS: [&str; 2] = [OBSERVES_RELATION, SUMMARIZES_RELATION];

// =============================================================================
// STRUCTURAL GUARD
// =============================================================================

fn is_reserved(relation: &str) -> bool {
    RESERVED_RELATIONS.contains(&relation)
}

fn refuse(message: String) -> Result<(), GnosisError> {
    Err(GnosisError::Validation(message))
}

/// Check a write that does not come from the chain maintenance itself.
///
/// `current` is the latest version of `write.id`, if the entity exists.
///
/// - `observes` and `summarizes` edges can be neither created nor touched.
/// - Self-model, meta, memory and archetype nodes cannot be created here.
/// - Meta and memory nodes and archetypes cannot be updated or retired.
/// - A self-model node may get new content but must keep its exact label
///   (level and target), and cannot be retired.
/// - Any other node keeps its label kind across versions.
pub fn check_external_write(
    current: Option<&Entity>,
    write: &EntityWrite,
) -> Result<(), GnosisError> {
    if let Some(edge) = write.payload.as_edge().filter(|e| is_reserved(&e.relation)) {
        return refuse(format!(
            "relation '{}' is reserved for the self-model chain",
            edge.relation
        ));
    }

    let Some(current) = current else {
        return match write.payload.as_node().map(|n| &n.label) {
            Some(
                NodeLabel::SelfModel { .. }
                | NodeLabel::Meta { .. }
                | NodeLabel::Memory { .. }
                | NodeLabel::Archetype,
            ) => refuse(
                "self-model, meta, memory and archetype nodes have dedicated constructors".into(),
            ),
            _ => Ok(()),
        };
    };

    if let Some(edge) = current.as_edge() {
        if is_reserved(&edge.relation) {
            return refuse(format!("edge {} belongs to the self-model chain", current.id));
        }
        return Ok(());
    }

    let Some(node) = current.as_node() else {
        return Ok(());
    };
    match &node.label {
        NodeLabel::Meta { .. } => refuse(format!("meta node {} is derived", current.id)),
        NodeLabel::Memory { .. } => refuse(format!(
            "memory node {} is owned by the memory subsystem",
            current.id
        )),
        NodeLabel::Archetype => refuse(format!(
            "archetype {} is immutable once published",
            current.id
        )),
        NodeLabel::SelfModel { .. } => match write.payload.as_node() {
            Some(next) if next.label == node.label => Ok(()),
            _ => refuse(format!(
                "self-model node {} must keep its level and target",
                current.id
            )),
        },
        label => match write.payload.as_node() {
            Some(next) if discriminant(&next.label) != discriminant(label) => refuse(format!(
                "node {} cannot change its label",
                current.id
            )),
            _ => Ok(()),
        },
    }
}

/// [`check_external_write`] for plugin handlers, which may not write a
/// self-model node at all.
pub fn check_plugin_write(
    current: Option<&Entity>,
    write: &EntityWrite,
) -> Result<(), GnosisError> {
    if let Some(current) = current.filter(|e| {
        e.as_node()
            .is_some_and(|n| matches!(n.label, NodeLabel::SelfModel { .. }))
    }) {
        return refuse(format!(
            "self-model node {} is maintained by the self-map",
            current.id
        ));
    }
    check_external_write(current, write)
}

/// One link of the self-model chain, or a meta node summarizing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfModelNode {
    pub entity_id: EntityId,
    /// 0 is the base self; a meta node reports `observed_depth + 1`.
    pub level: u32,
    pub observed_at: DateTime<Utc>,
    /// The entity this node models. The base self targets itself.
    pub target_ref: EntityId,
}

impl SelfModelNode {
    /// Read a self-model or meta node out of an entity version.
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        let (level, target) = match &entity.as_node()?.label {
            NodeLabel::SelfModel { level, target } => (*level, target.unwrap_or(entity.id)),
            NodeLabel::Meta {
                observed_depth,
                target,
            } => (observed_depth.saturating_add(1), *target),
            _ => return None,
        };
        Some(Self {
            entity_id: entity.id,
            level,
            observed_at: entity.committed_at,
            target_ref: target,
        })
    }
}

/// A self-map node ranked by the salience stored in its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalientNode {
    pub entity_id: EntityId,
    pub label: NodeLabel,
    /// `content.salience`, 1.0 when unset.
    pub salience: f64,
}

/// The summary a meta node carries. Contains no timestamps, so observing an
/// unchanged chain always produces the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChainSummary {
    observed_depth: u32,
    levels: Vec<LevelSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LevelSummary {
    level: u32,
    entity_id: EntityId,
    version: u64,
    payload_hash: ContentHash,
}

#[derive(Debug, Default)]
struct Registry {
    levels: BTreeMap<u32, EntityId>,
    meta: BTreeMap<u32, EntityId>,
}

/// The self-referential part of the graph.
#[derive(Debug)]
pub struct SelfMap {
    store: Arc<EntityStore>,
    transactions: Arc<TransactionManager>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
    feedback_decay: f64,
    registry: RwLock<Registry>,
    subscribers: Mutex<Vec<Sender<Arc<Entity>>>>,
}

impl SelfMap {
    /// Build the self-map, rebuilding the level registry from the store.
    pub fn new(
        store: Arc<EntityStore>,
        transactions: Arc<TransactionManager>,
        clock: Arc<dyn Clock>,
        config: &GnosisConfig,
    ) -> Self {
        let mut registry = Registry::default();
        let nodes = store.nodes_where(|label| {
            matches!(label, NodeLabel::SelfModel { .. } | NodeLabel::Meta { .. })
        });
        for entity in &nodes {
            let Some(node) = entity.as_node() else {
                continue;
            };
            let (slot, key) = match node.label {
                NodeLabel::SelfModel { level, .. } => (&mut registry.levels, level),
                NodeLabel::Meta { observed_depth, .. } => (&mut registry.meta, observed_depth),
                _ => continue,
            };
            if let Some(existing) = slot.insert(key, entity.id) {
                warn!(level = key, kept = %entity.id, dropped = %existing, "duplicate self-model level");
            }
        }
        if !registry.levels.is_empty() {
            info!(levels = registry.levels.len(), "self-model chain rebuilt from store");
        }

        Self {
            store,
            transactions,
            clock,
            max_depth: config.max_self_model_depth,
            feedback_decay: config.feedback_decay,
            registry: RwLock::new(registry),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn node_at(&self, id: EntityId) -> Result<SelfModelNode, GnosisError> {
        let entity = self.store.get(id, None)?;
        SelfModelNode::from_entity(&entity).ok_or_else(|| {
            GnosisError::Precondition(format!("entity {} is not a self-model node", id))
        })
    }

    // -------------------------------------------------------------------------
    // Self-model chain
    // -------------------------------------------------------------------------

    /// Create the level-0 node. Fails if one already exists.
    pub fn create_base_self(
        &self,
        content: impl Into<Content>,
        provenance: Provenance,
    ) -> Result<SelfModelNode, GnosisError> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = registry.levels.get(&0) {
            return Err(GnosisError::Precondition(format!(
                "base self already exists: {}",
                existing
            )));
        }

        let payload = Payload::node(
            NodeLabel::SelfModel {
                level: 0,
                target: None,
            },
            content,
        )
        .with_tags(["identity"]);
        let write = EntityWrite::create(payload, provenance);
        let id = write.id;
        self.transactions.execute(Actor::System, vec![write])?;
        registry.levels.insert(0, id);
        drop(registry);

        info!(base = %id, "base self created");
        self.node_at(id)
    }

    /// Build (or extend) the chain so levels `0..=levels` exist, each level
    /// `L` observing level `L-1`. Existing levels are reused.
    pub fn create_recursive_self_model(
        &self,
        levels: u32,
    ) -> Result<Vec<SelfModelNode>, GnosisError> {
        if levels > self.max_depth {
            return Err(GnosisError::Precondition(format!(
                "requested {} levels, maximum is {}",
                levels, self.max_depth
            )));
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(&base) = registry.levels.get(&0) else {
            return Err(GnosisError::Precondition(
                "base self (level 0) does not exist".into(),
            ));
        };

        let now = self.clock.now();
        let mut writes = Vec::new();
        let mut created = BTreeMap::new();
        let mut below = base;
        for level in 1..=levels {
            if let Some(&existing) = registry.levels.get(&level) {
                below = existing;
                continue;
            }
            let node = EntityWrite::create(
                Payload::node(
                    NodeLabel::SelfModel {
                        level,
                        target: Some(below),
                    },
                    json!({ "level": level, "models": below.to_string() }),
                ),
                Provenance::new(now).derived_from(below),
            );
            let edge = EntityWrite::create(
                Payload::edge(node.id, below, OBSERVES_RELATION),
                Provenance::new(now),
            );
            created.insert(level, node.id);
            below = node.id;
            writes.push(node);
            writes.push(edge);
        }

        if !writes.is_empty() {
            self.transactions.execute(Actor::System, writes)?;
            debug!(new_levels = created.len(), "self-model chain extended");
            registry.levels.extend(created);
        }

        let ids: Vec<EntityId> = (0..=levels)
            .filter_map(|level| registry.levels.get(&level).copied())
            .collect();
        drop(registry);
        ids.into_iter().map(|id| self.node_at(id)).collect()
    }

    /// Summarize levels `0..=depth` into a meta node.
    ///
    /// The meta payload depends only on each level's id, version and payload
    /// hash. Observing an unchanged chain writes nothing and returns the same
    /// node.
    pub fn observe_self_modeling(&self, depth: u32) -> Result<SelfModelNode, GnosisError> {
        if depth > self.max_depth {
            return Err(GnosisError::Precondition(format!(
                "observation depth {} exceeds maximum {}",
                depth, self.max_depth
            )));
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut levels = Vec::new();
        for level in 0..=depth {
            let id = registry.levels.get(&level).copied().ok_or_else(|| {
                GnosisError::Precondition(format!("self-model level {} does not exist", level))
            })?;
            let entity = self.store.get(id, None)?;
            levels.push(LevelSummary {
                level,
                entity_id: id,
                version: entity.version,
                payload_hash: entity.payload_hash()?,
            });
        }
        let top = levels
            .last()
            .map(|l| l.entity_id)
            .ok_or_else(|| GnosisError::Precondition("empty self-model chain".into()))?;

        let summary = ChainSummary {
            observed_depth: depth,
            levels,
        };
        let content = serde_json::to_value(&summary)
            .map_err(|e| GnosisError::Serialization(e.to_string()))?;
        let payload = Payload::node(
            NodeLabel::Meta {
                observed_depth: depth,
                target: top,
            },
            content,
        );

        let now = self.clock.now();
        let meta_id = match registry.meta.get(&depth).copied() {
            Some(existing) => {
                let current = self.store.get(existing, None)?;
                if hash_canonical(&current.payload)? == hash_canonical(&payload)? {
                    debug!(meta = %existing, depth, "self-observation unchanged");
                } else {
                    let update = EntityWrite::update(
                        existing,
                        current.version,
                        payload,
                        Provenance::new(now).derived_from(top),
                    );
                    self.transactions.execute(Actor::System, vec![update])?;
                    debug!(meta = %existing, depth, "self-observation updated");
                }
                existing
            }
            None => {
                let node = EntityWrite::create(payload, Provenance::new(now).derived_from(top));
                let edge = EntityWrite::create(
                    Payload::edge(node.id, top, SUMMARIZES_RELATION),
                    Provenance::new(now),
                );
                let id = node.id;
                self.transactions.execute(Actor::System, vec![node, edge])?;
                registry.meta.insert(depth, id);
                debug!(meta = %id, depth, "self-observation created");
                id
            }
        };
        drop(registry);
        self.node_at(meta_id)
    }

    /// The chain, level 0 first.
    pub fn chain(&self) -> Result<Vec<SelfModelNode>, GnosisError> {
        let ids: Vec<EntityId> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .levels
            .values()
            .copied()
            .collect();
        ids.into_iter().map(|id| self.node_at(id)).collect()
    }

    /// Meta node for an observation depth, if one was made.
    pub fn meta_node(&self, depth: u32) -> Option<EntityId> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .meta
            .get(&depth)
            .copied()
    }

    /// Check the chain's structure.
    ///
    /// Levels must run `0..=top` without gaps, every node must still be a
    /// self-model node at its registered level, and each level must have
    /// exactly one outgoing `observes` edge (to the level below, none for the
    /// base self) and exactly one incoming one (from the level above, none
    /// for the top). Returns the number of levels.
    pub fn verify_chain(&self) -> Result<usize, GnosisError> {
        let levels: Vec<(u32, EntityId)> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .levels
            .iter()
            .map(|(level, id)| (*level, *id))
            .collect();

        for (position, &(level, id)) in levels.iter().enumerate() {
            if level as usize != position {
                return Err(GnosisError::Precondition(format!(
                    "self-model level {} is missing",
                    position
                )));
            }
            let node = self.node_at(id)?;
            if node.level != level {
                return Err(GnosisError::Precondition(format!(
                    "entity {} is registered at level {} but reports level {}",
                    id, level, node.level
                )));
            }
        }

        let graph = self.store.graph();
        for (position, &(level, id)) in levels.iter().enumerate() {
            let observes: Vec<(EntityId, EntityId)> = graph
                .incident_edges(id)
                .into_iter()
                .filter_map(|edge| graph.edge(edge))
                .filter(|edge| edge.relation == OBSERVES_RELATION)
                .map(|edge| (edge.from, edge.to))
                .collect();
            let down: Vec<EntityId> = observes
                .iter()
                .filter(|(from, _)| *from == id)
                .map(|(_, to)| *to)
                .collect();
            let up: Vec<EntityId> = observes
                .iter()
                .filter(|(_, to)| *to == id)
                .map(|(from, _)| *from)
                .collect();

            let below: Vec<EntityId> = position
                .checked_sub(1)
                .and_then(|p| levels.get(p))
                .map(|(_, below)| *below)
                .into_iter()
                .collect();
            let above: Vec<EntityId> = levels
                .get(position + 1)
                .map(|(_, above)| *above)
                .into_iter()
                .collect();

            if down != below {
                return Err(GnosisError::Precondition(format!(
                    "level {} observes {:?}, expected {:?}",
                    level, down, below
                )));
            }
            if up != above {
                return Err(GnosisError::Precondition(format!(
                    "level {} is observed by {:?}, expected {:?}",
                    level, up, above
                )));
            }
        }
        Ok(levels.len())
    }

    // -------------------------------------------------------------------------
    // Beliefs and other nodes
    // -------------------------------------------------------------------------

    /// Add an identity, belief, value, qualia or generic node. Archetypes go
    /// through [`SelfMap::publish_archetype`].
    pub fn add_node(
        &self,
        label: NodeLabel,
        content: impl Into<Content>,
        tags: BTreeSet<String>,
        provenance: Provenance,
    ) -> Result<EntityId, GnosisError> {
        let write = EntityWrite::create(Payload::node(label, content).with_tags(tags), provenance);
        check_external_write(None, &write)?;
        let id = write.id;
        self.transactions.execute(Actor::System, vec![write])?;
        Ok(id)
    }

    /// Add an edge between two existing entities.
    pub fn connect(
        &self,
        from: EntityId,
        to: EntityId,
        relation: impl Into<String>,
        polarity: Polarity,
        weight: f64,
    ) -> Result<EntityId, GnosisError> {
        let payload = Payload::Edge(EdgeData {
            from,
            to,
            relation: relation.into(),
            polarity,
            weight,
        });
        let write = EntityWrite::create(payload, Provenance::new(self.clock.now()));
        check_external_write(None, &write)?;
        let id = write.id;
        self.transactions.execute(Actor::System, vec![write])?;
        Ok(id)
    }

    /// Write a new version of an existing node. Never mutates in place.
    ///
    /// The label may not change; on a self-model node only the content and
    /// tags are replaced.
    pub fn update_belief(
        &self,
        entity_id: EntityId,
        new_payload: Payload,
        provenance: Provenance,
    ) -> Result<VersionedId, GnosisError> {
        provenance.validate()?;
        let current = self.store.get(entity_id, None)?;
        if current.as_node().is_none() || new_payload.as_node().is_none() {
            return Err(GnosisError::Validation(format!(
                "update_belief expects node payloads ({})",
                entity_id
            )));
        }
        let write = EntityWrite::update(entity_id, current.version, new_payload, provenance);
        check_external_write(Some(&current), &write)?;
        let mut ids = self.transactions.execute(Actor::System, vec![write])?;
        ids.pop()
            .ok_or_else(|| GnosisError::Storage("empty commit result".into()))
    }

    // -------------------------------------------------------------------------
    // Retirement
    // -------------------------------------------------------------------------

    /// Tombstone a node together with every edge still attached to it.
    pub fn remove_node(&self, id: EntityId) -> Result<Vec<VersionedId>, GnosisError> {
        let current = self.store.get(id, None)?;
        if current.as_node().is_none() {
            return Err(GnosisError::Validation(format!("{} is not a live node", id)));
        }
        let now = self.clock.now();
        let edges = self.store.graph().incident_edges(id);
        let mut writes = Vec::new();
        for edge_id in edges {
            let edge = self.store.get(edge_id, None)?;
            let write = EntityWrite::retire(edge_id, EntityKind::Edge, Provenance::new(now));
            check_external_write(Some(&edge), &write)?;
            writes.push(write);
        }
        let write = EntityWrite::retire(id, EntityKind::Node, Provenance::new(now));
        check_external_write(Some(&current), &write)?;
        writes.push(write);

        let ids = self.transactions.execute(Actor::System, writes)?;
        debug!(node = %id, edges = ids.len().saturating_sub(1), "node retired");
        Ok(ids)
    }

    /// Tombstone one edge.
    pub fn remove_connection(&self, edge_id: EntityId) -> Result<VersionedId, GnosisError> {
        let current = self.store.get(edge_id, None)?;
        if current.as_edge().is_none() {
            return Err(GnosisError::Validation(format!(
                "{} is not a live edge",
                edge_id
            )));
        }
        let write = EntityWrite::retire(
            edge_id,
            EntityKind::Edge,
            Provenance::new(self.clock.now()),
        );
        check_external_write(Some(&current), &write)?;
        let mut ids = self.transactions.execute(Actor::System, vec![write])?;
        ids.pop()
            .ok_or_else(|| GnosisError::Storage("empty commit result".into()))
    }

    // -------------------------------------------------------------------------
    // Salience
    // -------------------------------------------------------------------------

    /// Fold a felt response into a node's `content.salience`, written as a
    /// new version.
    ///
    /// `salience = clamp(salience * feedback_decay + valence * intensity, 0, 1)`
    pub fn apply_qualia(
        &self,
        target: EntityId,
        valence: f64,
        intensity: f64,
    ) -> Result<f64, GnosisError> {
        if !valence.is_finite() || !(-1.0..=1.0).contains(&valence) {
            return Err(GnosisError::Validation(format!(
                "valence {} outside [-1, 1]",
                valence
            )));
        }
        if !intensity.is_finite() || !(0.0..=1.0).contains(&intensity) {
            return Err(GnosisError::Validation(format!(
                "intensity {} outside [0, 1]",
                intensity
            )));
        }

        let current = self.store.get(target, None)?;
        let Some(node) = current.as_node() else {
            return Err(GnosisError::Validation(format!("{} is not a live node", target)));
        };
        let Some(fields) = node.content.as_value().as_object() else {
            return Err(GnosisError::Validation(format!(
                "node {} content is not an object",
                target
            )));
        };

        let salience = (salience_of(&node.content) * self.feedback_decay + valence * intensity)
            .clamp(0.0, 1.0);
        let mut fields = fields.clone();
        fields.insert("salience".into(), json!(salience));
        let payload = Payload::Node(NodeData {
            label: node.label.clone(),
            content: Content(Value::Object(fields)),
            tags: node.tags.clone(),
        });
        let write = EntityWrite::update(
            target,
            current.version,
            payload,
            Provenance::new(self.clock.now()),
        );
        check_external_write(Some(&current), &write)?;
        self.transactions.execute(Actor::System, vec![write])?;
        debug!(node = %target, salience, "qualia feedback applied");
        Ok(salience)
    }

    /// The `top_n` live self-map nodes with the highest stored salience.
    /// Memory and meta nodes are not ranked here.
    pub fn salient_nodes(&self, top_n: usize) -> Vec<SalientNode> {
        let mut nodes: Vec<SalientNode> = self
            .store
            .nodes_where(|label| !matches!(label, NodeLabel::Memory { .. } | NodeLabel::Meta { .. }))
            .iter()
            .filter_map(|entity| {
                let node = entity.as_node()?;
                Some(SalientNode {
                    entity_id: entity.id,
                    label: node.label.clone(),
                    salience: salience_of(&node.content),
                })
            })
            .collect();
        nodes.sort_by(|a, b| b.salience.total_cmp(&a.salience));
        nodes.truncate(top_n);
        nodes
    }

    // -------------------------------------------------------------------------
    // Archetypes
    // -------------------------------------------------------------------------

    /// Publish an archetype under `id`, once.
    ///
    /// Archetypes never get a second version; a revised pattern is published
    /// under a new id. Every live subscriber receives the committed entity.
    pub fn publish_archetype(
        &self,
        id: EntityId,
        content: impl Into<Content>,
        tags: BTreeSet<String>,
        provenance: Provenance,
    ) -> Result<EntityId, GnosisError> {
        if self.store.contains(id) {
            return Err(GnosisError::Conflict {
                id,
                reason: "already published; publish revisions under a new id".into(),
            });
        }
        let mut write = EntityWrite::create(
            Payload::node(NodeLabel::Archetype, content).with_tags(tags),
            provenance,
        );
        write.id = id;
        self.transactions.execute(Actor::System, vec![write])?;

        let entity = self.store.get(id, None)?;
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(Arc::clone(&entity)).is_ok());
        info!(archetype = %id, subscribers = subscribers.len(), "archetype published");
        Ok(id)
    }

    /// Receive every archetype published from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe_archetypes(&self) -> Receiver<Arc<Entity>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

fn salience_of(content: &Content) -> f64 {
    content
        .as_value()
        .get("salience")
        .and_then(Value::as_f64)
        .unwrap_or(1.0)
}
