//! # Entity Store
//!
//! Append-only store of immutable, versioned entities.
//!
//! Every committed write produces a new `Entity` version; nothing is ever
//! updated in place. The store owns all versions, and the [`GraphIndex`] is
//! kept beside them under the same lock so one commit updates both at once.
//!
//! ## Write-ahead ordering
//!
//! A batch is validated, then appended to the [`Journal`], and only then
//! folded into the in-memory state. A journal failure leaves nothing visible.

use crate::clock::Clock;
use crate::graph::GraphIndex;
use crate::primitives::{MAX_NAME_LENGTH, MAX_PROVENANCE_DEPTH};
use crate::storage::{Journal, MemoryJournal};
use crate::types::{
    Base, Entity, EntityId, EntityKind, EntityWrite, GnosisError, NodeLabel, Payload, TxId,
    VersionedId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Default)]
struct StoreInner {
    /// id -> versions, oldest first. The last element is the latest.
    versions: BTreeMap<EntityId, Vec<Arc<Entity>>>,
    graph: GraphIndex,
    version_count: usize,
    max_tx: u64,
}

impl StoreInner {
    fn latest(&self, id: EntityId) -> Option<&Arc<Entity>> {
        self.versions.get(&id).and_then(|versions| versions.last())
    }

    fn insert(&mut self, entity: Entity) {
        if let Some(tx) = entity.tx_id {
            self.max_tx = self.max_tx.max(tx.0);
        }
        let entity = Arc::new(entity);
        self.graph.apply(&entity);
        self.versions.entry(entity.id).or_default().push(entity);
        self.version_count = self.version_count.saturating_add(1);
    }
}

/// What crash recovery found while replaying the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Distinct entity ids recovered.
    pub entities: usize,
    /// Entity versions replayed.
    pub versions: usize,
    /// Latest-index entries that disagreed with the log and were rewritten.
    pub index_repairs: usize,
}

/// Point-in-time copy of all versions and the graph index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub versions: BTreeMap<EntityId, Vec<Arc<Entity>>>,
    pub graph: GraphIndex,
}

/// Read guard exposing the graph index. Holds the store's read lock, so
/// keep it short-lived.
pub struct GraphView<'a> {
    guard: RwLockReadGuard<'a, StoreInner>,
}

impl Deref for GraphView<'_> {
    type Target = GraphIndex;

    fn deref(&self) -> &GraphIndex {
        &self.guard.graph
    }
}

/// All versions of one entity, newest first when iterated.
///
/// `iter()` may be called any number of times.
#[derive(Debug, Clone)]
pub struct History {
    id: EntityId,
    versions: Vec<Arc<Entity>>,
}

impl History {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Entity> + '_ {
        self.versions.iter().rev().map(Arc::as_ref)
    }

    pub fn latest(&self) -> Option<&Entity> {
        self.versions.last().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

// =============================================================================
// ENTITY STORE
// =============================================================================

/// The shared, append-only entity store.
#[derive(Debug)]
pub struct EntityStore {
    inner: RwLock<StoreInner>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    /// Open the store over a journal, replaying its log.
    ///
    /// The latest-version index is rebuilt from the log; persisted index
    /// entries that disagree are rewritten and counted in the report.
    pub fn open(
        journal: Arc<dyn Journal>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport), GnosisError> {
        let mut inner = StoreInner::default();

        for entity in journal.load_entities()? {
            let expected = inner.latest(entity.id).map_or(1, |e| e.version.saturating_add(1));
            if entity.version != expected {
                return Err(GnosisError::Storage(format!(
                    "journal out of order: {} has version {} (expected {})",
                    entity.id, entity.version, expected
                )));
            }
            inner.insert(entity);
        }

        let derived: BTreeMap<EntityId, u64> = inner
            .versions
            .iter()
            .filter_map(|(id, versions)| versions.last().map(|e| (*id, e.version)))
            .collect();
        let persisted = journal.load_latest_index()?;
        let keys: BTreeSet<&EntityId> = derived.keys().chain(persisted.keys()).collect();
        let index_repairs = keys
            .into_iter()
            .filter(|id| derived.get(id) != persisted.get(id))
            .count();
        if index_repairs > 0 {
            warn!(
                repairs = index_repairs,
                "latest-version index disagreed with entity log; rebuilding"
            );
            journal.store_latest_index(&derived)?;
        }

        let report = RecoveryReport {
            entities: inner.versions.len(),
            versions: inner.version_count,
            index_repairs,
        };
        info!(
            entities = report.entities,
            versions = report.versions,
            "entity store recovered"
        );

        Ok((
            Self {
                inner: RwLock::new(inner),
                journal,
                clock,
            },
            report,
        ))
    }

    /// An empty store over a volatile journal.
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            journal: Arc::new(MemoryJournal::new()),
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Append a single write outside any transaction.
    pub fn append(&self, write: EntityWrite) -> Result<VersionedId, GnosisError> {
        let mut ids = self.commit_batch(std::slice::from_ref(&write), None)?;
        ids.pop()
            .ok_or_else(|| GnosisError::Storage("empty commit result".into()))
    }

    /// Validate and durably append a batch of writes atomically.
    ///
    /// Every base expectation is checked under the write lock before anything
    /// is journaled. Several writes to the same id chain their versions in
    /// order. Edge endpoints must exist or be created in the same batch.
    pub fn commit_batch(
        &self,
        writes: &[EntityWrite],
        tx: Option<TxId>,
    ) -> Result<Vec<VersionedId>, GnosisError> {
        for write in writes {
            validate_write(write)?;
        }
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let batch_ids: BTreeSet<EntityId> = writes.iter().map(|w| w.id).collect();
        let retiring: BTreeSet<EntityId> = writes
            .iter()
            .filter(|w| w.payload.is_retired())
            .map(|w| w.id)
            .collect();
        let mut inner = self.write();
        let now = self.clock.now();
        // id -> (version, kind, retired)
        let mut working: BTreeMap<EntityId, (u64, EntityKind, bool)> = BTreeMap::new();
        let mut entities = Vec::with_capacity(writes.len());

        for write in writes {
            let current = working
                .get(&write.id)
                .copied()
                .or_else(|| {
                    inner
                        .latest(write.id)
                        .map(|e| (e.version, e.kind, e.is_retired()))
                });
            let current_version = current.map(|(v, _, _)| v);

            if current.is_some_and(|(_, _, retired)| retired) {
                return Err(GnosisError::Validation(format!(
                    "entity {} is retired",
                    write.id
                )));
            }

            match write.base {
                Base::Absent => {
                    if let Some(found) = current_version {
                        return Err(GnosisError::Conflict {
                            id: write.id,
                            reason: format!("expected new entity, found version {}", found),
                        });
                    }
                }
                Base::Version(expected) => {
                    if current_version != Some(expected) {
                        return Err(GnosisError::Conflict {
                            id: write.id,
                            reason: format!(
                                "expected base version {}, found {}",
                                expected,
                                current_version.map_or_else(|| "none".to_string(), |v| v.to_string())
                            ),
                        });
                    }
                }
                Base::Latest => {}
            }

            let kind = write.payload.kind();
            if let Some((_, existing, _)) = current.filter(|(_, k, _)| *k != kind) {
                return Err(GnosisError::Validation(format!(
                    "entity {} is a {:?}, cannot write a {:?} version",
                    write.id, existing, kind
                )));
            }

            match &write.payload {
                Payload::Edge(edge) => {
                    for endpoint in [edge.from, edge.to] {
                        if !inner.versions.contains_key(&endpoint) && !batch_ids.contains(&endpoint)
                        {
                            return Err(GnosisError::Validation(format!(
                                "edge endpoint {} does not exist",
                                endpoint
                            )));
                        }
                        let retired = retiring.contains(&endpoint)
                            || inner.latest(endpoint).is_some_and(|e| e.is_retired());
                        if retired {
                            return Err(GnosisError::Validation(format!(
                                "edge endpoint {} is retired",
                                endpoint
                            )));
                        }
                    }
                }
                Payload::Retired(_) if current.is_none() => {
                    return Err(GnosisError::NotFound {
                        id: write.id,
                        version: None,
                    });
                }
                Payload::Retired(EntityKind::Node) => {
                    if let Some(edge) = inner
                        .graph
                        .incident_edges(write.id)
                        .into_iter()
                        .find(|edge| !retiring.contains(edge))
                    {
                        return Err(GnosisError::Validation(format!(
                            "node {} still has live edge {}",
                            write.id, edge
                        )));
                    }
                }
                _ => {}
            }

            let version = current_version.map_or(1, |v| v.saturating_add(1));
            entities.push(Entity {
                id: write.id,
                kind,
                version,
                prev_version: current_version,
                payload: write.payload.clone(),
                provenance: write.provenance.clone(),
                created_by: write.created_by.clone(),
                tx_id: tx,
                committed_at: now,
            });
            working.insert(write.id, (version, kind, write.payload.is_retired()));
        }

        self.journal.append_entities(&entities)?;

        let ids: Vec<VersionedId> = entities.iter().map(Entity::versioned_id).collect();
        for entity in entities {
            inner.insert(entity);
        }
        debug!(versions = ids.len(), tx = ?tx, "committed entity batch");
        Ok(ids)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch one version of an entity, or the latest when `version` is `None`.
    pub fn get(&self, id: EntityId, version: Option<u64>) -> Result<Arc<Entity>, GnosisError> {
        let inner = self.read();
        let versions = inner
            .versions
            .get(&id)
            .ok_or(GnosisError::NotFound { id, version })?;
        let found = match version {
            None => versions.last(),
            Some(v) => v
                .checked_sub(1)
                .and_then(|index| versions.get(usize::try_from(index).ok()?)),
        };
        found.cloned().ok_or(GnosisError::NotFound { id, version })
    }

    /// Latest version number of an entity.
    pub fn latest(&self, id: EntityId) -> Option<u64> {
        self.read().latest(id).map(|e| e.version)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.read().versions.contains_key(&id)
    }

    /// All versions of an entity, newest first when iterated.
    pub fn history(&self, id: EntityId) -> Result<History, GnosisError> {
        let inner = self.read();
        let versions = inner
            .versions
            .get(&id)
            .ok_or(GnosisError::NotFound { id, version: None })?;
        Ok(History {
            id,
            versions: versions.clone(),
        })
    }

    pub fn entity_count(&self) -> usize {
        self.read().versions.len()
    }

    pub fn version_count(&self) -> usize {
        self.read().version_count
    }

    /// Latest version of every entity, ordered by id.
    pub fn latest_entities(&self) -> Vec<Arc<Entity>> {
        self.read()
            .versions
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect()
    }

    /// Latest node versions whose label matches `predicate`.
    pub fn nodes_where<F>(&self, mut predicate: F) -> Vec<Arc<Entity>>
    where
        F: FnMut(&NodeLabel) -> bool,
    {
        self.read()
            .versions
            .values()
            .filter_map(|versions| versions.last())
            .filter(|e| e.as_node().is_some_and(|node| predicate(&node.label)))
            .cloned()
            .collect()
    }

    /// Follow `provenance.source_id` backwards from the latest version of `id`.
    ///
    /// Returns the chain oldest first, ending with `id` itself. Stops at a
    /// missing source, a cycle, or after `max_depth` hops.
    pub fn trace_provenance(
        &self,
        id: EntityId,
        max_depth: usize,
    ) -> Result<Vec<Arc<Entity>>, GnosisError> {
        let inner = self.read();
        let start = inner
            .latest(id)
            .cloned()
            .ok_or(GnosisError::NotFound { id, version: None })?;

        let max_depth = max_depth.min(MAX_PROVENANCE_DEPTH);
        let mut seen = BTreeSet::from([id]);
        let mut chain = vec![start];

        while chain.len() <= max_depth {
            let Some(source) = chain.last().and_then(|e| e.provenance.source_id) else {
                break;
            };
            if !seen.insert(source) {
                break;
            }
            let Some(entity) = inner.latest(source) else {
                break;
            };
            chain.push(entity.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Borrow the graph index under the store's read lock.
    pub fn graph(&self) -> GraphView<'_> {
        GraphView { guard: self.read() }
    }

    /// Copy of all state, for comparisons.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.read();
        StoreSnapshot {
            versions: inner.versions.clone(),
            graph: inner.graph.clone(),
        }
    }

    /// Highest transaction id seen in the log.
    pub(crate) fn max_tx_id(&self) -> u64 {
        self.read().max_tx
    }
}

// =============================================================================
// READ-ONLY VIEW
// =============================================================================

/// Read-only access to entities, handed to plugin handlers.
#[derive(Debug, Clone)]
pub struct EntityView {
    store: Arc<EntityStore>,
}

impl EntityView {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, id: EntityId, version: Option<u64>) -> Result<Arc<Entity>, GnosisError> {
        self.store.get(id, version)
    }

    pub fn latest(&self, id: EntityId) -> Option<u64> {
        self.store.latest(id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.store.contains(id)
    }

    pub fn history(&self, id: EntityId) -> Result<History, GnosisError> {
        self.store.history(id)
    }

    pub fn neighbors(&self, id: EntityId, relation: Option<&str>) -> BTreeSet<EntityId> {
        self.store.graph().neighbors(id, relation)
    }

    /// Live edges that start or end at `id`.
    pub fn incident_edges(&self, id: EntityId) -> BTreeSet<EntityId> {
        self.store.graph().incident_edges(id)
    }

    /// The store's clock reading, for provenance timestamps.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.store.clock().now()
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Schema and range checks that do not depend on store state.
pub fn validate_write(write: &EntityWrite) -> Result<(), GnosisError> {
    write.provenance.validate()?;
    match &write.payload {
        Payload::Edge(edge) => {
            if !edge.weight.is_finite() {
                return Err(GnosisError::Validation(format!(
                    "edge weight {} is not finite",
                    edge.weight
                )));
            }
            if edge.relation.is_empty() || edge.relation.len() > MAX_NAME_LENGTH {
                return Err(GnosisError::Validation(format!(
                    "edge relation must be 1..={} bytes",
                    MAX_NAME_LENGTH
                )));
            }
        }
        Payload::Node(node) => {
            if let Some(tag) = node.tags.iter().find(|t| t.len() > MAX_NAME_LENGTH) {
                return Err(GnosisError::Validation(format!(
                    "tag '{}...' exceeds {} bytes",
                    tag.chars().take(16).collect::<String>(),
                    MAX_NAME_LENGTH
                )));
            }
            if let NodeLabel::Memory {
                decay_rate,
                valence,
                ..
            } = &node.label
            {
                if !decay_rate.is_finite() || *decay_rate < 0.0 {
                    return Err(GnosisError::Validation(format!(
                        "decay rate {} must be finite and >= 0",
                        decay_rate
                    )));
                }
                if let Some(v) = valence.filter(|v| !v.is_finite() || !(-1.0..=1.0).contains(v)) {
                    return Err(GnosisError::Validation(format!(
                        "valence {} outside [-1, 1]",
                        v
                    )));
                }
            }
        }
        Payload::Retired(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{MemoryType, Provenance};
    use chrono::Utc;
    use serde_json::json;

    fn store() -> EntityStore {
        EntityStore::in_memory(Arc::new(SystemClock))
    }

    fn prov() -> Provenance {
        Provenance::new(Utc::now())
    }

    fn belief(text: &str) -> Payload {
        Payload::node(NodeLabel::Belief, json!({ "claim": text }))
    }

    #[test]
    fn append_assigns_sequential_versions() {
        let store = store();
        let write = EntityWrite::create(belief("a"), prov());
        let id = write.id;

        let v1 = store.append(write).expect("create");
        assert_eq!(v1.version, 1);

        let v2 = store
            .append(EntityWrite::update(id, 1, belief("b"), prov()))
            .expect("update");
        assert_eq!(v2.version, 2);

        let latest = store.get(id, None).expect("latest");
        assert_eq!(latest.prev_version, Some(1));
        assert_eq!(store.get(id, Some(1)).expect("v1").payload, belief("a"));
    }

    #[test]
    fn stale_base_conflicts() {
        let store = store();
        let write = EntityWrite::create(belief("a"), prov());
        let id = write.id;
        store.append(write).expect("create");
        store
            .append(EntityWrite::update(id, 1, belief("b"), prov()))
            .expect("update");

        let result = store.append(EntityWrite::update(id, 1, belief("c"), prov()));
        assert!(matches!(result, Err(GnosisError::Conflict { .. })));
        assert_eq!(store.latest(id), Some(2));
    }

    #[test]
    fn absent_base_conflicts_on_existing_id() {
        let store = store();
        let write = EntityWrite::create(belief("a"), prov());
        store.append(write.clone()).expect("create");
        assert!(matches!(
            store.append(write),
            Err(GnosisError::Conflict { .. })
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = store();
        let id = EntityId::new();
        assert!(matches!(
            store.get(id, None),
            Err(GnosisError::NotFound { .. })
        ));

        let write = EntityWrite::create(belief("a"), prov());
        let id = write.id;
        store.append(write).expect("create");
        assert!(matches!(
            store.get(id, Some(2)),
            Err(GnosisError::NotFound {
                version: Some(2),
                ..
            })
        ));
        assert!(store.get(id, Some(0)).is_err());
    }

    #[test]
    fn history_is_newest_first_and_restartable() {
        let store = store();
        let write = EntityWrite::create(belief("v1"), prov());
        let id = write.id;
        store.append(write).expect("create");
        for v in 1..3 {
            store
                .append(EntityWrite::update(id, v, belief("next"), prov()))
                .expect("update");
        }

        let history = store.history(id).expect("history");
        let first: Vec<u64> = history.iter().map(|e| e.version).collect();
        let second: Vec<u64> = history.iter().map(|e| e.version).collect();
        assert_eq!(first, vec![3, 2, 1]);
        assert_eq!(first, second);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn edges_require_existing_endpoints() {
        let store = store();
        let a = EntityWrite::create(belief("a"), prov());
        let a_id = a.id;
        store.append(a).expect("a");

        let dangling = EntityWrite::create(Payload::edge(a_id, EntityId::new(), "r"), prov());
        assert!(matches!(
            store.append(dangling),
            Err(GnosisError::Validation(_))
        ));

        // Endpoints created in the same batch are fine, in any order.
        let b = EntityWrite::create(belief("b"), prov());
        let edge = EntityWrite::create(Payload::edge(a_id, b.id, "r"), prov());
        store.commit_batch(&[edge, b], None).expect("batch");
        assert_eq!(store.graph().edge_count(), 1);
    }

    #[test]
    fn retirement_removes_from_index_and_ends_history() {
        let store = store();
        let a = EntityWrite::create(belief("a"), prov());
        let b = EntityWrite::create(belief("b"), prov());
        let edge = EntityWrite::create(Payload::edge(a.id, b.id, "supports"), prov());
        let (a_id, b_id, edge_id) = (a.id, b.id, edge.id);
        store.commit_batch(&[a, b, edge], None).expect("batch");

        // A node with a live edge cannot be retired alone.
        assert!(matches!(
            store.append(EntityWrite::retire(b_id, EntityKind::Node, prov())),
            Err(GnosisError::Validation(_))
        ));

        store
            .commit_batch(
                &[
                    EntityWrite::retire(edge_id, EntityKind::Edge, prov()),
                    EntityWrite::retire(b_id, EntityKind::Node, prov()),
                ],
                None,
            )
            .expect("retire");
        assert_eq!(store.graph().edge_count(), 0);
        assert!(!store.graph().contains_node(b_id));
        assert_eq!(store.history(b_id).expect("history").len(), 2);

        assert!(matches!(
            store.append(EntityWrite::update_latest(b_id, belief("again"), prov())),
            Err(GnosisError::Validation(_))
        ));
        let to_retired = EntityWrite::create(Payload::edge(a_id, b_id, "r"), prov());
        assert!(matches!(
            store.append(to_retired),
            Err(GnosisError::Validation(_))
        ));
        assert!(matches!(
            store.append(EntityWrite::retire(EntityId::new(), EntityKind::Node, prov())),
            Err(GnosisError::NotFound { .. })
        ));
    }

    #[test]
    fn kind_cannot_change() {
        let store = store();
        let a = EntityWrite::create(belief("a"), prov());
        let a_id = a.id;
        store.append(a).expect("a");
        let as_edge = EntityWrite::update(a_id, 1, Payload::edge(a_id, a_id, "self"), prov());
        assert!(matches!(
            store.append(as_edge),
            Err(GnosisError::Validation(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let bad_conf = EntityWrite::create(belief("a"), prov().with_confidence(2.0));
        assert!(validate_write(&bad_conf).is_err());

        let bad_decay = EntityWrite::create(
            Payload::node(
                NodeLabel::Memory {
                    memory_type: MemoryType::Episodic,
                    decay_rate: -1.0,
                    valence: None,
                },
                json!({}),
            ),
            prov(),
        );
        assert!(validate_write(&bad_decay).is_err());

        let mut edge = Payload::edge(EntityId::new(), EntityId::new(), "r");
        if let Payload::Edge(e) = &mut edge {
            e.weight = f64::INFINITY;
        }
        assert!(validate_write(&EntityWrite::create(edge, prov())).is_err());
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let store = store();
        let a = EntityWrite::create(belief("a"), prov());
        store.append(a.clone()).expect("a");
        let before = store.snapshot();

        let fresh = EntityWrite::create(belief("fresh"), prov());
        let stale = EntityWrite::update(a.id, 7, belief("stale"), prov());
        assert!(store.commit_batch(&[fresh.clone(), stale], None).is_err());

        assert_eq!(store.snapshot(), before);
        assert!(!store.contains(fresh.id));
    }

    #[test]
    fn trace_provenance_walks_back_and_stops_on_cycles() {
        let store = store();
        let root = EntityWrite::create(belief("root"), prov());
        let mid = EntityWrite::create(belief("mid"), prov().derived_from(root.id));
        let leaf = EntityWrite::create(belief("leaf"), prov().derived_from(mid.id));
        let (root_id, mid_id, leaf_id) = (root.id, mid.id, leaf.id);
        store.commit_batch(&[root, mid, leaf], None).expect("batch");

        let chain: Vec<EntityId> = store
            .trace_provenance(leaf_id, 10)
            .expect("trace")
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(chain, vec![root_id, mid_id, leaf_id]);

        let short = store.trace_provenance(leaf_id, 1).expect("trace");
        assert_eq!(short.len(), 2);

        // Point root back at leaf: the walk must still terminate.
        store
            .append(EntityWrite::update(
                root_id,
                1,
                belief("root"),
                prov().derived_from(leaf_id),
            ))
            .expect("cycle");
        assert_eq!(store.trace_provenance(leaf_id, 100).expect("trace").len(), 3);
    }

    #[test]
    fn reopen_replays_and_repairs_index() {
        let journal = Arc::new(MemoryJournal::new());
        let id = {
            let (store, report) =
                EntityStore::open(journal.clone(), Arc::new(SystemClock)).expect("open");
            assert_eq!(report, RecoveryReport::default());
            let write = EntityWrite::create(belief("a"), prov());
            let id = write.id;
            store.append(write).expect("a");
            store
                .append(EntityWrite::update(id, 1, belief("b"), prov()))
                .expect("b");
            id
        };

        // Simulate a lost index write.
        journal
            .store_latest_index(&BTreeMap::from([(id, 1)]))
            .expect("corrupt");

        let (store, report) = EntityStore::open(journal.clone(), Arc::new(SystemClock)).expect("reopen");
        assert_eq!(report.versions, 2);
        assert_eq!(report.index_repairs, 1);
        assert_eq!(store.latest(id), Some(2));
        assert_eq!(journal.load_latest_index().expect("index").get(&id), Some(&2));
    }
}
