//! # Memory Subsystem
//!
//! Typed memory records with salience-weighted recall and lazy decay.
//!
//! The memory's payload lives in the Entity Store as a node labelled
//! `NodeLabel::Memory`. The mutable bookkeeping (salience, last access,
//! access count) lives here, keyed by entity id, and is never journaled.
//!
//! ## Scoring
//!
//! ```text
//! effective = salience * exp(-decay_rate * seconds_since_last_access)
//! recency   = 0.5 ^ (seconds_since_creation / recency_half_life)
//! relevance = |query tokens found in payload| / |query tokens|   (1.0 for an empty query)
//! score     = effective * recency * relevance
//! ```
//!
//! Ties are broken by insertion order, earlier first.

use crate::canonical::Content;
use crate::clock::{Clock, seconds_between};
use crate::config::GnosisConfig;
use crate::primitives::MAX_RECALL_RESULTS;
use crate::store::EntityStore;
use crate::transaction::TransactionManager;
use crate::types::{
    Actor, EntityId, EntityWrite, GnosisError, MemoryType, NodeLabel, Payload, Provenance,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, trace};

// =============================================================================
// TYPES
// =============================================================================

/// Salience bookkeeping for one memory entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub entity_id: EntityId,
    pub memory_type: MemoryType,
    pub timestamp: DateTime<Utc>,
    /// Salience as of `last_access`, in [0, 1].
    pub salience: f64,
    /// Per-second exponential decay rate.
    pub decay_rate: f64,
    pub emotional_valence: Option<f64>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    /// Insertion order; breaks scoring ties.
    pub seq: u64,
}

impl MemoryRecord {
    /// Salience decayed from `last_access` to `now`.
    pub fn effective_salience(&self, now: DateTime<Utc>) -> f64 {
        let idle = seconds_between(self.last_access, now).max(0.0);
        (self.salience * (-self.decay_rate * idle).exp()).clamp(0.0, 1.0)
    }
}

/// A recalled memory and the score it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    /// The record after the recall boost was applied.
    pub record: MemoryRecord,
    pub score: f64,
}

/// Parameters for a new memory.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub memory_type: MemoryType,
    pub content: Content,
    pub valence: Option<f64>,
    /// Falls back to `GnosisConfig::default_decay_rate`.
    pub decay_rate: Option<f64>,
    /// Falls back to full-confidence provenance stamped now.
    pub provenance: Option<Provenance>,
    pub tags: BTreeSet<String>,
}

impl NewMemory {
    pub fn new(memory_type: MemoryType, content: impl Into<Content>) -> Self {
        Self {
            memory_type,
            content: content.into(),
            valence: None,
            decay_rate: None,
            provenance: None,
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn valence(mut self, valence: f64) -> Self {
        self.valence = Some(valence);
        self
    }

    #[must_use]
    pub fn decay_rate(mut self, rate: f64) -> Self {
        self.decay_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Filter for chronological queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryQuery {
    pub memory_type: Option<MemoryType>,
    /// Inclusive lower bound on creation time.
    pub after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    pub before: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
}

// =============================================================================
// SUBSYSTEM
// =============================================================================

/// Tunables the memory subsystem reads from [`GnosisConfig`].
#[derive(Debug, Clone, Copy)]
struct MemorySettings {
    recall_boost: f64,
    recall_threshold: f64,
    default_decay_rate: f64,
    recency_half_life_secs: f64,
    feedback_decay: f64,
}

impl From<&GnosisConfig> for MemorySettings {
    fn from(config: &GnosisConfig) -> Self {
        Self {
            recall_boost: config.recall_boost,
            recall_threshold: config.recall_threshold,
            default_decay_rate: config.default_decay_rate,
            recency_half_life_secs: config.recency_half_life_secs,
            feedback_decay: config.feedback_decay,
        }
    }
}

/// Typed memories over the Entity Store.
#[derive(Debug)]
pub struct MemorySubsystem {
    store: Arc<EntityStore>,
    transactions: Arc<TransactionManager>,
    clock: Arc<dyn Clock>,
    settings: MemorySettings,
    records: RwLock<BTreeMap<EntityId, MemoryRecord>>,
    next_seq: AtomicU64,
}

impl MemorySubsystem {
    /// Build the subsystem, rebuilding records for every memory node already
    /// in the store. Rebuilt records start at salience 1.0 with
    /// `last_access` equal to their creation time.
    pub fn new(
        store: Arc<EntityStore>,
        transactions: Arc<TransactionManager>,
        clock: Arc<dyn Clock>,
        config: &GnosisConfig,
    ) -> Self {
        let mut existing: Vec<MemoryRecord> = store
            .nodes_where(|label| matches!(label, NodeLabel::Memory { .. }))
            .iter()
            .filter_map(|entity| match entity.as_node().map(|n| &n.label) {
                Some(NodeLabel::Memory {
                    memory_type,
                    decay_rate,
                    valence,
                }) => Some(MemoryRecord {
                    entity_id: entity.id,
                    memory_type: *memory_type,
                    timestamp: entity.provenance.created_at,
                    salience: 1.0,
                    decay_rate: *decay_rate,
                    emotional_valence: *valence,
                    last_access: entity.provenance.created_at,
                    access_count: 0,
                    seq: 0,
                }),
                _ => None,
            })
            .collect();
        existing.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let mut records = BTreeMap::new();
        for (seq, mut record) in existing.into_iter().enumerate() {
            record.seq = seq as u64;
            records.insert(record.entity_id, record);
        }
        if !records.is_empty() {
            info!(memories = records.len(), "memory records rebuilt from store");
        }

        let next_seq = records.len() as u64;
        Self {
            store,
            transactions,
            clock,
            settings: MemorySettings::from(config),
            records: RwLock::new(records),
            next_seq: AtomicU64::new(next_seq),
        }
    }

    /// Store a memory with the default decay rate. Initial salience is 1.0.
    pub fn store(
        &self,
        memory_type: MemoryType,
        content: impl Into<Content>,
        valence: Option<f64>,
    ) -> Result<EntityId, GnosisError> {
        let mut memory = NewMemory::new(memory_type, content);
        memory.valence = valence;
        self.store_with(memory)
    }

    /// Store a memory with explicit options.
    pub fn store_with(&self, memory: NewMemory) -> Result<EntityId, GnosisError> {
        let now = self.clock.now();
        let decay_rate = memory.decay_rate.unwrap_or(self.settings.default_decay_rate);
        let provenance = memory.provenance.unwrap_or_else(|| Provenance::new(now));
        let payload = Payload::node(
            NodeLabel::Memory {
                memory_type: memory.memory_type,
                decay_rate,
                valence: memory.valence,
            },
            memory.content,
        )
        .with_tags(memory.tags);

        let write = EntityWrite::create(payload, provenance);
        let id = write.id;
        self.transactions.execute(Actor::System, vec![write])?;

        let record = MemoryRecord {
            entity_id: id,
            memory_type: memory.memory_type,
            timestamp: now,
            salience: 1.0,
            decay_rate,
            emotional_valence: memory.valence,
            last_access: now,
            access_count: 0,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
        debug!(memory = %id, kind = %memory.memory_type, "memory stored");
        Ok(id)
    }

    /// Rank memories against `query`, boost the winners and return them.
    ///
    /// An empty or fully decayed set yields an empty result, not an error.
    pub fn recall(
        &self,
        query: &str,
        top_k: usize,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<RecallHit>, GnosisError> {
        let now = self.clock.now();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let ranked = self.rank(&records, query, top_k, memory_type, now);

        let mut hits = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            if let Some(record) = records.get_mut(&id) {
                let effective = record.effective_salience(now);
                record.salience = (effective + self.settings.recall_boost).min(1.0);
                record.last_access = now;
                record.access_count = record.access_count.saturating_add(1);
                hits.push(RecallHit {
                    record: record.clone(),
                    score,
                });
            }
        }
        debug!(query, hits = hits.len(), "memory recall");
        Ok(hits)
    }

    /// Same ranking as [`recall`](Self::recall) without boosting anything.
    pub fn preview(
        &self,
        query: &str,
        top_k: usize,
        memory_type: Option<MemoryType>,
    ) -> Vec<RecallHit> {
        let now = self.clock.now();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        self.rank(&records, query, top_k, memory_type, now)
            .into_iter()
            .filter_map(|(id, score)| {
                records.get(&id).map(|record| RecallHit {
                    record: record.clone(),
                    score,
                })
            })
            .collect()
    }

    fn rank(
        &self,
        records: &BTreeMap<EntityId, MemoryRecord>,
        query: &str,
        top_k: usize,
        memory_type: Option<MemoryType>,
        now: DateTime<Utc>,
    ) -> Vec<(EntityId, f64)> {
        let terms = tokenize(query);
        let mut scored: Vec<(u64, EntityId, f64)> = records
            .values()
            .filter(|record| memory_type.is_none_or(|t| t == record.memory_type))
            .filter_map(|record| {
                let relevance = self.relevance(record.entity_id, &terms);
                let age = seconds_between(record.timestamp, now).max(0.0);
                let recency = 0.5_f64.powf(age / self.settings.recency_half_life_secs);
                let score = record.effective_salience(now) * recency * relevance;
                trace!(memory = %record.entity_id, score, relevance, recency, "scored memory");
                (score >= self.settings.recall_threshold && score > 0.0)
                    .then_some((record.seq, record.entity_id, score))
            })
            .collect();

        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(top_k.min(MAX_RECALL_RESULTS))
            .map(|(_, id, score)| (id, score))
            .collect()
    }

    fn relevance(&self, id: EntityId, terms: &BTreeSet<String>) -> f64 {
        if terms.is_empty() {
            return 1.0;
        }
        let Ok(entity) = self.store.get(id, None) else {
            return 0.0;
        };
        let Some(node) = entity.as_node() else {
            return 0.0;
        };
        let mut text = node.content.flatten_text();
        for tag in &node.tags {
            text.push(' ');
            text.push_str(tag);
        }
        let found = tokenize(&text);
        terms.intersection(&found).count() as f64 / terms.len() as f64
    }

    /// Every record with its salience decayed to `now`. Nothing is written.
    pub fn decay(&self, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|record| MemoryRecord {
                salience: record.effective_salience(now),
                ..record.clone()
            })
            .collect()
    }

    /// Effective salience of one memory right now.
    pub fn effective_salience(&self, id: EntityId) -> Result<f64, GnosisError> {
        let now = self.clock.now();
        self.record(id)
            .map(|record| record.effective_salience(now))
            .ok_or(GnosisError::NotFound { id, version: None })
    }

    pub fn record(&self, id: EntityId) -> Option<MemoryRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Records matching `filter`, oldest first.
    pub fn query(&self, filter: &MemoryQuery) -> Vec<MemoryRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<MemoryRecord> = records
            .values()
            .filter(|r| filter.memory_type.is_none_or(|t| t == r.memory_type))
            .filter(|r| filter.after.is_none_or(|after| r.timestamp >= after))
            .filter(|r| filter.before.is_none_or(|before| r.timestamp < before))
            .filter(|r| {
                filter.min_confidence.is_none_or(|min| {
                    self.store
                        .get(r.entity_id, None)
                        .is_ok_and(|e| e.provenance.confidence >= min)
                })
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.seq.cmp(&b.seq)));
        matched
    }

    /// Fold a felt response into a memory's salience.
    ///
    /// `salience = clamp(effective * feedback_decay + valence * intensity, 0, 1)`
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

        let now = self.clock.now();
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(&target)
            .ok_or(GnosisError::NotFound {
                id: target,
                version: None,
            })?;
        let updated = record.effective_salience(now) * self.settings.feedback_decay
            + valence * intensity;
        record.salience = updated.clamp(0.0, 1.0);
        record.last_access = now;
        debug!(memory = %target, salience = record.salience, "qualia feedback applied");
        Ok(record.salience)
    }

    /// The `top_n` records with the highest effective salience.
    pub fn salient(&self, top_n: usize) -> Vec<MemoryRecord> {
        let now = self.clock.now();
        let mut records = self.decay(now);
        records.sort_by(|a, b| b.salience.total_cmp(&a.salience).then_with(|| a.seq.cmp(&b.seq)));
        records.truncate(top_n);
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// =============================================================================
// READ-ONLY VIEW
// =============================================================================

/// Read-only access to memories, handed to plugin handlers.
#[derive(Debug, Clone)]
pub struct MemoryView {
    memory: Arc<MemorySubsystem>,
}

impl MemoryView {
    pub fn new(memory: Arc<MemorySubsystem>) -> Self {
        Self { memory }
    }

    pub fn record(&self, id: EntityId) -> Option<MemoryRecord> {
        self.memory.record(id)
    }

    pub fn query(&self, filter: &MemoryQuery) -> Vec<MemoryRecord> {
        self.memory.query(filter)
    }

    /// Ranked matches without the recall boost.
    pub fn search(&self, query: &str, top_k: usize, memory_type: Option<MemoryType>) -> Vec<RecallHit> {
        self.memory.preview(query, top_k, memory_type)
    }
}
