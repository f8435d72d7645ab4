//! # Storage
//!
//! The durable journal behind the Entity Store, audit log and plugin table.
//!
//! Four logical stores:
//! - entity log (append-only, every version ever committed)
//! - latest-version index (id -> version)
//! - plugin table (name -> `PluginInfo`)
//! - audit log (append-only)
//!
//! The entity log is the source of truth. The latest index is a cache that
//! recovery rebuilds by replaying the log.

mod redb_journal;

pub use redb_journal::RedbJournal;

use crate::audit::AuditRecord;
use crate::registry::PluginInfo;
use crate::types::{Entity, EntityId, GnosisError};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

/// Durable backing store.
///
/// Implementations must make each `append_entities` call atomic: either the
/// whole batch and its index updates persist, or none of it does.
pub trait Journal: Send + Sync + Debug {
    /// Persist a batch of entity versions and advance the latest index.
    fn append_entities(&self, entities: &[Entity]) -> Result<(), GnosisError>;

    /// Every persisted entity version, in append order.
    fn load_entities(&self) -> Result<Vec<Entity>, GnosisError>;

    /// The persisted latest-version index.
    fn load_latest_index(&self) -> Result<BTreeMap<EntityId, u64>, GnosisError>;

    /// Overwrite the latest-version index (used by recovery repair).
    fn store_latest_index(&self, index: &BTreeMap<EntityId, u64>) -> Result<(), GnosisError>;

    fn append_audit(&self, record: &AuditRecord) -> Result<(), GnosisError>;

    /// Every audit record, in sequence order.
    fn load_audit(&self) -> Result<Vec<AuditRecord>, GnosisError>;

    /// Insert or replace the plugin row for an operation name.
    fn put_plugin(&self, operation: &str, info: &PluginInfo) -> Result<(), GnosisError>;

    /// Every plugin row as `(operation, info)`, ordered by operation.
    fn load_plugins(&self) -> Result<Vec<(String, PluginInfo)>, GnosisError>;
}

// =============================================================================
// IN-MEMORY JOURNAL
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    entities: Vec<Entity>,
    latest: BTreeMap<EntityId, u64>,
    audit: Vec<AuditRecord>,
    plugins: BTreeMap<String, PluginInfo>,
}

/// Volatile journal. Used by tests and throwaway cores.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    state: Mutex<MemoryState>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for MemoryJournal {
    fn append_entities(&self, entities: &[Entity]) -> Result<(), GnosisError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for entity in entities {
            state.latest.insert(entity.id, entity.version);
            state.entities.push(entity.clone());
        }
        Ok(())
    }

    fn load_entities(&self) -> Result<Vec<Entity>, GnosisError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.entities.clone())
    }

    fn load_latest_index(&self) -> Result<BTreeMap<EntityId, u64>, GnosisError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.latest.clone())
    }

    fn store_latest_index(&self, index: &BTreeMap<EntityId, u64>) -> Result<(), GnosisError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.latest = index.clone();
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), GnosisError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.audit.push(record.clone());
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditRecord>, GnosisError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.audit.clone())
    }

    fn put_plugin(&self, operation: &str, info: &PluginInfo) -> Result<(), GnosisError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.plugins.insert(operation.to_string(), info.clone());
        Ok(())
    }

    fn load_plugins(&self) -> Result<Vec<(String, PluginInfo)>, GnosisError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .plugins
            .iter()
            .map(|(operation, info)| (operation.clone(), info.clone()))
            .collect())
    }
}
