//! # System
//!
//! `GnosisCore` builds every subsystem once and hands each its dependencies.
//! There are no process-wide singletons: two cores in one process share
//! nothing.
//!
//! ```text
//! Journal ─┬─ EntityStore ─ TransactionManager ─┬─ MemorySubsystem ─┐
//!          └─ AuditLog ──────────┘              ├─ SelfMap ─────────┼─ MessageRouter
//!                                               └─ Registry ────────┘
//! ```

use crate::audit::AuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::GnosisConfig;
use crate::memory::{MemorySubsystem, MemoryView};
use crate::messaging::{MessageRouter, generate_signing_key};
use crate::registry::{Capability, TransformationRegistry, builtins};
use crate::selfmap::SelfMap;
use crate::storage::{Journal, MemoryJournal, RedbJournal};
use crate::store::{EntityStore, RecoveryReport};
use crate::transaction::TransactionManager;
use crate::types::{GnosisError, Plane};
use ed25519_dalek::SigningKey;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// All subsystems over one journal.
#[derive(Debug)]
pub struct GnosisCore {
    config: GnosisConfig,
    clock: Arc<dyn Clock>,
    store: Arc<EntityStore>,
    audit: Arc<AuditLog>,
    transactions: Arc<TransactionManager>,
    memory: Arc<MemorySubsystem>,
    selfmap: Arc<SelfMap>,
    registry: Arc<TransformationRegistry>,
    router: Arc<MessageRouter>,
    recovery: RecoveryReport,
}

impl GnosisCore {
    /// Replay `journal`, rebuild derived state and wire the subsystems.
    ///
    /// Digital and mental callers are granted every built-in capability;
    /// metaphysical callers may only read memories. The built-in graph
    /// operations are registered.
    pub fn open(
        journal: Arc<dyn Journal>,
        config: GnosisConfig,
        clock: Arc<dyn Clock>,
        signing_key: SigningKey,
    ) -> Result<Self, GnosisError> {
        config.validate()?;

        let (store, recovery) = EntityStore::open(Arc::clone(&journal), Arc::clone(&clock))?;
        let store = Arc::new(store);
        let audit = Arc::new(AuditLog::open(Arc::clone(&journal), Arc::clone(&clock))?);
        let transactions = Arc::new(TransactionManager::new(
            Arc::clone(&store),
            Arc::clone(&audit),
        ));
        let memory = Arc::new(MemorySubsystem::new(
            Arc::clone(&store),
            Arc::clone(&transactions),
            Arc::clone(&clock),
            &config,
        ));
        let selfmap = Arc::new(SelfMap::new(
            Arc::clone(&store),
            Arc::clone(&transactions),
            Arc::clone(&clock),
            &config,
        ));
        let registry = Arc::new(TransformationRegistry::open(
            Arc::clone(&transactions),
            MemoryView::new(Arc::clone(&memory)),
            Arc::clone(&audit),
            journal,
        )?);

        let everything = [
            Capability::TRANSFORMATION,
            Capability::GRAPH_WRITE,
            Capability::MEMORY_READ,
        ];
        registry.grant_plane(Plane::Digital, everything);
        registry.grant_plane(Plane::Mental, everything);
        registry.grant_plane(Plane::Metaphysical, [Capability::MEMORY_READ]);
        builtins::register_builtins(&registry)?;

        let router = Arc::new(MessageRouter::new(
            signing_key,
            config.freshness_window_secs,
            Arc::clone(&clock),
            Arc::clone(&audit),
            Arc::clone(&store),
            Arc::clone(&memory),
            Arc::clone(&selfmap),
            Arc::clone(&registry),
        ));

        info!(
            entities = recovery.entities,
            versions = recovery.versions,
            repairs = recovery.index_repairs,
            "gnosis core ready"
        );
        Ok(Self {
            config,
            clock,
            store,
            audit,
            transactions,
            memory,
            selfmap,
            registry,
            router,
            recovery,
        })
    }

    /// Volatile core with default configuration, the system clock and a
    /// random response key.
    pub fn in_memory() -> Result<Self, GnosisError> {
        Self::open(
            Arc::new(MemoryJournal::new()),
            GnosisConfig::default(),
            Arc::new(SystemClock),
            generate_signing_key(),
        )
    }

    /// Core backed by a redb database at `path`, created if missing.
    pub fn with_redb(
        path: impl AsRef<Path>,
        config: GnosisConfig,
        signing_key: SigningKey,
    ) -> Result<Self, GnosisError> {
        let journal = Arc::new(RedbJournal::open(path)?);
        Self::open(journal, config, Arc::new(SystemClock), signing_key)
    }

    pub fn config(&self) -> &GnosisConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn memory(&self) -> &Arc<MemorySubsystem> {
        &self.memory
    }

    pub fn selfmap(&self) -> &Arc<SelfMap> {
        &self.selfmap
    }

    pub fn registry(&self) -> &Arc<TransformationRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// What replay found when this core was opened.
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }
}
