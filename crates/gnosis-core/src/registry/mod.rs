//! # Transformation Registry
//!
//! Maps operation names to plugin handlers plus the capability set each
//! plugin requires.
//!
//! - Registration checks requested permissions against the registrant's grants.
//! - Invocation checks the caller plane's grants against the plugin's permissions.
//! - Every invocation runs in its own transaction: the handler returns writes,
//!   the registry commits them only if the handler succeeded.
//! - Every invocation appends exactly one audit record under the operation's
//!   name, whatever the outcome.
//!
//! Handlers never touch storage. They see read-only [`EntityView`] and
//! [`MemoryView`] handles and return [`EntityWrite`]s.

pub mod builtins;

use crate::audit::{AuditLog, Outcome};
use crate::canonical::{ContentHash, hash_canonical};
use crate::memory::MemoryView;
use crate::primitives::MAX_NAME_LENGTH;
use crate::selfmap::check_plugin_write;
use crate::storage::Journal;
use crate::store::EntityView;
use crate::transaction::TransactionManager;
use crate::types::{Actor, EntityWrite, GnosisError, Plane, TxId, VersionedId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

// =============================================================================
// CAPABILITIES AND PLUGIN METADATA
// =============================================================================

/// A named permission. Compared by exact string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    /// Generic "may run as a transformation".
    pub const TRANSFORMATION: &'static str = "transformation";
    /// May return entity writes.
    pub const GRAPH_WRITE: &'static str = "graph.write";
    /// May read memories through the handler context.
    pub const MEMORY_READ: &'static str = "memory.read";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a set from names.
    pub fn set<I, S>(names: I) -> BTreeSet<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().map(Self::new).collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of a registered plugin. Persisted in the plugin table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    /// Semantic version, `MAJOR.MINOR.PATCH`.
    pub version: String,
    pub author: String,
    pub permissions: BTreeSet<Capability>,
    pub enabled: bool,
}

impl PluginInfo {
    /// Enabled plugin with no permissions.
    pub fn new(name: impl Into<String>, version: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: author.into(),
            permissions: BTreeSet::new(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Capability::new));
        self
    }

    fn validate(&self) -> Result<(), GnosisError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LENGTH {
            return Err(GnosisError::Validation(format!(
                "plugin name must be 1..={} bytes",
                MAX_NAME_LENGTH
            )));
        }
        let parts: Vec<&str> = self.version.split('.').collect();
        let numeric = parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
        if parts.len() != 3 || !numeric {
            return Err(GnosisError::Validation(format!(
                "plugin version '{}' is not MAJOR.MINOR.PATCH",
                self.version
            )));
        }
        Ok(())
    }
}

/// Who is registering a plugin, and what they may hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registrant {
    pub name: String,
    pub grants: BTreeSet<Capability>,
}

impl Registrant {
    pub fn new<I, S>(name: impl Into<String>, grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            grants: Capability::set(grants),
        }
    }
}

// =============================================================================
// HANDLER CONTRACT
// =============================================================================

/// What a handler may look at.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub entities: EntityView,
    pub memory: MemoryView,
}

/// What a handler returns: a result document and the writes to commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub payload: Value,
    pub writes: Vec<EntityWrite>,
}

impl HandlerOutput {
    /// A result with no writes.
    pub fn reply(payload: Value) -> Self {
        Self {
            payload,
            writes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_write(mut self, write: EntityWrite) -> Self {
        self.writes.push(write);
        self
    }
}

/// A handler's own failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<GnosisError> for HandlerError {
    fn from(err: GnosisError) -> Self {
        Self(err.to_string())
    }
}

/// A plugin transformation.
///
/// Implementations must be `Send + Sync` and must not mutate anything
/// outside the writes they return.
pub trait Transformation: Send + Sync {
    fn apply(&self, args: &Value, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError>;
}

impl<F> Transformation for F
where
    F: Fn(&Value, &HandlerContext) -> Result<HandlerOutput, HandlerError> + Send + Sync,
{
    fn apply(&self, args: &Value, ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
        self(args, ctx)
    }
}

// =============================================================================
// INVOCATION RESULTS
// =============================================================================

/// A successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub operation: String,
    pub tx_id: TxId,
    /// Versions written by the handler, in write order.
    pub versions: Vec<VersionedId>,
    pub payload: Value,
    pub args_hash: ContentHash,
    /// Sequence number of the invocation's audit record.
    pub audit_seq: u64,
}

/// Why an invocation did not take effect.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation '{0}' is disabled")]
    Disabled(String),

    #[error("Plane {plane} lacks {missing:?} for '{operation}'")]
    Permission {
        operation: String,
        plane: Plane,
        missing: Vec<String>,
    },

    #[error("Handler for '{operation}' failed: {source}")]
    Handler {
        operation: String,
        #[source]
        source: HandlerError,
    },

    /// The handler's writes were refused at buffer or commit time.
    #[error("Commit of '{operation}' failed: {source}")]
    Commit {
        operation: String,
        #[source]
        source: GnosisError,
    },

    #[error(transparent)]
    Core(#[from] GnosisError),
}

impl InvocationError {
    fn outcome(&self) -> Outcome {
        match self {
            Self::UnknownOperation(_) | Self::Disabled(_) | Self::Permission { .. } => {
                Outcome::Rejected
            }
            Self::Handler { .. } | Self::Commit { .. } | Self::Core(_) => Outcome::Failure,
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

struct Slot {
    info: PluginInfo,
    handler: Arc<dyn Transformation>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("info", &self.info).finish()
    }
}

/// Operation name -> plugin, with per-operation locks.
#[derive(Debug)]
pub struct TransformationRegistry {
    transactions: Arc<TransactionManager>,
    context: HandlerContext,
    audit: Arc<AuditLog>,
    journal: Arc<dyn Journal>,
    slots: RwLock<BTreeMap<String, Arc<RwLock<Slot>>>>,
    /// Rows from the plugin table. Survive until the operation is registered again.
    persisted: RwLock<BTreeMap<String, PluginInfo>>,
    retired: RwLock<Vec<(String, PluginInfo)>>,
    grants: RwLock<BTreeMap<Plane, BTreeSet<Capability>>>,
}

impl TransformationRegistry {
    /// Create the registry and load the persisted plugin table.
    ///
    /// Persisted rows carry no handler; they only decide whether a later
    /// registration of the same plugin starts disabled.
    pub fn open(
        transactions: Arc<TransactionManager>,
        memory: MemoryView,
        audit: Arc<AuditLog>,
        journal: Arc<dyn Journal>,
    ) -> Result<Self, GnosisError> {
        let persisted: BTreeMap<String, PluginInfo> = journal.load_plugins()?.into_iter().collect();
        if !persisted.is_empty() {
            info!(plugins = persisted.len(), "plugin table loaded");
        }
        let context = HandlerContext {
            entities: EntityView::new(Arc::clone(transactions.store())),
            memory,
        };
        Ok(Self {
            transactions,
            context,
            audit,
            journal,
            slots: RwLock::new(BTreeMap::new()),
            persisted: RwLock::new(persisted),
            retired: RwLock::new(Vec::new()),
            grants: RwLock::new(BTreeMap::new()),
        })
    }

    fn slot(&self, operation: &str) -> Option<Arc<RwLock<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned()
    }

    fn audit_quietly(
        &self,
        actor: Actor,
        operation: &str,
        outcome: Outcome,
        hash: Option<ContentHash>,
        detail: String,
    ) -> Option<u64> {
        match self.audit.record(actor, operation, outcome, hash, detail) {
            Ok(record) => Some(record.seq),
            Err(err) => {
                warn!(operation, error = %err, "failed to append audit record");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register `handler` under `operation`.
    ///
    /// A disabled registration under the same name is soft-retired and
    /// replaced. A plugin persisted as disabled comes back disabled.
    pub fn register<T>(
        &self,
        operation: &str,
        handler: T,
        info: PluginInfo,
        registrant: &Registrant,
    ) -> Result<(), GnosisError>
    where
        T: Transformation + 'static,
    {
        if operation.is_empty() || operation.len() > MAX_NAME_LENGTH {
            return Err(GnosisError::Validation(format!(
                "operation name must be 1..={} bytes",
                MAX_NAME_LENGTH
            )));
        }
        info.validate()?;

        let actor = Actor::Plugin(registrant.name.clone());
        let excess: Vec<String> = info
            .permissions
            .difference(&registrant.grants)
            .map(ToString::to_string)
            .collect();
        if !excess.is_empty() {
            let detail = format!("requested {:?} beyond grants", excess);
            warn!(operation, registrant = %registrant.name, ?excess, "registration refused");
            self.audit_quietly(actor, "plugin.register", Outcome::Rejected, None, detail.clone());
            return Err(GnosisError::Permission(format!("{}: {}", operation, detail)));
        }

        let mut info = info;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.get(operation) {
            let existing = existing.read().unwrap_or_else(PoisonError::into_inner);
            if existing.info.enabled {
                return Err(GnosisError::DuplicateOperation(operation.to_string()));
            }
            self.retired
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push((operation.to_string(), existing.info.clone()));
        }

        let remembered = self
            .persisted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(operation);
        if remembered.is_some_and(|row| row.name == info.name && !row.enabled) {
            info.enabled = false;
        }

        self.journal.put_plugin(operation, &info)?;
        let enabled = info.enabled;
        slots.insert(
            operation.to_string(),
            Arc::new(RwLock::new(Slot {
                info,
                handler: Arc::new(handler),
            })),
        );
        drop(slots);

        info!(operation, registrant = %registrant.name, enabled, "plugin registered");
        self.audit_quietly(
            actor,
            "plugin.register",
            Outcome::Success,
            None,
            format!("{} enabled={}", operation, enabled),
        );
        Ok(())
    }

    /// Re-enable a registered operation.
    pub fn enable(&self, operation: &str) -> Result<(), GnosisError> {
        self.set_enabled(operation, true)
    }

    /// Disable a registered operation. Later invocations are rejected.
    pub fn disable(&self, operation: &str) -> Result<(), GnosisError> {
        self.set_enabled(operation, false)
    }

    fn set_enabled(&self, operation: &str, enabled: bool) -> Result<(), GnosisError> {
        let action = if enabled { "plugin.enable" } else { "plugin.disable" };
        let Some(slot) = self.slot(operation) else {
            self.audit_quietly(
                Actor::System,
                action,
                Outcome::Rejected,
                None,
                format!("{} is not registered", operation),
            );
            return Err(GnosisError::UnknownOperation(operation.to_string()));
        };

        // Taking the write lock waits for in-flight invocations.
        let mut slot = slot.write().unwrap_or_else(PoisonError::into_inner);
        let mut info = slot.info.clone();
        info.enabled = enabled;
        self.journal.put_plugin(operation, &info)?;
        slot.info = info;
        drop(slot);

        info!(operation, enabled, "plugin state changed");
        self.audit_quietly(Actor::System, action, Outcome::Success, None, operation.to_string());
        Ok(())
    }

    /// Set the capabilities a plane's callers hold.
    pub fn grant_plane<I, S>(&self, plane: Plane, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let caps = Capability::set(capabilities);
        debug!(%plane, caps = caps.len(), "plane grants updated");
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plane, caps);
    }

    pub fn plane_grants(&self, plane: Plane) -> BTreeSet<Capability> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&plane)
            .cloned()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Operation name -> plugin metadata.
    pub fn list_plugins(&self) -> BTreeMap<String, PluginInfo> {
        let slots: Vec<(String, Arc<RwLock<Slot>>)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .map(|(name, slot)| {
                let info = slot.read().unwrap_or_else(PoisonError::into_inner).info.clone();
                (name, info)
            })
            .collect()
    }

    pub fn plugin_info(&self, operation: &str) -> Option<PluginInfo> {
        self.slot(operation)
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).info.clone())
    }

    /// Disabled registrations that were replaced, oldest first.
    pub fn retired(&self) -> Vec<(String, PluginInfo)> {
        self.retired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -------------------------------------------------------------------------
    // Invocation
    // -------------------------------------------------------------------------

    /// Run `operation` on behalf of `caller`.
    ///
    /// Exactly one audit record is appended under `operation`. Handler errors
    /// and refused writes roll the implicit transaction back.
    pub fn invoke(
        &self,
        operation: &str,
        args: &Value,
        caller: Plane,
    ) -> Result<TransactionOutcome, InvocationError> {
        let args_hash = hash_canonical(args)?;
        let result = self.run(operation, args, caller, args_hash);

        let (outcome, detail) = match &result {
            Ok(done) => (
                Outcome::Success,
                format!("{} versions in {}", done.versions.len(), done.tx_id),
            ),
            Err(err) => (err.outcome(), err.to_string()),
        };
        let seq = self.audit_quietly(
            Actor::Plane(caller),
            operation,
            outcome,
            Some(args_hash),
            detail,
        );

        match result {
            Ok(mut done) => {
                done.audit_seq = seq.unwrap_or_default();
                debug!(operation, %caller, tx = %done.tx_id, "invocation committed");
                Ok(done)
            }
            Err(err) => {
                warn!(operation, %caller, error = %err, "invocation failed");
                Err(err)
            }
        }
    }

    fn run(
        &self,
        operation: &str,
        args: &Value,
        caller: Plane,
        args_hash: ContentHash,
    ) -> Result<TransactionOutcome, InvocationError> {
        let slot = self
            .slot(operation)
            .ok_or_else(|| InvocationError::UnknownOperation(operation.to_string()))?;
        // Held for the whole call so disable() cannot interleave.
        let slot = slot.read().unwrap_or_else(PoisonError::into_inner);
        if !slot.info.enabled {
            return Err(InvocationError::Disabled(operation.to_string()));
        }

        let held = self.plane_grants(caller);
        let missing: Vec<String> = slot
            .info
            .permissions
            .difference(&held)
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(InvocationError::Permission {
                operation: operation.to_string(),
                plane: caller,
                missing,
            });
        }

        let actor = Actor::Plugin(slot.info.name.clone());
        let tx = self.transactions.begin_as(actor.clone());

        let output = match slot.handler.apply(args, &self.context) {
            Ok(output) => output,
            Err(source) => {
                self.transactions.rollback(tx)?;
                return Err(InvocationError::Handler {
                    operation: operation.to_string(),
                    source,
                });
            }
        };

        for write in output.writes {
            let current = self.context.entities.get(write.id, None).ok();
            let staged = check_plugin_write(current.as_deref(), &write)
                .and_then(|()| self.transactions.write(tx, write.by(actor.clone())));
            if let Err(source) = staged {
                self.transactions.rollback(tx)?;
                return Err(InvocationError::Commit {
                    operation: operation.to_string(),
                    source,
                });
            }
        }

        let versions = self
            .transactions
            .commit(tx)
            .map_err(|source| InvocationError::Commit {
                operation: operation.to_string(),
                source,
            })?;

        Ok(TransactionOutcome {
            operation: operation.to_string(),
            tx_id: tx.id(),
            versions,
            payload: output.payload,
            args_hash,
            audit_seq: 0,
        })
    }
}
