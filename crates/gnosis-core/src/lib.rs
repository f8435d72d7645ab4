//! # gnosis-core
//!
//! The versioned, self-referential graph core for Gnosis - THE LOGIC.
//!
//! A store of immutable, versioned entities with a live adjacency index,
//! transactional mutation and rollback, salience-weighted memory, recursive
//! self-model chains, a capability-gated plugin registry and signed messages
//! between planes.
//!
//! ## Architectural Constraints
//!
//! - Append-only: a write creates a new version, never mutates one
//! - Every mutation flows through the [`TransactionManager`]
//! - Plugins return writes; they never touch storage
//! - Traversals and recursion are depth-bounded
//! - No async, no network dependencies
//! - No process-wide singletons: [`GnosisCore`] wires explicit instances

// =============================================================================
// MODULES
// =============================================================================

pub mod audit;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod graph;
pub mod memory;
pub mod messaging;
pub mod primitives;
pub mod registry;
pub mod selfmap;
pub mod storage;
pub mod store;
pub mod system;
pub mod transaction;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    Actor, Base, EdgeData, Entity, EntityId, EntityKind, EntityWrite, GnosisError, MemoryType,
    NodeData, NodeLabel, Payload, Plane, Polarity, Provenance, TxId, VersionedId,
};

pub use canonical::{Content, ContentHash, canonical_json, hash_canonical};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GnosisConfig;
pub use system::GnosisCore;

// =============================================================================
// RE-EXPORTS: Subsystems
// =============================================================================

pub use audit::{AuditLog, AuditRecord, Outcome};
pub use graph::{GraphIndex, Hop};
pub use memory::{MemoryQuery, MemoryRecord, MemorySubsystem, MemoryView, NewMemory, RecallHit};
pub use registry::{
    Capability, HandlerContext, HandlerError, HandlerOutput, InvocationError, PluginInfo,
    Registrant, Transformation, TransactionOutcome, TransformationRegistry,
};
pub use selfmap::{SalientNode, SelfMap, SelfModelNode};
pub use store::{EntityStore, EntityView, History, RecoveryReport, StoreSnapshot};
pub use transaction::{TransactionManager, TxHandle, TxStatus};

// =============================================================================
// RE-EXPORTS: Messaging & Storage
// =============================================================================

pub use messaging::{
    BoundaryPolicy, Delivery, Envelope, KeyRing, MessageRouter, MessageSigner, OpCategory,
    Operation, RejectReason, SignedMessage,
};
pub use storage::{Journal, MemoryJournal, RedbJournal};
