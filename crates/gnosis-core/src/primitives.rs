//! # Primitives
//!
//! Hardcoded runtime constants for the Gnosis core.
//!
//! Tunables that operators may change live in [`crate::config::GnosisConfig`];
//! the values here bound computation and fix persistence formats.

/// Maximum traversal depth for graph queries.
///
/// - All traversals must be computationally bounded.
/// - Requested depths above this are clamped.
pub const MAX_TRAVERSAL_DEPTH: usize = 100;

/// Hard ceiling on recursive self-model depth, regardless of configuration.
pub const MAX_SELF_MODEL_DEPTH: u32 = 64;

/// Maximum hops followed by provenance tracing.
pub const MAX_PROVENANCE_DEPTH: usize = 256;

/// Relation used for "level L observes level L-1" edges.
pub const OBSERVES_RELATION: &str = "observes";

/// Relation used from a meta node to the level it summarizes.
pub const SUMMARIZES_RELATION: &str = "summarizes";

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Magic bytes stored in the journal metadata table.
pub const MAGIC_BYTES: &[u8; 4] = b"GNOS";

/// Current journal format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for operation names, relations and tags.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum number of records returned by one recall.
pub const MAX_RECALL_RESULTS: usize = 1000;

/// Maximum number of writes buffered in one transaction.
pub const MAX_TRANSACTION_WRITES: usize = 10_000;

/// Finished transactions whose status stays queryable; older ones are forgotten.
pub const SETTLED_TX_HISTORY: usize = 1024;
