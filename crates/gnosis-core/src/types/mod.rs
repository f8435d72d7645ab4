//! # Core Type Definitions
//!
//! This module contains all core types for the Gnosis graph substrate:
//! - Identifiers (`EntityId`, `VersionedId`, `TxId`)
//! - Versioned records (`Entity`, `Payload`, `NodeData`, `EdgeData`)
//! - Write requests (`EntityWrite`, `Base`)
//! - Metadata (`Provenance`, `Actor`, `Plane`)
//! - Error types (`GnosisError`)
//!
//! ## Persistence Compatibility
//!
//! Every type here round-trips through both `serde_json` (wire format) and
//! `postcard` (journal format). Enums are externally tagged and no field is
//! conditionally skipped, because postcard cannot decode self-describing data.

use crate::canonical::{Content, ContentHash, hash_canonical};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique identifier of an entity (node or edge). Stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Mint a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The identifier as a 128-bit integer (journal key form).
    #[must_use]
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = GnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| GnosisError::Validation(format!("invalid entity id '{}': {}", s, e)))
    }
}

/// An entity id pinned to one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionedId {
    pub id: EntityId,
    pub version: u64,
}

impl VersionedId {
    #[must_use]
    pub const fn new(id: EntityId, version: u64) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for VersionedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Identifier of a transaction. Monotonic within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

// =============================================================================
// PLANES & ACTORS
// =============================================================================

/// An isolated subsystem boundary. Planes talk to each other only through
/// signed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    Digital,
    Mental,
    Metaphysical,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Digital, Plane::Mental, Plane::Metaphysical];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Digital => "digital",
            Self::Mental => "mental",
            Self::Metaphysical => "metaphysical",
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plane {
    type Err = GnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digital" => Ok(Self::Digital),
            "mental" => Ok(Self::Mental),
            "metaphysical" => Ok(Self::Metaphysical),
            other => Err(GnosisError::Validation(format!("unknown plane '{}'", other))),
        }
    }
}

/// Who caused a write or an audited action.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Actor {
    System,
    Plugin(String),
    Plane(Plane),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Plugin(name) => write!(f, "plugin:{}", name),
            Self::Plane(plane) => write!(f, "plane:{}", plane),
        }
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// Whether an entity is a node or an edge. Derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Node,
    Edge,
}

/// Sign of an edge's influence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
    #[default]
    Neutral,
}

/// Memory categories tracked by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Emotional,
    Procedural,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Emotional => "emotional",
            Self::Procedural => "procedural",
        };
        f.write_str(name)
    }
}

impl FromStr for MemoryType {
    type Err = GnosisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "emotional" => Ok(Self::Emotional),
            "procedural" => Ok(Self::Procedural),
            other => Err(GnosisError::Validation(format!(
                "unknown memory type '{}'",
                other
            ))),
        }
    }
}

/// Role of a node within the self-map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeLabel {
    Generic,
    Identity,
    Belief,
    Value,
    Qualia,
    Archetype,
    /// A memory node. The mutable salience state lives in the memory subsystem.
    Memory {
        memory_type: MemoryType,
        decay_rate: f64,
        valence: Option<f64>,
    },
    /// Link `level` of the recursive self-model chain. Level 0 is the base self.
    SelfModel { level: u32, target: Option<EntityId> },
    /// Summary of the chain observed up to `observed_depth`.
    Meta { observed_depth: u32, target: EntityId },
}

/// Node body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    pub label: NodeLabel,
    pub content: Content,
    /// Opaque tags (principle names, provenance markers). Never interpreted.
    pub tags: BTreeSet<String>,
}

/// Edge body. Edges are versioned exactly like nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    pub from: EntityId,
    pub to: EntityId,
    pub relation: String,
    pub polarity: Polarity,
    pub weight: f64,
}

/// Typed union carried by every entity version.
///
/// `Retired` is a tombstone: the entity keeps its history but leaves the
/// graph index, and no version may follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Node(NodeData),
    Edge(EdgeData),
    Retired(EntityKind),
}

impl Payload {
    /// A node payload without tags.
    #[must_use]
    pub fn node(label: NodeLabel, content: impl Into<Content>) -> Self {
        Self::Node(NodeData {
            label,
            content: content.into(),
            tags: BTreeSet::new(),
        })
    }

    /// A neutral edge of weight 1.0.
    #[must_use]
    pub fn edge(from: EntityId, to: EntityId, relation: impl Into<String>) -> Self {
        Self::Edge(EdgeData {
            from,
            to,
            relation: relation.into(),
            polarity: Polarity::Neutral,
            weight: 1.0,
        })
    }

    /// Attach opaque tags. No effect on edges.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Node(node) = &mut self {
            node.tags.extend(tags.into_iter().map(Into::into));
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Edge(_) => EntityKind::Edge,
            Self::Retired(kind) => *kind,
        }
    }

    #[must_use]
    pub fn as_node(&self) -> Option<&NodeData> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_edge(&self) -> Option<&EdgeData> {
        match self {
            Self::Edge(edge) => Some(edge),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        matches!(self, Self::Retired(_))
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Origin and confidence of a piece of state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub confidence: f64,
}

impl Provenance {
    /// Full-confidence provenance with no source.
    #[must_use]
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            source_id: None,
            created_at,
            confidence: 1.0,
        }
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn derived_from(mut self, source: EntityId) -> Self {
        self.source_id = Some(source);
        self
    }

    /// Confidence must be a finite number in [0, 1].
    pub fn validate(&self) -> Result<(), GnosisError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(GnosisError::Validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

// =============================================================================
// ENTITY
// =============================================================================

/// One immutable version of an entity, as stored in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Starts at 1 and increments by one per committed write.
    pub version: u64,
    /// Back-reference to the version this one supersedes.
    pub prev_version: Option<u64>,
    pub payload: Payload,
    pub provenance: Provenance,
    pub created_by: Actor,
    /// The transaction that committed this version, if any.
    pub tx_id: Option<TxId>,
    pub committed_at: DateTime<Utc>,
}

impl Entity {
    #[must_use]
    pub fn versioned_id(&self) -> VersionedId {
        VersionedId::new(self.id, self.version)
    }

    /// BLAKE3 hash of the canonical JSON form of the payload.
    pub fn payload_hash(&self) -> Result<ContentHash, GnosisError> {
        hash_canonical(&self.payload)
    }

    #[must_use]
    pub fn as_node(&self) -> Option<&NodeData> {
        self.payload.as_node()
    }

    #[must_use]
    pub fn as_edge(&self) -> Option<&EdgeData> {
        self.payload.as_edge()
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.payload.is_retired()
    }
}

// =============================================================================
// WRITE REQUESTS
// =============================================================================

/// The version a writer expects to supersede (optimistic concurrency).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Base {
    /// The id must not exist yet.
    Absent,
    /// The id's latest version must be exactly this one.
    Version(u64),
    /// Whatever is latest when the write is buffered. A transaction pins this
    /// to a concrete version at `write` time.
    Latest,
}

/// A requested write of one entity version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub id: EntityId,
    pub base: Base,
    pub payload: Payload,
    pub provenance: Provenance,
    pub created_by: Actor,
}

impl EntityWrite {
    /// Write a brand new entity under a freshly minted id.
    #[must_use]
    pub fn create(payload: Payload, provenance: Provenance) -> Self {
        Self {
            id: EntityId::new(),
            base: Base::Absent,
            payload,
            provenance,
            created_by: Actor::System,
        }
    }

    /// Supersede exactly `base_version` of `id`.
    #[must_use]
    pub fn update(id: EntityId, base_version: u64, payload: Payload, provenance: Provenance) -> Self {
        Self {
            id,
            base: Base::Version(base_version),
            payload,
            provenance,
            created_by: Actor::System,
        }
    }

    /// Supersede whatever version of `id` is current at buffering time.
    #[must_use]
    pub fn update_latest(id: EntityId, payload: Payload, provenance: Provenance) -> Self {
        Self {
            id,
            base: Base::Latest,
            payload,
            provenance,
            created_by: Actor::System,
        }
    }

    /// Tombstone the current version of `id`.
    #[must_use]
    pub fn retire(id: EntityId, kind: EntityKind, provenance: Provenance) -> Self {
        Self {
            id,
            base: Base::Latest,
            payload: Payload::Retired(kind),
            provenance,
            created_by: Actor::System,
        }
    }

    /// Attribute the write to an actor.
    #[must_use]
    pub fn by(mut self, actor: Actor) -> Self {
        self.created_by = actor;
        self
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Gnosis core.
///
/// - `Conflict` is the only retryable class: re-read and re-apply.
/// - `Validation` needs different input.
/// - `Permission` is a boundary violation and is always audited by the caller.
/// - Storage errors reach the transaction manager unchanged; a failed commit
///   is reported to its caller as `Conflict`.
#[derive(Debug, Error)]
pub enum GnosisError {
    /// The entity, or the requested version of it, does not exist.
    #[error("Not found: {id}{}", version.map(|v| format!(" version {}", v)).unwrap_or_default())]
    NotFound { id: EntityId, version: Option<u64> },

    /// Optimistic concurrency violation or a write lock held by another transaction.
    #[error("Conflict on {id}: {reason}")]
    Conflict { id: EntityId, reason: String },

    /// Schema or range violation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requested capabilities exceed what was granted.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// An enabled plugin already owns the operation name.
    #[error("Operation already registered: {0}")]
    DuplicateOperation(String),

    /// No plugin is registered under the operation name.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Invalid recursive-model depth or state.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The transaction already committed or rolled back.
    #[error("Transaction {0} is not pending")]
    TransactionClosed(TxId),

    /// The durable journal failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GnosisError {
    /// Whether re-reading and re-applying may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_parses_its_display() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
        assert_eq!(EntityId::from_u128(id.as_u128()), id);
    }

    #[test]
    fn entity_id_rejects_garbage() {
        let result = "not-a-uuid".parse::<EntityId>();
        assert!(matches!(result, Err(GnosisError::Validation(_))));
    }

    #[test]
    fn plane_names_are_lowercase() {
        for plane in Plane::ALL {
            assert_eq!(plane.to_string().parse::<Plane>().expect("parse"), plane);
        }
        assert_eq!(Actor::Plane(Plane::Mental).to_string(), "plane:mental");
        assert_eq!(Actor::Plugin("echo".into()).to_string(), "plugin:echo");
    }

    #[test]
    fn provenance_rejects_out_of_range_confidence() {
        let now = Utc::now();
        assert!(Provenance::new(now).validate().is_ok());
        assert!(Provenance::new(now).with_confidence(0.0).validate().is_ok());
        assert!(Provenance::new(now).with_confidence(1.5).validate().is_err());
        assert!(Provenance::new(now).with_confidence(-0.1).validate().is_err());
        assert!(Provenance::new(now).with_confidence(f64::NAN).validate().is_err());
    }

    #[test]
    fn payload_kind_follows_variant() {
        let node = Payload::node(NodeLabel::Belief, json!({"claim": "sky is blue"}));
        assert_eq!(node.kind(), EntityKind::Node);

        let edge = Payload::edge(EntityId::new(), EntityId::new(), "supports");
        assert_eq!(edge.kind(), EntityKind::Edge);
        assert!(edge.as_node().is_none());

        let tombstone = Payload::Retired(EntityKind::Edge);
        assert_eq!(tombstone.kind(), EntityKind::Edge);
        assert!(tombstone.is_retired());
        assert!(tombstone.as_edge().is_none());
    }

    #[test]
    fn tags_apply_to_nodes_only() {
        let node = Payload::node(NodeLabel::Value, json!({})).with_tags(["mentalism"]);
        assert!(node.as_node().is_some_and(|n| n.tags.contains("mentalism")));

        let edge = Payload::edge(EntityId::new(), EntityId::new(), "r").with_tags(["ignored"]);
        assert!(edge.as_edge().is_some());
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = GnosisError::Conflict {
            id: EntityId::new(),
            reason: "stale".into(),
        };
        assert!(conflict.is_retryable());
        assert!(!GnosisError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn memory_type_round_trips_through_text() {
        let parsed: MemoryType = "Episodic".parse().expect("parse");
        assert_eq!(parsed, MemoryType::Episodic);
        assert_eq!(MemoryType::Procedural.to_string(), "procedural");
    }
}
