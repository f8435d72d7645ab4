//! # Messaging Layer
//!
//! Signed envelopes between planes.
//!
//! ```text
//! Received -> Verified -> Authorized -> Applied
//!                 \            \
//!                  +------------+--> Rejected(reason)
//! ```
//!
//! - Signature: ed25519 over the canonical JSON of the envelope, checked
//!   against the sender plane's key in the [`KeyRing`].
//! - Freshness: timestamp within the window, nonce unseen within the window.
//! - Boundary: `(from, to, op category)` must be on the [`BoundaryPolicy`] allow-list.
//!
//! Rejections are typed outcomes ([`Delivery::Rejected`]), never errors.

mod router;

pub use router::MessageRouter;

use crate::canonical::canonical_bytes;
use crate::primitives::MAX_NAME_LENGTH;
use crate::types::{GnosisError, Plane};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// The signed part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from_plane: Plane,
    pub to_plane: Plane,
    pub op: String,
    #[serde(default)]
    pub payload: Value,
    /// Hex-encoded random bytes, unique per sender within the freshness window.
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// New envelope with a fresh random nonce.
    pub fn new(
        from_plane: Plane,
        to_plane: Plane,
        op: impl Into<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            from_plane,
            to_plane,
            op: op.into(),
            payload,
            nonce: hex::encode(rand::random::<[u8; 16]>()),
            timestamp,
        }
    }

    /// The bytes a signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, GnosisError> {
        canonical_bytes(self)
    }
}

/// An envelope and the hex-encoded ed25519 signature over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub envelope: Envelope,
    pub signature: String,
}

impl SignedMessage {
    pub fn sign(envelope: Envelope, key: &SigningKey) -> Result<Self, GnosisError> {
        let signature = key.sign(&envelope.signing_bytes()?);
        Ok(Self {
            envelope,
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// Whether the signature matches the envelope under `key`. Malformed
    /// signatures do not verify.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        let Ok(bytes) = self.envelope.signing_bytes() else {
            return false;
        };
        let Some(signature) = hex::decode(&self.signature)
            .ok()
            .and_then(|raw| <[u8; 64]>::try_from(raw.as_slice()).ok())
            .map(|raw| Signature::from_bytes(&raw))
        else {
            return false;
        };
        key.verify(&bytes, &signature).is_ok()
    }

    pub fn to_json(&self) -> Result<String, GnosisError> {
        serde_json::to_string(self).map_err(|e| GnosisError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, GnosisError> {
        serde_json::from_str(text).map_err(|e| GnosisError::Serialization(e.to_string()))
    }
}

// =============================================================================
// KEYS
// =============================================================================

/// Parse a hex-encoded ed25519 public key.
pub fn verifying_key_from_hex(text: &str) -> Result<VerifyingKey, GnosisError> {
    let raw = hex::decode(text.trim())
        .map_err(|e| GnosisError::Validation(format!("public key is not hex: {}", e)))?;
    let raw = <[u8; 32]>::try_from(raw.as_slice())
        .map_err(|_| GnosisError::Validation("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| GnosisError::Validation(format!("invalid public key: {}", e)))
}

/// Parse a hex-encoded ed25519 secret key.
pub fn signing_key_from_hex(text: &str) -> Result<SigningKey, GnosisError> {
    let raw = hex::decode(text.trim())
        .map_err(|e| GnosisError::Validation(format!("secret key is not hex: {}", e)))?;
    let raw = <[u8; 32]>::try_from(raw.as_slice())
        .map_err(|_| GnosisError::Validation("secret key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&raw))
}

/// A fresh random signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Registered public key per plane.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<Plane, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a plane's key.
    pub fn register(&mut self, plane: Plane, key: VerifyingKey) {
        self.keys.insert(plane, key);
    }

    pub fn get(&self, plane: Plane) -> Option<&VerifyingKey> {
        self.keys.get(&plane)
    }

    pub fn planes(&self) -> impl Iterator<Item = Plane> + '_ {
        self.keys.keys().copied()
    }
}

/// Builds signed messages for one sending plane.
#[derive(Debug, Clone)]
pub struct MessageSigner {
    plane: Plane,
    key: SigningKey,
}

impl MessageSigner {
    pub fn new(plane: Plane, key: SigningKey) -> Self {
        Self { plane, key }
    }

    /// Signer with a random key.
    pub fn generate(plane: Plane) -> Self {
        Self::new(plane, generate_signing_key())
    }

    pub fn plane(&self) -> Plane {
        self.plane
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(
        &self,
        to_plane: Plane,
        op: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<SignedMessage, GnosisError> {
        SignedMessage::sign(Envelope::new(self.plane, to_plane, op, payload, now), &self.key)
    }
}

// =============================================================================
// OPERATIONS & BOUNDARY POLICY
// =============================================================================

/// Coarse class of a message operation, used by the boundary policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCategory {
    Invoke,
    MemoryRead,
    MemoryWrite,
    SelfMapRead,
    SelfMapWrite,
    EntityRead,
    ArchetypePublish,
}

impl OpCategory {
    pub const ALL: [OpCategory; 7] = [
        OpCategory::Invoke,
        OpCategory::MemoryRead,
        OpCategory::MemoryWrite,
        OpCategory::SelfMapRead,
        OpCategory::SelfMapWrite,
        OpCategory::EntityRead,
        OpCategory::ArchetypePublish,
    ];

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::MemoryRead | Self::SelfMapRead | Self::EntityRead
        )
    }
}

/// A parsed message operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Invoke(String),
    MemoryStore,
    MemoryRecall,
    SelfMapChain,
    SelfMapObserve,
    SelfMapSalient,
    SelfMapQualia,
    EntityGet,
    EntityHistory,
    ArchetypePublish,
}

impl Operation {
    /// Parse an `op` string. `None` for anything unrecognized.
    pub fn parse(op: &str) -> Option<Self> {
        if let Some(name) = op.strip_prefix("invoke:") {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                return None;
            }
            return Some(Self::Invoke(name.to_string()));
        }
        match op {
            "memory.store" => Some(Self::MemoryStore),
            "memory.recall" => Some(Self::MemoryRecall),
            "selfmap.chain" => Some(Self::SelfMapChain),
            "selfmap.observe" => Some(Self::SelfMapObserve),
            "selfmap.salient" => Some(Self::SelfMapSalient),
            "selfmap.qualia" => Some(Self::SelfMapQualia),
            "entity.get" => Some(Self::EntityGet),
            "entity.history" => Some(Self::EntityHistory),
            "archetype.publish" => Some(Self::ArchetypePublish),
            _ => None,
        }
    }

    pub fn category(&self) -> OpCategory {
        match self {
            Self::Invoke(_) => OpCategory::Invoke,
            Self::MemoryStore => OpCategory::MemoryWrite,
            // Recall only touches volatile salience.
            Self::MemoryRecall => OpCategory::MemoryRead,
            Self::SelfMapChain | Self::SelfMapSalient => OpCategory::SelfMapRead,
            Self::SelfMapObserve | Self::SelfMapQualia => OpCategory::SelfMapWrite,
            Self::EntityGet | Self::EntityHistory => OpCategory::EntityRead,
            Self::ArchetypePublish => OpCategory::ArchetypePublish,
        }
    }
}

/// Allow-list of `(from, to, category)` triples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundaryPolicy {
    allowed: BTreeSet<(Plane, Plane, OpCategory)>,
}

impl BoundaryPolicy {
    /// Deny everything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every plane may send anything to the digital and mental planes; the
    /// metaphysical plane only accepts reads. Only the metaphysical plane
    /// publishes archetypes.
    pub fn standard() -> Self {
        let mut policy = Self::empty();
        for from in Plane::ALL {
            for to in Plane::ALL {
                for category in OpCategory::ALL {
                    let permitted = match category {
                        OpCategory::ArchetypePublish => from == Plane::Metaphysical,
                        _ => to != Plane::Metaphysical || category.is_read(),
                    };
                    if permitted {
                        policy.allow(from, to, category);
                    }
                }
            }
        }
        policy
    }

    pub fn allow(&mut self, from: Plane, to: Plane, category: OpCategory) {
        self.allowed.insert((from, to, category));
    }

    pub fn deny(&mut self, from: Plane, to: Plane, category: OpCategory) {
        self.allowed.remove(&(from, to, category));
    }

    pub fn permits(&self, from: Plane, to: Plane, category: OpCategory) -> bool {
        self.allowed.contains(&(from, to, category))
    }
}

// =============================================================================
// DELIVERY
// =============================================================================

/// Why a message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadSignature,
    Replay,
    Forbidden,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BadSignature => "bad_signature",
            Self::Replay => "replay",
            Self::Forbidden => "forbidden",
        };
        f.write_str(name)
    }
}

/// Final state of a processed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Dispatched; carries the signed response.
    Applied(SignedMessage),
    Rejected { reason: RejectReason, detail: String },
}

impl Delivery {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The signed response, if the message was applied.
    pub fn into_response(self) -> Option<SignedMessage> {
        match self {
            Self::Applied(response) => Some(response),
            Self::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_covers_payload() {
        let signer = MessageSigner::generate(Plane::Digital);
        let message = signer
            .sign(Plane::Mental, "memory.recall", json!({"query": "x"}), Utc::now())
            .expect("sign");
        assert!(message.verify(&signer.verifying_key()));

        let mut tampered = message.clone();
        tampered.envelope.payload = json!({"query": "y"});
        assert!(!tampered.verify(&signer.verifying_key()));

        let other = MessageSigner::generate(Plane::Digital);
        assert!(!message.verify(&other.verifying_key()));
    }

    #[test]
    fn malformed_signature_does_not_verify() {
        let signer = MessageSigner::generate(Plane::Mental);
        let mut message = signer
            .sign(Plane::Mental, "selfmap.chain", Value::Null, Utc::now())
            .expect("sign");
        message.signature = "zz".into();
        assert!(!message.verify(&signer.verifying_key()));
        message.signature = "abcd".into();
        assert!(!message.verify(&signer.verifying_key()));
    }

    #[test]
    fn json_round_trip_keeps_signature_valid() {
        let signer = MessageSigner::generate(Plane::Mental);
        let message = signer
            .sign(Plane::Digital, "invoke:echo", json!({"b": 1, "a": [1.5, "x"]}), Utc::now())
            .expect("sign");
        let text = message.to_json().expect("json");
        let parsed = SignedMessage::from_json(&text).expect("parse");
        assert!(parsed.verify(&signer.verifying_key()));
    }

    #[test]
    fn operations_parse() {
        assert_eq!(
            Operation::parse("invoke:echo"),
            Some(Operation::Invoke("echo".into()))
        );
        assert_eq!(Operation::parse("invoke:"), None);
        assert_eq!(Operation::parse("memory.forget"), None);
        assert_eq!(
            Operation::parse("entity.history").map(|op| op.category()),
            Some(OpCategory::EntityRead)
        );
    }

    #[test]
    fn standard_policy_keeps_metaphysical_read_only() {
        let policy = BoundaryPolicy::standard();
        assert!(policy.permits(Plane::Digital, Plane::Mental, OpCategory::Invoke));
        assert!(policy.permits(Plane::Mental, Plane::Metaphysical, OpCategory::SelfMapRead));
        assert!(!policy.permits(Plane::Mental, Plane::Metaphysical, OpCategory::Invoke));
        assert!(!policy.permits(Plane::Digital, Plane::Metaphysical, OpCategory::MemoryWrite));
        assert!(!BoundaryPolicy::empty().permits(Plane::Digital, Plane::Mental, OpCategory::EntityRead));
        assert!(policy.permits(Plane::Metaphysical, Plane::Mental, OpCategory::ArchetypePublish));
        assert!(!policy.permits(Plane::Mental, Plane::Mental, OpCategory::ArchetypePublish));
        assert!(!policy.permits(Plane::Digital, Plane::Metaphysical, OpCategory::ArchetypePublish));
    }

    #[test]
    fn key_hex_round_trip() {
        let key = generate_signing_key();
        let public = hex::encode(key.verifying_key().as_bytes());
        assert_eq!(verifying_key_from_hex(&public).expect("pk"), key.verifying_key());
        let secret = hex::encode(key.to_bytes());
        assert_eq!(
            signing_key_from_hex(&secret).expect("sk").verifying_key(),
            key.verifying_key()
        );
        assert!(verifying_key_from_hex("abcd").is_err());
    }
}
