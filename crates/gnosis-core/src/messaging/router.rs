use super::{
    BoundaryPolicy, Delivery, Envelope, KeyRing, Operation, RejectReason, SignedMessage,
};
use crate::audit::{AuditLog, Outcome};
use crate::canonical::{ContentHash, hash_canonical};
use crate::clock::{Clock, seconds_between};
use crate::memory::{MemorySubsystem, NewMemory};
use crate::primitives::MAX_RECALL_RESULTS;
use crate::registry::TransformationRegistry;
use crate::selfmap::SelfMap;
use crate::store::EntityStore;
use crate::types::{Actor, EntityId, GnosisError, MemoryType, Plane, Provenance};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct StoreArgs {
    memory_type: MemoryType,
    #[serde(default)]
    content: Value,
    valence: Option<f64>,
    decay_rate: Option<f64>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct RecallArgs {
    #[serde(default)]
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    memory_type: Option<MemoryType>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct ObserveArgs {
    depth: u32,
}

#[derive(Debug, Deserialize)]
struct SalientArgs {
    #[serde(default = "default_top_k")]
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct QualiaArgs {
    target: EntityId,
    valence: f64,
    #[serde(default = "default_intensity")]
    intensity: f64,
}

fn default_intensity() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct PublishArgs {
    id: Option<EntityId>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct EntityArgs {
    id: EntityId,
    version: Option<u64>,
}

fn args<T: DeserializeOwned>(payload: &Value) -> Result<T, GnosisError> {
    T::deserialize(payload)
        .map_err(|e| GnosisError::Validation(format!("bad message payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, GnosisError> {
    serde_json::to_value(value).map_err(|e| GnosisError::Serialization(e.to_string()))
}

/// Verifies, authorizes and dispatches plane messages.
#[derive(Debug)]
pub struct MessageRouter {
    keys: RwLock<KeyRing>,
    policy: RwLock<BoundaryPolicy>,
    signing_key: SigningKey,
    window_secs: u64,
    clock: Arc<dyn Clock>,
    /// `(sender, nonce)` -> envelope timestamp, pruned past the window.
    nonces: Mutex<BTreeMap<(Plane, String), DateTime<Utc>>>,
    audit: Arc<AuditLog>,
    store: Arc<EntityStore>,
    memory: Arc<MemorySubsystem>,
    selfmap: Arc<SelfMap>,
    registry: Arc<TransformationRegistry>,
}

impl MessageRouter {
    pub fn new(
        signing_key: SigningKey,
        window_secs: u64,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        store: Arc<EntityStore>,
        memory: Arc<MemorySubsystem>,
        selfmap: Arc<SelfMap>,
        registry: Arc<TransformationRegistry>,
    ) -> Self {
        Self {
            keys: RwLock::new(KeyRing::new()),
            policy: RwLock::new(BoundaryPolicy::standard()),
            signing_key,
            window_secs,
            clock,
            nonces: Mutex::new(BTreeMap::new()),
            audit,
            store,
            memory,
            selfmap,
            registry,
        }
    }

    /// Key that signs responses.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn register_plane_key(&self, plane: Plane, key: VerifyingKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(plane, key);
        debug!(%plane, "plane key registered");
    }

    pub fn set_policy(&self, policy: BoundaryPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process a message given as JSON text. Unparseable input is
    /// rejected as `BadSignature`.
    pub fn process_json(&self, text: &str) -> Delivery {
        match SignedMessage::from_json(text) {
            Ok(message) => self.process(&message),
            Err(err) => {
                let detail = format!("unparseable message: {}", err);
                warn!(reason = %RejectReason::BadSignature, %detail, "message rejected");
                self.audit_reject(
                    Actor::System,
                    Some(ContentHash::of(text.as_bytes())),
                    RejectReason::BadSignature,
                    &detail,
                );
                Delivery::Rejected {
                    reason: RejectReason::BadSignature,
                    detail,
                }
            }
        }
    }

    /// Run a message through verification, freshness, boundary checks and
    /// dispatch. Nothing is applied for a rejected message.
    pub fn process(&self, message: &SignedMessage) -> Delivery {
        let envelope = &message.envelope;
        let hash = hash_canonical(envelope).ok();

        let operation = match self.authorize(message) {
            Ok(operation) => operation,
            Err((reason, detail)) => {
                warn!(
                    from = %envelope.from_plane,
                    to = %envelope.to_plane,
                    op = %envelope.op,
                    %reason,
                    %detail,
                    "message rejected"
                );
                self.audit_reject(Actor::Plane(envelope.from_plane), hash, reason, &detail);
                return Delivery::Rejected { reason, detail };
            }
        };

        let result = match &operation {
            Operation::Invoke(name) => self
                .registry
                .invoke(name, &envelope.payload, envelope.from_plane)
                .map_err(|e| e.to_string())
                .and_then(|done| to_value(&done).map_err(|e| e.to_string())),
            other => self.dispatch(envelope, other).map_err(|e| e.to_string()),
        };
        let body = match result {
            Ok(result) => json!({ "status": "ok", "result": result }),
            Err(error) => json!({ "status": "error", "error": error }),
        };
        let ok = body["status"] == "ok";
        if let Err(err) = self.audit.record(
            Actor::Plane(envelope.from_plane),
            "message.apply",
            if ok { Outcome::Success } else { Outcome::Failure },
            hash,
            format!("{} {} -> {}", envelope.op, envelope.from_plane, envelope.to_plane),
        ) {
            warn!(error = %err, "failed to audit applied message");
        }

        let response = Envelope {
            from_plane: envelope.to_plane,
            to_plane: envelope.from_plane,
            op: envelope.op.clone(),
            payload: body,
            nonce: envelope.nonce.clone(),
            timestamp: self.clock.now(),
        };
        match SignedMessage::sign(response, &self.signing_key) {
            Ok(signed) => {
                debug!(op = %envelope.op, from = %envelope.from_plane, ok, "message applied");
                Delivery::Applied(signed)
            }
            Err(err) => {
                warn!(error = %err, "failed to sign response");
                Delivery::Rejected {
                    reason: RejectReason::BadSignature,
                    detail: err.to_string(),
                }
            }
        }
    }

    fn authorize(&self, message: &SignedMessage) -> Result<Operation, (RejectReason, String)> {
        let envelope = &message.envelope;

        // Verified
        let key = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(envelope.from_plane)
            .copied();
        let Some(key) = key else {
            return Err((
                RejectReason::BadSignature,
                format!("no key registered for plane {}", envelope.from_plane),
            ));
        };
        if !message.verify(&key) {
            return Err((RejectReason::BadSignature, "signature mismatch".into()));
        }

        // Fresh
        let now = self.clock.now();
        let window = self.window_secs as f64;
        let skew = seconds_between(envelope.timestamp, now).abs();
        if skew > window {
            return Err((
                RejectReason::Replay,
                format!("timestamp {:.0}s outside the {}s window", skew, self.window_secs),
            ));
        }
        {
            let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
            nonces.retain(|_, seen| seconds_between(*seen, now).abs() <= window);
            let key = (envelope.from_plane, envelope.nonce.clone());
            if nonces.contains_key(&key) {
                return Err((RejectReason::Replay, format!("nonce {} already seen", envelope.nonce)));
            }
            nonces.insert(key, envelope.timestamp);
        }

        // Authorized
        let Some(operation) = Operation::parse(&envelope.op) else {
            return Err((RejectReason::Forbidden, format!("unknown op '{}'", envelope.op)));
        };
        let category = operation.category();
        let permitted = self
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .permits(envelope.from_plane, envelope.to_plane, category);
        if !permitted {
            return Err((
                RejectReason::Forbidden,
                format!(
                    "{} may not send {:?} to {}",
                    envelope.from_plane, category, envelope.to_plane
                ),
            ));
        }
        Ok(operation)
    }

    /// Store, memory and self-map operations. Invocations go through the registry.
    fn dispatch(&self, envelope: &Envelope, operation: &Operation) -> Result<Value, GnosisError> {
        let payload = &envelope.payload;
        match operation {
            Operation::Invoke(name) => Err(GnosisError::UnknownOperation(name.clone())),
            Operation::MemoryStore => {
                let a: StoreArgs = args(payload)?;
                let mut memory = NewMemory::new(a.memory_type, a.content);
                memory.valence = a.valence;
                memory.decay_rate = a.decay_rate;
                memory.tags = a.tags;
                let id = self.memory.store_with(memory)?;
                Ok(json!({ "id": id.to_string() }))
            }
            Operation::MemoryRecall => {
                let a: RecallArgs = args(payload)?;
                let hits = self.memory.recall(
                    &a.query,
                    a.top_k.min(MAX_RECALL_RESULTS),
                    a.memory_type,
                )?;
                to_value(&hits)
            }
            Operation::SelfMapChain => to_value(&self.selfmap.chain()?),
            Operation::SelfMapObserve => {
                let a: ObserveArgs = args(payload)?;
                to_value(&self.selfmap.observe_self_modeling(a.depth)?)
            }
            Operation::SelfMapSalient => {
                let a: SalientArgs = args(payload)?;
                to_value(&self.selfmap.salient_nodes(a.top_n.min(MAX_RECALL_RESULTS)))
            }
            Operation::SelfMapQualia => {
                let a: QualiaArgs = args(payload)?;
                let salience = self.selfmap.apply_qualia(a.target, a.valence, a.intensity)?;
                Ok(json!({ "salience": salience }))
            }
            Operation::ArchetypePublish => {
                let a: PublishArgs = args(payload)?;
                let id = self.selfmap.publish_archetype(
                    a.id.unwrap_or_else(EntityId::new),
                    a.content,
                    a.tags,
                    Provenance::new(self.clock.now()),
                )?;
                Ok(json!({ "id": id.to_string() }))
            }
            Operation::EntityGet => {
                let a: EntityArgs = args(payload)?;
                to_value(&*self.store.get(a.id, a.version)?)
            }
            Operation::EntityHistory => {
                let a: EntityArgs = args(payload)?;
                let history = self.store.history(a.id)?;
                let versions: Vec<_> = history.iter().collect();
                to_value(&versions)
            }
        }
    }

    fn audit_reject(
        &self,
        actor: Actor,
        hash: Option<ContentHash>,
        reason: RejectReason,
        detail: &str,
    ) {
        if let Err(err) = self.audit.record(
            actor,
            "message.reject",
            Outcome::Rejected,
            hash,
            format!("{}: {}", reason, detail),
        ) {
            warn!(error = %err, "failed to audit rejected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GnosisConfig;
    use crate::messaging::{MessageSigner, OpCategory, generate_signing_key};
    use crate::storage::MemoryJournal;
    use crate::system::GnosisCore;
    use crate::types::NodeLabel;

    struct Fixture {
        clock: Arc<ManualClock>,
        core: GnosisCore,
        digital: MessageSigner,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let core = GnosisCore::open(
            Arc::new(MemoryJournal::new()),
            GnosisConfig::default(),
            clock.clone(),
            generate_signing_key(),
        )
        .expect("core");
        let digital = MessageSigner::generate(Plane::Digital);
        core.router()
            .register_plane_key(Plane::Digital, digital.verifying_key());
        Fixture {
            clock,
            core,
            digital,
        }
    }

    fn rejects(f: &Fixture) -> usize {
        f.core
            .audit()
            .by_operation("message.reject")
            .expect("audit")
            .len()
    }

    #[test]
    fn applied_response_is_signed_by_core() {
        let f = fixture();
        let message = f
            .digital
            .sign(
                Plane::Mental,
                "memory.store",
                json!({"memory_type": "episodic", "content": {"episode": "met user"}}),
                f.clock.now(),
            )
            .expect("sign");

        let response = f
            .core
            .router()
            .process(&message)
            .into_response()
            .expect("applied");
        assert!(response.verify(&f.core.router().verifying_key()));
        assert_eq!(response.envelope.to_plane, Plane::Digital);
        assert_eq!(response.envelope.payload["status"], "ok");
        assert_eq!(f.core.memory().len(), 1);
    }

    #[test]
    fn tampered_payload_is_bad_signature() {
        let f = fixture();
        for op in ["memory.store", "invoke:graph.upsert_node", "no.such.op"] {
            let mut message = f
                .digital
                .sign(Plane::Mental, op, json!({"memory_type": "semantic"}), f.clock.now())
                .expect("sign");
            message.envelope.payload = json!({"memory_type": "emotional"});
            assert_eq!(
                f.core.router().process(&message).reject_reason(),
                Some(RejectReason::BadSignature)
            );
        }
        assert!(f.core.memory().is_empty());
        assert_eq!(rejects(&f), 3);
    }

    #[test]
    fn unknown_sender_is_bad_signature() {
        let f = fixture();
        let stranger = MessageSigner::generate(Plane::Mental);
        let message = stranger
            .sign(Plane::Digital, "selfmap.chain", Value::Null, f.clock.now())
            .expect("sign");
        assert_eq!(
            f.core.router().process(&message).reject_reason(),
            Some(RejectReason::BadSignature)
        );
    }

    #[test]
    fn replayed_and_stale_messages_are_rejected() {
        let f = fixture();
        let message = f
            .digital
            .sign(Plane::Mental, "selfmap.chain", Value::Null, f.clock.now())
            .expect("sign");
        assert!(f.core.router().process(&message).is_applied());
        assert_eq!(
            f.core.router().process(&message).reject_reason(),
            Some(RejectReason::Replay)
        );

        let stale = f
            .digital
            .sign(Plane::Mental, "selfmap.chain", Value::Null, f.clock.now())
            .expect("sign");
        f.clock.advance_secs(301.0);
        assert_eq!(
            f.core.router().process(&stale).reject_reason(),
            Some(RejectReason::Replay)
        );
    }

    #[test]
    fn boundary_policy_forbids_writes_to_metaphysical() {
        let f = fixture();
        let write = f
            .digital
            .sign(
                Plane::Metaphysical,
                "memory.store",
                json!({"memory_type": "episodic"}),
                f.clock.now(),
            )
            .expect("sign");
        assert_eq!(
            f.core.router().process(&write).reject_reason(),
            Some(RejectReason::Forbidden)
        );
        assert!(f.core.memory().is_empty());

        let unknown = f
            .digital
            .sign(Plane::Mental, "memory.forget", Value::Null, f.clock.now())
            .expect("sign");
        assert_eq!(
            f.core.router().process(&unknown).reject_reason(),
            Some(RejectReason::Forbidden)
        );

        let mut policy = f.core.router().policy();
        policy.deny(Plane::Digital, Plane::Mental, OpCategory::SelfMapRead);
        f.core.router().set_policy(policy);
        let read = f
            .digital
            .sign(Plane::Mental, "selfmap.chain", Value::Null, f.clock.now())
            .expect("sign");
        assert_eq!(
            f.core.router().process(&read).reject_reason(),
            Some(RejectReason::Forbidden)
        );
    }

    #[test]
    fn garbage_json_is_rejected() {
        let f = fixture();
        let delivery = f.core.router().process_json("{not json");
        assert_eq!(delivery.reject_reason(), Some(RejectReason::BadSignature));
        assert_eq!(rejects(&f), 1);
    }

    #[test]
    fn dispatch_errors_are_applied_with_error_body() {
        let f = fixture();
        let message = f
            .digital
            .sign(
                Plane::Mental,
                "entity.get",
                json!({"id": EntityId::new().to_string()}),
                f.clock.now(),
            )
            .expect("sign");
        let response = f
            .core
            .router()
            .process(&message)
            .into_response()
            .expect("applied");
        assert_eq!(response.envelope.payload["status"], "error");
    }

    #[test]
    fn selfmap_and_history_ops_dispatch() {
        let f = fixture();
        let base = f
            .core
            .selfmap()
            .create_base_self(json!({"name": "self"}), Provenance::new(f.clock.now()))
            .expect("base");
        f.core.selfmap().create_recursive_self_model(1).expect("chain");

        let observe = f
            .digital
            .sign(Plane::Mental, "selfmap.observe", json!({"depth": 1}), f.clock.now())
            .expect("sign");
        let response = f
            .core
            .router()
            .process_json(&observe.to_json().expect("json"))
            .into_response()
            .expect("applied");
        assert_eq!(response.envelope.payload["result"]["level"], 2);

        let history = f
            .digital
            .sign(
                Plane::Metaphysical,
                "entity.history",
                json!({"id": base.entity_id.to_string()}),
                f.clock.now(),
            )
            .expect("sign");
        let response = f
            .core
            .router()
            .process(&history)
            .into_response()
            .expect("applied");
        assert_eq!(
            response.envelope.payload["result"].as_array().map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn archetypes_come_from_the_metaphysical_plane() {
        let f = fixture();
        let metaphysical = MessageSigner::generate(Plane::Metaphysical);
        f.core
            .router()
            .register_plane_key(Plane::Metaphysical, metaphysical.verifying_key());
        let inbox = f.core.selfmap().subscribe_archetypes();

        let forged = f
            .digital
            .sign(Plane::Mental, "archetype.publish", json!({"content": {}}), f.clock.now())
            .expect("sign");
        assert_eq!(
            f.core.router().process(&forged).reject_reason(),
            Some(RejectReason::Forbidden)
        );

        let publish = metaphysical
            .sign(
                Plane::Mental,
                "archetype.publish",
                json!({"content": {"pattern": "rhythm"}, "tags": ["rhythm"]}),
                f.clock.now(),
            )
            .expect("sign");
        let response = f
            .core
            .router()
            .process(&publish)
            .into_response()
            .expect("applied");
        assert_eq!(response.envelope.payload["status"], "ok");

        let published = inbox.try_recv().expect("delivered");
        let node = published.as_node().expect("node");
        assert_eq!(node.label, NodeLabel::Archetype);
        assert_eq!(
            response.envelope.payload["result"]["id"],
            json!(published.id.to_string())
        );
    }

    #[test]
    fn qualia_feedback_and_salience_dispatch() {
        let f = fixture();
        let base = f
            .core
            .selfmap()
            .create_base_self(json!({"name": "self"}), Provenance::new(f.clock.now()))
            .expect("base");

        let feel = f
            .digital
            .sign(
                Plane::Mental,
                "selfmap.qualia",
                json!({"target": base.entity_id.to_string(), "valence": -1.0}),
                f.clock.now(),
            )
            .expect("sign");
        let response = f
            .core
            .router()
            .process(&feel)
            .into_response()
            .expect("applied");
        assert_eq!(response.envelope.payload["status"], "ok");

        let salient = f
            .digital
            .sign(Plane::Metaphysical, "selfmap.salient", json!({"top_n": 5}), f.clock.now())
            .expect("sign");
        let response = f
            .core
            .router()
            .process(&salient)
            .into_response()
            .expect("applied");
        let ranked = response.envelope.payload["result"].as_array().expect("ranked list");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0]["entity_id"], json!(base.entity_id.to_string()));
        assert!(f.core.selfmap().verify_chain().is_ok());
    }
}
