//! # Transaction Manager
//!
//! Atomic multi-entity updates over the Entity Store.
//!
//! State machine per transaction:
//!
//! ```text
//! Pending --commit--> Committed
//!    |
//!    +--rollback / failed commit--> RolledBack
//! ```
//!
//! Both end states are terminal. Writes are buffered until commit, so readers
//! never see a pending write. Each entity id may be write-locked by at most
//! one pending transaction; a second transaction touching the same id fails
//! fast with `Conflict` instead of waiting.
//!
//! Finished transactions move to a bounded history of the most recent
//! [`SETTLED_TX_HISTORY`] entries; after that, their handles are unknown.

use crate::audit::{AuditLog, Outcome};
use crate::primitives::{MAX_TRANSACTION_WRITES, SETTLED_TX_HISTORY};
use crate::store::{EntityStore, validate_write};
use crate::types::{Actor, Base, EntityId, EntityWrite, GnosisError, TxId, VersionedId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

/// Handle returned by [`TransactionManager::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHandle {
    id: TxId,
}

impl TxHandle {
    pub fn id(&self) -> TxId {
        self.id
    }
}

/// Read-only copy of a transaction's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub tx_id: TxId,
    pub started_at: DateTime<Utc>,
    pub actor: Actor,
    pub writes: Vec<EntityWrite>,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Writes handed to the store; no further changes accepted.
    Committing,
    Done(TxStatus),
}

#[derive(Debug)]
struct TxState {
    started_at: DateTime<Utc>,
    actor: Actor,
    writes: Vec<EntityWrite>,
    phase: Phase,
}

/// Open transactions, plus the most recent finished ones.
#[derive(Debug, Default)]
struct Ledger {
    live: BTreeMap<TxId, TxState>,
    settled: BTreeMap<TxId, TxState>,
}

impl Ledger {
    fn get(&self, id: &TxId) -> Option<&TxState> {
        self.live.get(id).or_else(|| self.settled.get(id))
    }

    fn open_mut(&mut self, id: &TxId) -> Option<&mut TxState> {
        self.live.get_mut(id).filter(|s| s.phase == Phase::Open)
    }

    fn settle(&mut self, id: TxId, status: TxStatus) {
        if let Some(mut state) = self.live.remove(&id) {
            state.phase = Phase::Done(status);
            state.writes = Vec::new();
            self.settled.insert(id, state);
        }
        while self.settled.len() > SETTLED_TX_HISTORY {
            self.settled.pop_first();
        }
    }
}

/// Coordinates buffered writes, per-id locks and atomic commit.
#[derive(Debug)]
pub struct TransactionManager {
    store: Arc<EntityStore>,
    audit: Arc<AuditLog>,
    next_id: AtomicU64,
    transactions: Mutex<Ledger>,
    locks: Mutex<BTreeMap<EntityId, TxId>>,
}

impl TransactionManager {
    pub fn new(store: Arc<EntityStore>, audit: Arc<AuditLog>) -> Self {
        let next_id = store.max_tx_id().saturating_add(1);
        Self {
            store,
            audit,
            next_id: AtomicU64::new(next_id),
            transactions: Mutex::new(Ledger::default()),
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    fn transactions(&self) -> MutexGuard<'_, Ledger> {
        self.transactions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks(&self) -> MutexGuard<'_, BTreeMap<EntityId, TxId>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a transaction attributed to the system.
    pub fn begin(&self) -> TxHandle {
        self.begin_as(Actor::System)
    }

    /// Start a transaction attributed to `actor`.
    pub fn begin_as(&self, actor: Actor) -> TxHandle {
        let id = TxId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let state = TxState {
            started_at: self.store.clock().now(),
            actor,
            writes: Vec::new(),
            phase: Phase::Open,
        };
        self.transactions().live.insert(id, state);
        TxHandle { id }
    }

    /// Buffer a write.
    ///
    /// Takes the id's write lock (fails fast with `Conflict` if another
    /// pending transaction holds it) and pins `Base::Latest` to the version
    /// current right now. Validation failures leave the transaction pending.
    pub fn write(&self, tx: TxHandle, mut write: EntityWrite) -> Result<(), GnosisError> {
        validate_write(&write)?;

        let mut transactions = self.transactions();
        let state = transactions
            .open_mut(&tx.id)
            .ok_or(GnosisError::TransactionClosed(tx.id))?;

        if state.writes.len() >= MAX_TRANSACTION_WRITES {
            return Err(GnosisError::Validation(format!(
                "transaction exceeds {} writes",
                MAX_TRANSACTION_WRITES
            )));
        }

        {
            let mut locks = self.locks();
            match locks.get(&write.id) {
                Some(holder) if *holder != tx.id => {
                    return Err(GnosisError::Conflict {
                        id: write.id,
                        reason: format!("write-locked by {}", holder),
                    });
                }
                Some(_) => {}
                None => {
                    locks.insert(write.id, tx.id);
                }
            }
        }

        let already_buffered = state.writes.iter().any(|w| w.id == write.id);
        if write.base == Base::Latest && !already_buffered {
            write.base = self
                .store
                .latest(write.id)
                .map_or(Base::Absent, Base::Version);
        }

        state.writes.push(write);
        Ok(())
    }

    /// Apply every buffered write atomically.
    ///
    /// On any failure the transaction is rolled back, nothing becomes visible
    /// and the caller sees `Conflict` (or `Validation` for schema problems
    /// detected against store state).
    pub fn commit(&self, tx: TxHandle) -> Result<Vec<VersionedId>, GnosisError> {
        let writes = {
            let mut transactions = self.transactions();
            let state = transactions
                .open_mut(&tx.id)
                .ok_or(GnosisError::TransactionClosed(tx.id))?;
            state.phase = Phase::Committing;
            state.writes.clone()
        };

        match self.store.commit_batch(&writes, Some(tx.id)) {
            Ok(ids) => {
                self.finish(tx.id, TxStatus::Committed);
                debug!(tx = %tx.id, versions = ids.len(), "transaction committed");
                Ok(ids)
            }
            Err(err) => {
                self.finish(tx.id, TxStatus::RolledBack);
                self.audit_rollback(tx.id, Outcome::Failure, &err.to_string());
                warn!(tx = %tx.id, error = %err, "commit failed; transaction rolled back");
                Err(match (err, writes.first()) {
                    (err @ (GnosisError::Validation(_) | GnosisError::Conflict { .. }), _) => err,
                    (other, Some(first)) => GnosisError::Conflict {
                        id: first.id,
                        reason: other.to_string(),
                    },
                    (other, None) => other,
                })
            }
        }
    }

    /// Discard every buffered write.
    ///
    /// Succeeds for pending transactions and is a no-op for ones already
    /// rolled back. A committed transaction cannot be rolled back.
    pub fn rollback(&self, tx: TxHandle) -> Result<(), GnosisError> {
        let phase = self.transactions().get(&tx.id).map(|s| s.phase);
        match phase {
            Some(Phase::Open) => {
                self.finish(tx.id, TxStatus::RolledBack);
                self.audit_rollback(tx.id, Outcome::Success, "explicit rollback");
                debug!(tx = %tx.id, "transaction rolled back");
                Ok(())
            }
            Some(Phase::Done(TxStatus::RolledBack)) => Ok(()),
            _ => Err(GnosisError::TransactionClosed(tx.id)),
        }
    }

    fn finish(&self, id: TxId, status: TxStatus) {
        self.transactions().settle(id, status);
        self.locks().retain(|_, holder| *holder != id);
    }

    fn audit_rollback(&self, id: TxId, outcome: Outcome, detail: &str) {
        let actor = self
            .transactions()
            .get(&id)
            .map(|s| s.actor.clone())
            .unwrap_or(Actor::System);
        if let Err(err) = self.audit.record(
            actor,
            "tx.rollback",
            outcome,
            None,
            format!("{}: {}", id, detail),
        ) {
            warn!(tx = %id, error = %err, "failed to audit rollback");
        }
    }

    /// Current status, or `None` for an unknown or long-finished handle.
    pub fn status(&self, tx: TxHandle) -> Option<TxStatus> {
        self.transactions().get(&tx.id).map(|s| match s.phase {
            Phase::Open | Phase::Committing => TxStatus::Pending,
            Phase::Done(status) => status,
        })
    }

    /// Read-only copy of a transaction.
    pub fn transaction(&self, tx: TxHandle) -> Option<Transaction> {
        let status = self.status(tx)?;
        self.transactions().get(&tx.id).map(|s| Transaction {
            tx_id: tx.id,
            started_at: s.started_at,
            actor: s.actor.clone(),
            writes: s.writes.clone(),
            status,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.transactions().live.len()
    }

    /// Begin, buffer `writes`, commit. Rolls back if any write is refused.
    pub fn execute(
        &self,
        actor: Actor,
        writes: Vec<EntityWrite>,
    ) -> Result<Vec<VersionedId>, GnosisError> {
        let tx = self.begin_as(actor);
        for write in writes {
            if let Err(err) = self.write(tx, write) {
                if let Err(rollback) = self.rollback(tx) {
                    warn!(tx = %tx.id, error = %rollback, "rollback after refused write failed");
                }
                return Err(err);
            }
        }
        self.commit(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::clock::SystemClock;
    use crate::registry::PluginInfo;
    use crate::storage::{Journal, MemoryJournal};
    use crate::types::{Entity, NodeLabel, Payload, Provenance};
    use serde_json::json;

    fn manager() -> TransactionManager {
        let clock = Arc::new(SystemClock);
        let journal = Arc::new(MemoryJournal::new());
        let (store, _) = EntityStore::open(journal.clone(), clock.clone()).expect("store");
        let audit = AuditLog::open(journal, clock).expect("audit");
        TransactionManager::new(Arc::new(store), Arc::new(audit))
    }

    fn create(text: &str) -> EntityWrite {
        EntityWrite::create(
            Payload::node(NodeLabel::Belief, json!({ "claim": text })),
            Provenance::new(Utc::now()),
        )
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let tm = manager();
        let tx = tm.begin();
        let write = create("a");
        let id = write.id;
        tm.write(tx, write).expect("write");

        assert!(!tm.store().contains(id));
        assert_eq!(tm.status(tx), Some(TxStatus::Pending));
        let pending = tm.transaction(tx).expect("known handle");
        assert_eq!(pending.writes.len(), 1);
        assert_eq!(pending.tx_id, tx.id());

        let ids = tm.commit(tx).expect("commit");
        assert_eq!(ids, vec![VersionedId::new(id, 1)]);
        assert_eq!(tm.status(tx), Some(TxStatus::Committed));
        assert_eq!(tm.store().get(id, None).expect("get").tx_id, Some(tx.id()));
    }

    #[test]
    fn terminal_transactions_refuse_operations() {
        let tm = manager();
        let tx = tm.begin();
        tm.commit(tx).expect("empty commit");

        assert!(matches!(
            tm.write(tx, create("late")),
            Err(GnosisError::TransactionClosed(_))
        ));
        assert!(matches!(
            tm.commit(tx),
            Err(GnosisError::TransactionClosed(_))
        ));
        assert!(matches!(
            tm.rollback(tx),
            Err(GnosisError::TransactionClosed(_))
        ));
    }

    #[test]
    fn rollback_discards_and_is_audited() {
        let tm = manager();
        let tx = tm.begin();
        let write = create("a");
        let id = write.id;
        tm.write(tx, write).expect("write");
        tm.rollback(tx).expect("rollback");
        tm.rollback(tx).expect("second rollback is a no-op");

        assert!(!tm.store().contains(id));
        assert_eq!(tm.status(tx), Some(TxStatus::RolledBack));
        assert_eq!(tm.audit.by_operation("tx.rollback").expect("audit").len(), 1);
        assert_eq!(tm.pending_count(), 0);
    }

    #[test]
    fn id_locks_fail_fast_and_release() {
        let tm = manager();
        let write = create("a");
        let id = write.id;

        let first = tm.begin();
        let second = tm.begin();
        tm.write(first, write.clone()).expect("lock");
        assert!(matches!(
            tm.write(second, write.clone()),
            Err(GnosisError::Conflict { .. })
        ));
        // The refused transaction is still usable.
        assert_eq!(tm.status(second), Some(TxStatus::Pending));

        tm.rollback(first).expect("rollback");
        tm.write(second, write).expect("lock released");
        tm.commit(second).expect("commit");
        assert!(tm.store().contains(id));
    }

    #[test]
    fn latest_base_is_pinned_at_write_time() {
        let tm = manager();
        let write = create("a");
        let id = write.id;
        tm.store().append(write).expect("seed");

        let tx = tm.begin();
        tm.write(
            tx,
            EntityWrite::update_latest(
                id,
                Payload::node(NodeLabel::Belief, json!({"claim": "b"})),
                Provenance::new(Utc::now()),
            ),
        )
        .expect("write");

        // Another writer advances the entity outside the transaction.
        tm.store()
            .append(EntityWrite::update(
                id,
                1,
                Payload::node(NodeLabel::Belief, json!({"claim": "c"})),
                Provenance::new(Utc::now()),
            ))
            .expect("concurrent");

        assert!(matches!(tm.commit(tx), Err(GnosisError::Conflict { .. })));
        assert_eq!(tm.status(tx), Some(TxStatus::RolledBack));
        assert_eq!(tm.store().latest(id), Some(2));
    }

    #[test]
    fn multiple_writes_to_one_id_chain_versions() {
        let tm = manager();
        let write = create("a");
        let id = write.id;
        let tx = tm.begin();
        tm.write(tx, write).expect("create");
        tm.write(
            tx,
            EntityWrite::update(
                id,
                1,
                Payload::node(NodeLabel::Belief, json!({"claim": "b"})),
                Provenance::new(Utc::now()),
            ),
        )
        .expect("update");

        let ids = tm.commit(tx).expect("commit");
        assert_eq!(ids.last().map(|v| v.version), Some(2));
    }

    #[test]
    fn validation_failure_keeps_transaction_pending() {
        let tm = manager();
        let tx = tm.begin();
        let bad = EntityWrite::create(
            Payload::node(NodeLabel::Belief, json!({})),
            Provenance::new(Utc::now()).with_confidence(3.0),
        );
        assert!(matches!(tm.write(tx, bad), Err(GnosisError::Validation(_))));
        assert_eq!(tm.status(tx), Some(TxStatus::Pending));
    }

    #[test]
    fn finished_transactions_are_forgotten_past_the_history() {
        let tm = manager();
        let first = tm.begin();
        tm.commit(first).expect("commit");
        let rolled = tm.begin();
        tm.rollback(rolled).expect("rollback");

        let mut last = first;
        for _ in 0..SETTLED_TX_HISTORY {
            last = tm.begin();
            tm.commit(last).expect("commit");
        }

        assert_eq!(tm.status(last), Some(TxStatus::Committed));
        assert_eq!(tm.status(first), None);
        assert_eq!(tm.status(rolled), None);
        assert_eq!(tm.transactions().settled.len(), SETTLED_TX_HISTORY);
        assert!(tm.transactions().live.is_empty());
        assert!(matches!(
            tm.rollback(rolled),
            Err(GnosisError::TransactionClosed(_))
        ));
    }

    #[test]
    fn execute_rolls_back_when_a_write_is_refused() {
        let tm = manager();
        let good = create("kept out");
        let id = good.id;
        let bad = EntityWrite::create(
            Payload::node(NodeLabel::Belief, json!({})),
            Provenance::new(Utc::now()).with_confidence(-0.5),
        );

        let err = tm.execute(Actor::System, vec![good, bad]).expect_err("refused");
        assert!(matches!(err, GnosisError::Validation(_)));
        assert!(!tm.store().contains(id));
        assert_eq!(tm.pending_count(), 0);
        assert_eq!(tm.audit.by_operation("tx.rollback").expect("audit").len(), 1);
    }

    /// Accepts everything except entity batches.
    #[derive(Debug, Default)]
    struct FullDisk(MemoryJournal);

    impl Journal for FullDisk {
        fn append_entities(&self, _: &[Entity]) -> Result<(), GnosisError> {
            Err(GnosisError::Storage("disk full".into()))
        }
        fn load_entities(&self) -> Result<Vec<Entity>, GnosisError> {
            self.0.load_entities()
        }
        fn load_latest_index(&self) -> Result<BTreeMap<EntityId, u64>, GnosisError> {
            self.0.load_latest_index()
        }
        fn store_latest_index(&self, index: &BTreeMap<EntityId, u64>) -> Result<(), GnosisError> {
            self.0.store_latest_index(index)
        }
        fn append_audit(&self, record: &AuditRecord) -> Result<(), GnosisError> {
            self.0.append_audit(record)
        }
        fn load_audit(&self) -> Result<Vec<AuditRecord>, GnosisError> {
            self.0.load_audit()
        }
        fn put_plugin(&self, operation: &str, info: &PluginInfo) -> Result<(), GnosisError> {
            self.0.put_plugin(operation, info)
        }
        fn load_plugins(&self) -> Result<Vec<(String, PluginInfo)>, GnosisError> {
            self.0.load_plugins()
        }
    }

    #[test]
    fn storage_failure_reports_the_first_write() {
        let clock = Arc::new(SystemClock);
        let journal = Arc::new(FullDisk::default());
        let (store, _) = EntityStore::open(journal.clone(), clock.clone()).expect("store");
        let audit = AuditLog::open(journal, clock).expect("audit");
        let tm = TransactionManager::new(Arc::new(store), Arc::new(audit));

        let first = create("a");
        let id = first.id;
        let tx = tm.begin();
        tm.write(tx, first).expect("buffer");
        tm.write(tx, create("b")).expect("buffer");

        let err = tm.commit(tx).expect_err("journal refuses");
        assert!(
            matches!(&err, GnosisError::Conflict { id: reported, reason }
                if *reported == id && reason.contains("disk full")),
            "{:?}",
            err
        );
        assert_eq!(tm.status(tx), Some(TxStatus::RolledBack));
        assert!(!tm.store().contains(id));
    }
}
