//! # Audit Log
//!
//! Append-only record of every plugin invocation, administrative action,
//! transaction rollback and message rejection. Never pruned by the core.

use crate::canonical::ContentHash;
use crate::clock::Clock;
use crate::storage::Journal;
use crate::types::{Actor, GnosisError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Result class of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Rejected,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub operation: String,
    pub outcome: Outcome,
    /// Hash of the arguments or message this record is about.
    pub hash: Option<ContentHash>,
    pub detail: String,
}

/// Shared handle to the durable audit sequence.
#[derive(Debug)]
pub struct AuditLog {
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    next_seq: Mutex<u64>,
}

impl AuditLog {
    /// Attach to the journal, continuing after the last persisted record.
    pub fn open(journal: Arc<dyn Journal>, clock: Arc<dyn Clock>) -> Result<Self, GnosisError> {
        let next_seq = journal
            .load_audit()?
            .last()
            .map(|record| record.seq.saturating_add(1))
            .unwrap_or(0);
        Ok(Self {
            journal,
            clock,
            next_seq: Mutex::new(next_seq),
        })
    }

    /// Append one record. Sequence numbers are gap-free.
    pub fn record(
        &self,
        actor: Actor,
        operation: &str,
        outcome: Outcome,
        hash: Option<ContentHash>,
        detail: impl Into<String>,
    ) -> Result<AuditRecord, GnosisError> {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let record = AuditRecord {
            seq: *next_seq,
            timestamp: self.clock.now(),
            actor,
            operation: operation.to_string(),
            outcome,
            hash,
            detail: detail.into(),
        };
        self.journal.append_audit(&record)?;
        *next_seq = next_seq.saturating_add(1);
        Ok(record)
    }

    /// All records in sequence order.
    pub fn records(&self) -> Result<Vec<AuditRecord>, GnosisError> {
        self.journal.load_audit()
    }

    /// Records whose operation equals `operation`.
    pub fn by_operation(&self, operation: &str) -> Result<Vec<AuditRecord>, GnosisError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|record| record.operation == operation)
            .collect())
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        *self.next_seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::MemoryJournal;

    fn log() -> (Arc<MemoryJournal>, AuditLog) {
        let journal = Arc::new(MemoryJournal::new());
        let audit = AuditLog::open(journal.clone(), Arc::new(SystemClock)).expect("open");
        (journal, audit)
    }

    #[test]
    fn sequence_numbers_are_gap_free() {
        let (_, audit) = log();
        for i in 0..3 {
            let record = audit
                .record(Actor::System, "op", Outcome::Success, None, "")
                .expect("record");
            assert_eq!(record.seq, i);
        }
        assert_eq!(audit.len(), 3);
    }

    #[test]
    fn reopen_continues_sequence() {
        let (journal, audit) = log();
        audit
            .record(Actor::System, "a", Outcome::Success, None, "")
            .expect("record");
        drop(audit);

        let reopened = AuditLog::open(journal, Arc::new(SystemClock)).expect("open");
        let record = reopened
            .record(Actor::System, "b", Outcome::Failure, None, "boom")
            .expect("record");
        assert_eq!(record.seq, 1);
        assert_eq!(reopened.by_operation("b").expect("filter").len(), 1);
    }
}
