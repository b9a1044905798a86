//! What the record journal contains.

use crate::types::{Record, RecordId, Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame of `records.log`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogEntry {
    /// Closes a compacted log so purged sequences are never reused.
    Checkpoint { next_sequence: Sequence },
    Append(Record),
    /// A bulk append, all-or-nothing on recovery.
    Batch(Vec<Record>),
    Transition(Transition),
}

/// A status change on an existing record. Payloads are never rewritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    Claimed {
        id: RecordId,
        worker: String,
        at: Timestamp,
        lease_expires_at: Timestamp,
    },
    Completed {
        id: RecordId,
        at: Timestamp,
        result: Option<Value>,
    },
    Failed {
        id: RecordId,
        at: Timestamp,
        error: String,
    },
    LeaseRenewed {
        id: RecordId,
        lease_expires_at: Timestamp,
    },
    LeaseExpired {
        id: RecordId,
        at: Timestamp,
    },
    ForceExpired {
        id: RecordId,
        at: Timestamp,
    },
}

impl Transition {
    pub fn id(&self) -> RecordId {
        match self {
            Transition::Claimed { id, .. }
            | Transition::Completed { id, .. }
            | Transition::Failed { id, .. }
            | Transition::LeaseRenewed { id, .. }
            | Transition::LeaseExpired { id, .. }
            | Transition::ForceExpired { id, .. } => *id,
        }
    }

    /// Short verb for logs and errors.
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Claimed { .. } => "claim",
            Transition::Completed { .. } => "complete",
            Transition::Failed { .. } => "fail",
            Transition::LeaseRenewed { .. } => "renew",
            Transition::LeaseExpired { .. } => "expire",
            Transition::ForceExpired { .. } => "force-expire",
        }
    }
}
