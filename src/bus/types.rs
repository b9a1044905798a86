//! Notification bus types.

use crate::types::{Record, RecordClass, RecordId, Sequence};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Default threshold for including payload in record notifications (bytes).
pub const DEFAULT_PAYLOAD_THRESHOLD: usize = 4096;

/// Which topics a subscription receives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    /// `"*"`: every topic.
    All,
    /// `"orders.*"`: every topic starting with `"orders."`.
    Prefix(String),
    /// Exactly one topic.
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicPattern::All
        } else if let Some(stem) = pattern.strip_suffix('*') {
            TopicPattern::Prefix(stem.to_string())
        } else {
            TopicPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(stem) => topic.starts_with(stem.as_str()),
            TopicPattern::Exact(exact) => exact == topic,
        }
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::parse(pattern)
    }
}

impl From<String> for TopicPattern {
    fn from(pattern: String) -> Self {
        TopicPattern::parse(&pattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::All => f.write_str("*"),
            TopicPattern::Prefix(stem) => write!(f, "{}*", stem),
            TopicPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// What the bus delivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A task or message became available.
    RecordAppended { record: RecordSummary },

    RecordCompleted {
        id: RecordId,
        topic: String,
        kind: String,
        result: Option<Value>,
    },

    /// A processing attempt failed. `terminal` is false when the record was
    /// put back for another attempt.
    RecordFailed {
        id: RecordId,
        topic: String,
        kind: String,
        error: String,
        attempts: u32,
        terminal: bool,
    },

    EventAppended { record: RecordSummary },

    /// Application-defined notification with no backing record.
    Custom { kind: String, payload: Value },
}

impl Notification {
    pub fn appended(record: &Record, payload_threshold: usize) -> Self {
        let record_summary = RecordSummary::from_record(record, payload_threshold);
        match record.class {
            RecordClass::Event => Notification::EventAppended {
                record: record_summary,
            },
            RecordClass::Task | RecordClass::Message => Notification::RecordAppended {
                record: record_summary,
            },
        }
    }

    pub fn completed(record: &Record) -> Self {
        Notification::RecordCompleted {
            id: record.id,
            topic: record.topic.clone(),
            kind: record.kind.clone(),
            result: record.result.clone(),
        }
    }

    pub fn failed(record: &Record) -> Self {
        Notification::RecordFailed {
            id: record.id,
            topic: record.topic.clone(),
            kind: record.kind.clone(),
            error: record.error.clone().unwrap_or_default(),
            attempts: record.attempts,
            terminal: record.status.is_terminal(),
        }
    }
}

/// Summary of a record (for notifications, avoids sending large payloads).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub sequence: Sequence,
    pub class: RecordClass,
    pub topic: String,
    pub kind: String,
    pub priority: i32,
    pub aggregate_id: Option<String>,
    pub aggregate_version: Option<u64>,
    pub created_at: i64,
    /// Encoded payload size in bytes.
    pub payload_size: usize,
    /// The payload itself, if small enough.
    pub payload: Option<Value>,
}

impl RecordSummary {
    pub fn from_record(record: &Record, include_payload_threshold: usize) -> Self {
        let payload_size = serde_json::to_vec(&record.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(0);

        let payload = if payload_size <= include_payload_threshold {
            Some(record.payload.clone())
        } else {
            None
        };

        Self {
            id: record.id,
            sequence: record.sequence,
            class: record.class,
            topic: record.topic.clone(),
            kind: record.kind.clone(),
            priority: record.priority,
            aggregate_id: record.aggregate_id.clone(),
            aggregate_version: record.aggregate_version,
            created_at: record.created_at.0,
            payload_size,
            payload,
        }
    }
}

/// Unique identifier for a subscription. Ids grow in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Where a subscriber's notifications go.
#[derive(Clone)]
pub enum Sink {
    /// Invoked synchronously on the publisher's thread.
    Callback(Callback),
    /// Bounded channel; a full buffer drops the notification.
    Channel(crossbeam_channel::Sender<Notification>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Callback(_) => f.write_str("Sink::Callback"),
            Sink::Channel(sender) => write!(f, "Sink::Channel(len={})", sender.len()),
        }
    }
}

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive notifications.
    pub receiver: crossbeam_channel::Receiver<Notification>,
}

impl SubscriptionHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<Notification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<Notification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Notification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Discard anything already buffered.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parse_and_match() {
        assert_eq!(TopicPattern::parse("*"), TopicPattern::All);
        assert_eq!(
            TopicPattern::parse("orders.*"),
            TopicPattern::Prefix("orders.".into())
        );
        assert_eq!(
            TopicPattern::parse("orders"),
            TopicPattern::Exact("orders".into())
        );

        let prefix = TopicPattern::parse("orders.*");
        assert!(prefix.matches("orders.created"));
        assert!(!prefix.matches("orders"));
        assert!(!prefix.matches("payments.created"));
        assert!(TopicPattern::All.matches("anything"));
        assert_eq!(prefix.to_string(), "orders.*");
    }

    #[test]
    fn test_notification_serialization_is_tagged() {
        let notification = Notification::Custom {
            kind: "ping".into(),
            payload: serde_json::json!({ "n": 1 }),
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["type"], "custom");
        assert_eq!(json["kind"], "ping");
    }
}
