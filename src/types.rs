//! Core types for the record store.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Globally unique identifier for a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the global log. Strictly increasing, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp moved forward by `duration`.
    pub fn plus(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_micros() as i64))
    }

    /// This timestamp moved back by `duration`.
    pub fn minus(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as i64))
    }

    /// Time elapsed from `earlier` to `self` (zero if `earlier` is later).
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Which access pattern produced a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordClass {
    /// Work item for the task queue.
    Task,
    /// Pub/sub message on a channel.
    Message,
    /// Event in an aggregate's history. Never claimable.
    Event,
}

impl RecordClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordClass::Task => "task",
            RecordClass::Message => "message",
            RecordClass::Event => "event",
        }
    }

    /// Whether records of this class go through the claim protocol.
    pub fn is_claimable(&self) -> bool {
        !matches!(self, RecordClass::Event)
    }
}

/// Lifecycle status of a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    Pending,
    Leased,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Leased => "leased",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordStatus::Completed | RecordStatus::Failed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attempt ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Completed,
    Failed(String),
    LeaseExpired,
    ForceExpired,
}

/// One claim of a record by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub worker: String,
    pub claimed_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    /// `None` while the attempt is still running.
    pub outcome: Option<AttemptOutcome>,
}

/// A single record in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier (assigned by store).
    pub id: RecordId,

    /// Global position (assigned by store).
    pub sequence: Sequence,

    pub class: RecordClass,

    /// Routing key: queue lane, pub/sub channel, or aggregate type.
    pub topic: String,

    /// Application-defined discriminator (task type, message type, event type).
    pub kind: String,

    /// Application payload, stored verbatim.
    pub payload: Value,

    /// Context about the record rather than its content, such as causation
    /// or correlation ids. Always a JSON object.
    pub metadata: Value,

    /// Higher is served first.
    pub priority: i32,

    pub status: RecordStatus,
    pub attempts: u32,
    pub max_attempts: u32,

    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<Timestamp>,

    /// `None` means the record never expires.
    pub ttl_seconds: Option<u64>,

    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    /// Per-aggregate version, starting at 1.
    pub aggregate_version: Option<u64>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,

    pub result: Option<Value>,
    pub error: Option<String>,

    /// Every claim of this record, oldest first.
    pub history: Vec<Attempt>,
}

impl Record {
    /// When the record stops being deliverable, if ever.
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.ttl_seconds
            .map(|ttl| self.created_at.plus(Duration::from_secs(ttl)))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Whether a claim at `now` could select this record.
    pub fn is_claimable(&self, now: Timestamp) -> bool {
        self.class.is_claimable() && self.status == RecordStatus::Pending && !self.is_expired(now)
    }

    /// Whether the current lease has run out at `now`.
    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.status == RecordStatus::Leased
            && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// End-to-end processing latency (`completed_at - created_at`).
    pub fn latency(&self) -> Option<Duration> {
        self.completed_at.map(|done| done.since(self.created_at))
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Expiry setting on a new record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Ttl {
    /// Use the store's configured default.
    #[default]
    Default,
    Never,
    Seconds(u64),
}

/// Input for creating a new record (before id/sequence assigned).
#[derive(Clone, Debug)]
pub struct RecordInput {
    pub class: RecordClass,
    pub topic: String,
    pub kind: String,
    pub payload: Value,
    /// A JSON object; empty unless set.
    pub metadata: Value,
    pub priority: i32,
    pub ttl: Ttl,
    /// `None` uses the store default for the record class.
    pub max_attempts: Option<u32>,
    pub aggregate_id: Option<String>,
}

impl RecordInput {
    /// A task for the work queue.
    pub fn task(topic: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            class: RecordClass::Task,
            topic: topic.into(),
            kind: kind.into(),
            payload,
            metadata: Value::Object(Map::new()),
            priority: 0,
            ttl: Ttl::Default,
            max_attempts: None,
            aggregate_id: None,
        }
    }

    /// A task whose payload is serialized from any `Serialize` value.
    pub fn json(
        topic: impl Into<String>,
        kind: impl Into<String>,
        payload: &impl Serialize,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::task(topic, kind, serde_json::to_value(payload)?))
    }

    /// A message published on a channel.
    pub fn message(channel: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            class: RecordClass::Message,
            ..Self::task(channel, kind, payload)
        }
    }

    /// An event in an aggregate's history. The topic is the aggregate type.
    pub fn event(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            class: RecordClass::Event,
            ttl: Ttl::Never,
            aggregate_id: Some(aggregate_id.into()),
            ..Self::task(aggregate_type, event_type, data)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Ttl::Seconds(seconds);
        self
    }

    pub fn without_ttl(mut self) -> Self {
        self.ttl = Ttl::Never;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject malformed input before anything is stored.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(StoreError::Validation("topic must not be empty".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(StoreError::Validation("kind must not be empty".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(StoreError::Validation("max_attempts must be at least 1".into()));
        }
        if !self.metadata.is_object() {
            return Err(StoreError::Validation("metadata must be a JSON object".into()));
        }
        match (&self.class, &self.aggregate_id) {
            (RecordClass::Event, None) => {
                return Err(StoreError::Validation("events need an aggregate_id".into()))
            }
            (RecordClass::Event, Some(id)) if id.trim().is_empty() => {
                return Err(StoreError::Validation("aggregate_id must not be empty".into()))
            }
            (RecordClass::Task | RecordClass::Message, Some(_)) => {
                return Err(StoreError::Validation(
                    "only events carry an aggregate_id".into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Cached aggregate state at a given version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub state: Value,
    pub timestamp: Timestamp,
}

/// One key of a materialized projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectionEntry {
    pub projection: String,
    pub key: String,
    pub data: Value,
    /// Sequence of the last record folded into `data`.
    pub last_sequence: Sequence,
    pub updated_at: Timestamp,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub record_count: u64,
    pub task_count: u64,
    pub message_count: u64,
    pub event_count: u64,
    pub aggregate_count: u64,
    pub snapshot_count: u64,
    pub projection_entry_count: u64,
    pub subscription_count: u64,
    pub log_size_bytes: u64,
    pub head: Sequence,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_navigation() {
        let seq = Sequence(5);
        assert_eq!(seq.next(), Sequence(6));
        assert_eq!(seq.prev(), Some(Sequence(4)));
        assert_eq!(Sequence(0).prev(), None);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp(1_000_000);
        assert_eq!(t.plus(Duration::from_secs(2)), Timestamp(3_000_000));
        assert_eq!(t.minus(Duration::from_secs(1)), Timestamp(0));
        assert_eq!(Timestamp(3_000_000).since(t), Duration::from_secs(2));
        assert_eq!(t.since(Timestamp(3_000_000)), Duration::ZERO);
    }

    #[test]
    fn test_record_input_json() {
        #[derive(Serialize)]
        struct Shipping {
            weight: f64,
        }

        let input = RecordInput::json("shipping", "calculate", &Shipping { weight: 2.5 }).unwrap();
        assert_eq!(input.class, RecordClass::Task);
        assert_eq!(input.payload["weight"], 2.5);
    }

    #[test]
    fn test_validation() {
        assert!(RecordInput::task("orders", "new", json!({})).validate().is_ok());
        assert!(RecordInput::task("", "new", json!({})).validate().is_err());
        assert!(RecordInput::task("orders", " ", json!({})).validate().is_err());
        assert!(RecordInput::task("orders", "new", json!({}))
            .with_max_attempts(0)
            .validate()
            .is_err());
        assert!(RecordInput::event("", "order", "created", json!({}))
            .validate()
            .is_err());
        assert!(RecordInput::event("o-1", "order", "created", json!({}))
            .validate()
            .is_ok());
        assert!(RecordInput::event("o-1", "order", "created", json!({}))
            .with_metadata(json!({ "correlation_id": "c-1" }))
            .validate()
            .is_ok());
        assert!(RecordInput::event("o-1", "order", "created", json!({}))
            .with_metadata(json!(["not", "an", "object"]))
            .validate()
            .is_err());
        assert_eq!(RecordInput::task("orders", "new", json!({})).metadata, json!({}));
    }

    #[test]
    fn test_event_input_never_expires() {
        let input = RecordInput::event("o-1", "order", "created", json!({}));
        assert_eq!(input.ttl, Ttl::Never);
        assert_eq!(input.topic, "order");
        assert_eq!(input.kind, "created");
    }
}
