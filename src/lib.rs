//! # Workstream
//!
//! A durable, single-node record store that serves three access patterns
//! over one ordered log.
//!
//! ## Core Concepts
//!
//! - **Records**: Tasks, messages and events appended with a global sequence
//! - **Claims**: Time-bounded leases on pending records, with retries
//! - **Notifications**: In-process pub/sub over dotted topics with wildcards
//! - **Replay**: Snapshots, deterministic rebuild and incremental projections
//!
//! ## Example
//!
//! ```ignore
//! use workstream::{ClaimRequest, RecordInput, Store, StoreConfig};
//!
//! let store = Store::open_or_create(StoreConfig::new("./my-store"))?;
//!
//! // Enqueue a task
//! store.append(RecordInput::task("email", "send", json!({ "to": "a@b.c" })).with_priority(5))?;
//!
//! // Claim and finish it
//! if let Some(task) = store.claim(&ClaimRequest::new("worker-1").topic("email"))? {
//!     store.complete(task.id, Some(json!({ "sent": true })))?;
//! }
//!
//! // Event sourcing
//! store.append_event("acc-1", "account", "deposited", json!({ "amount": 100 }))?;
//! let balance: i64 = store.rebuild("acc-1", |b, e| b + e.payload["amount"].as_i64().unwrap_or(0))?;
//! ```

pub mod bus;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod queue;
pub mod records;
pub mod replay;
pub mod store;
pub mod types;

// Re-exports
pub use bus::{
    Notification, NotificationBus, RecordSummary, SubscriptionHandle, SubscriptionId, TopicPattern,
};
pub use error::{Result, StoreError};
pub use metrics::{LatencyStats, Metrics, StatusCounts, TopicMetrics};
pub use queue::{ClaimRequest, HandlerResult, RetentionPolicy, Worker, WorkerReport};
pub use records::{Order, RecordIter, RecordQuery};
pub use replay::{ProjectionUpdate, ProjectionView};
pub use store::{QueueDefaults, Store, StoreConfig};
pub use types::*;
