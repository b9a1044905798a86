//! In-process notification bus.
//!
//! The bus pushes notifications to interested parties so they wake up faster
//! than polling would. It persists nothing: durability is the record log's
//! job, and subscriptions do not survive a restart.
//!
//! Topic patterns:
//! - `"*"` matches every topic
//! - `"orders.*"` matches every topic starting with `"orders."`
//! - anything else matches that exact topic
//!
//! # Example
//!
//! ```ignore
//! let bus = NotificationBus::new();
//!
//! // Callback, invoked on the publisher's thread
//! bus.subscribe("orders.*", |n| println!("{:?}", n));
//!
//! // Bounded channel, drained by another thread
//! let handle = bus.subscribe_channel("*", 256);
//! while let Ok(notification) = handle.recv() {
//!     // ...
//! }
//! ```

mod manager;
mod types;

pub use manager::NotificationBus;
pub use types::{
    Callback, Notification, RecordSummary, Sink, SubscriptionHandle, SubscriptionId, TopicPattern,
    DEFAULT_PAYLOAD_THRESHOLD,
};
