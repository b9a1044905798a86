//! Subscriber registry and dispatch.

use crossbeam_channel::{bounded, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::types::{
    Notification, Sink, SubscriptionHandle, SubscriptionId, TopicPattern,
    DEFAULT_PAYLOAD_THRESHOLD,
};

/// Subscribers sharing one pattern.
type Bucket = Arc<Mutex<Vec<(SubscriptionId, Sink)>>>;

/// In-process, best-effort notification dispatch.
///
/// Subscribers are grouped in buckets by pattern, each bucket behind its own
/// mutex. A publish collects the matching buckets, merges them back into
/// registration order and delivers outside every lock, so a callback may
/// subscribe, unsubscribe or call into the store.
pub struct NotificationBus {
    buckets: RwLock<HashMap<TopicPattern, Bucket>>,
    /// Subscription -> pattern, for unsubscribe.
    patterns: Mutex<HashMap<SubscriptionId, TopicPattern>>,
    next_id: AtomicU64,
    payload_threshold: usize,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_payload_threshold(DEFAULT_PAYLOAD_THRESHOLD)
    }

    /// Create a bus that inlines record payloads up to `threshold` bytes.
    pub fn with_payload_threshold(threshold: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            payload_threshold: threshold,
        }
    }

    pub fn payload_threshold(&self) -> usize {
        self.payload_threshold
    }

    /// Register a callback. It runs synchronously on the publisher's thread;
    /// a panic inside it is caught and logged.
    pub fn subscribe<F>(&self, pattern: impl Into<TopicPattern>, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(pattern.into(), Sink::Callback(Arc::new(callback)))
    }

    /// Register a bounded channel. Notifications that find it full are dropped.
    pub fn subscribe_channel(
        &self,
        pattern: impl Into<TopicPattern>,
        buffer_size: usize,
    ) -> SubscriptionHandle {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let id = self.register(pattern.into(), Sink::Channel(sender));
        SubscriptionHandle { id, receiver }
    }

    fn register(&self, pattern: TopicPattern, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        self.buckets
            .write()
            .entry(pattern.clone())
            .or_default()
            .lock()
            .push((id, sink));

        debug!(subscription = %id, pattern = %pattern, "Subscribed");
        self.patterns.lock().insert(id, pattern);
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(pattern) = self.patterns.lock().remove(&id) else {
            return false;
        };

        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(&pattern) {
            let now_empty = {
                let mut subscribers = bucket.lock();
                subscribers.retain(|(sub, _)| *sub != id);
                subscribers.is_empty()
            };
            if now_empty {
                buckets.remove(&pattern);
            }
        }

        debug!(subscription = %id, "Unsubscribed");
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.patterns.lock().len()
    }

    /// Whether any subscription would receive a notification on `topic`.
    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.buckets
            .read()
            .iter()
            .any(|(pattern, bucket)| pattern.matches(topic) && !bucket.lock().is_empty())
    }

    /// Deliver `notification` to every subscription matching `topic`, in
    /// registration order. Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, notification: &Notification) -> usize {
        let targets = self.matching(topic);
        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut disconnected = Vec::new();

        for (id, sink) in targets {
            match sink {
                Sink::Callback(callback) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(notification)));
                    match outcome {
                        Ok(()) => delivered += 1,
                        Err(payload) => {
                            error!(
                                subscription = %id,
                                topic,
                                panic = %panic_message(&*payload),
                                "Notification callback panicked"
                            );
                        }
                    }
                }
                Sink::Channel(sender) => match sender.try_send(notification.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!(subscription = %id, topic, "Subscriber buffer full, notification dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(id),
                },
            }
        }

        for id in disconnected {
            self.unsubscribe(id);
        }

        delivered
    }

    /// Like [`publish`](Self::publish), but only builds the notification when
    /// someone is listening.
    pub fn publish_with<F>(&self, topic: &str, build: F) -> usize
    where
        F: FnOnce() -> Notification,
    {
        if !self.has_subscribers(topic) {
            return 0;
        }
        self.publish(topic, &build())
    }

    /// Snapshot of the sinks matching `topic`, in registration order.
    fn matching(&self, topic: &str) -> Vec<(SubscriptionId, Sink)> {
        let buckets: Vec<Bucket> = self
            .buckets
            .read()
            .iter()
            .filter(|(pattern, _)| pattern.matches(topic))
            .map(|(_, bucket)| Arc::clone(bucket))
            .collect();

        let mut targets: Vec<(SubscriptionId, Sink)> = buckets
            .iter()
            .flat_map(|bucket| bucket.lock().clone())
            .collect();
        targets.sort_by_key(|(id, _)| *id);
        targets
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn custom(kind: &str) -> Notification {
        Notification::Custom {
            kind: kind.to_string(),
            payload: json!(null),
        }
    }

    fn kind_of(notification: &Notification) -> String {
        match notification {
            Notification::Custom { kind, .. } => kind.clone(),
            other => panic!("Expected Custom, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let bus = NotificationBus::new();

        let id = bus.subscribe("*", |_| {});
        let handle = bus.subscribe_channel("orders", 8);
        assert_eq!(bus.subscription_count(), 2);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(bus.unsubscribe(handle.id));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_registration_order_across_patterns() {
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (label, pattern) in [("a", "orders.created"), ("b", "*"), ("c", "orders.*"), ("d", "*")] {
            let seen = Arc::clone(&seen);
            bus.subscribe(pattern, move |_| seen.lock().push(label));
        }

        assert_eq!(bus.publish("orders.created", &custom("x")), 4);
        assert_eq!(*seen.lock(), vec!["a", "b", "c", "d"]);

        seen.lock().clear();
        assert_eq!(bus.publish("payments", &custom("y")), 2);
        assert_eq!(*seen.lock(), vec!["b", "d"]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = NotificationBus::new();
        let count = Arc::new(AtomicU64::new(0));

        bus.subscribe("*", |_| panic!("subscriber bug"));
        let counter = Arc::clone(&count);
        bus.subscribe("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish("t", &custom("x")), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscription_count(), 2);
    }

    #[test]
    fn test_channel_full_drops_notification_only() {
        let bus = NotificationBus::new();
        let handle = bus.subscribe_channel("*", 2);

        for i in 0..5 {
            bus.publish("t", &custom(&i.to_string()));
        }

        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(kind_of(&handle.recv_timeout(Duration::from_millis(100)).unwrap()), "0");
        assert_eq!(kind_of(&handle.recv_timeout(Duration::from_millis(100)).unwrap()), "1");
        assert!(handle.try_recv().is_err());

        bus.publish("t", &custom("later"));
        assert_eq!(kind_of(&handle.try_recv().unwrap()), "later");
    }

    #[test]
    fn test_disconnected_channel_is_removed() {
        let bus = NotificationBus::new();
        let handle = bus.subscribe_channel("*", 4);
        drop(handle);

        assert_eq!(bus.publish("t", &custom("x")), 0);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let bus = Arc::new(NotificationBus::new());
        let slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let bus_ref = Arc::clone(&bus);
        let slot_ref = Arc::clone(&slot);
        let id = bus.subscribe("*", move |_| {
            if let Some(id) = *slot_ref.lock() {
                bus_ref.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        bus.publish("t", &custom("x"));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_publish_with_is_lazy() {
        let bus = NotificationBus::new();
        let delivered = bus.publish_with("t", || panic!("built without subscribers"));
        assert_eq!(delivered, 0);
    }
}
