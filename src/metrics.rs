//! Derived queue metrics.
//!
//! Nothing here is durable. Status counters are kept incrementally by the
//! record table; completions land in a bounded ring of recent samples. A
//! [`Metrics`] value is computed under a single read lock.

use crate::records::RecordTable;
use crate::types::{RecordStatus, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Status counts for the tasks and messages of one topic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: RecordStatus, delta: i64) {
        let slot = match status {
            RecordStatus::Pending => &mut self.pending,
            RecordStatus::Leased => &mut self.leased,
            RecordStatus::Completed => &mut self.completed,
            RecordStatus::Failed => &mut self.failed,
        };
        *slot = slot.saturating_add_signed(delta);
    }

    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.completed + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Recent completions.
///
/// Latencies are a ring of the last `capacity` samples and only feed the
/// percentiles. Completion times are kept for `span`, however many there are,
/// so the windowed count is exact.
#[derive(Debug)]
pub(crate) struct CompletionWindow {
    latencies: VecDeque<Duration>,
    capacity: usize,
    times: VecDeque<Timestamp>,
    span: Duration,
}

impl CompletionWindow {
    pub(crate) fn new(capacity: usize, span: Duration) -> Self {
        Self {
            latencies: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            times: VecDeque::new(),
            span,
        }
    }

    pub(crate) fn push(&mut self, at: Timestamp, latency: Duration) {
        if self.latencies.len() == self.capacity {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);

        self.times.push_back(at);
        let horizon = at.minus(self.span);
        while self.times.front().is_some_and(|first| *first < horizon) {
            self.times.pop_front();
        }
    }

    /// Completions at or after `since`, if `since` lies within the span.
    fn count_since(&self, since: Timestamp) -> u64 {
        self.times.iter().filter(|at| **at >= since).count() as u64
    }

    fn latencies(&self) -> Vec<Duration> {
        self.latencies.iter().copied().collect()
    }
}

/// Processing latency (`completed_at - created_at`) over recent completions.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();

        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let total: f64 = samples.iter().copied().map(ms).sum();
        let percentile = |p: f64| {
            let rank = ((samples.len() as f64) * p).ceil() as usize;
            ms(samples[rank.clamp(1, samples.len()) - 1])
        };

        Self {
            count: samples.len() as u64,
            mean_ms: total / samples.len() as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
            max_ms: ms(samples[samples.len() - 1]),
        }
    }
}

/// Per-topic view.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TopicMetrics {
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
    /// Pending but past their TTL; removed by the next retention sweep.
    pub expired: u64,
}

/// Snapshot of queue health.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Metrics {
    /// Deliverable pending records (TTL not yet expired).
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    /// Events are facts, not work; they are counted apart.
    pub events: u64,
    pub per_topic: BTreeMap<String, TopicMetrics>,
    pub throughput_per_sec: f64,
    pub completed_in_window: u64,
    pub window: Duration,
    pub latency: LatencyStats,
    pub oldest_pending_age: Option<Duration>,
}

impl Metrics {
    pub(crate) fn collect(table: &RecordTable, now: Timestamp, window: Duration) -> Self {
        let mut metrics = Metrics {
            events: table.event_count(),
            window,
            ..Default::default()
        };

        for (topic, counts) in table.counts() {
            let topic_metrics = metrics.per_topic.entry(topic.clone()).or_default();
            topic_metrics.pending = counts.pending;
            topic_metrics.leased = counts.leased;
            topic_metrics.completed = counts.completed;
            topic_metrics.failed = counts.failed;
        }

        for id in table.expired_pending(now) {
            if let Some(record) = table.get(id) {
                let topic_metrics = metrics.per_topic.entry(record.topic.clone()).or_default();
                topic_metrics.expired += 1;
                topic_metrics.pending = topic_metrics.pending.saturating_sub(1);
            }
        }

        for topic_metrics in metrics.per_topic.values() {
            metrics.pending += topic_metrics.pending;
            metrics.leased += topic_metrics.leased;
            metrics.completed += topic_metrics.completed;
            metrics.failed += topic_metrics.failed;
            metrics.expired += topic_metrics.expired;
        }

        let completions = table.completions();
        metrics.completed_in_window = completions.count_since(now.minus(window));
        if !window.is_zero() {
            metrics.throughput_per_sec = metrics.completed_in_window as f64 / window.as_secs_f64();
        }
        metrics.latency = LatencyStats::from_samples(completions.latencies());
        metrics.oldest_pending_age = table
            .oldest_pending(now)
            .map(|record| now.since(record.created_at));

        metrics
    }

    /// Mean processing latency in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        self.latency.mean_ms
    }

    pub fn topic(&self, topic: &str) -> Option<&TopicMetrics> {
        self.per_topic.get(topic)
    }
}
