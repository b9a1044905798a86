//! Record queries.
//!
//! A query picks candidate sequences from the narrowest index under a short
//! read lock, then yields matching records lazily, re-reading the table for
//! each one. Records purged between the two steps are skipped.

use crate::records::table::RecordTable;
use crate::types::{Record, RecordClass, RecordStatus, Sequence, Timestamp};
use parking_lot::RwLock;

/// Result ordering by sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Filters, ordering and limit for [`Store::query`](crate::Store::query).
#[derive(Clone, Debug, Default)]
pub struct RecordQuery {
    pub topic: Option<String>,
    pub kind: Option<String>,
    pub class: Option<RecordClass>,
    pub status: Option<RecordStatus>,
    pub aggregate_id: Option<String>,
    pub aggregate_type: Option<String>,
    /// Inclusive lower bound.
    pub from_sequence: Option<Sequence>,
    /// Inclusive upper bound.
    pub to_sequence: Option<Sequence>,
    /// Inclusive lower bound on `created_at`.
    pub from_time: Option<Timestamp>,
    /// Inclusive upper bound on `created_at`.
    pub to_time: Option<Timestamp>,
    /// Only records a claim at this instant could select.
    pub claimable_at: Option<Timestamp>,
    pub order: Order,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn class(mut self, class: RecordClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn aggregate(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn sequences(mut self, from: Sequence, to: Sequence) -> Self {
        self.from_sequence = Some(from);
        self.to_sequence = Some(to);
        self
    }

    pub fn after(mut self, sequence: Sequence) -> Self {
        self.from_sequence = Some(sequence.next());
        self
    }

    pub fn created_between(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.from_time = Some(from);
        self.to_time = Some(to);
        self
    }

    /// Keep only records eligible for claim right now.
    pub fn claimable(mut self) -> Self {
        self.claimable_at = Some(Timestamp::now());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn sequence_bounds(&self) -> (Sequence, Sequence) {
        (
            self.from_sequence.unwrap_or(Sequence(0)),
            self.to_sequence.unwrap_or(Sequence(u64::MAX)),
        )
    }

    /// Whether `record` passes every filter.
    pub fn matches(&self, record: &Record) -> bool {
        let (from, to) = self.sequence_bounds();
        if record.sequence < from || record.sequence > to {
            return false;
        }
        if self.topic.as_ref().is_some_and(|t| *t != record.topic) {
            return false;
        }
        if self.kind.as_ref().is_some_and(|k| *k != record.kind) {
            return false;
        }
        if self.class.is_some_and(|c| c != record.class) {
            return false;
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.aggregate_id.is_some() && self.aggregate_id != record.aggregate_id {
            return false;
        }
        if self.aggregate_type.is_some() && self.aggregate_type != record.aggregate_type {
            return false;
        }
        if self.from_time.is_some_and(|t| record.created_at < t) {
            return false;
        }
        if self.to_time.is_some_and(|t| record.created_at > t) {
            return false;
        }
        if self.claimable_at.is_some_and(|now| !record.is_claimable(now)) {
            return false;
        }
        true
    }
}

/// Lazy, finite, single-pass iterator over query results.
pub struct RecordIter<'a> {
    table: &'a RwLock<RecordTable>,
    query: RecordQuery,
    candidates: std::vec::IntoIter<Sequence>,
    remaining: usize,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(table: &'a RwLock<RecordTable>, query: RecordQuery) -> Self {
        let mut candidates = table.read().candidates(&query);
        if query.order == Order::Descending {
            candidates.reverse();
        }
        let remaining = query.limit.unwrap_or(usize::MAX);
        Self {
            table,
            query,
            candidates: candidates.into_iter(),
            remaining,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        for sequence in self.candidates.by_ref() {
            let table = self.table.read();
            let Some(record) = table.get_by_sequence(sequence) else {
                continue;
            };
            if self.query.matches(record) {
                self.remaining -= 1;
                return Some(record.clone());
            }
        }

        None
    }
}
