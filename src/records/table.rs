//! In-memory record table and its indices.
//!
//! The table is the materialized state of `records.log`: every journal entry,
//! live or replayed at open, goes through [`RecordTable::apply`]. Live writers
//! validate with the `plan_*` methods first, journal the resulting entry, then
//! apply it, all under the store's write lock.

use crate::error::{Result, StoreError};
use crate::metrics::{CompletionWindow, StatusCounts};
use crate::records::entry::{LogEntry, Transition};
use crate::records::query::RecordQuery;
use crate::types::{
    Attempt, AttemptOutcome, Record, RecordClass, RecordId, RecordStatus, Sequence, Timestamp,
};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Claim order: highest priority first, then lowest sequence.
type ReadyKey = (Reverse<i32>, Sequence, RecordId);

/// Error recorded when a lease runs out on the last allowed attempt.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

pub struct RecordTable {
    records: HashMap<RecordId, Record>,

    /// Global order.
    by_sequence: BTreeMap<Sequence, RecordId>,

    /// Topic -> sequences, ascending.
    by_topic: HashMap<String, Vec<Sequence>>,

    /// Kind -> sequences, ascending.
    by_kind: HashMap<String, Vec<Sequence>>,

    /// Aggregate -> event ids; position `i` holds version `i + 1`.
    aggregates: HashMap<String, Vec<RecordId>>,

    /// Topic -> claimable pending records in claim order.
    ready: HashMap<String, BTreeSet<ReadyKey>>,

    /// Active leases by expiry.
    leases: BTreeSet<(Timestamp, RecordId)>,

    /// Pending records by sequence (oldest backlog first).
    pending: BTreeSet<Sequence>,

    /// Pending records with a TTL, by expiry.
    expiries: BTreeSet<(Timestamp, RecordId)>,

    /// Per-topic status counts for tasks and messages.
    counts: HashMap<String, StatusCounts>,

    event_count: u64,

    completions: CompletionWindow,

    next_sequence: Sequence,
}

impl RecordTable {
    /// Create an empty table keeping up to `latency_samples` recent latencies
    /// and every completion time within `metrics_window`.
    pub fn new(latency_samples: usize, metrics_window: Duration) -> Self {
        Self {
            records: HashMap::new(),
            by_sequence: BTreeMap::new(),
            by_topic: HashMap::new(),
            by_kind: HashMap::new(),
            aggregates: HashMap::new(),
            ready: HashMap::new(),
            leases: BTreeSet::new(),
            pending: BTreeSet::new(),
            expiries: BTreeSet::new(),
            counts: HashMap::new(),
            event_count: 0,
            completions: CompletionWindow::new(latency_samples, metrics_window),
            next_sequence: Sequence(1),
        }
    }

    // --- Reads ---

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    pub fn get_by_sequence(&self, sequence: Sequence) -> Option<&Record> {
        self.by_sequence
            .get(&sequence)
            .and_then(|id| self.records.get(id))
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    /// Highest sequence ever assigned (zero for an empty store).
    pub fn head(&self) -> Sequence {
        self.next_sequence.prev().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current version of an aggregate (zero if it has no events).
    pub fn aggregate_version(&self, aggregate_id: &str) -> u64 {
        self.aggregates
            .get(aggregate_id)
            .map(|ids| ids.len() as u64)
            .unwrap_or(0)
    }

    /// Type of an aggregate, taken from its first event.
    pub fn aggregate_type(&self, aggregate_id: &str) -> Option<&str> {
        self.aggregates
            .get(aggregate_id)
            .and_then(|ids| ids.first())
            .and_then(|id| self.records.get(id))
            .and_then(|record| record.aggregate_type.as_deref())
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.len()
    }

    /// Events of an aggregate with version greater than `from_version`, ascending.
    pub fn aggregate_events(&self, aggregate_id: &str, from_version: u64) -> Vec<Record> {
        self.aggregates
            .get(aggregate_id)
            .map(|ids| {
                ids.iter()
                    .skip(from_version as usize)
                    .filter_map(|id| self.records.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All records in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.by_sequence
            .values()
            .filter_map(move |id| self.records.get(id))
    }

    pub fn class_count(&self, class: RecordClass) -> usize {
        match class {
            RecordClass::Event => self.event_count as usize,
            _ => self.records.values().filter(|r| r.class == class).count(),
        }
    }

    pub(crate) fn counts(&self) -> &HashMap<String, StatusCounts> {
        &self.counts
    }

    pub(crate) fn event_count(&self) -> u64 {
        self.event_count
    }

    pub(crate) fn completions(&self) -> &CompletionWindow {
        &self.completions
    }

    /// Pending records whose TTL ran out at or before `now`.
    pub(crate) fn expired_pending(&self, now: Timestamp) -> impl Iterator<Item = RecordId> + '_ {
        self.expiries
            .iter()
            .take_while(move |(at, _)| *at <= now)
            .map(|(_, id)| *id)
    }

    /// Oldest pending record that is still deliverable at `now`.
    pub(crate) fn oldest_pending(&self, now: Timestamp) -> Option<&Record> {
        self.pending
            .iter()
            .filter_map(|seq| self.get_by_sequence(*seq))
            .find(|r| !r.is_expired(now))
    }

    /// Candidate sequences for a query, from the narrowest index available.
    pub(crate) fn candidates(&self, query: &RecordQuery) -> Vec<Sequence> {
        let (from, to) = query.sequence_bounds();

        if let Some(aggregate_id) = &query.aggregate_id {
            return self
                .aggregates
                .get(aggregate_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.records.get(id))
                        .map(|r| r.sequence)
                        .filter(|s| *s >= from && *s <= to)
                        .collect()
                })
                .unwrap_or_default();
        }

        let indexed = match (&query.topic, &query.kind) {
            (Some(topic), _) => Some(self.by_topic.get(topic)),
            (None, Some(kind)) => Some(self.by_kind.get(kind)),
            (None, None) => None,
        };

        match indexed {
            Some(list) => {
                let list = list.map(Vec::as_slice).unwrap_or(&[]);
                let start = list.partition_point(|s| *s < from);
                let end = list.partition_point(|s| *s <= to);
                list[start..end].to_vec()
            }
            None => self.by_sequence.range(from..=to).map(|(s, _)| *s).collect(),
        }
    }

    // --- Claim selection ---

    /// Best claimable record across `topics` (all topics when `None`).
    ///
    /// TTL-expired records found at the head of a topic are evicted from the
    /// ready index; they can never become claimable again.
    pub fn select_claimable(&mut self, topics: Option<&[String]>, now: Timestamp) -> Option<RecordId> {
        let candidates: Vec<String> = match topics {
            Some(topics) => topics.to_vec(),
            None => self.ready.keys().cloned().collect(),
        };

        let mut best: Option<ReadyKey> = None;
        for topic in candidates {
            let Some(set) = self.ready.get_mut(&topic) else {
                continue;
            };
            while let Some(key) = set.first().copied() {
                let expired = self
                    .records
                    .get(&key.2)
                    .map_or(true, |record| !record.is_claimable(now));
                if expired {
                    set.pop_first();
                    continue;
                }
                if best.map_or(true, |b| key < b) {
                    best = Some(key);
                }
                break;
            }
            if set.is_empty() {
                self.ready.remove(&topic);
            }
        }

        best.map(|(_, _, id)| id)
    }

    /// Leases that have run out at or before `now`.
    pub fn expired_leases(&self, now: Timestamp) -> Vec<RecordId> {
        self.leases
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| *id)
            .collect()
    }

    // --- Planning (validation before journaling) ---

    fn leased(&self, id: RecordId, action: &'static str) -> Result<&Record> {
        let record = self.records.get(&id).ok_or(StoreError::RecordNotFound(id))?;
        if record.status != RecordStatus::Leased {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                action,
            });
        }
        Ok(record)
    }

    /// A leased record whose lease belongs to `worker` and has not run out.
    fn held(&self, id: RecordId, worker: &str, action: &'static str, now: Timestamp) -> Result<&Record> {
        let record = self.leased(id, action)?;
        if record.lease_owner.as_deref() != Some(worker) || record.lease_expired(now) {
            return Err(StoreError::LeaseNotHeld(id));
        }
        Ok(record)
    }

    /// Plan a completion. With `owner`, the lease must still be held by it.
    /// A `null` result is stored as no result.
    pub fn plan_complete(
        &self,
        id: RecordId,
        owner: Option<&str>,
        result: Option<Value>,
        now: Timestamp,
    ) -> Result<Transition> {
        match owner {
            Some(worker) => self.held(id, worker, "complete", now)?,
            None => self.leased(id, "complete")?,
        };
        let result = result.filter(|value| !value.is_null());
        Ok(Transition::Completed { id, at: now, result })
    }

    pub fn plan_fail(
        &self,
        id: RecordId,
        owner: Option<&str>,
        error: String,
        now: Timestamp,
    ) -> Result<Transition> {
        match owner {
            Some(worker) => self.held(id, worker, "fail", now)?,
            None => self.leased(id, "fail")?,
        };
        Ok(Transition::Failed { id, at: now, error })
    }

    pub fn plan_renew(
        &self,
        id: RecordId,
        worker: &str,
        lease_expires_at: Timestamp,
        now: Timestamp,
    ) -> Result<Transition> {
        self.held(id, worker, "renew", now)?;
        Ok(Transition::LeaseRenewed {
            id,
            lease_expires_at,
        })
    }

    pub fn plan_force_expire(&self, id: RecordId, now: Timestamp) -> Result<Transition> {
        self.leased(id, "force-expire")?;
        Ok(Transition::ForceExpired { id, at: now })
    }

    // --- Mutation ---

    /// Apply one journal entry.
    pub fn apply(&mut self, entry: LogEntry) -> Result<()> {
        match entry {
            LogEntry::Checkpoint { next_sequence } => {
                self.next_sequence = self.next_sequence.max(next_sequence);
                Ok(())
            }
            LogEntry::Append(record) => self.insert(record),
            LogEntry::Batch(records) => {
                for record in records {
                    self.insert(record)?;
                }
                Ok(())
            }
            LogEntry::Transition(transition) => self.apply_transition(transition),
        }
    }

    fn insert(&mut self, record: Record) -> Result<()> {
        if record.sequence < self.next_sequence {
            return Err(StoreError::Corruption(format!(
                "Sequence {} already assigned (next is {})",
                record.sequence, self.next_sequence
            )));
        }

        if let Some(aggregate_id) = &record.aggregate_id {
            let versions = self.aggregates.entry(aggregate_id.clone()).or_default();
            let expected = versions.len() as u64 + 1;
            if record.aggregate_version != Some(expected) {
                return Err(StoreError::Corruption(format!(
                    "Aggregate {} expected version {}, got {:?}",
                    aggregate_id, expected, record.aggregate_version
                )));
            }
            versions.push(record.id);
        }

        self.next_sequence = record.sequence.next();
        self.by_sequence.insert(record.sequence, record.id);
        self.by_topic
            .entry(record.topic.clone())
            .or_default()
            .push(record.sequence);
        self.by_kind
            .entry(record.kind.clone())
            .or_default()
            .push(record.sequence);

        if record.class == RecordClass::Event {
            self.event_count += 1;
        } else {
            self.counts
                .entry(record.topic.clone())
                .or_default()
                .add(record.status, 1);
            match record.status {
                RecordStatus::Pending => self.index_pending(&record),
                RecordStatus::Leased => {
                    if let Some(at) = record.lease_expires_at {
                        self.leases.insert((at, record.id));
                    }
                }
                RecordStatus::Completed => {
                    if let (Some(done), Some(latency)) = (record.completed_at, record.latency()) {
                        self.completions.push(done, latency);
                    }
                }
                RecordStatus::Failed => {}
            }
        }

        self.records.insert(record.id, record);
        Ok(())
    }

    fn apply_transition(&mut self, transition: Transition) -> Result<()> {
        let id = transition.id();
        let mut record = self
            .records
            .remove(&id)
            .ok_or_else(|| StoreError::Corruption(format!("Transition for unknown record {}", id)))?;

        let outcome = self.transition_record(&mut record, transition);
        self.records.insert(id, record);
        outcome
    }

    fn transition_record(&mut self, record: &mut Record, transition: Transition) -> Result<()> {
        let expected = match &transition {
            Transition::Claimed { .. } => RecordStatus::Pending,
            _ => RecordStatus::Leased,
        };
        if record.status != expected {
            return Err(StoreError::InvalidTransition {
                id: record.id,
                from: record.status,
                action: transition.action(),
            });
        }

        let before = record.status;
        let expiry_outcome = match &transition {
            Transition::ForceExpired { .. } => AttemptOutcome::ForceExpired,
            _ => AttemptOutcome::LeaseExpired,
        };
        match transition {
            Transition::Claimed {
                worker,
                at,
                lease_expires_at,
                ..
            } => {
                self.unindex_pending(record);
                record.status = RecordStatus::Leased;
                record.attempts += 1;
                record.lease_owner = Some(worker.clone());
                record.lease_expires_at = Some(lease_expires_at);
                record.updated_at = at;
                record.history.push(Attempt {
                    number: record.attempts,
                    worker,
                    claimed_at: at,
                    finished_at: None,
                    outcome: None,
                });
                self.leases.insert((lease_expires_at, record.id));
            }
            Transition::Completed { at, result, .. } => {
                self.release_lease(record);
                record.status = RecordStatus::Completed;
                record.result = result;
                record.completed_at = Some(at);
                record.updated_at = at;
                close_attempt(record, at, AttemptOutcome::Completed);
                if let Some(latency) = record.latency() {
                    self.completions.push(at, latency);
                }
            }
            Transition::Failed { at, error, .. } => {
                self.release_lease(record);
                close_attempt(record, at, AttemptOutcome::Failed(error.clone()));
                record.error = Some(error);
                self.retry_or_fail(record, at);
            }
            Transition::LeaseRenewed {
                lease_expires_at, ..
            } => {
                if let Some(old) = record.lease_expires_at {
                    self.leases.remove(&(old, record.id));
                }
                record.lease_expires_at = Some(lease_expires_at);
                self.leases.insert((lease_expires_at, record.id));
            }
            Transition::LeaseExpired { at, .. } | Transition::ForceExpired { at, .. } => {
                self.release_lease(record);
                close_attempt(record, at, expiry_outcome);
                if record.attempts >= record.max_attempts {
                    record.error = Some(LEASE_EXPIRED_ERROR.to_string());
                }
                self.retry_or_fail(record, at);
            }
        }

        if before != record.status {
            let counts = self.counts.entry(record.topic.clone()).or_default();
            counts.add(before, -1);
            counts.add(record.status, 1);
        }
        Ok(())
    }

    /// Back to pending if attempts remain, otherwise terminally failed.
    fn retry_or_fail(&mut self, record: &mut Record, at: Timestamp) {
        record.updated_at = at;
        if record.attempts >= record.max_attempts {
            record.status = RecordStatus::Failed;
        } else {
            record.status = RecordStatus::Pending;
            self.index_pending(record);
        }
    }

    fn release_lease(&mut self, record: &mut Record) {
        if let Some(at) = record.lease_expires_at.take() {
            self.leases.remove(&(at, record.id));
        }
        record.lease_owner = None;
    }

    fn index_pending(&mut self, record: &Record) {
        self.ready
            .entry(record.topic.clone())
            .or_default()
            .insert((Reverse(record.priority), record.sequence, record.id));
        self.pending.insert(record.sequence);
        if let Some(at) = record.expires_at() {
            self.expiries.insert((at, record.id));
        }
    }

    fn unindex_pending(&mut self, record: &Record) {
        if let Some(set) = self.ready.get_mut(&record.topic) {
            set.remove(&(Reverse(record.priority), record.sequence, record.id));
            if set.is_empty() {
                self.ready.remove(&record.topic);
            }
        }
        self.pending.remove(&record.sequence);
        if let Some(at) = record.expires_at() {
            self.expiries.remove(&(at, record.id));
        }
    }

    /// Physically remove records (retention sweep). Events are never removed.
    pub fn remove(&mut self, ids: &[RecordId]) -> usize {
        let mut removed = Vec::new();
        for id in ids {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if record.class == RecordClass::Event {
                continue;
            }
            let record = record.clone();
            match record.status {
                RecordStatus::Pending => self.unindex_pending(&record),
                RecordStatus::Leased => {
                    if let Some(at) = record.lease_expires_at {
                        self.leases.remove(&(at, record.id));
                    }
                }
                _ => {}
            }
            if let Some(counts) = self.counts.get_mut(&record.topic) {
                counts.add(record.status, -1);
            }
            self.by_sequence.remove(&record.sequence);
            self.records.remove(id);
            removed.push(record.sequence);
        }

        if !removed.is_empty() {
            removed.sort_unstable();
            let gone = |s: &Sequence| removed.binary_search(s).is_err();
            for list in self.by_topic.values_mut() {
                list.retain(gone);
            }
            for list in self.by_kind.values_mut() {
                list.retain(gone);
            }
            self.by_topic.retain(|_, list| !list.is_empty());
            self.by_kind.retain(|_, list| !list.is_empty());
            self.counts.retain(|_, c| !c.is_empty());
        }
        removed.len()
    }

    /// Entries that reproduce this table without the `excluded` records, for
    /// log compaction.
    pub fn checkpoint_entries(&self, excluded: &HashSet<RecordId>) -> Vec<LogEntry> {
        let mut entries = Vec::with_capacity(self.records.len() + 1);
        entries.extend(
            self.iter()
                .filter(|record| !excluded.contains(&record.id))
                .cloned()
                .map(LogEntry::Append),
        );
        entries.push(LogEntry::Checkpoint {
            next_sequence: self.next_sequence,
        });
        entries
    }
}

fn close_attempt(record: &mut Record, at: Timestamp, outcome: AttemptOutcome) {
    if let Some(attempt) = record.history.last_mut() {
        if attempt.outcome.is_none() {
            attempt.finished_at = Some(at);
            attempt.outcome = Some(outcome);
        }
    }
}
