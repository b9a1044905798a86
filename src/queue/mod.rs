//! Claim-based consumption.
//!
//! A record moves `Pending -> Leased -> Completed`, or back to `Pending` on
//! a failed attempt while attempts remain, or to `Failed` once they run
//! out. Selection and the transition to `Leased` happen in one critical
//! section, so two concurrent claims never receive the same record.
//!
//! An expired lease needs no heartbeat to recover: every claim first sweeps
//! leases whose expiry has passed.

mod worker;

pub use worker::{HandlerResult, Worker, WorkerReport};

use crate::error::{Result, StoreError};
use crate::records::{LogEntry, RecordTable, Transition};
use crate::store::Store;
use crate::types::{Record, RecordClass, RecordId, RecordStatus, Timestamp};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters of one claim.
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub worker_id: String,
    /// Topics to take work from (`None` = any topic).
    pub topics: Option<Vec<String>>,
    /// Lease length (`None` = the store default).
    pub lease: Option<Duration>,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            topics: None,
            lease: None,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.get_or_insert_with(Vec::new).push(topic.into());
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// What the retention sweep removes.
#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    /// Completed or failed tasks and messages finished longer ago than this.
    pub completed_older_than: Duration,
    /// Also remove pending records whose TTL has run out.
    pub remove_expired: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_older_than: Duration::from_secs(24 * 60 * 60),
            remove_expired: true,
        }
    }
}

impl RetentionPolicy {
    pub fn older_than(completed_older_than: Duration) -> Self {
        Self {
            completed_older_than,
            ..Default::default()
        }
    }
}

impl Store {
    // --- Claiming ---

    /// Take the best eligible pending record: highest priority first, then
    /// lowest sequence. Returns `None` when nothing is eligible.
    pub fn claim(&self, request: &ClaimRequest) -> Result<Option<Record>> {
        let now = Timestamp::now();
        let lease = request.lease.unwrap_or(self.config().defaults.lease);

        let (claimed, reclaimed) = {
            let mut table = self.table.write();
            let reclaimed = self.expire_leases(&mut table, now)?;

            match table.select_claimable(request.topics.as_deref(), now) {
                Some(id) => {
                    let claim = Transition::Claimed {
                        id,
                        worker: request.worker_id.clone(),
                        at: now,
                        lease_expires_at: now.plus(lease),
                    };
                    self.commit(&mut table, LogEntry::Transition(claim))?;
                    (table.get(id).cloned(), reclaimed)
                }
                None => (None, reclaimed),
            }
        };

        for record in &reclaimed {
            self.announce_outcome(record);
        }
        if let Some(record) = &claimed {
            debug!(
                id = %record.id,
                worker = %request.worker_id,
                attempt = record.attempts,
                topic = %record.topic,
                "Claimed record"
            );
        }
        Ok(claimed)
    }

    /// Finish a leased record successfully, whoever holds the lease.
    ///
    /// A `Some(Value::Null)` result is stored as `None`.
    pub fn complete(&self, id: RecordId, result: Option<Value>) -> Result<Record> {
        self.finish(id, None, result)
    }

    /// Finish a record leased by `worker_id`. Fails with
    /// [`StoreError::LeaseNotHeld`] once the lease has run out or passed to
    /// another worker.
    pub fn complete_as(&self, id: RecordId, worker_id: &str, result: Option<Value>) -> Result<Record> {
        self.finish(id, Some(worker_id), result)
    }

    /// Record a failed attempt. The record goes back to pending while
    /// attempts remain, otherwise it fails for good.
    pub fn fail(&self, id: RecordId, error: impl Into<String>) -> Result<Record> {
        self.fail_attempt(id, None, error.into())
    }

    /// [`Store::fail`] for a record leased by `worker_id`.
    pub fn fail_as(&self, id: RecordId, worker_id: &str, error: impl Into<String>) -> Result<Record> {
        self.fail_attempt(id, Some(worker_id), error.into())
    }

    fn finish(&self, id: RecordId, owner: Option<&str>, result: Option<Value>) -> Result<Record> {
        let record = self.transition(|table, now| table.plan_complete(id, owner, result, now))?;
        debug!(id = %id, latency_ms = record.latency().map(|d| d.as_millis() as u64), "Completed record");
        self.announce_outcome(&record);
        Ok(record)
    }

    fn fail_attempt(&self, id: RecordId, owner: Option<&str>, error: String) -> Result<Record> {
        let record = self.transition(|table, now| table.plan_fail(id, owner, error, now))?;
        debug!(
            id = %id,
            attempts = record.attempts,
            max_attempts = record.max_attempts,
            terminal = record.status == RecordStatus::Failed,
            "Failed attempt"
        );
        self.announce_outcome(&record);
        Ok(record)
    }

    /// Extend a lease held by `worker_id`.
    pub fn renew_lease(&self, id: RecordId, worker_id: &str, lease: Duration) -> Result<Record> {
        self.transition(|table, now| table.plan_renew(id, worker_id, now.plus(lease), now))
    }

    /// Expire a lease now, as if it had run out.
    pub fn force_expire(&self, id: RecordId) -> Result<Record> {
        let record = self.transition(|table, now| table.plan_force_expire(id, now))?;
        info!(id = %id, status = %record.status, "Force-expired lease");
        self.announce_outcome(&record);
        Ok(record)
    }

    /// Sweep expired leases without claiming. Returns how many were reclaimed.
    pub fn reclaim_expired(&self) -> Result<usize> {
        let reclaimed = {
            let mut table = self.table.write();
            self.expire_leases(&mut table, Timestamp::now())?
        };
        for record in &reclaimed {
            self.announce_outcome(record);
        }
        Ok(reclaimed.len())
    }

    // --- Retention ---

    /// Remove finished tasks and messages older than the policy allows, and
    /// pending records past their TTL. Events are kept. The record journal
    /// is rewritten; sequence numbers are never reused afterwards.
    pub fn purge(&self, policy: &RetentionPolicy) -> Result<usize> {
        let now = Timestamp::now();
        let cutoff = now.minus(policy.completed_older_than);

        let mut table = self.table.write();
        let doomed: Vec<RecordId> = table
            .iter()
            .filter(|record| record.class != RecordClass::Event)
            .filter(|record| match record.status {
                RecordStatus::Completed | RecordStatus::Failed => record.updated_at <= cutoff,
                RecordStatus::Pending => policy.remove_expired && record.is_expired(now),
                RecordStatus::Leased => false,
            })
            .map(|record| record.id)
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let excluded: HashSet<RecordId> = doomed.iter().copied().collect();
        let entries = table.checkpoint_entries(&excluded);
        self.rewrite_log(&entries)?;
        let removed = table.remove(&doomed);

        info!(
            removed,
            remaining = table.len(),
            next_sequence = table.next_sequence().0,
            "Retention sweep"
        );
        Ok(removed)
    }

    // --- Helpers ---

    /// Plan a transition, journal it and apply it in one critical section.
    fn transition<F>(&self, plan: F) -> Result<Record>
    where
        F: FnOnce(&RecordTable, Timestamp) -> Result<Transition>,
    {
        let now = Timestamp::now();
        let mut table = self.table.write();
        let transition = plan(&table, now)?;
        let id = transition.id();
        self.commit(&mut table, LogEntry::Transition(transition))?;
        table.get(id).cloned().ok_or(StoreError::RecordNotFound(id))
    }

    /// Journal a `LeaseExpired` for every lease that ran out by `now`.
    fn expire_leases(&self, table: &mut RecordTable, now: Timestamp) -> Result<Vec<Record>> {
        let mut reclaimed = Vec::new();
        for id in table.expired_leases(now) {
            self.commit(table, LogEntry::Transition(Transition::LeaseExpired { id, at: now }))?;
            if let Some(record) = table.get(id) {
                warn!(
                    id = %id,
                    attempts = record.attempts,
                    status = %record.status,
                    "Reclaimed expired lease"
                );
                reclaimed.push(record.clone());
            }
        }
        Ok(reclaimed)
    }
}
