//! Claim loop for one worker.

use super::ClaimRequest;
use crate::error::Result;
use crate::store::Store;
use crate::types::Record;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of handling one record. `Ok` completes the record with the
/// returned result; `Err` fails the attempt with that reason.
pub type HandlerResult = std::result::Result<Option<Value>, String>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What a worker did before it stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Records handed to the handler.
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Completions or failures rejected because the lease was lost meanwhile.
    pub lost_leases: u64,
    /// Storage errors retried with backoff.
    pub storage_errors: u64,
}

/// Claims records and feeds them to a handler.
///
/// When idle the worker waits on a notification subscription for at most
/// `poll_interval`, so it reacts to new work quickly but stays correct under
/// polling alone.
pub struct Worker {
    store: Arc<Store>,
    request: ClaimRequest,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<Store>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            request: ClaimRequest::new(worker_id),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request = self.request.topics(topics);
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.request = self.request.lease(lease);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.request.worker_id
    }

    /// Run until `stop` is set. Storage errors are retried with exponential
    /// backoff; they never end the loop.
    pub fn run<H>(&self, mut handler: H, stop: &AtomicBool) -> WorkerReport
    where
        H: FnMut(&Record) -> HandlerResult,
    {
        let wake = match self.request.topics.as_deref() {
            Some([topic]) => self.store.subscribe_channel(topic.as_str(), 1),
            _ => self.store.subscribe_channel("*", 1),
        };

        let mut report = WorkerReport::default();
        let mut backoff = INITIAL_BACKOFF;
        info!(worker = %self.id(), "Worker started");

        while !stop.load(Ordering::Relaxed) {
            match self.step(&mut handler, &mut report) {
                Ok(true) => backoff = INITIAL_BACKOFF,
                Ok(false) => {
                    // Idle: wait for a notification or the poll interval.
                    let _ = wake.recv_timeout(self.poll_interval);
                    wake.drain();
                }
                Err(e) => {
                    report.storage_errors += 1;
                    warn!(worker = %self.id(), error = %e, backoff_ms = backoff.as_millis() as u64, "Storage error, backing off");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        self.store.unsubscribe(wake.id);
        info!(worker = %self.id(), processed = report.processed, "Worker stopped");
        report
    }

    /// Process records until a claim comes back empty.
    pub fn run_until_idle<H>(&self, mut handler: H) -> Result<WorkerReport>
    where
        H: FnMut(&Record) -> HandlerResult,
    {
        let mut report = WorkerReport::default();
        while self.step(&mut handler, &mut report)? {}
        Ok(report)
    }

    /// Claim and handle one record. Returns false when there was nothing to do.
    fn step<H>(&self, handler: &mut H, report: &mut WorkerReport) -> Result<bool>
    where
        H: FnMut(&Record) -> HandlerResult,
    {
        let Some(record) = self.store.claim(&self.request)? else {
            return Ok(false);
        };
        report.processed += 1;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&record)))
            .unwrap_or_else(|_| {
                error!(worker = %self.id(), id = %record.id, "Handler panicked");
                Err("handler panicked".to_string())
            });

        let finished = match outcome {
            Ok(result) => self
                .store
                .complete_as(record.id, self.id(), result)
                .map(|_| true),
            Err(reason) => {
                debug!(worker = %self.id(), id = %record.id, reason = %reason, "Handler failed");
                self.store.fail_as(record.id, self.id(), reason).map(|_| false)
            }
        };

        match finished {
            Ok(true) => report.completed += 1,
            Ok(false) => report.failed += 1,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(worker = %self.id(), id = %record.id, error = %e, "Lease lost before finishing");
                report.lost_leases += 1;
            }
        }
        Ok(true)
    }
}
