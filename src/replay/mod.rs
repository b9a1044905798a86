//! Snapshots, deterministic rebuild and projections over aggregate events.
//!
//! State is rebuilt by starting from the latest snapshot of an aggregate
//! (or the default state) and folding every later event into it, in
//! version order:
//!
//! ```ignore
//! let balance: i64 = store.rebuild("acc-1", |balance, event| {
//!     balance + event.payload["amount"].as_i64().unwrap_or(0)
//! })?;
//! ```

mod projections;
mod snapshots;

pub use projections::{ProjectionFn, ProjectionStore, ProjectionUpdate, ProjectionView};
pub use snapshots::SnapshotStore;

use crate::error::{Result, StoreError};
use crate::records::RecordTable;
use crate::store::Store;
use crate::types::{ProjectionEntry, Record, Snapshot, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

impl Store {
    // --- Snapshots ---

    /// Save the state of an aggregate as of `version`. Older snapshots are
    /// kept; the highest version is used by [`Store::rebuild`].
    pub fn save_snapshot(&self, aggregate_id: &str, version: u64, state: Value) -> Result<Snapshot> {
        let table = self.table.read();
        self.save_snapshot_locked(&table, aggregate_id, version, state)
    }

    pub fn get_latest_snapshot(&self, aggregate_id: &str) -> Option<Snapshot> {
        self.snapshots.latest(aggregate_id)
    }

    /// True once an aggregate has gained `snapshot_every` events since its
    /// latest snapshot.
    pub fn snapshot_due(&self, aggregate_id: &str) -> bool {
        let every = self.config().snapshot_every;
        if every == 0 {
            return false;
        }
        let version = self.aggregate_version(aggregate_id);
        version.saturating_sub(self.snapshots.latest_version(aggregate_id)) >= every
    }

    // --- Replay ---

    /// Reconstruct an aggregate's state with `reducer`. Reads only: calling
    /// it twice without intervening appends yields the same state.
    ///
    /// The reducer runs without any store lock held and may call back into
    /// the store.
    pub fn rebuild<S, F>(&self, aggregate_id: &str, reducer: F) -> Result<S>
    where
        S: DeserializeOwned + Default,
        F: FnMut(S, &Record) -> S,
    {
        let (state, _) = self.fold(aggregate_id, reducer)?;
        Ok(state)
    }

    /// Rebuild an aggregate and snapshot it at the version the rebuild
    /// reached. Returns `None` for an aggregate with no events.
    pub fn compact_aggregate<S, F>(&self, aggregate_id: &str, reducer: F) -> Result<Option<Snapshot>>
    where
        S: Serialize + DeserializeOwned + Default,
        F: FnMut(S, &Record) -> S,
    {
        let (state, version) = self.fold(aggregate_id, reducer)?;
        if version == 0 || version == self.snapshots.latest_version(aggregate_id) {
            return Ok(self.snapshots.latest(aggregate_id));
        }

        let state = serde_json::to_value(state)?;
        let snapshot = self.save_snapshot(aggregate_id, version, state)?;
        info!(aggregate_id, version, "Compacted aggregate");
        Ok(Some(snapshot))
    }

    // --- Projections ---

    /// Register a projection and feed it the stored history. Appends wait
    /// until the backfill is done, so the projection sees every record in
    /// sequence order. Returns the number of entries written.
    pub fn register_projection<F>(&self, name: impl Into<String>, f: F) -> Result<usize>
    where
        F: Fn(&Record, &ProjectionView<'_>) -> ProjectionUpdate + Send + Sync + 'static,
    {
        let name = name.into();
        let table = self.table.read();
        self.projections.register(name.clone(), f);
        let written = self.projections.apply_named(&name, table.iter())?;
        debug!(projection = %name, written, head = table.head().0, "Backfilled projection");
        Ok(written)
    }

    pub fn get_projection(&self, name: &str, key: &str) -> Option<Value> {
        self.projections.get(name, key)
    }

    /// All entries of a projection, ordered by key.
    pub fn list_projection(&self, name: &str) -> Vec<ProjectionEntry> {
        self.projections.list(name)
    }

    /// Feed every stored record through one projection, in sequence order.
    /// Keys already updated by a record are not updated again by it or by
    /// any earlier one, so this is safe to repeat.
    pub fn catch_up_projection(&self, name: &str) -> Result<usize> {
        let table = self.table.read();
        let written = self.projections.apply_named(name, table.iter())?;
        info!(projection = name, written, head = table.head().0, "Projection caught up");
        Ok(written)
    }

    // --- Private Helpers ---

    /// Latest snapshot of an aggregate and the events after it.
    fn replay_source(&self, aggregate_id: &str) -> (Option<Snapshot>, Vec<Record>) {
        let table = self.table.read();
        let snapshot = self.snapshots.latest(aggregate_id);
        let from_version = snapshot.as_ref().map_or(0, |s| s.version);
        (snapshot, table.aggregate_events(aggregate_id, from_version))
    }

    fn fold<S, F>(&self, aggregate_id: &str, mut reducer: F) -> Result<(S, u64)>
    where
        S: DeserializeOwned + Default,
        F: FnMut(S, &Record) -> S,
    {
        let (snapshot, events) = self.replay_source(aggregate_id);
        let (mut state, from_version) = match snapshot {
            Some(snapshot) => (serde_json::from_value(snapshot.state)?, snapshot.version),
            None => (S::default(), 0),
        };

        let version = events
            .last()
            .and_then(|e| e.aggregate_version)
            .unwrap_or(from_version);
        debug!(
            aggregate_id,
            from_version,
            replayed = events.len(),
            "Rebuilding aggregate"
        );
        for event in &events {
            state = reducer(state, event);
        }
        Ok((state, version))
    }

    fn save_snapshot_locked(
        &self,
        table: &RecordTable,
        aggregate_id: &str,
        version: u64,
        state: Value,
    ) -> Result<Snapshot> {
        let current = table.aggregate_version(aggregate_id);
        if version == 0 || version > current {
            return Err(StoreError::Validation(format!(
                "snapshot version {version} outside 1..={current} for aggregate {aggregate_id}"
            )));
        }
        let aggregate_type = table
            .aggregate_type(aggregate_id)
            .unwrap_or_default()
            .to_string();

        let snapshot = Snapshot {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type,
            version,
            state,
            timestamp: Timestamp::now(),
        };
        self.snapshots.save(snapshot.clone())?;
        Ok(snapshot)
    }
}
