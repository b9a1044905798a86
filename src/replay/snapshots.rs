//! Aggregate snapshots.

use crate::error::Result;
use crate::journal::Journal;
use crate::types::Snapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Magic bytes for `snapshots.log`.
const SNAPSHOT_MAGIC: &[u8; 4] = b"WSS\0";

/// Append-only snapshot history with the latest version per aggregate
/// kept in memory.
pub struct SnapshotStore {
    journal: Journal<Snapshot>,
    latest: RwLock<HashMap<String, Snapshot>>,
    count: AtomicU64,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let (journal, recovered) = Journal::<Snapshot>::open(path, SNAPSHOT_MAGIC, sync_interval)?;

        let count = recovered.entries.len() as u64;
        let mut latest: HashMap<String, Snapshot> = HashMap::new();
        for snapshot in recovered.entries {
            keep_latest(&mut latest, snapshot);
        }

        Ok(Self {
            journal,
            latest: RwLock::new(latest),
            count: AtomicU64::new(count),
        })
    }

    /// Append a snapshot. Older versions stay on disk; only the highest
    /// version per aggregate is served.
    pub fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut latest = self.latest.write();
        self.journal.append(&snapshot)?;
        self.count.fetch_add(1, Ordering::Relaxed);

        debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "Saved snapshot"
        );
        keep_latest(&mut latest, snapshot);
        Ok(())
    }

    pub fn latest(&self, aggregate_id: &str) -> Option<Snapshot> {
        self.latest.read().get(aggregate_id).cloned()
    }

    pub fn latest_version(&self, aggregate_id: &str) -> u64 {
        self.latest
            .read()
            .get(aggregate_id)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    /// Snapshots ever saved, superseded ones included.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sync(&self) -> Result<()> {
        self.journal.sync()
    }

    pub fn size(&self) -> u64 {
        self.journal.size()
    }
}

fn keep_latest(latest: &mut HashMap<String, Snapshot>, snapshot: Snapshot) {
    let newer = latest
        .get(&snapshot.aggregate_id)
        .map_or(true, |current| snapshot.version >= current.version);
    if newer {
        latest.insert(snapshot.aggregate_id.clone(), snapshot);
    }
}
