//! Incrementally maintained projections.
//!
//! A projection function sees each appended record plus read access to the
//! projection's current data, and returns the keys to upsert. Every stored
//! entry remembers the sequence of the record that last wrote it; an update
//! from a record at or below that sequence is skipped, so feeding the same
//! record twice never double-counts.

use crate::error::{Result, StoreError};
use crate::journal::Journal;
use crate::types::{ProjectionEntry, Record, Timestamp};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Magic bytes for `projections.log`.
const PROJECTION_MAGIC: &[u8; 4] = b"WSP\0";

/// Projection function. Runs inside the store's append critical section and
/// must not call back into the store.
pub type ProjectionFn = Arc<dyn Fn(&Record, &ProjectionView<'_>) -> ProjectionUpdate + Send + Sync>;

type ProjectionData = BTreeMap<String, ProjectionEntry>;

/// Read access to one projection's data while it is being updated.
pub struct ProjectionView<'a> {
    entries: Option<&'a ProjectionData>,
}

impl<'a> ProjectionView<'a> {
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.entries.and_then(|e| e.get(key)).map(|entry| &entry.data)
    }

    pub fn len(&self) -> usize {
        self.entries.map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys to upsert, returned by a projection function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectionUpdate {
    upserts: BTreeMap<String, Value>,
}

impl ProjectionUpdate {
    /// No change.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, data: Value) -> Self {
        self.upserts.insert(key.into(), data);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, data: Value) {
        self.upserts.insert(key.into(), data);
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ProjectionUpdate {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            upserts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Registered projection functions and their materialized data.
pub struct ProjectionStore {
    journal: Journal<ProjectionEntry>,
    /// Registration order is application order.
    registry: RwLock<Vec<(String, ProjectionFn)>>,
    data: RwLock<HashMap<String, ProjectionData>>,
}

impl ProjectionStore {
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let (journal, recovered) =
            Journal::<ProjectionEntry>::open(path, PROJECTION_MAGIC, sync_interval)?;

        let mut data: HashMap<String, ProjectionData> = HashMap::new();
        for entry in recovered.entries {
            let entries = data.entry(entry.projection.clone()).or_default();
            let newer = entries
                .get(&entry.key)
                .map_or(true, |current| entry.last_sequence >= current.last_sequence);
            if newer {
                entries.insert(entry.key.clone(), entry);
            }
        }

        Ok(Self {
            journal,
            registry: RwLock::new(Vec::new()),
            data: RwLock::new(data),
        })
    }

    /// Register `f` under `name`, replacing any function already registered
    /// under that name. Data written before a restart is kept.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Record, &ProjectionView<'_>) -> ProjectionUpdate + Send + Sync + 'static,
    {
        let name = name.into();
        let f: ProjectionFn = Arc::new(f);
        let mut registry = self.registry.write();
        match registry.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = f,
            None => registry.push((name.clone(), f)),
        }
        debug!(projection = %name, "Registered projection");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().iter().any(|(n, _)| n == name)
    }

    /// Feed `record` through every registered projection. Returns the number
    /// of entries written.
    pub fn apply(&self, record: &Record) -> Result<usize> {
        let registry = self.registry.read().clone();
        let mut written = 0;
        for (name, f) in &registry {
            written += self.apply_fn(name, f, record)?;
        }
        Ok(written)
    }

    /// Feed `records` through one projection.
    pub fn apply_named<'a, I>(&self, name: &str, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let f = self
            .registry
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| Arc::clone(f))
            .ok_or_else(|| StoreError::ProjectionNotRegistered(name.to_string()))?;

        let mut written = 0;
        for record in records {
            written += self.apply_fn(name, &f, record)?;
        }
        Ok(written)
    }

    fn apply_fn(&self, name: &str, f: &ProjectionFn, record: &Record) -> Result<usize> {
        let mut data = self.data.write();

        let outcome = {
            let view = ProjectionView {
                entries: data.get(name),
            };
            panic::catch_unwind(AssertUnwindSafe(|| f(record, &view)))
        };
        let update = match outcome {
            Ok(update) => update,
            Err(_) => {
                error!(
                    projection = name,
                    sequence = record.sequence.0,
                    "Projection function panicked, record skipped"
                );
                return Ok(0);
            }
        };

        let entries = data.entry(name.to_string()).or_default();
        let mut written = 0;
        for (key, value) in update.upserts {
            let already_applied = entries
                .get(&key)
                .is_some_and(|current| current.last_sequence >= record.sequence);
            if already_applied {
                continue;
            }

            let entry = ProjectionEntry {
                projection: name.to_string(),
                key: key.clone(),
                data: value,
                last_sequence: record.sequence,
                updated_at: Timestamp::now(),
            };
            self.journal.append(&entry)?;
            entries.insert(key, entry);
            written += 1;
        }
        Ok(written)
    }

    pub fn get(&self, name: &str, key: &str) -> Option<Value> {
        self.get_entry(name, key).map(|entry| entry.data)
    }

    pub fn get_entry(&self, name: &str, key: &str) -> Option<ProjectionEntry> {
        self.data.read().get(name)?.get(key).cloned()
    }

    /// All entries of a projection, ordered by key.
    pub fn list(&self, name: &str) -> Vec<ProjectionEntry> {
        self.data
            .read()
            .get(name)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.data.read().values().map(BTreeMap::len).sum()
    }

    pub fn sync(&self) -> Result<()> {
        self.journal.sync()
    }

    pub fn size(&self) -> u64 {
        self.journal.size()
    }
}
