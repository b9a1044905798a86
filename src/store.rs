//! Main Store struct tying all components together.

use crate::bus::{Notification, NotificationBus, SubscriptionHandle, SubscriptionId, TopicPattern};
use crate::error::{Result, StoreError};
use crate::journal::Journal;
use crate::metrics::Metrics;
use crate::records::{LogEntry, RecordIter, RecordQuery, RecordTable};
use crate::replay::{ProjectionStore, SnapshotStore};
use crate::types::{
    Record, RecordClass, RecordId, RecordInput, RecordStatus, Sequence, StoreStats, Timestamp, Ttl,
};
use fs2::FileExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Defaults applied to records and claims that do not set their own.
#[derive(Clone, Debug)]
pub struct QueueDefaults {
    /// `None` means records never expire.
    pub ttl_seconds: Option<u64>,

    /// Attempts allowed for tasks.
    pub max_attempts: u32,

    /// Attempts allowed for published messages.
    pub message_max_attempts: u32,

    /// Lease granted by a claim.
    pub lease: Duration,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            ttl_seconds: Some(3600),
            max_attempts: 3,
            message_max_attempts: 1,
            lease: Duration::from_secs(300),
        }
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Fsync every N journal frames (1 = every write).
    pub sync_interval: u64,

    pub defaults: QueueDefaults,

    /// Largest payload (bytes of JSON) inlined into notifications.
    pub payload_threshold: usize,

    /// Span over which `throughput_per_sec` is measured.
    pub metrics_window: Duration,

    /// Recent completions kept for latency percentiles.
    pub latency_sample_size: usize,

    /// Events between snapshots before `snapshot_due` reports true
    /// (0 disables).
    pub snapshot_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            sync_interval: 1,
            defaults: QueueDefaults::default(),
            payload_threshold: crate::bus::DEFAULT_PAYLOAD_THRESHOLD,
            metrics_window: Duration::from_secs(60),
            latency_sample_size: 10_000,
            snapshot_every: 100,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_sync_interval(mut self, sync_interval: u64) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn with_defaults(mut self, defaults: QueueDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_metrics_window(mut self, window: Duration) -> Self {
        self.metrics_window = window;
        self
    }

    pub fn with_snapshot_every(mut self, events: u64) -> Self {
        self.snapshot_every = events;
        self
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"WST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for `records.log`.
const RECORD_LOG_MAGIC: &[u8; 4] = b"WSR\0";

/// The main record store.
///
/// Provides a unified interface for:
/// - Appending tasks, messages and events to one ordered log
/// - Claiming work under time-bounded leases
/// - Pushing notifications to in-process subscribers
/// - Snapshots, replay and projections over aggregate events
///
/// Every mutation runs as one critical section under the table's write lock:
/// validate, journal, then apply. Notifications go out after the lock is
/// released.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Record journal.
    log: Journal<LogEntry>,

    /// Materialized records and their indices.
    pub(crate) table: RwLock<RecordTable>,

    pub(crate) snapshots: SnapshotStore,

    pub(crate) projections: ProjectionStore,

    bus: NotificationBus,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::load(config, lock_file)
    }

    /// Open an existing store, replaying its journals.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        Self::load(config, lock_file)
    }

    fn load(config: StoreConfig, lock_file: File) -> Result<Self> {
        let (log, recovered) = Journal::open(
            config.path.join("records.log"),
            RECORD_LOG_MAGIC,
            config.sync_interval,
        )?;

        let mut table = RecordTable::new(config.latency_sample_size, config.metrics_window);
        let entries = recovered.entries.len();
        for entry in recovered.entries {
            table.apply(entry)?;
        }

        let snapshots = SnapshotStore::open(config.path.join("snapshots.log"), config.sync_interval)?;
        let projections =
            ProjectionStore::open(config.path.join("projections.log"), config.sync_interval)?;

        info!(
            path = %config.path.display(),
            entries,
            records = table.len(),
            head = table.head().0,
            truncated_bytes = recovered.truncated_bytes,
            "Opened store"
        );

        let bus = NotificationBus::with_payload_threshold(config.payload_threshold);

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            table: RwLock::new(table),
            snapshots,
            projections,
            bus,
        })
    }

    // --- Record Operations ---

    /// Append one record. Assigns its sequence and, for events, its
    /// aggregate version.
    pub fn append(&self, input: RecordInput) -> Result<Record> {
        input.validate()?;

        let record = {
            let mut table = self.table.write();
            let aggregate_version = input
                .aggregate_id
                .as_deref()
                .map(|id| table.aggregate_version(id) + 1);
            let record = self.materialize(
                input,
                table.next_sequence(),
                aggregate_version,
                Timestamp::now(),
            );
            self.commit(&mut table, LogEntry::Append(record.clone()))?;
            self.project(&record);
            record
        };

        debug!(
            id = %record.id,
            sequence = record.sequence.0,
            topic = %record.topic,
            kind = %record.kind,
            class = record.class.as_str(),
            "Appended record"
        );
        self.announce(&record);
        Ok(record)
    }

    /// Append many records as one journal frame. Either all of them survive a
    /// crash or none do. Returns how many were appended.
    pub fn bulk_append(&self, inputs: Vec<RecordInput>) -> Result<usize> {
        for input in &inputs {
            input.validate()?;
        }
        if inputs.is_empty() {
            return Ok(0);
        }

        let records = {
            let mut table = self.table.write();
            let now = Timestamp::now();
            let mut sequence = table.next_sequence();
            let mut versions: HashMap<String, u64> = HashMap::new();

            let mut records = Vec::with_capacity(inputs.len());
            for input in inputs {
                let aggregate_version = input.aggregate_id.as_deref().map(|id| {
                    let version = versions
                        .entry(id.to_string())
                        .or_insert_with(|| table.aggregate_version(id));
                    *version += 1;
                    *version
                });
                records.push(self.materialize(input, sequence, aggregate_version, now));
                sequence = sequence.next();
            }

            self.commit(&mut table, LogEntry::Batch(records.clone()))?;
            for record in &records {
                self.project(record);
            }
            records
        };

        info!(
            count = records.len(),
            first = records[0].sequence.0,
            last = records[records.len() - 1].sequence.0,
            "Bulk appended records"
        );
        for record in &records {
            self.announce(record);
        }
        Ok(records.len())
    }

    /// Publish a message on a channel (append + notify).
    pub fn publish(
        &self,
        channel: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<Record> {
        self.append(RecordInput::message(channel, kind, payload))
    }

    /// Append an event to an aggregate's history. Its version is one past
    /// the aggregate's current version. Build the input with
    /// [`RecordInput::event`] and pass it to [`Store::append`] to attach
    /// metadata.
    pub fn append_event(
        &self,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Result<Record> {
        self.append(RecordInput::event(aggregate_id, aggregate_type, event_type, data))
    }

    /// Events of an aggregate with version greater than `from_version`, in
    /// version order.
    pub fn get_aggregate_events(&self, aggregate_id: &str, from_version: u64) -> Vec<Record> {
        self.table.read().aggregate_events(aggregate_id, from_version)
    }

    /// Current version of an aggregate (zero if it has no events).
    pub fn aggregate_version(&self, aggregate_id: &str) -> u64 {
        self.table.read().aggregate_version(aggregate_id)
    }

    /// Get a record by ID.
    pub fn get_record(&self, id: RecordId) -> Option<Record> {
        self.table.read().get(id).cloned()
    }

    /// Lazily iterate records matching `query`.
    pub fn query(&self, query: RecordQuery) -> RecordIter<'_> {
        RecordIter::new(&self.table, query)
    }

    // --- Notifications ---

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Register a callback for notifications on topics matching `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<TopicPattern>, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.bus.subscribe(pattern, callback)
    }

    /// Register a bounded channel for notifications on topics matching `pattern`.
    pub fn subscribe_channel(
        &self,
        pattern: impl Into<TopicPattern>,
        buffer_size: usize,
    ) -> SubscriptionHandle {
        self.bus.subscribe_channel(pattern, buffer_size)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Push a notification with no backing record.
    pub fn publish_notification(&self, topic: &str, notification: &Notification) -> usize {
        self.bus.publish(topic, notification)
    }

    // --- Store Operations ---

    /// Queue health, computed under one read lock.
    pub fn metrics(&self) -> Metrics {
        let table = self.table.read();
        Metrics::collect(&table, Timestamp::now(), self.config.metrics_window)
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let table = self.table.read();
        StoreStats {
            record_count: table.len() as u64,
            task_count: table.class_count(RecordClass::Task) as u64,
            message_count: table.class_count(RecordClass::Message) as u64,
            event_count: table.class_count(RecordClass::Event) as u64,
            aggregate_count: table.aggregate_count() as u64,
            snapshot_count: self.snapshots.count(),
            projection_entry_count: self.projections.entry_count() as u64,
            subscription_count: self.bus.subscription_count() as u64,
            log_size_bytes: self.log.size(),
            head: table.head(),
        }
    }

    /// Highest sequence assigned so far.
    pub fn head(&self) -> Sequence {
        self.table.read().head()
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        self.snapshots.sync()?;
        self.projections.sync()?;
        Ok(())
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Crate Helpers ---

    /// Journal `entry`, then apply it. Callers hold the table's write lock.
    pub(crate) fn commit(&self, table: &mut RecordTable, entry: LogEntry) -> Result<()> {
        self.log.append(&entry)?;
        table.apply(entry)
    }

    /// Replace the record journal with `entries`.
    pub(crate) fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
        self.log.rewrite(entries)
    }

    /// Notify subscribers of a new record.
    pub(crate) fn announce(&self, record: &Record) {
        self.bus.publish_with(&record.topic, || {
            Notification::appended(record, self.bus.payload_threshold())
        });
    }

    /// Notify subscribers of a finished attempt.
    pub(crate) fn announce_outcome(&self, record: &Record) {
        match record.status {
            RecordStatus::Completed => {
                self.bus
                    .publish_with(&record.topic, || Notification::completed(record));
            }
            RecordStatus::Failed | RecordStatus::Pending => {
                self.bus
                    .publish_with(&record.topic, || Notification::failed(record));
            }
            RecordStatus::Leased => {}
        }
    }

    // --- Private Helpers ---

    fn materialize(
        &self,
        input: RecordInput,
        sequence: Sequence,
        aggregate_version: Option<u64>,
        now: Timestamp,
    ) -> Record {
        let defaults = &self.config.defaults;

        let ttl_seconds = match (input.class, input.ttl) {
            (RecordClass::Event, _) | (_, Ttl::Never) => None,
            (_, Ttl::Default) => defaults.ttl_seconds,
            (_, Ttl::Seconds(seconds)) => Some(seconds),
        };

        let (status, completed_at, max_attempts, aggregate_type) = match input.class {
            RecordClass::Task => (
                RecordStatus::Pending,
                None,
                input.max_attempts.unwrap_or(defaults.max_attempts),
                None,
            ),
            RecordClass::Message => (
                RecordStatus::Pending,
                None,
                input.max_attempts.unwrap_or(defaults.message_max_attempts),
                None,
            ),
            RecordClass::Event => (RecordStatus::Completed, Some(now), 1, Some(input.topic.clone())),
        };

        Record {
            id: RecordId::new(),
            sequence,
            class: input.class,
            topic: input.topic,
            kind: input.kind,
            payload: input.payload,
            metadata: input.metadata,
            priority: input.priority,
            status,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            lease_owner: None,
            lease_expires_at: None,
            ttl_seconds,
            aggregate_id: input.aggregate_id,
            aggregate_type,
            aggregate_version,
            created_at: now,
            updated_at: now,
            completed_at,
            result: None,
            error: None,
            history: Vec::new(),
        }
    }

    /// Run registered projections. The record is already durable, so a
    /// failure here is only logged. `catch_up_projection` retries it for keys
    /// no later record has updated.
    fn project(&self, record: &Record) {
        if let Err(e) = self.projections.apply(record) {
            error!(sequence = record.sequence.0, error = %e, "Projection update failed");
        }
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
