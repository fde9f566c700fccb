//! HybridLog - unified three-tier storage engine
//!
//! This module ties the hash index, the mutable region and the warm and cold
//! segments into one key-value engine:
//! - Writes update a hot record in place when the new encoding fits its
//!   slot, and append to the mutable region otherwise
//! - Reads resolve the key's address against the published region layout
//!   and decode the record from whichever tier holds it
//! - A full mutable region triggers a shift (see `shifter.rs`), compaction
//!   reclaims cold segments (see `compaction.rs`) and checkpoints bound
//!   recovery time (see `recovery.rs`)

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::address::{LogAddress, RegionBoundaries};
use super::compaction::{CompactionConfig, CompactionSnapshot, CompactionState};
use super::index::{HashIndex, Publish};
use super::layout::{RegionLayout, Resolved, Tier};
use super::mutable::MIN_CAPACITY;
use super::record::{encode_record, encoded_len, Record, RecordKind, MAX_KEY_LEN, MAX_VALUE_LEN};
use super::recovery::RecoveryInfo;
use super::telemetry::{HybridLogTelemetry, LatencyTimer, TierSnapshot};
use crate::config::SyncPolicy;
use crate::error::{CinderError, Result};
use crate::hooks::{ObserverRegistry, WriteEvent, WriteObserver};
use crate::io::{complete, ReadBatch, RetryPolicy};
use crate::persistence::{CheckpointConfig, CheckpointId, CheckpointManager};
use crate::storage::epoch::{EpochConfig, EpochManager, EpochPtr, EpochStats, Guard};

/// Configuration for HybridLog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridLogConfig {
    /// Directory holding segment files and checkpoints
    pub data_dir: PathBuf,
    /// Size of the mutable region in bytes
    pub mutable_size: usize,
    /// Bytes of warm segments kept before the oldest is flushed to disk
    pub readonly_size: usize,
    /// Upper bound for cold segment bytes (0 = unlimited)
    pub disk_size: usize,
    /// Hash index bucket count; must be a power of two
    pub index_buckets: usize,
    /// Keys per bucket above which a shift logs a warning
    pub max_load_factor: f64,
    /// Durability of the hot segment's write-through file
    pub sync_policy: SyncPolicy,
    /// fsync warm and cold segment files when they are created
    pub sync_on_flush: bool,
    /// Epoch manager configuration
    pub epoch: EpochConfig,
    /// Retry policy for segment I/O
    pub retry: RetryPolicy,
    /// Compaction configuration
    pub compaction: CompactionConfig,
    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,
}

impl Default for HybridLogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            mutable_size: 64 * 1024 * 1024,   // 64MB
            readonly_size: 256 * 1024 * 1024, // 256MB
            disk_size: 0,                     // Unlimited
            index_buckets: 1 << 16,
            max_load_factor: 4.0,
            sync_policy: SyncPolicy::EverySecond,
            sync_on_flush: true,
            epoch: EpochConfig::default(),
            retry: RetryPolicy::default(),
            compaction: CompactionConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl HybridLogConfig {
    /// A default configuration rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.mutable_size < MIN_CAPACITY {
            return Err(CinderError::Config(format!(
                "storage.mutable_size must be at least {MIN_CAPACITY} bytes, got {}",
                self.mutable_size
            )));
        }
        if self.index_buckets == 0 || !self.index_buckets.is_power_of_two() {
            return Err(CinderError::Config(format!(
                "storage.index_buckets must be a power of two, got {}",
                self.index_buckets
            )));
        }
        if self.max_load_factor.is_nan() || self.max_load_factor <= 0.0 {
            return Err(CinderError::Config(
                "storage.max_load_factor must be positive".to_string(),
            ));
        }
        if self.disk_size != 0 && self.disk_size < self.mutable_size {
            return Err(CinderError::Config(format!(
                "storage.disk_size ({}) must be 0 or at least mutable_size ({})",
                self.disk_size, self.mutable_size
            )));
        }
        if self.epoch.max_threads == 0 {
            return Err(CinderError::Config(
                "storage.epoch.max_threads must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CinderError::Config(
                "storage.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.max_checkpoints == 0 {
            return Err(CinderError::Config(
                "storage.checkpoint.max_checkpoints must be at least 1".to_string(),
            ));
        }
        self.compaction.validate()
    }
}

/// Operation and maintenance counters
#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) get_ops: AtomicU64,
    pub(super) set_ops: AtomicU64,
    pub(super) del_ops: AtomicU64,
    pub(super) shifts: AtomicU64,
    pub(super) shift_failures: AtomicU64,
    pub(super) segments_flushed: AtomicU64,
    pub(super) checkpoints: AtomicU64,
}

/// Statistics for HybridLog
#[derive(Debug, Clone)]
pub struct HybridLogStats {
    /// Live keys
    pub key_count: u64,
    /// Delete markers not yet cleared by a shift
    pub delete_markers: u64,
    /// Hash index bucket count
    pub index_buckets: usize,
    /// Live keys per bucket
    pub index_load_factor: f64,
    /// Current region boundaries
    pub boundaries: RegionBoundaries,
    /// Address the next append receives
    pub tail: LogAddress,
    /// Version of the published region layout
    pub layout_version: u64,
    /// Bytes used in the mutable region
    pub hot_bytes: u64,
    /// Capacity of the mutable region
    pub hot_capacity: u64,
    /// Records appended to the current mutable region
    pub hot_records: u64,
    /// In-place overwrites in the current mutable region
    pub in_place_updates: u64,
    /// Bytes in warm segments
    pub warm_bytes: u64,
    /// Number of warm segments
    pub warm_segments: usize,
    /// Bytes in cold segments
    pub cold_bytes: u64,
    /// Number of cold segments
    pub cold_segments: usize,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Completed shifts
    pub shifts: u64,
    /// Shifts that failed and left the mutable region sealed
    pub shift_failures: u64,
    /// Warm segments flushed to the cold tier
    pub segments_flushed: u64,
    /// Compaction counters
    pub compaction: CompactionSnapshot,
    /// Checkpoints written by this instance
    pub checkpoints: u64,
    /// Id of the newest checkpoint on disk
    pub last_checkpoint: Option<CheckpointId>,
    /// Writes are refused until a shift succeeds
    pub backpressure: bool,
    /// Whether background tasks are running
    pub background_tasks_active: bool,
    /// Epoch manager state
    pub epoch: EpochStats,
    /// Per-tier counters, ordered hot, warm, cold
    pub tiers: [TierSnapshot; 3],
}

/// The HybridLog - three-tier storage engine
pub struct HybridLog {
    pub(super) config: HybridLogConfig,
    pub(super) epoch: Arc<EpochManager>,
    pub(super) index: HashIndex,
    pub(super) layout: EpochPtr<RegionLayout>,
    /// Serializes shifts, layout changes and checkpoints
    pub(super) maintenance: Mutex<()>,
    /// Set while a failed shift keeps the mutable region sealed
    pub(super) backpressure: AtomicBool,
    pub(super) closed: AtomicBool,
    pub(super) checkpoints: CheckpointManager,
    pub(super) compaction: CompactionState,
    pub(super) observers: ObserverRegistry,
    pub(super) telemetry: HybridLogTelemetry,
    pub(super) counters: Counters,
    pub(super) background_tasks: AtomicUsize,
    pub(super) recovery: RecoveryInfo,
}

impl HybridLog {
    /// Get the value stored for `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.counters.get_ops.fetch_add(1, Ordering::Relaxed);

        let backoff = Backoff::new();
        loop {
            let guard = self.epoch.pin();
            // Layout first: an index entry is never newer than the layout
            // that can resolve it
            let layout = self.layout.load(&guard);
            let Some(address) = self.index.lookup(key, &guard) else {
                return Ok(None);
            };

            let result = match layout.resolve(address) {
                Resolved::Hot(hot) => self.timed(Tier::Hot, || hot.read(address)),
                Resolved::Warm(warm) => self.timed(Tier::Warm, || warm.read(address)),
                Resolved::Cold(cold) => self.timed(Tier::Cold, || cold.read(address)),
                Resolved::Relocating => {
                    drop(guard);
                    backoff.snooze();
                    continue;
                }
                Resolved::Invalid => {
                    self.check_moved(key, address, layout, &guard)?;
                    continue;
                }
            };
            return value_of(key, address, result?);
        }
    }

    /// Get the value stored for `key`, reading the cold tier off the runtime
    ///
    /// Dropping the future does not cancel a cold read already in flight.
    pub async fn get_async(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.counters.get_ops.fetch_add(1, Ordering::Relaxed);

        loop {
            // The guard cannot live across the await; the segment handle
            // keeps a cold file readable on its own.
            let target = {
                let guard = self.epoch.pin();
                let layout = self.layout.load(&guard);
                let Some(address) = self.index.lookup(key, &guard) else {
                    return Ok(None);
                };
                match layout.resolve(address) {
                    Resolved::Hot(hot) => {
                        let record = self.timed(Tier::Hot, || hot.read(address))?;
                        return value_of(key, address, record);
                    }
                    Resolved::Warm(warm) => {
                        let record = self.timed(Tier::Warm, || warm.read(address))?;
                        return value_of(key, address, record);
                    }
                    Resolved::Cold(cold) => Some((address, Arc::clone(cold))),
                    Resolved::Relocating => None,
                    Resolved::Invalid => {
                        self.check_moved(key, address, layout, &guard)?;
                        continue;
                    }
                }
            };
            let Some((address, segment)) = target else {
                tokio::task::yield_now().await;
                continue;
            };

            let timer = LatencyTimer::start();
            let result = segment.read_async(address).await;
            timer.finish(&self.telemetry.cold, &result);
            return value_of(key, address, result?);
        }
    }

    /// Get several keys, executing all of their cold reads as one batch
    ///
    /// Results are returned in the order of `keys`.
    pub async fn get_many_async(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        enum Pending {
            Ready(Option<Bytes>),
            Cold(LogAddress, tokio::sync::oneshot::Receiver<Result<Record>>),
            Retry,
        }

        self.counters
            .get_ops
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        let mut batch = ReadBatch::with_capacity(keys.len());
        let mut pending = Vec::with_capacity(keys.len());
        {
            let guard = self.epoch.pin();
            let layout = self.layout.load(&guard);
            for key in keys {
                let item = match self.index.lookup(key, &guard) {
                    None => Pending::Ready(None),
                    Some(address) => match layout.resolve(address) {
                        Resolved::Hot(hot) => Pending::Ready(value_of(
                            key,
                            address,
                            self.timed(Tier::Hot, || hot.read(address))?,
                        )?),
                        Resolved::Warm(warm) => Pending::Ready(value_of(
                            key,
                            address,
                            self.timed(Tier::Warm, || warm.read(address))?,
                        )?),
                        Resolved::Cold(cold) => Pending::Cold(
                            address,
                            batch.add(Arc::clone(cold), address.offset_from(cold.base())),
                        ),
                        // Being repointed; look it up again
                        Resolved::Relocating | Resolved::Invalid => Pending::Retry,
                    },
                };
                pending.push(item);
            }
        }

        if !batch.is_empty() {
            debug!(reads = batch.len(), "Submitting batched cold reads");
            batch.submit();
        }

        let mut values = Vec::with_capacity(keys.len());
        for (key, item) in keys.iter().zip(pending) {
            let value = match item {
                Pending::Ready(value) => value,
                Pending::Cold(address, rx) => {
                    let timer = LatencyTimer::start();
                    let result = complete(rx).await;
                    timer.finish(&self.telemetry.cold, &result);
                    value_of(key, address, result?)?
                }
                Pending::Retry => self.get_async(key).await?,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Store `value` under `key`
    pub fn set(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.counters.set_ops.fetch_add(1, Ordering::Relaxed);
        self.check_open()?;
        self.check_size(key.len(), value.len())?;

        let event = WriteEvent::set(&key, &value);
        self.observers.before_write(&event);

        let record = encode_record(RecordKind::Set, &key, &value);
        let address = self.write(&key, &record, true, |address, guard| {
            if let Publish::Superseded(newer) = self.index.publish(key.clone(), address, guard) {
                debug!(address = %address, newer = %newer, "Write superseded before publication");
            }
        })?;

        self.observers.after_write(&event, address);
        Ok(())
    }

    /// Delete `key`, returning whether it was present
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.counters.del_ops.fetch_add(1, Ordering::Relaxed);
        self.check_open()?;
        if !self.exists(key) {
            return Ok(false);
        }
        self.check_size(key.len(), 0)?;

        let event = WriteEvent::delete(key);
        self.observers.before_write(&event);

        let record = encode_record(RecordKind::Delete, key, &[]);
        let key = Bytes::copy_from_slice(key);
        let mut removed = None;
        let address = self.write(&key, &record, false, |address, guard| {
            removed = self.index.mark_deleted(&key, address, guard);
        })?;

        if removed.is_some() {
            self.observers.after_write(&event, address);
        }
        Ok(removed.is_some())
    }

    /// Whether `key` currently has a value
    pub fn exists(&self, key: &[u8]) -> bool {
        let guard = self.epoch.pin();
        self.index.lookup(key, &guard).is_some()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no key is live
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Attach an observer notified of every set and delete
    pub fn register_observer(&self, observer: Arc<dyn WriteObserver>) {
        self.observers.register(observer);
    }

    /// The engine configuration
    pub fn config(&self) -> &HybridLogConfig {
        &self.config
    }

    /// The epoch manager protecting this engine
    pub fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    /// Checkpoint files of this engine
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// What the last open recovered
    pub fn recovery_info(&self) -> &RecoveryInfo {
        &self.recovery
    }

    /// Current region boundaries
    pub fn boundaries(&self) -> RegionBoundaries {
        let guard = self.epoch.pin();
        self.layout.load(&guard).boundaries()
    }

    /// Flush the hot segment and every warm segment to stable storage
    pub fn sync(&self) -> Result<()> {
        let (hot, warm) = {
            let guard = self.epoch.pin();
            let layout = self.layout.load(&guard);
            (Arc::clone(&layout.hot), layout.warm.clone())
        };
        hot.sync()?;
        for segment in &warm {
            segment.sync()?;
        }
        Ok(())
    }

    /// Flush the hot segment if it has unsynced writes
    pub(super) fn sync_hot(&self) -> Result<()> {
        let hot = {
            let guard = self.epoch.pin();
            Arc::clone(&self.layout.load(&guard).hot)
        };
        hot.sync()
    }

    /// Refuse further writes and flush everything written so far
    ///
    /// The hot segment stays a `.hot` file; the next open converts it.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _token = self.maintenance.lock();
        self.sync()?;
        self.epoch.flush();
        tracing::info!(
            keys = self.index.len(),
            tail = %self.boundaries().hot_start,
            "HybridLog closed"
        );
        Ok(())
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether background tasks are running
    pub fn are_background_tasks_active(&self) -> bool {
        self.background_tasks.load(Ordering::Acquire) > 0
    }

    /// Get statistics
    pub fn stats(&self) -> HybridLogStats {
        let guard = self.epoch.pin();
        let layout = self.layout.load(&guard);

        HybridLogStats {
            key_count: self.index.len() as u64,
            delete_markers: self.index.markers() as u64,
            index_buckets: self.index.bucket_count(),
            index_load_factor: self.index.load_factor(),
            boundaries: layout.boundaries(),
            tail: layout.tail(),
            layout_version: layout.version,
            hot_bytes: layout.hot.used() as u64,
            hot_capacity: layout.hot.capacity() as u64,
            hot_records: layout.hot.entry_count(),
            in_place_updates: layout.hot.in_place_updates(),
            warm_bytes: layout.warm_bytes(),
            warm_segments: layout.warm.len(),
            cold_bytes: layout.cold_bytes(),
            cold_segments: layout.cold.len(),
            get_ops: self.counters.get_ops.load(Ordering::Relaxed),
            set_ops: self.counters.set_ops.load(Ordering::Relaxed),
            del_ops: self.counters.del_ops.load(Ordering::Relaxed),
            shifts: self.counters.shifts.load(Ordering::Relaxed),
            shift_failures: self.counters.shift_failures.load(Ordering::Relaxed),
            segments_flushed: self.counters.segments_flushed.load(Ordering::Relaxed),
            compaction: self.compaction.metrics.snapshot(),
            checkpoints: self.counters.checkpoints.load(Ordering::Relaxed),
            last_checkpoint: self.checkpoints.last_checkpoint().map(|m| m.id),
            backpressure: self.backpressure.load(Ordering::Acquire),
            background_tasks_active: self.are_background_tasks_active(),
            epoch: self.epoch.stats(),
            tiers: self.telemetry.snapshot_all(),
        }
    }

    /// Log `record` for `key` and publish it
    ///
    /// With `in_place` set, a hot record the index still points at is
    /// overwritten when the new encoding fits. Otherwise the record is
    /// appended and `publish` runs while the append's guard is still pinned,
    /// so a shift cannot convert the region before the index sees it.
    fn write<F>(&self, key: &Bytes, record: &[u8], in_place: bool, mut publish: F) -> Result<LogAddress>
    where
        F: FnMut(LogAddress, &Guard<'_>),
    {
        loop {
            let version = {
                let guard = self.epoch.pin();
                let layout = self.layout.load(&guard);
                let hot = &layout.hot;

                if in_place {
                    if let Some(current) = self.index.lookup(key, &guard) {
                        if hot.contains(current)
                            && hot.try_update_in_place(current, record, || {
                                self.index.lookup(key, &guard) == Some(current)
                            })?
                        {
                            return Ok(current);
                        }
                    }
                }

                match hot.append(record)? {
                    Some(address) => {
                        publish(address, &guard);
                        return Ok(address);
                    }
                    None => layout.version,
                }
            };

            // Full or sealed: shift (or wait for the shift in progress) and retry
            self.shift_if_current(version)?;
        }
    }

    /// Decide what an address that resolved to no segment means
    ///
    /// Returns `Ok` when the key moved concurrently and the read should be
    /// retried.
    fn check_moved(
        &self,
        key: &[u8],
        address: LogAddress,
        seen: &RegionLayout,
        guard: &Guard<'_>,
    ) -> Result<()> {
        let moved = self.index.lookup(key, guard) != Some(address)
            || self.layout.load(guard).version != seen.version;
        if moved {
            Ok(())
        } else {
            Err(CinderError::Internal(format!(
                "index points at {address}, outside the log {:?}",
                seen.boundaries()
            )))
        }
    }

    fn timed<T>(&self, tier: Tier, read: impl FnOnce() -> Result<T>) -> Result<T> {
        let timer = LatencyTimer::start();
        let result = read();
        timer.finish(self.telemetry.tier(tier), &result);
        result
    }

    pub(super) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CinderError::Fatal("engine is closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_size(&self, key_len: usize, value_len: usize) -> Result<()> {
        if key_len > MAX_KEY_LEN {
            return Err(CinderError::InvalidArgument(format!(
                "key of {key_len} bytes exceeds {MAX_KEY_LEN}"
            )));
        }
        if value_len > MAX_VALUE_LEN {
            return Err(CinderError::InvalidArgument(format!(
                "value of {value_len} bytes exceeds {MAX_VALUE_LEN}"
            )));
        }
        let size = encoded_len(key_len, value_len);
        let capacity = {
            let guard = self.epoch.pin();
            self.layout.load(&guard).hot.capacity()
        };
        if size > capacity {
            return Err(CinderError::InvalidArgument(format!(
                "record of {size} bytes does not fit the {capacity} byte mutable region"
            )));
        }
        Ok(())
    }
}

/// Interpret the record an index entry points at
fn value_of(key: &[u8], address: LogAddress, record: Record) -> Result<Option<Bytes>> {
    if record.key.as_ref() != key {
        return Err(CinderError::corruption(
            address.as_u64(),
            "record key does not match the index",
        ));
    }
    match record.kind {
        RecordKind::Set => Ok(Some(record.value)),
        RecordKind::Delete => Ok(None),
        RecordKind::Tombstone => Err(CinderError::corruption(
            address.as_u64(),
            "index points at a voided record",
        )),
    }
}

impl Drop for HybridLog {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.sync_hot() {
                tracing::warn!(error = %e, "Failed to sync hot segment on drop");
            }
        }
    }
}

impl std::fmt::Debug for HybridLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridLog")
            .field("data_dir", &self.config.data_dir)
            .field("keys", &self.index.len())
            .field("boundaries", &self.boundaries())
            .finish()
    }
}

/// Small, unsynced configuration for unit tests
#[cfg(test)]
pub(super) fn test_config(dir: &tempfile::TempDir) -> HybridLogConfig {
    HybridLogConfig {
        data_dir: dir.path().to_path_buf(),
        mutable_size: 4096,
        readonly_size: 8192,
        index_buckets: 64,
        sync_policy: SyncPolicy::No,
        sync_on_flush: false,
        retry: RetryPolicy::no_retry(),
        ..HybridLogConfig::default()
    }
}
