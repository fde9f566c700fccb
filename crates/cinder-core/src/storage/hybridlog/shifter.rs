//! Region shifting
//!
//! A shift retires the full mutable region: it is sealed, in-flight writers
//! drain out through the epoch, and its write-through file becomes the
//! newest warm segment while a fresh mutable region takes over. Writers only
//! wait for that swap. When the warm tier then outgrows `readonly_size` its
//! oldest segments are copied to cold segment files and a second layout is
//! installed. Every change is a single layout swap, so readers resolve each
//! address against either the old or the new layout, never a mix.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::address::{LogAddress, RegionBoundaries};
use super::disk::DiskSegment;
use super::log::HybridLog;
use super::mutable::MutableRegion;
use super::readonly::WarmSegment;
use super::record::RecordKind;
use crate::error::{CinderError, Result};
use crate::persistence::CheckpointId;

/// What a shift left behind
pub(super) struct ShiftOutcome {
    /// Boundaries after the shift; `hot_start` is the log tail
    pub(super) boundaries: RegionBoundaries,
    /// Index image at the tail, when requested
    pub(super) entries: Vec<(Bytes, LogAddress)>,
}

impl HybridLog {
    /// Move the mutable region to the warm tier now
    ///
    /// An empty mutable region is left in place.
    pub fn shift(&self) -> Result<()> {
        self.check_open()?;
        let _token = self.maintenance.lock();
        self.shift_locked(false).map(|_| ())
    }

    /// Shift unless another thread already replaced layout `version`
    pub(super) fn shift_if_current(&self, version: u64) -> Result<()> {
        let _token = self.maintenance.lock();
        let current = {
            let guard = self.epoch.pin();
            self.layout.load(&guard).version
        };
        if current != version {
            return Ok(());
        }
        self.shift_locked(false).map(|_| ())
    }

    /// Write a checkpoint of the current log position and index
    pub fn checkpoint(&self) -> Result<CheckpointId> {
        self.check_open()?;
        let _token = self.maintenance.lock();
        self.checkpoint_locked()
    }

    /// Checkpoint with the maintenance lock held
    pub(super) fn checkpoint_locked(&self) -> Result<CheckpointId> {
        let outcome = self.shift_locked(true)?;

        let (warm, cold) = {
            let guard = self.epoch.pin();
            let layout = self.layout.load(&guard);
            (layout.warm.clone(), layout.cold.clone())
        };
        for segment in &warm {
            segment.sync()?;
        }
        for segment in &cold {
            segment.sync()?;
        }
        let segments: Vec<LogAddress> = cold
            .iter()
            .map(|s| s.base())
            .chain(warm.iter().map(|s| s.base()))
            .collect();

        let result = self.checkpoints.create_checkpoint(
            outcome.boundaries,
            &segments,
            &outcome.entries,
        )?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(
            id = result.metadata.id,
            duration_ms = result.duration.as_millis() as u64,
            "Checkpoint written"
        );
        Ok(result.metadata.id)
    }

    /// Wait until every guard pinned before the call has been dropped
    ///
    /// The caller must not hold a guard.
    pub(super) fn quiesce(&self) {
        while !self.epoch.bump_and_wait(self.epoch.stall_timeout()) {}
    }

    /// Shift with the maintenance lock held
    ///
    /// A failure leaves the current mutable region sealed and writers see
    /// errors until a later shift succeeds.
    pub(super) fn shift_locked(&self, capture: bool) -> Result<ShiftOutcome> {
        match self.try_shift(capture) {
            Ok(outcome) => {
                self.backpressure.store(false, Ordering::Release);
                Ok(outcome)
            }
            Err(e) => {
                {
                    let guard = self.epoch.pin();
                    self.layout.load(&guard).hot.seal();
                }
                self.backpressure.store(true, Ordering::Release);
                self.counters.shift_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Shift failed, mutable region stays sealed");
                Err(match e {
                    CinderError::ResourceExhausted(_) | CinderError::Fatal(_) => e,
                    other => CinderError::Fatal(format!("shift failed: {other}")),
                })
            }
        }
    }

    fn try_shift(&self, capture: bool) -> Result<ShiftOutcome> {
        let start = Instant::now();
        let hot = {
            let guard = self.epoch.pin();
            Arc::clone(&self.layout.load(&guard).hot)
        };

        hot.seal();
        self.quiesce();

        let entries = if capture {
            let guard = self.epoch.pin();
            self.index.entries(&guard)
        } else {
            Vec::new()
        };

        // Writers resume before the flush, on a fresh region or this one
        let used = hot.used() as u64;
        if used > 0 {
            let converted = self.convert_hot(&hot)?;
            self.clear_delete_markers(&converted);
        } else {
            hot.unseal();
        }
        let flushed = self.flush_warm()?;

        if used == 0 && flushed == 0 {
            let guard = self.epoch.pin();
            let boundaries = self.layout.load(&guard).boundaries();
            return Ok(ShiftOutcome { boundaries, entries });
        }

        let boundaries = {
            let guard = self.epoch.pin();
            self.layout.load(&guard).boundaries()
        };

        let load_factor = self.index.load_factor();
        if load_factor > self.config.max_load_factor {
            warn!(
                load_factor,
                max_load_factor = self.config.max_load_factor,
                buckets = self.index.bucket_count(),
                "Hash index is overloaded; it grows on the next open"
            );
        }

        self.counters.shifts.fetch_add(1, Ordering::Relaxed);
        info!(
            bytes = used,
            flushed_segments = flushed,
            tail = %boundaries.hot_start,
            duration_ms = start.elapsed().as_millis() as u64,
            "Shifted mutable region to warm tier"
        );

        Ok(ShiftOutcome { boundaries, entries })
    }

    /// Turn the sealed, quiesced `hot` region into the newest warm segment
    /// and install a fresh mutable region behind it
    fn convert_hot(&self, hot: &MutableRegion) -> Result<Arc<WarmSegment>> {
        let used = hot.used() as u64;
        let warm_path = hot.finish(self.config.sync_on_flush)?.ok_or_else(|| {
            CinderError::Internal(format!("mutable region {} vanished during shift", hot.base()))
        })?;
        let converted = Arc::new(WarmSegment::open(&warm_path, hot.base())?);
        let next_hot = MutableRegion::create(
            &self.config.data_dir,
            hot.tail_address(),
            self.config.mutable_size,
            self.config.sync_policy,
            self.config.retry.clone(),
        )?;

        {
            let guard = self.epoch.pin();
            let mut next = self.layout.load(&guard).successor();
            next.hot = Arc::new(next_hot);
            next.warm.push(Arc::clone(&converted));
            self.layout.swap(next, &guard);
        }
        self.telemetry.hot.record_outflow(used);
        self.telemetry.warm.record_inflow(used);
        Ok(converted)
    }

    /// Copy the oldest warm segments to the cold tier until the warm tier
    /// fits `readonly_size`, returning how many moved
    ///
    /// The newest warm segment always stays.
    fn flush_warm(&self) -> Result<usize> {
        let (warm, cold_bytes) = {
            let guard = self.epoch.pin();
            let layout = self.layout.load(&guard);
            (layout.warm.clone(), layout.cold_bytes())
        };

        let readonly_size = self.config.readonly_size as u64;
        let mut warm_bytes: u64 = warm.iter().map(|s| s.len() as u64).sum();
        let mut flush = 0;
        while flush + 1 < warm.len() && warm_bytes > readonly_size {
            warm_bytes -= warm[flush].len() as u64;
            flush += 1;
        }
        if flush == 0 {
            return Ok(0);
        }

        if self.config.disk_size != 0 {
            let incoming: u64 = warm[..flush].iter().map(|s| s.len() as u64).sum();
            if cold_bytes + incoming > self.config.disk_size as u64 {
                return Err(CinderError::ResourceExhausted(format!(
                    "cold tier would grow to {} bytes, limit is {}",
                    cold_bytes + incoming,
                    self.config.disk_size
                )));
            }
        }

        let mut flushed = Vec::with_capacity(flush);
        for segment in &warm[..flush] {
            let disk = DiskSegment::create_from(
                &self.config.data_dir,
                segment.base(),
                segment.bytes(),
                self.config.sync_on_flush,
                self.config.retry.clone(),
            )?;
            flushed.push(Arc::new(disk));
        }

        {
            let guard = self.epoch.pin();
            let mut next = self.layout.load(&guard).successor();
            next.warm.drain(..flush);
            next.cold.extend(flushed.iter().cloned());
            self.layout.swap(next, &guard);
        }
        for segment in &warm[..flush] {
            segment.retire();
            self.telemetry.warm.record_outflow(segment.len() as u64);
        }
        for segment in &flushed {
            self.telemetry.cold.record_inflow(segment.len());
        }
        self.counters
            .segments_flushed
            .fetch_add(flush as u64, Ordering::Relaxed);
        Ok(flush)
    }

    /// Drop the markers of deletes that now live in `segment`
    fn clear_delete_markers(&self, segment: &WarmSegment) {
        let guard = self.epoch.pin();
        for item in segment.records() {
            match item {
                Ok((offset, record)) if record.kind == RecordKind::Delete => {
                    let at = segment.base().advance(offset as u64);
                    self.index.clear_marker(record.key, at, &guard);
                }
                Ok(_) => {}
                Err((offset, e)) => {
                    warn!(
                        segment = %segment.base(),
                        offset,
                        error = %e,
                        "Unreadable record while clearing delete markers"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hybridlog::log::test_config;
    use tempfile::tempdir;

    fn fill(log: &HybridLog, prefix: &str, n: usize) {
        for i in 0..n {
            log.set(
                Bytes::from(format!("{prefix}{i:04}")),
                Bytes::from(format!("value-{prefix}-{i}")),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_shift_moves_hot_to_warm() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();

        fill(&log, "k", 10);
        let tail = log.stats().tail;
        log.shift().unwrap();

        let stats = log.stats();
        assert_eq!(stats.warm_segments, 1);
        assert_eq!(stats.hot_bytes, 0);
        assert_eq!(stats.boundaries.hot_start, tail);
        assert_eq!(stats.shifts, 1);
        assert_eq!(stats.layout_version, 1);
        assert_eq!(stats.tiers[1].segments_in, 1);

        for i in 0..10 {
            assert_eq!(
                log.get(format!("k{i:04}").as_bytes()).unwrap(),
                Some(Bytes::from(format!("value-k-{i}")))
            );
        }
    }

    #[test]
    fn test_shift_of_empty_region_is_noop() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();

        log.shift().unwrap();
        let stats = log.stats();
        assert_eq!(stats.shifts, 0);
        assert_eq!(stats.layout_version, 0);

        log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        assert_eq!(log.get(b"a").unwrap(), Some(Bytes::from("1")));
    }

    #[test]
    fn test_full_region_shifts_on_write() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();

        // Far more than one 4 KiB mutable region
        fill(&log, "key", 500);

        let stats = log.stats();
        assert!(stats.shifts > 1);
        assert!(stats.cold_segments > 0);
        assert!(stats.warm_bytes <= 8192);
        for i in (0..500).step_by(37) {
            assert_eq!(
                log.get(format!("key{i:04}").as_bytes()).unwrap(),
                Some(Bytes::from(format!("value-key-{i}")))
            );
        }
    }

    #[test]
    fn test_shift_clears_delete_markers() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();

        log.set(Bytes::from("gone"), Bytes::from("soon")).unwrap();
        log.delete(b"gone").unwrap();
        assert_eq!(log.stats().delete_markers, 1);

        log.shift().unwrap();
        let stats = log.stats();
        assert_eq!(stats.delete_markers, 0);
        assert_eq!(stats.key_count, 0);
        assert_eq!(log.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_disk_limit_applies_backpressure() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.readonly_size = 0;
        config.disk_size = 4096;
        let log = HybridLog::open(config).unwrap();

        let mut exhausted = None;
        for i in 0..2000 {
            if let Err(e) = log.set(
                Bytes::from(format!("key{i:05}")),
                Bytes::from("some value bytes"),
            ) {
                exhausted = Some(e);
                break;
            }
        }

        assert!(matches!(exhausted, Some(CinderError::ResourceExhausted(_))));
        let stats = log.stats();
        assert!(stats.backpressure);
        assert!(stats.shift_failures > 0);
        assert!(stats.cold_bytes <= 4096);
        assert_eq!(log.get(b"key00000").unwrap(), Some(Bytes::from("some value bytes")));
    }

    #[test]
    fn test_flush_is_a_separate_layout_change() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.readonly_size = 0;
        let log = HybridLog::open(config).unwrap();

        fill(&log, "a", 10);
        log.shift().unwrap();
        assert_eq!(log.stats().layout_version, 1);

        fill(&log, "b", 10);
        log.shift().unwrap();
        let stats = log.stats();
        assert_eq!(stats.layout_version, 3);
        assert_eq!(stats.warm_segments, 1);
        assert_eq!(stats.cold_segments, 1);
        assert_eq!(stats.segments_flushed, 1);
    }

    #[test]
    fn test_failed_flush_keeps_converted_region() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.readonly_size = 0;
        config.disk_size = 4096;
        let log = HybridLog::open(config).unwrap();

        // About 3 KiB per region: the second flush crosses the limit
        fill(&log, "a", 100);
        log.shift().unwrap();
        fill(&log, "b", 100);
        log.shift().unwrap();
        fill(&log, "c", 100);
        let tail = log.stats().tail;

        assert!(matches!(
            log.shift(),
            Err(CinderError::ResourceExhausted(_))
        ));
        let stats = log.stats();
        assert!(stats.backpressure);
        assert_eq!(stats.boundaries.hot_start, tail);
        assert_eq!(stats.warm_segments, 2);
        assert_eq!(stats.cold_segments, 1);
        assert_eq!(stats.hot_bytes, 0);
        assert_eq!(
            log.get(b"c0099").unwrap(),
            Some(Bytes::from("value-c-99"))
        );
        assert!(matches!(
            log.set(Bytes::from("d"), Bytes::from("1")),
            Err(CinderError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_checkpoint_records_tail() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();

        fill(&log, "c", 5);
        let tail = log.stats().tail;
        let id = log.checkpoint().unwrap();

        let metadata = log.checkpoints().latest_checkpoint().unwrap().unwrap();
        assert_eq!(metadata.id, id);
        assert_eq!(metadata.tail(), tail);
        assert_eq!(metadata.key_count, 5);
        assert_eq!(log.stats().checkpoints, 1);
        assert_eq!(log.stats().last_checkpoint, Some(id));
    }
}
