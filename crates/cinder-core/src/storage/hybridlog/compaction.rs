//! Log compaction for HybridLog
//!
//! Compaction rewrites one cold segment without its dead records. A Set
//! record is live when the index still points at it; a Delete record is
//! kept unless its segment is the oldest one, since an older Set of the same
//! key could otherwise resurface on a full replay. The kept records are
//! packed, in log order, at the end of the segment's address range and
//! written as a fresh segment file, leaving a hole at the front that no
//! address refers to any more.
//!
//! The whole run holds the maintenance token. Installing the result takes
//! two layout swaps: the first marks the old range as relocating, so
//! readers back off instead of resolving an address that is being
//! repointed; once the guards that could predate it are gone the index is
//! repointed with compare-and-swap, and the second swap puts the compacted
//! segment in place of the old one. The old file is deleted when its last
//! reader lets go.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::address::LogAddress;
use super::disk::DiskSegment;
use super::log::HybridLog;
use super::record::{encode_record, RecordIter, RecordKind};
use crate::error::{CinderError, Result};
use crate::persistence::CheckpointId;

/// Configuration for compaction behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compact a segment once its dead fraction reaches this (0.0-1.0)
    pub dead_space_threshold: f64,
    /// Minimum dead bytes before compaction is worthwhile
    pub min_dead_bytes: u64,
    /// Records examined or relocated per epoch pin
    pub batch_size: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            dead_space_threshold: 0.3,
            min_dead_bytes: 1024 * 1024, // 1 MB
            batch_size: 10_000,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dead_space_threshold) {
            return Err(CinderError::Config(format!(
                "storage.compaction.dead_space_threshold must be within 0.0-1.0, got {}",
                self.dead_space_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(CinderError::Config(
                "storage.compaction.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Running compaction totals
#[derive(Debug, Default)]
pub struct CompactionMetrics {
    /// Segment bytes freed, net of the records kept
    pub bytes_reclaimed: AtomicU64,
    /// Live records repointed into compacted segments
    pub records_moved: AtomicU64,
    /// Dead records left behind
    pub records_dropped: AtomicU64,
    /// Cold segments rewritten or removed
    pub segments_compacted: AtomicU64,
    /// Runs that found no segment worth compacting
    pub runs_skipped: AtomicU64,
    /// Whether a run is in progress
    pub in_progress: AtomicBool,
}

impl CompactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a finished run to the totals
    pub fn record(&self, report: &CompactionReport) {
        self.bytes_reclaimed
            .fetch_add(report.bytes_reclaimed(), Ordering::Relaxed);
        self.records_moved
            .fetch_add(report.records_moved, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(report.records_dropped, Ordering::Relaxed);
        self.segments_compacted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current metrics
    pub fn snapshot(&self) -> CompactionSnapshot {
        CompactionSnapshot {
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            records_moved: self.records_moved.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            segments_compacted: self.segments_compacted.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of compaction metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionSnapshot {
    pub bytes_reclaimed: u64,
    pub records_moved: u64,
    pub records_dropped: u64,
    pub segments_compacted: u64,
    pub runs_skipped: u64,
    pub in_progress: bool,
}

/// Outcome of compacting one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Base address of the rewritten segment
    pub segment: LogAddress,
    /// Base address of its replacement; `None` when nothing was kept
    pub compacted: Option<LogAddress>,
    /// Size of the rewritten segment
    pub segment_bytes: u64,
    /// Bytes of records kept in the replacement
    pub live_bytes: u64,
    /// Live records repointed into the replacement
    pub records_moved: u64,
    /// Records left behind, including copies a newer write superseded
    pub records_dropped: u64,
    /// Wall time of the run
    pub duration: Duration,
}

impl CompactionReport {
    /// Bytes the run gave back
    pub fn bytes_reclaimed(&self) -> u64 {
        self.segment_bytes.saturating_sub(self.live_bytes)
    }
}

/// Whether a segment of `total_bytes` with `live_bytes` live is worth compacting
///
/// Returns `true` when the dead fraction reaches the threshold and the
/// absolute dead bytes reach the minimum.
pub fn should_compact(total_bytes: u64, live_bytes: u64, config: &CompactionConfig) -> bool {
    if total_bytes == 0 {
        return false;
    }
    let dead_bytes = total_bytes.saturating_sub(live_bytes);
    let dead_ratio = dead_bytes as f64 / total_bytes as f64;

    dead_ratio >= config.dead_space_threshold && dead_bytes >= config.min_dead_bytes
}

/// Shared compaction state: one run at a time
#[derive(Debug, Clone)]
pub struct CompactionState {
    pub metrics: Arc<CompactionMetrics>,
    pub config: CompactionConfig,
}

impl CompactionState {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            metrics: Arc::new(CompactionMetrics::new()),
            config,
        }
    }

    /// Mark compaction as in-progress; returns false if already running
    pub fn try_start(&self) -> bool {
        self.metrics
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the run as finished, recording its outcome if it reclaimed a segment
    pub fn finish(&self, report: Option<&CompactionReport>) {
        if let Some(report) = report {
            self.metrics.record(report);
        }
        self.metrics.in_progress.store(false, Ordering::Release);
    }

    /// Whether a segment with these sizes is worth compacting
    pub fn should_trigger(&self, total_bytes: u64, live_bytes: u64) -> bool {
        let result = should_compact(total_bytes, live_bytes, &self.config);
        if result {
            debug!(
                total_bytes,
                live_bytes,
                dead_bytes = total_bytes.saturating_sub(live_bytes),
                "Compaction threshold exceeded"
            );
        }
        result
    }

    /// Count a run that found nothing to do
    pub fn skip(&self) {
        self.metrics.runs_skipped.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for CompactionState {
    fn default() -> Self {
        Self::new(CompactionConfig::default())
    }
}

/// A record that survives compaction
struct Kept {
    kind: RecordKind,
    key: Bytes,
    value: Bytes,
    /// Address in the segment being compacted
    from: LogAddress,
}

/// What a scan of one cold segment found
struct Survey {
    kept: Vec<Kept>,
    live_bytes: u64,
    dropped: u64,
}

impl HybridLog {
    /// Compact the oldest cold segment that holds any dead records
    ///
    /// Returns `None` when no cold segment has dead records or another run
    /// is in progress.
    pub fn compact(&self) -> Result<Option<CompactionReport>> {
        self.run_compaction(true)
    }

    /// Compact the oldest cold segment whose dead space crosses the
    /// configured thresholds
    pub fn compact_if_needed(&self) -> Result<Option<CompactionReport>> {
        self.run_compaction(false)
    }

    /// [`compact`](Self::compact) on the blocking pool
    pub async fn compact_async(self: &Arc<Self>) -> Result<Option<CompactionReport>> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.compact())
            .await
            .map_err(|e| CinderError::Internal(format!("compaction task failed: {e}")))?
    }

    fn run_compaction(&self, force: bool) -> Result<Option<CompactionReport>> {
        self.check_open()?;
        if !self.compaction.try_start() {
            debug!("Compaction already in progress, skipping");
            return Ok(None);
        }

        let result = {
            let _token = self.maintenance.lock();
            self.compact_locked(force)
        };
        self.compaction.finish(result.as_ref().ok().and_then(|r| r.as_ref()));
        match &result {
            Ok(None) => self.compaction.skip(),
            Ok(Some(_)) => {}
            Err(e) => warn!(error = %e, "Compaction failed"),
        }
        result
    }

    /// Pick and rewrite one cold segment, oldest first
    fn compact_locked(&self, force: bool) -> Result<Option<CompactionReport>> {
        let cold = {
            let guard = self.epoch.pin();
            self.layout.load(&guard).cold.clone()
        };

        for (position, segment) in cold.iter().enumerate() {
            let survey = self.survey(segment, position == 0)?;
            let segment_bytes = segment.len();
            if survey.live_bytes == segment_bytes {
                continue;
            }
            if !force && !self.compaction.should_trigger(segment_bytes, survey.live_bytes) {
                continue;
            }
            return self.rewrite(segment, survey).map(Some);
        }

        debug!(segments = cold.len(), "No cold segment worth compacting");
        Ok(None)
    }

    /// Find the records of `segment` that must survive
    fn survey(&self, segment: &DiskSegment, oldest: bool) -> Result<Survey> {
        let base = segment.base();
        let image = segment.load()?;
        let batch = self.compaction.config.batch_size.max(1);

        let mut survey = Survey {
            kept: Vec::new(),
            live_bytes: 0,
            dropped: 0,
        };
        let mut records = RecordIter::new(&image).peekable();
        while records.peek().is_some() {
            let guard = self.epoch.pin();
            for item in records.by_ref().take(batch) {
                let (offset, record) =
                    item.map_err(|(offset, e)| e.at(base.advance(offset as u64).as_u64()))?;
                let address = base.advance(offset as u64);
                let keep = match record.kind {
                    RecordKind::Set => self.index.lookup(record.key, &guard) == Some(address),
                    // Markers were cleared when the delete left the hot tier
                    RecordKind::Delete => !oldest,
                    RecordKind::Tombstone => false,
                };
                if keep {
                    survey.live_bytes += record.size as u64;
                    survey.kept.push(Kept {
                        kind: record.kind,
                        key: Bytes::copy_from_slice(record.key),
                        value: Bytes::copy_from_slice(record.value),
                        from: address,
                    });
                } else {
                    survey.dropped += 1;
                }
            }
        }
        Ok(survey)
    }

    /// Replace `segment` with a segment holding only `survey.kept`
    fn rewrite(&self, segment: &Arc<DiskSegment>, survey: Survey) -> Result<CompactionReport> {
        let start = Instant::now();
        let base = segment.base();
        let end = segment.end();
        let segment_bytes = segment.len();
        let compacted_base = LogAddress::new(end.as_u64() - survey.live_bytes);

        let mut image = Vec::with_capacity(survey.live_bytes as usize);
        let mut moves = Vec::new();
        for kept in &survey.kept {
            let to = compacted_base.advance(image.len() as u64);
            image.extend_from_slice(&encode_record(kept.kind, &kept.key, &kept.value));
            if kept.kind == RecordKind::Set {
                moves.push((kept.key.clone(), kept.from, to));
            }
        }
        if image.len() as u64 != survey.live_bytes {
            return Err(CinderError::Internal(format!(
                "compacted image of {} bytes, expected {}",
                image.len(),
                survey.live_bytes
            )));
        }

        // Durable before the index can point into it
        let compacted = if image.is_empty() {
            None
        } else {
            Some(Arc::new(DiskSegment::create_from(
                &self.config.data_dir,
                compacted_base,
                &image,
                true,
                self.config.retry.clone(),
            )?))
        };

        // Nothing below may fail until the relocating range is lifted
        {
            let guard = self.epoch.pin();
            let mut frozen = self.layout.load(&guard).successor();
            frozen.relocating = Some(base..end);
            self.layout.swap(frozen, &guard);
        }
        self.quiesce();

        let batch = self.compaction.config.batch_size.max(1);
        let mut records_moved = 0u64;
        let mut superseded = 0u64;
        for chunk in moves.chunks(batch) {
            let guard = self.epoch.pin();
            for (key, from, to) in chunk {
                if self.index.compare_exchange(key.clone(), *from, *to, &guard) {
                    records_moved += 1;
                } else {
                    superseded += 1;
                }
            }
        }

        {
            let guard = self.epoch.pin();
            let mut next = self.layout.load(&guard).successor();
            next.cold.retain(|s| !Arc::ptr_eq(s, segment));
            if let Some(compacted) = &compacted {
                let at = next.cold.partition_point(|s| s.base() < compacted_base);
                next.cold.insert(at, Arc::clone(compacted));
            }
            segment.retire();
            self.layout.swap(next, &guard);
        }
        self.telemetry.cold.record_outflow(segment_bytes);
        if let Some(compacted) = &compacted {
            self.telemetry.cold.record_inflow(compacted.len());
        }

        let report = CompactionReport {
            segment: base,
            compacted: compacted.as_ref().map(|s| s.base()),
            segment_bytes,
            live_bytes: survey.live_bytes,
            records_moved,
            records_dropped: survey.dropped + superseded,
            duration: start.elapsed(),
        };
        info!(
            segment = %base,
            compacted = ?report.compacted,
            bytes_reclaimed = report.bytes_reclaimed(),
            records_moved,
            records_dropped = report.records_dropped,
            duration_ms = report.duration.as_millis() as u64,
            "Compacted cold segment"
        );

        if let Err(e) = self.replace_checkpoints() {
            warn!(error = %e, "Failed to checkpoint after compaction");
        }
        Ok(report)
    }

    /// Checkpoints taken before a compaction name segments that no longer
    /// exist; write a current one and drop the rest
    fn replace_checkpoints(&self) -> Result<Option<CheckpointId>> {
        if self.checkpoints.latest_checkpoint()?.is_none() {
            return Ok(None);
        }
        let id = self.checkpoint_locked()?;
        self.checkpoints.prune_older_than(id)?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hybridlog::log::test_config;
    use crate::storage::hybridlog::record::encoded_len;
    use crate::storage::hybridlog::segment::{segment_path, SegmentKind};
    use tempfile::tempdir;

    fn config(threshold: f64, min_dead: u64) -> CompactionConfig {
        CompactionConfig {
            dead_space_threshold: threshold,
            min_dead_bytes: min_dead,
            batch_size: 1000,
        }
    }

    #[test]
    fn test_should_compact_empty() {
        assert!(!should_compact(0, 0, &CompactionConfig::default()));
    }

    #[test]
    fn test_should_compact_thresholds() {
        // 10% dead space, below a 30% threshold
        assert!(!should_compact(1000, 900, &config(0.3, 100)));
        // 50% dead space
        assert!(should_compact(1000, 500, &config(0.3, 100)));
        // 50% dead but only 500 dead bytes
        assert!(!should_compact(1000, 500, &config(0.3, 1_000_000)));
    }

    #[test]
    fn test_config_validation() {
        assert!(CompactionConfig::default().validate().is_ok());
        assert!(config(1.5, 0).validate().is_err());
        let mut bad = CompactionConfig::default();
        bad.batch_size = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_state_single_run() {
        let state = CompactionState::default();
        assert!(state.try_start());
        assert!(!state.try_start());
        state.finish(None);
        assert!(state.try_start());
        assert_eq!(state.metrics.snapshot().segments_compacted, 0);
    }

    #[test]
    fn test_metrics_record() {
        let metrics = CompactionMetrics::new();
        let report = CompactionReport {
            segment: LogAddress::ZERO,
            compacted: Some(LogAddress::new(3072)),
            segment_bytes: 4096,
            live_bytes: 1024,
            records_moved: 10,
            records_dropped: 30,
            duration: Duration::from_millis(1),
        };
        metrics.record(&report);
        metrics.record(&report);

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_reclaimed, 6144);
        assert_eq!(snap.records_moved, 20);
        assert_eq!(snap.records_dropped, 60);
        assert_eq!(snap.segments_compacted, 2);
    }

    #[test]
    fn test_skipped_run_counted() {
        let state = CompactionState::new(config(0.5, 0));
        assert!(!state.should_trigger(1000, 900));
        assert!(state.should_trigger(1000, 100));
        assert_eq!(state.metrics.snapshot().runs_skipped, 0);
        state.skip();
        assert_eq!(state.metrics.snapshot().runs_skipped, 1);
    }

    /// Write `rounds` overwrites of the same keys so older cold records die
    fn churn(log: &HybridLog, keys: usize, rounds: usize) {
        for round in 0..rounds {
            for i in 0..keys {
                let value = format!("value-{round}-{i}-{}", "x".repeat(40));
                log.set(Bytes::from(format!("key{i:03}")), Bytes::from(value))
                    .unwrap();
            }
            log.shift().unwrap();
        }
    }

    #[test]
    fn test_compact_relocates_live_records() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        let log = HybridLog::open(cfg).unwrap();

        churn(&log, 20, 4);
        log.delete(b"key000").unwrap();
        log.shift().unwrap();

        let before = log.stats();
        assert!(before.cold_segments >= 4);

        let report = log.compact().unwrap().unwrap();
        assert_eq!(report.segment, LogAddress::ZERO);
        assert_eq!(report.compacted, None);
        assert_eq!(report.records_moved, 0);
        assert_eq!(report.live_bytes, 0);
        assert!(report.bytes_reclaimed() > 0);

        let after = log.stats();
        assert_eq!(after.cold_segments, before.cold_segments - 1);
        assert!(after.boundaries.cold_start > before.boundaries.cold_start);
        assert_eq!(after.compaction.segments_compacted, 1);

        assert_eq!(log.get(b"key000").unwrap(), None);
        for i in 1..20 {
            let value = log.get(format!("key{i:03}").as_bytes()).unwrap().unwrap();
            assert!(value.starts_with(format!("value-3-{i}-").as_bytes()));
        }
    }

    #[test]
    fn test_compact_moves_only_current_versions() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        let log = HybridLog::open(cfg).unwrap();

        // "stable" lives only in the first segment; "hot" is rewritten later
        log.set(Bytes::from("stable"), Bytes::from("kept")).unwrap();
        log.set(Bytes::from("hot"), Bytes::from("old")).unwrap();
        log.shift().unwrap();
        log.set(Bytes::from("hot"), Bytes::from("new")).unwrap();
        log.shift().unwrap();

        let report = log.compact().unwrap().unwrap();
        assert_eq!(report.records_moved, 1);
        assert_eq!(report.records_dropped, 1);
        assert_eq!(report.live_bytes, encoded_len(6, 4) as u64);

        assert_eq!(log.get(b"stable").unwrap(), Some(Bytes::from("kept")));
        assert_eq!(log.get(b"hot").unwrap(), Some(Bytes::from("new")));
        assert!(log.stats().boundaries.cold_start > LogAddress::ZERO);
    }

    #[test]
    fn test_compact_if_needed_respects_threshold() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        cfg.compaction = config(0.9, 0);
        let log = HybridLog::open(cfg).unwrap();

        log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        log.set(Bytes::from("b"), Bytes::from("2")).unwrap();
        log.shift().unwrap();
        log.set(Bytes::from("b"), Bytes::from("3")).unwrap();
        log.shift().unwrap();

        // Half of the only cold segment is dead, short of 90%
        assert!(log.compact_if_needed().unwrap().is_none());
        assert_eq!(log.stats().compaction.runs_skipped, 1);
        assert!(log.compact().unwrap().is_some());
        assert_eq!(log.get(b"a").unwrap(), Some(Bytes::from("1")));
        assert_eq!(log.get(b"b").unwrap(), Some(Bytes::from("3")));
    }

    #[test]
    fn test_compact_without_cold_segments() {
        let dir = tempdir().unwrap();
        let log = HybridLog::open(test_config(&dir)).unwrap();
        log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        assert!(log.compact().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compact_async() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        let log = Arc::new(HybridLog::open(cfg).unwrap());

        log.set(Bytes::from("keep1"), Bytes::from("value1")).unwrap();
        log.set(Bytes::from("keep2"), Bytes::from("value2")).unwrap();
        log.set(Bytes::from("delete"), Bytes::from("value3")).unwrap();
        log.delete(b"delete").unwrap();
        log.shift().unwrap();
        log.set(Bytes::from("later"), Bytes::from("value4")).unwrap();
        log.shift().unwrap();

        let report = log.compact_async().await.unwrap().unwrap();
        assert_eq!(report.records_moved, 2);

        assert_eq!(log.get(b"keep1").unwrap(), Some(Bytes::from("value1")));
        assert_eq!(log.get(b"keep2").unwrap(), Some(Bytes::from("value2")));
        assert_eq!(log.get(b"delete").unwrap(), None);

        let stats = log.stats();
        assert_eq!(stats.compaction.segments_compacted, 1);
        assert_eq!(stats.compaction.bytes_reclaimed, report.bytes_reclaimed());
    }

    #[test]
    fn test_compacted_segment_replaces_original() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        let log = HybridLog::open(cfg).unwrap();

        for i in 0..10 {
            log.set(Bytes::from(format!("key{i}")), Bytes::from("first"))
                .unwrap();
        }
        log.shift().unwrap();
        for i in 0..5 {
            log.set(Bytes::from(format!("key{i}")), Bytes::from("second"))
                .unwrap();
        }
        log.shift().unwrap();

        let before = log.stats();
        let original_end = before.boundaries.warm_start;
        let report = log.compact().unwrap().unwrap();

        let compacted = report.compacted.unwrap();
        assert_eq!(compacted.as_u64(), original_end.as_u64() - report.live_bytes);
        assert_eq!(report.records_moved, 5);
        assert_eq!(report.records_dropped, 5);

        let after = log.stats();
        assert_eq!(after.cold_segments, before.cold_segments);
        assert_eq!(after.boundaries.cold_start, compacted);
        assert_eq!(after.boundaries.warm_start, original_end);
        assert_eq!(after.layout_version, before.layout_version + 2);
        assert!(segment_path(dir.path(), compacted, SegmentKind::Cold).exists());

        for i in 0..10 {
            let expected = if i < 5 { "second" } else { "first" };
            assert_eq!(
                log.get(format!("key{i}").as_bytes()).unwrap(),
                Some(Bytes::from(expected))
            );
        }
    }

    #[test]
    fn test_compact_skips_fully_live_segments() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;

        let (first_base, second_base) = {
            let log = HybridLog::open(cfg.clone()).unwrap();
            log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
            log.set(Bytes::from("b"), Bytes::from("2")).unwrap();
            log.shift().unwrap();
            let second_base = log.stats().boundaries.warm_start;

            log.set(Bytes::from("c"), Bytes::from("3")).unwrap();
            log.set(Bytes::from("d"), Bytes::from("4")).unwrap();
            log.set(Bytes::from("x"), Bytes::from("5")).unwrap();
            log.delete(b"x").unwrap();
            log.shift().unwrap();
            log.set(Bytes::from("d"), Bytes::from("6")).unwrap();
            log.shift().unwrap();
            assert_eq!(log.stats().cold_segments, 2);

            let report = log.compact().unwrap().unwrap();
            assert_eq!(report.segment, second_base);
            assert_eq!(report.records_moved, 1);
            // Old "d" and the Set of "x"; the Delete of "x" stays
            assert_eq!(report.records_dropped, 2);
            assert_eq!(
                report.live_bytes,
                (encoded_len(1, 1) + encoded_len(1, 0)) as u64
            );

            let stats = log.stats();
            assert_eq!(stats.cold_segments, 2);
            assert_eq!(stats.boundaries.cold_start, LogAddress::ZERO);

            // The hole left in front of the compacted records resolves nowhere
            assert_eq!(log.get(b"x").unwrap(), None);
            log.close().unwrap();
            (LogAddress::ZERO, second_base)
        };

        let log = HybridLog::open(cfg).unwrap();
        assert_eq!(log.stats().boundaries.cold_start, first_base);
        assert!(!segment_path(dir.path(), second_base, SegmentKind::Cold).exists());
        assert_eq!(log.get(b"a").unwrap(), Some(Bytes::from("1")));
        assert_eq!(log.get(b"b").unwrap(), Some(Bytes::from("2")));
        assert_eq!(log.get(b"c").unwrap(), Some(Bytes::from("3")));
        assert_eq!(log.get(b"d").unwrap(), Some(Bytes::from("6")));
        assert_eq!(log.get(b"x").unwrap(), None);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_reopen_with_original_left_behind() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;

        let original_path = segment_path(dir.path(), LogAddress::ZERO, SegmentKind::Cold);
        let (original, compacted) = {
            let log = HybridLog::open(cfg.clone()).unwrap();
            log.set(Bytes::from("stable"), Bytes::from("kept")).unwrap();
            log.set(Bytes::from("hot"), Bytes::from("old")).unwrap();
            log.shift().unwrap();
            log.set(Bytes::from("hot"), Bytes::from("new")).unwrap();
            log.shift().unwrap();

            let original = std::fs::read(&original_path).unwrap();
            let report = log.compact().unwrap().unwrap();
            log.close().unwrap();
            (original, report.compacted.unwrap())
        };

        // A crash between writing the compacted file and deleting the
        // original leaves both on disk
        std::fs::write(&original_path, &original).unwrap();

        let log = HybridLog::open(cfg).unwrap();
        assert!(!original_path.exists());
        assert!(segment_path(dir.path(), compacted, SegmentKind::Cold).exists());
        assert_eq!(log.stats().boundaries.cold_start, compacted);
        assert_eq!(log.get(b"stable").unwrap(), Some(Bytes::from("kept")));
        assert_eq!(log.get(b"hot").unwrap(), Some(Bytes::from("new")));
    }

    #[test]
    fn test_compaction_replaces_checkpoints() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        let log = HybridLog::open(cfg).unwrap();

        log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        log.set(Bytes::from("b"), Bytes::from("2")).unwrap();
        log.shift().unwrap();
        log.set(Bytes::from("b"), Bytes::from("3")).unwrap();
        let stale = log.checkpoint().unwrap();

        let report = log.compact().unwrap().unwrap();
        let checkpoints = log.checkpoints().list_checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].id > stale);
        assert_eq!(checkpoints[0].cold_start, report.compacted.unwrap().as_u64());
        assert!(checkpoints[0].segments.contains(&report.compacted.unwrap().as_u64()));
    }
}
