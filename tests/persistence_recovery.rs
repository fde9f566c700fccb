//! Persistence and recovery integration tests
//!
//! Each scenario writes through a real engine, drops it with or without a
//! clean close, and reopens the same directory:
//! - Crash recovery across all three tiers
//! - Checkpoint selection, retention and fallback
//! - Interaction between compaction and checkpoints
//! - Write observers and shutdown behavior

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cinder::io::RetryPolicy;
use cinder::storage::hybridlog::LogAddress;
use cinder::{
    CinderError, HybridLog, HybridLogConfig, SyncPolicy, WriteEvent, WriteObserver, WriteOp,
};
use tempfile::{tempdir, TempDir};

fn config(dir: &TempDir) -> HybridLogConfig {
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

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some(ext))
        .collect();
    paths.sort();
    paths
}

/// Write `count` keys with a generation suffix, shifting every `per_shift`
fn fill(log: &HybridLog, prefix: &str, count: usize, per_shift: usize) {
    for i in 0..count {
        log.set(
            Bytes::from(format!("{prefix}{i}")),
            Bytes::from(format!("{prefix}-value-{i}")),
        )
        .unwrap();
        if (i + 1) % per_shift == 0 {
            log.shift().unwrap();
        }
    }
}

fn assert_filled(log: &HybridLog, prefix: &str, count: usize) {
    for i in 0..count {
        assert_eq!(
            log.get(format!("{prefix}{i}").as_bytes()).unwrap(),
            Some(Bytes::from(format!("{prefix}-value-{i}"))),
            "key {prefix}{i}"
        );
    }
}

// ============================================================================
// Crash Recovery
// ============================================================================

#[test]
fn test_crash_recovery_across_all_tiers() {
    let dir = tempdir().unwrap();
    {
        let log = HybridLog::open(config(&dir)).unwrap();
        fill(&log, "k", 600, 100);
        log.delete(b"k10").unwrap();
        let stats = log.stats();
        assert!(stats.cold_segments > 0, "expected cold data: {stats:?}");
        assert!(stats.warm_segments > 0, "expected warm data: {stats:?}");
        assert!(stats.hot_records > 0);
        // Dropped without close
    }

    let log = HybridLog::open(config(&dir)).unwrap();
    assert_eq!(log.len(), 599);
    assert_eq!(log.get(b"k10").unwrap(), None);
    for i in (0..600).filter(|i| *i != 10) {
        assert_eq!(
            log.get(format!("k{i}").as_bytes()).unwrap(),
            Some(Bytes::from(format!("k-value-{i}")))
        );
    }
    assert!(log.boundaries().is_ordered());
}

#[test]
fn test_recovered_engine_accepts_writes_and_recovers_again() {
    let dir = tempdir().unwrap();
    {
        let log = HybridLog::open(config(&dir)).unwrap();
        fill(&log, "first", 100, 40);
        log.close().unwrap();
    }
    {
        let log = HybridLog::open(config(&dir)).unwrap();
        fill(&log, "second", 100, 40);
        log.set(Bytes::from("first0"), Bytes::from("rewritten")).unwrap();
    }

    let log = cinder::recover(dir.path()).unwrap();
    assert_eq!(log.len(), 200);
    assert_eq!(log.get(b"first0").unwrap(), Some(Bytes::from("rewritten")));
    assert_filled(&log, "second", 100);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn test_checkpoint_limits_replay() {
    let dir = tempdir().unwrap();
    let id = {
        let log = HybridLog::open(config(&dir)).unwrap();
        fill(&log, "base", 200, 50);
        let id = log.checkpoint().unwrap();
        for i in 0..5 {
            log.set(Bytes::from(format!("late{i}")), Bytes::from("x")).unwrap();
        }
        id
    };

    let log = HybridLog::open(config(&dir)).unwrap();
    let info = log.recovery_info();
    assert_eq!(info.checkpoint, Some(id));
    assert_eq!(info.replayed_records, 5);
    assert_eq!(info.keys, 205);
    assert_filled(&log, "base", 200);
}

#[test]
fn test_checkpoint_retention() {
    let dir = tempdir().unwrap();
    let log = HybridLog::open(config(&dir)).unwrap();

    let mut ids = Vec::new();
    for round in 0..5 {
        log.set(Bytes::from(format!("r{round}")), Bytes::from("v")).unwrap();
        ids.push(log.checkpoint().unwrap());
    }

    let kept: Vec<_> = log
        .checkpoints()
        .list_checkpoints()
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(kept.len(), 3);
    for id in &ids[2..] {
        assert!(kept.contains(id));
    }
    assert_eq!(log.stats().last_checkpoint, ids.last().copied());
    assert_eq!(log.stats().checkpoints, 5);
}

#[test]
fn test_corrupt_newest_checkpoint_uses_previous() {
    let dir = tempdir().unwrap();
    let (older, newer) = {
        let log = HybridLog::open(config(&dir)).unwrap();
        log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
        let older = log.checkpoint().unwrap();
        log.set(Bytes::from("b"), Bytes::from("2")).unwrap();
        let newer = log.checkpoint().unwrap();
        log.close().unwrap();
        (older, newer)
    };
    assert!(newer > older);

    let snapshots = files_with_extension(&dir.path().join("checkpoints"), "cidx");
    assert_eq!(snapshots.len(), 2);
    let newest = snapshots.last().unwrap();
    let mut bytes = fs::read(newest).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x55;
    fs::write(newest, bytes).unwrap();

    let log = HybridLog::open(config(&dir)).unwrap();
    assert_eq!(log.recovery_info().checkpoint, Some(older));
    assert_eq!(log.get(b"a").unwrap(), Some(Bytes::from("1")));
    assert_eq!(log.get(b"b").unwrap(), Some(Bytes::from("2")));
}

#[test]
fn test_compaction_replaces_stale_checkpoints() {
    let dir = tempdir().unwrap();
    let latest = {
        let log = HybridLog::open(config(&dir)).unwrap();
        fill(&log, "old", 50, 50);
        log.set(Bytes::from("marker"), Bytes::from("m")).unwrap();
        let stale = log.checkpoint().unwrap();

        // Half of the first segment dies
        for i in 0..25 {
            log.set(
                Bytes::from(format!("old{i}")),
                Bytes::from(format!("old-value-{i}")),
            )
            .unwrap();
        }
        fill(&log, "new", 400, 80);
        let before = log.stats();
        assert!(before.cold_segments > 0);

        let report = log.compact().unwrap().expect("a cold segment to compact");
        assert_eq!(report.segment, LogAddress::ZERO);
        assert_eq!(report.records_moved, 25);
        let compacted = report.compacted.expect("live records to keep");
        let after = log.stats();
        assert_eq!(after.cold_segments, before.cold_segments);
        assert_eq!(after.boundaries.cold_start, compacted);

        let kept = log.checkpoints().list_checkpoints().unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].id > stale);
        assert_eq!(kept[0].segments.first(), Some(&compacted.as_u64()));
        let latest = kept[0].id;
        log.close().unwrap();
        latest
    };

    let log = HybridLog::open(config(&dir)).unwrap();
    assert_eq!(log.recovery_info().checkpoint, Some(latest));
    assert_filled(&log, "old", 50);
    assert_filled(&log, "new", 400);
    assert_eq!(log.get(b"marker").unwrap(), Some(Bytes::from("m")));
    assert_eq!(log.len(), 451);
}

// ============================================================================
// Observers and Shutdown
// ============================================================================

#[derive(Default)]
struct CountingObserver {
    sets: AtomicU64,
    deletes: AtomicU64,
    last_address: AtomicU64,
}

impl WriteObserver for CountingObserver {
    fn after_write(&self, event: &WriteEvent<'_>, address: LogAddress) {
        match event.op {
            WriteOp::Set => self.sets.fetch_add(1, Ordering::Relaxed),
            WriteOp::Delete => self.deletes.fetch_add(1, Ordering::Relaxed),
        };
        self.last_address.store(address.as_u64(), Ordering::Relaxed);
    }
}

#[test]
fn test_observer_sees_committed_writes() {
    let dir = tempdir().unwrap();
    let log = HybridLog::open(config(&dir)).unwrap();
    let observer = Arc::new(CountingObserver::default());
    log.register_observer(observer.clone());

    log.set(Bytes::from("a"), Bytes::from("1")).unwrap();
    log.set(Bytes::from("b"), Bytes::from("2")).unwrap();
    assert!(log.delete(b"a").unwrap());
    // Deleting a missing key is not a write
    assert!(!log.delete(b"missing").unwrap());

    assert_eq!(observer.sets.load(Ordering::Relaxed), 2);
    assert_eq!(observer.deletes.load(Ordering::Relaxed), 1);
    assert!(observer.last_address.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_closed_engine_refuses_writes() {
    let dir = tempdir().unwrap();
    let log = HybridLog::open(config(&dir)).unwrap();
    log.set(Bytes::from("k"), Bytes::from("v")).unwrap();
    log.close().unwrap();
    assert!(log.is_closed());

    let err = log.set(Bytes::from("k2"), Bytes::from("v")).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CinderError::Fatal(_)));
    // Reads keep working on a closed engine
    assert_eq!(log.get(b"k").unwrap(), Some(Bytes::from("v")));
    // Closing twice is harmless
    log.close().unwrap();
}
