//! Opening and recovering a HybridLog
//!
//! The data directory alone describes the log: segment files named after
//! their base address, plus checkpoints. Opening a directory:
//!
//! 1. Removes interrupted temp files, warm files whose cold copy exists and
//!    cold files a compacted segment replaced
//! 2. Repairs the hot segment left by the previous run and adopts it as the
//!    newest warm segment
//! 3. Restores the index from the newest usable checkpoint and replays the
//!    records written after it, or replays the whole log when no checkpoint
//!    qualifies
//! 4. Starts a fresh mutable region at the end of the log

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::address::LogAddress;
use super::checksum::repair_segment;
use super::compaction::CompactionState;
use super::disk::DiskSegment;
use super::index::HashIndex;
use super::layout::RegionLayout;
use super::log::{Counters, HybridLog, HybridLogConfig};
use super::mutable::MutableRegion;
use super::readonly::WarmSegment;
use super::record::{RecordIter, RecordKind};
use super::segment::{parse_segment_name, segment_path, SegmentKind};
use super::telemetry::HybridLogTelemetry;
use crate::error::{CinderError, Result};
use crate::hooks::ObserverRegistry;
use crate::io::sync_dir;
use crate::persistence::{CheckpointId, CheckpointManager, CheckpointMetadata};
use crate::storage::epoch::{EpochManager, EpochPtr};

/// What opening the engine recovered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryInfo {
    /// Checkpoint the index was restored from; `None` after a full replay
    pub checkpoint: Option<CheckpointId>,
    /// Log records replayed on top of the checkpoint
    pub replayed_records: u64,
    /// Torn bytes cut from the end of the previous hot segment
    pub repaired_bytes: u64,
    /// Live keys after recovery
    pub keys: u64,
    /// Time spent recovering
    pub duration: Duration,
}

/// Segments found in the data directory, in address order
struct Discovered {
    cold: Vec<Arc<DiskSegment>>,
    warm: Vec<Arc<WarmSegment>>,
    /// Address just past the last segment
    end: LogAddress,
    repaired_bytes: u64,
}

impl Discovered {
    fn start(&self) -> LogAddress {
        self.cold
            .first()
            .map(|s| s.base())
            .or_else(|| self.warm.first().map(|s| s.base()))
            .unwrap_or(self.end)
    }

    /// Whether `address` is the base of a segment or the end of the log
    fn is_boundary(&self, address: LogAddress) -> bool {
        address == self.end
            || self.cold.iter().any(|s| s.base() == address)
            || self.warm.iter().any(|s| s.base() == address)
    }
}

impl HybridLog {
    /// Open the log in `config.data_dir`, recovering whatever it holds
    pub fn open(config: HybridLogConfig) -> Result<Self> {
        let epoch = Arc::new(EpochManager::new(config.epoch.clone()));
        Self::open_with_epoch(config, epoch)
    }

    /// Open the log, protecting it with an existing epoch manager
    pub fn open_with_epoch(config: HybridLogConfig, epoch: Arc<EpochManager>) -> Result<Self> {
        config.validate()?;
        let start = Instant::now();
        fs::create_dir_all(&config.data_dir)?;

        let checkpoints = CheckpointManager::new(&config.data_dir, config.checkpoint.clone())?;
        let segments = discover(&config)?;
        let (checkpoint, entries, replayed_records) = restore_index(&checkpoints, &segments)?;

        let buckets = config
            .index_buckets
            .max((entries.len() * 2).next_power_of_two());
        let index = HashIndex::with_buckets(buckets);
        {
            let guard = epoch.pin();
            for (key, address) in entries {
                index.upsert(key, address, &guard);
            }
        }

        let hot = MutableRegion::create(
            &config.data_dir,
            segments.end,
            config.mutable_size,
            config.sync_policy,
            config.retry.clone(),
        )?;
        let layout = RegionLayout {
            version: 0,
            hot: Arc::new(hot),
            warm: segments.warm,
            cold: segments.cold,
            relocating: None,
        };

        let recovery = RecoveryInfo {
            checkpoint,
            replayed_records,
            repaired_bytes: segments.repaired_bytes,
            keys: index.len() as u64,
            duration: start.elapsed(),
        };
        info!(
            data_dir = %config.data_dir.display(),
            checkpoint = ?recovery.checkpoint,
            replayed = recovery.replayed_records,
            repaired_bytes = recovery.repaired_bytes,
            keys = recovery.keys,
            buckets = index.bucket_count(),
            boundaries = ?layout.boundaries(),
            duration_ms = recovery.duration.as_millis() as u64,
            "HybridLog opened"
        );

        Ok(Self {
            compaction: CompactionState::new(config.compaction.clone()),
            config,
            epoch,
            index,
            layout: EpochPtr::new(layout),
            maintenance: Mutex::new(()),
            backpressure: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            checkpoints,
            observers: ObserverRegistry::new(),
            telemetry: HybridLogTelemetry::new(),
            counters: Counters::default(),
            background_tasks: AtomicUsize::new(0),
            recovery,
        })
    }

    /// Open the log in `path` with the default configuration
    pub fn recover(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(HybridLogConfig::with_data_dir(path.as_ref()))
    }
}

/// Find, clean up and open the segment files in the data directory
fn discover(config: &HybridLogConfig) -> Result<Discovered> {
    let dir = &config.data_dir;
    let mut found: BTreeMap<LogAddress, Vec<(SegmentKind, PathBuf)>> = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("segment-") && name.ends_with(".tmp") {
            debug!(path = %entry.path().display(), "Removing interrupted segment file");
            fs::remove_file(entry.path())?;
            continue;
        }
        if let Some((base, kind)) = parse_segment_name(&name) {
            found.entry(base).or_default().push((kind, entry.path()));
        }
    }

    let mut discovered = Discovered {
        cold: Vec::new(),
        warm: Vec::new(),
        end: LogAddress::ZERO,
        repaired_bytes: 0,
    };
    let mut expected: Option<LogAddress> = None;
    let last_base = found.keys().next_back().copied();

    for (base, mut files) in found {
        files.sort();
        let kinds: Vec<SegmentKind> = files.iter().map(|(k, _)| *k).collect();
        if let Some(at) = expected {
            // Compaction leaves holes in the cold tier and may crash before
            // deleting the segment it replaced
            let cold_only = kinds == [SegmentKind::Cold] && discovered.warm.is_empty();
            if base < at && cold_only {
                let segment = DiskSegment::open(&files[0].1, base, config.retry.clone())?;
                replace_compacted(&mut discovered, segment, at)?;
                continue;
            }
            if base != at && !(base > at && cold_only) {
                return Err(CinderError::Recovery(format!(
                    "segment at {base} does not continue the log ending at {at}"
                )));
            }
        }

        match kinds.as_slice() {
            [SegmentKind::Cold] => {
                open_cold(config, base, &files[0].1, &mut discovered)?;
            }
            [SegmentKind::Warm, SegmentKind::Cold] => {
                // The flush finished; the warm copy was awaiting deletion
                debug!(base = %base, "Removing warm segment superseded by its cold copy");
                fs::remove_file(&files[0].1)?;
                open_cold(config, base, &files[1].1, &mut discovered)?;
            }
            [SegmentKind::Warm] => {
                let segment = WarmSegment::open(&files[0].1, base)?;
                discovered.warm.push(Arc::new(segment));
            }
            [SegmentKind::Hot] if Some(base) == last_base => {
                let path = &files[0].1;
                let summary = repair_segment(path)?;
                discovered.repaired_bytes += summary.file_size - summary.last_valid_end;
                if summary.last_valid_end == 0 {
                    debug!(base = %base, "Removing empty hot segment");
                    fs::remove_file(path)?;
                    discovered.end = base;
                    expected = Some(base);
                    continue;
                }
                let warm = segment_path(dir, base, SegmentKind::Warm);
                fs::rename(path, &warm)?;
                sync_dir(dir)?;
                info!(
                    base = %base,
                    records = summary.valid_records,
                    bytes = summary.last_valid_end,
                    "Adopted hot segment from previous run"
                );
                discovered.warm.push(Arc::new(WarmSegment::open(&warm, base)?));
            }
            _ => {
                return Err(CinderError::Recovery(format!(
                    "unexpected segment files at {base}: {kinds:?}"
                )));
            }
        }

        let end = match (discovered.warm.last(), discovered.cold.last()) {
            (Some(warm), _) if warm.base() == base => warm.end(),
            (_, Some(cold)) if cold.base() == base => cold.end(),
            _ => base,
        };
        discovered.end = end;
        expected = Some(end);
    }

    if !discovered.warm.is_empty() {
        if let Some(cold) = discovered.cold.last() {
            if cold.base() > discovered.warm[0].base() {
                return Err(CinderError::Recovery(format!(
                    "cold segment {} follows warm segment {}",
                    cold.base(),
                    discovered.warm[0].base()
                )));
            }
        }
    }

    Ok(discovered)
}

/// Swap the newest cold segment for its compacted replacement
///
/// The replacement must end where the original ended; it holds every record
/// of the original that was live when it was written.
fn replace_compacted(
    discovered: &mut Discovered,
    segment: DiskSegment,
    end: LogAddress,
) -> Result<()> {
    let replaces = discovered
        .cold
        .last()
        .is_some_and(|previous| previous.base() < segment.base() && previous.end() == end);
    if !replaces || segment.end() != end {
        return Err(CinderError::Recovery(format!(
            "segment at {} overlaps the log ending at {end}",
            segment.base()
        )));
    }
    if let Some(original) = discovered.cold.pop() {
        info!(
            original = %original.base(),
            compacted = %segment.base(),
            "Removing cold segment replaced by compaction"
        );
        original.retire();
    }
    discovered.cold.push(Arc::new(segment));
    Ok(())
}

fn open_cold(
    config: &HybridLogConfig,
    base: LogAddress,
    path: &Path,
    discovered: &mut Discovered,
) -> Result<()> {
    let segment = DiskSegment::open(path, base, config.retry.clone())?;
    discovered.cold.push(Arc::new(segment));
    Ok(())
}

/// Rebuild the index image: newest usable checkpoint plus replay, or a full replay
fn restore_index(
    checkpoints: &CheckpointManager,
    segments: &Discovered,
) -> Result<(Option<CheckpointId>, HashMap<Bytes, LogAddress>, u64)> {
    for metadata in checkpoints.list_checkpoints()? {
        let Some(entries) = usable_checkpoint(checkpoints, &metadata, segments) else {
            continue;
        };
        let mut image: HashMap<Bytes, LogAddress> = entries.into_iter().collect();
        let replayed = replay(segments, metadata.tail(), &mut image)?;
        info!(
            id = metadata.id,
            tail = metadata.tail,
            keys = metadata.key_count,
            replayed,
            "Restored index from checkpoint"
        );
        return Ok((Some(metadata.id), image, replayed));
    }

    let mut image = HashMap::new();
    let replayed = replay(segments, segments.start(), &mut image)?;
    if replayed > 0 {
        info!(replayed, keys = image.len(), "Rebuilt index by full replay");
    }
    Ok((None, image, replayed))
}

/// Load a checkpoint's index if it verifies and the log still covers it
fn usable_checkpoint(
    checkpoints: &CheckpointManager,
    metadata: &CheckpointMetadata,
    segments: &Discovered,
) -> Option<Vec<(Bytes, LogAddress)>> {
    let start = segments.start();
    let tail = metadata.tail();
    if tail < start || tail > segments.end || !segments.is_boundary(tail) {
        warn!(
            id = metadata.id,
            tail = %tail,
            log_start = %start,
            log_end = %segments.end,
            "Checkpoint is not covered by the log, skipping"
        );
        return None;
    }

    let bases: Vec<u64> = segments
        .cold
        .iter()
        .map(|s| s.base())
        .chain(segments.warm.iter().map(|s| s.base()))
        .filter(|&base| base < tail)
        .map(|base| base.as_u64())
        .collect();
    if bases != metadata.segments {
        warn!(
            id = metadata.id,
            recorded = metadata.segments.len(),
            found = bases.len(),
            "Checkpoint predates a compaction, skipping"
        );
        return None;
    }

    let entries = match checkpoints.load_index(metadata) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(id = metadata.id, error = %e, "Checkpoint failed verification, skipping");
            return None;
        }
    };
    if let Some((_, address)) = entries.iter().find(|(_, a)| *a < start || *a >= tail) {
        warn!(
            id = metadata.id,
            address = %address,
            "Checkpoint references an address outside the log, skipping"
        );
        return None;
    }
    Some(entries)
}

/// Apply every record at or after `from` to `image`, returning the count
fn replay(
    segments: &Discovered,
    from: LogAddress,
    image: &mut HashMap<Bytes, LogAddress>,
) -> Result<u64> {
    let mut replayed = 0;

    for segment in segments.cold.iter().filter(|s| s.end() > from) {
        let bytes = segment.load()?;
        replayed += replay_image(segment.base(), &bytes, from, image)?;
    }
    for segment in segments.warm.iter().filter(|s| s.end() > from) {
        replayed += replay_image(segment.base(), segment.bytes(), from, image)?;
    }
    Ok(replayed)
}

fn replay_image(
    base: LogAddress,
    bytes: &[u8],
    from: LogAddress,
    image: &mut HashMap<Bytes, LogAddress>,
) -> Result<u64> {
    let mut replayed = 0;
    for item in RecordIter::new(bytes) {
        let (offset, record) =
            item.map_err(|(offset, e)| e.at(base.advance(offset as u64).as_u64()))?;
        let address = base.advance(offset as u64);
        if address < from {
            continue;
        }
        match record.kind {
            RecordKind::Set => {
                image.insert(Bytes::copy_from_slice(record.key), address);
            }
            RecordKind::Delete => {
                image.remove(record.key);
            }
            // Fillers and voided writes
            RecordKind::Tombstone => continue,
        }
        replayed += 1;
    }
    Ok(replayed)
}
