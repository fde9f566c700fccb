//! Checkpoint files for the HybridLog
//!
//! A checkpoint does not copy data. It records where the log stood at a
//! quiescent point (the region boundaries, the tail and the base of every
//! segment below it), plus a snapshot of the hash index taken at that
//! instant:
//!
//! 1. The engine shifts the mutable region so the tail lands on a segment
//!    boundary, capturing the index while writers are held off
//! 2. Every warm segment is synced to disk
//! 3. The index snapshot is written (`checkpoint-<id>.cidx`)
//! 4. Metadata is written last (`checkpoint-<id>.meta`, temp file + rename)
//!
//! Recovery:
//! 1. Pick the newest checkpoint whose metadata and snapshot verify and
//!    whose segment list matches the files on disk
//! 2. Rebuild the index from the snapshot
//! 3. Replay log records at or after the checkpoint tail

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::snapshot::{read_snapshot, write_snapshot};
use crate::error::{CinderError, Result};
use crate::io::sync_dir;
use crate::storage::hybridlog::{LogAddress, RegionBoundaries};

/// Checkpoint identifier; strictly increasing within a data directory
pub type CheckpointId = u64;

/// Checkpoint metadata stored alongside the index snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Version of the checkpoint format
    pub version: u32,
    /// Unique checkpoint ID
    pub id: CheckpointId,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Oldest live address at checkpoint time
    pub cold_start: u64,
    /// First warm address at checkpoint time
    pub warm_start: u64,
    /// Log tail at checkpoint time; replay starts here
    pub tail: u64,
    /// Base of every cold and warm segment below the tail, in log order
    pub segments: Vec<u64>,
    /// Number of keys in the snapshot
    pub key_count: u64,
    /// Snapshot file name, relative to the checkpoint directory
    pub index_file: String,
    /// CRC32 trailer of the snapshot file
    pub index_checksum: u32,
    /// CRC32 over the fields above
    pub checksum: u32,
}

impl CheckpointMetadata {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Compute the metadata checksum
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.id.to_le_bytes());
        hasher.update(&self.created_at.to_le_bytes());
        hasher.update(&self.cold_start.to_le_bytes());
        hasher.update(&self.warm_start.to_le_bytes());
        hasher.update(&self.tail.to_le_bytes());
        hasher.update(&(self.segments.len() as u64).to_le_bytes());
        for base in &self.segments {
            hasher.update(&base.to_le_bytes());
        }
        hasher.update(&self.key_count.to_le_bytes());
        hasher.update(&self.index_checksum.to_le_bytes());
        hasher.update(self.index_file.as_bytes());
        hasher.finalize()
    }

    /// Compute and set checksum
    pub fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    /// Region boundaries recorded by the checkpoint
    pub fn boundaries(&self) -> RegionBoundaries {
        RegionBoundaries {
            cold_start: LogAddress::new(self.cold_start),
            warm_start: LogAddress::new(self.warm_start),
            hot_start: LogAddress::new(self.tail),
        }
    }

    /// Log position replay starts from
    pub fn tail(&self) -> LogAddress {
        LogAddress::new(self.tail)
    }

    /// Structural checks that need no other file
    pub fn validate(&self) -> Result<()> {
        if self.version != Self::CURRENT_VERSION {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} has unsupported version {}",
                self.id, self.version
            )));
        }
        if self.checksum != self.compute_checksum() {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} metadata checksum mismatch",
                self.id
            )));
        }
        if !self.boundaries().is_ordered() {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} boundaries out of order",
                self.id
            )));
        }
        if !self.segments.windows(2).all(|w| w[0] < w[1])
            || self.segments.last().is_some_and(|&base| base >= self.tail)
        {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} segment list out of order",
                self.id
            )));
        }
        if self.index_file.contains(['/', '\\']) || self.index_file.starts_with('.') {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} names an invalid index file {:?}",
                self.id, self.index_file
            )));
        }
        Ok(())
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for checkpoint files; relative paths resolve against the data directory
    pub checkpoint_dir: PathBuf,
    /// Maximum number of checkpoints to retain
    pub max_checkpoints: usize,
    /// Enable fsync after checkpoint writes
    pub sync_on_checkpoint: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_checkpoints: 3,
            sync_on_checkpoint: true,
        }
    }
}

/// Result of a checkpoint operation
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    /// The checkpoint metadata
    pub metadata: CheckpointMetadata,
    /// Time taken to write the checkpoint files
    pub duration: Duration,
    /// Path to the metadata file
    pub path: PathBuf,
}

/// Manages checkpoint files in one directory
pub struct CheckpointManager {
    /// Resolved checkpoint directory
    dir: PathBuf,
    /// Configuration
    config: CheckpointConfig,
    /// Whether a checkpoint is in progress
    checkpoint_in_progress: AtomicBool,
    /// Last checkpoint metadata
    last_checkpoint: RwLock<Option<CheckpointMetadata>>,
    /// Last checkpoint time
    last_checkpoint_time: RwLock<Option<Instant>>,
}

impl CheckpointManager {
    /// Open (creating if needed) the checkpoint directory under `data_dir`
    pub fn new(data_dir: &Path, config: CheckpointConfig) -> Result<Self> {
        let dir = if config.checkpoint_dir.is_absolute() {
            config.checkpoint_dir.clone()
        } else {
            data_dir.join(&config.checkpoint_dir)
        };
        fs::create_dir_all(&dir)?;

        let manager = Self {
            dir,
            config,
            checkpoint_in_progress: AtomicBool::new(false),
            last_checkpoint: RwLock::new(None),
            last_checkpoint_time: RwLock::new(None),
        };
        manager.remove_temp_files()?;

        if let Some(metadata) = manager.latest_checkpoint()? {
            debug!(
                id = metadata.id,
                tail = metadata.tail,
                keys = metadata.key_count,
                "Found existing checkpoint"
            );
            *manager.last_checkpoint.write() = Some(metadata);
        }

        Ok(manager)
    }

    /// Get the checkpoint directory
    pub fn checkpoint_dir(&self) -> &Path {
        &self.dir
    }

    /// Time since the last checkpoint written by this manager
    pub fn since_last_checkpoint(&self) -> Option<Duration> {
        self.last_checkpoint_time.read().map(|t| t.elapsed())
    }

    fn meta_path(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(format!("checkpoint-{id:016}.meta"))
    }

    fn index_name(id: CheckpointId) -> String {
        format!("checkpoint-{id:016}.cidx")
    }

    /// Write a checkpoint for the given log position and index image
    pub fn create_checkpoint(
        &self,
        boundaries: RegionBoundaries,
        segments: &[LogAddress],
        entries: &[(Bytes, LogAddress)],
    ) -> Result<CheckpointResult> {
        if self.checkpoint_in_progress.swap(true, Ordering::AcqRel) {
            return Err(CinderError::Checkpoint(
                "checkpoint already in progress".to_string(),
            ));
        }

        let start = Instant::now();
        let result = self.do_create_checkpoint(boundaries, segments, entries);
        self.checkpoint_in_progress.store(false, Ordering::Release);

        let (metadata, path) = result?;
        *self.last_checkpoint_time.write() = Some(Instant::now());
        Ok(CheckpointResult {
            metadata,
            duration: start.elapsed(),
            path,
        })
    }

    fn do_create_checkpoint(
        &self,
        boundaries: RegionBoundaries,
        segments: &[LogAddress],
        entries: &[(Bytes, LogAddress)],
    ) -> Result<(CheckpointMetadata, PathBuf)> {
        let sync = self.config.sync_on_checkpoint;
        let id = self.next_id()?;

        let index_file = Self::index_name(id);
        let index_checksum = write_snapshot(&self.dir.join(&index_file), entries, sync)?;

        let metadata = CheckpointMetadata {
            version: CheckpointMetadata::CURRENT_VERSION,
            id,
            created_at: unix_millis(),
            cold_start: boundaries.cold_start.as_u64(),
            warm_start: boundaries.warm_start.as_u64(),
            tail: boundaries.hot_start.as_u64(),
            segments: segments.iter().map(|s| s.as_u64()).collect(),
            key_count: entries.len() as u64,
            index_file,
            index_checksum,
            checksum: 0,
        }
        .sealed();

        let path = self.meta_path(id);
        let tmp = path.with_extension("meta.tmp");
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| CinderError::Checkpoint(format!("failed to encode metadata: {e}")))?;
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&json)?;
            writer.flush()?;
            if sync {
                writer.get_ref().sync_all()?;
            }
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CinderError::Io(e)
        })?;
        if sync {
            sync_dir(&self.dir)?;
        }

        *self.last_checkpoint.write() = Some(metadata.clone());
        self.cleanup_old_checkpoints()?;

        info!(
            id,
            tail = metadata.tail,
            cold_start = metadata.cold_start,
            keys = metadata.key_count,
            "Created checkpoint"
        );

        Ok((metadata, path))
    }

    fn next_id(&self) -> Result<CheckpointId> {
        let mut max = self.last_checkpoint.read().as_ref().map_or(0, |m| m.id);
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(id) = parse_id(&name.to_string_lossy()) {
                max = max.max(id);
            }
        }
        Ok(max + 1)
    }

    /// Load checkpoint metadata from a file
    fn load_checkpoint_metadata(&self, path: &Path) -> Result<CheckpointMetadata> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        serde_json::from_slice(&data).map_err(|e| {
            CinderError::Checkpoint(format!("unreadable metadata {}: {e}", path.display()))
        })
    }

    /// List all readable checkpoints, newest first
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointMetadata>> {
        let mut checkpoints = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("meta") {
                continue;
            }
            match self.load_checkpoint_metadata(&path) {
                Ok(metadata) => checkpoints.push(metadata),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load checkpoint"),
            }
        }

        checkpoints.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(checkpoints)
    }

    /// Newest readable checkpoint, if any
    pub fn latest_checkpoint(&self) -> Result<Option<CheckpointMetadata>> {
        Ok(self.list_checkpoints()?.into_iter().next())
    }

    /// Get the last checkpoint metadata seen by this manager
    pub fn last_checkpoint(&self) -> Option<CheckpointMetadata> {
        self.last_checkpoint.read().clone()
    }

    /// Verify metadata and snapshot integrity
    pub fn verify(&self, metadata: &CheckpointMetadata) -> Result<()> {
        self.load_index(metadata).map(|_| ())
    }

    /// Verify a checkpoint and load its index snapshot
    pub fn load_index(&self, metadata: &CheckpointMetadata) -> Result<Vec<(Bytes, LogAddress)>> {
        metadata.validate()?;
        let entries = read_snapshot(&self.dir.join(&metadata.index_file), metadata.index_checksum)?;
        if entries.len() as u64 != metadata.key_count {
            return Err(CinderError::Checkpoint(format!(
                "checkpoint {} expects {} keys, snapshot holds {}",
                metadata.id,
                metadata.key_count,
                entries.len()
            )));
        }
        Ok(entries)
    }

    /// Cleanup old checkpoints, keeping only the configured number
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;
        let keep = self.config.max_checkpoints.max(1);

        while checkpoints.len() > keep {
            if let Some(old) = checkpoints.pop() {
                self.delete_checkpoint(&old);
            }
        }

        Ok(())
    }

    /// Delete every checkpoint older than `id`
    ///
    /// Returns the number of checkpoints removed.
    pub fn prune_older_than(&self, id: CheckpointId) -> Result<usize> {
        let mut removed = 0;
        for metadata in self.list_checkpoints()? {
            if metadata.id < id {
                self.delete_checkpoint(&metadata);
                removed += 1;
            }
        }

        if removed > 0 {
            let mut last = self.last_checkpoint.write();
            if last.as_ref().is_some_and(|m| m.id < id) {
                *last = None;
            }
            info!(removed, kept = id, "Pruned superseded checkpoints");
        }
        Ok(removed)
    }

    /// Delete a checkpoint's files
    pub fn delete_checkpoint(&self, metadata: &CheckpointMetadata) {
        for path in [self.meta_path(metadata.id), self.dir.join(&metadata.index_file)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove checkpoint file"),
            }
        }
        debug!(id = metadata.id, "Removed checkpoint");
    }

    fn remove_temp_files(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("tmp") {
                debug!(path = %path.display(), "Removing interrupted checkpoint file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Extract the id from `checkpoint-<id>.meta` or `.cidx`
fn parse_id(name: &str) -> Option<CheckpointId> {
    let rest = name.strip_prefix("checkpoint-")?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
