//! Disk Region for HybridLog
//!
//! The disk region is the cold tier of the HybridLog: a run of immutable
//! segment files, each holding warm bytes flushed by a shift. Reads are
//! positional and run on the blocking pool when issued from async code.
//!
//! Key features:
//! - Segment files written once (temp file then rename) and never appended
//! - Positional reads with a read-ahead buffer for sequential access
//! - Batched async reads through [`ReadBatch`](crate::io::ReadBatch)
//! - Retired segments are deleted once no reader holds them

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::address::LogAddress;
use super::record::{decode, Decoded, Record, RecordHeader, HEADER_SIZE};
use super::segment::{segment_path, SegmentKind};
use crate::error::{CinderError, Result};
use crate::io::{classify, read_exact_at, sync_dir, write_all_at, BlockSource, RetryPolicy};

/// Bytes fetched past a missed record for the read-ahead buffer
const READ_AHEAD: usize = 64 * 1024;

/// Read-ahead buffer for prefetching disk data
///
/// Segments never change, so the buffer is only ever replaced, never
/// invalidated.
struct ReadAheadBuffer {
    /// Buffered data
    data: Vec<u8>,
    /// Starting offset of buffered data in the file
    start_offset: u64,
}

impl ReadAheadBuffer {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            start_offset: 0,
        }
    }

    /// Buffered bytes for `[offset, offset + len)`, if all of them are present
    fn read(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let end = self.start_offset + self.data.len() as u64;
        if offset < self.start_offset || offset + len as u64 > end {
            return None;
        }
        let start = (offset - self.start_offset) as usize;
        Some(&self.data[start..start + len])
    }

    fn fill(&mut self, data: Vec<u8>, start_offset: u64) {
        self.data = data;
        self.start_offset = start_offset;
    }
}

/// Prefetch statistics
#[derive(Debug, Default)]
pub struct PrefetchStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
}

/// One cold segment file covering `[base, base + len)`
pub struct DiskSegment {
    /// Logical address of the first byte
    base: LogAddress,
    /// Size of the file
    len: u64,
    /// Path to the data file
    path: PathBuf,
    file: File,
    retry: RetryPolicy,
    /// Delete the file when the last handle goes away
    retired: AtomicBool,
    /// Read count for statistics
    read_count: AtomicU64,
    prefetch_buffer: RwLock<ReadAheadBuffer>,
    prefetch_stats: PrefetchStats,
}

impl DiskSegment {
    /// Write `bytes` as a new cold segment starting at `base`
    ///
    /// The image goes to a temp file which is synced (when `sync` is set) and
    /// renamed into place, so a crash never leaves a partial cold segment.
    pub fn create_from(
        dir: &Path,
        base: LogAddress,
        bytes: &[u8],
        sync: bool,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let path = segment_path(dir, base, SegmentKind::Cold);
        let tmp = path.with_extension("cold.tmp");

        let written = retry.run("cold segment write", || {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            write_all_at(&file, bytes, 0)?;
            if sync {
                file.sync_all()?;
            }
            Ok(())
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        retry.run("cold segment rename", || fs::rename(&tmp, &path))?;
        if sync {
            retry.run("data dir sync", || sync_dir(dir))?;
        }

        debug!(path = %path.display(), base = %base, len = bytes.len(), "Wrote cold segment");
        Self::open(&path, base, retry)
    }

    /// Open an existing cold segment file
    pub fn open(path: impl AsRef<Path>, base: LogAddress, retry: RetryPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(classify)?;
        let len = file.metadata()?.len();

        Ok(Self {
            base,
            len,
            path,
            file,
            retry,
            retired: AtomicBool::new(false),
            read_count: AtomicU64::new(0),
            prefetch_buffer: RwLock::new(ReadAheadBuffer::new()),
            prefetch_stats: PrefetchStats::default(),
        })
    }

    /// Logical address of the first byte
    pub fn base(&self) -> LogAddress {
        self.base
    }

    /// Logical address just past the last byte
    pub fn end(&self) -> LogAddress {
        self.base.advance(self.len)
    }

    /// Size of the segment in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the segment holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `address` lies inside this segment
    pub fn contains(&self, address: LogAddress) -> bool {
        !address.is_null() && address >= self.base && address < self.end()
    }

    /// Path to the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Prefetch hit ratio (0.0 to 1.0)
    pub fn prefetch_hit_ratio(&self) -> f64 {
        let hits = self.prefetch_stats.hits.load(Ordering::Relaxed);
        let misses = self.prefetch_stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Blocking read of the record at `address`
    pub fn read(&self, address: LogAddress) -> Result<Record> {
        if !self.contains(address) {
            return Err(CinderError::Internal(format!(
                "address {address} outside cold segment {}",
                self.base
            )));
        }
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let offset = address.offset_from(self.base);

        if let Some(record) = self.read_buffered(offset, address)? {
            self.prefetch_stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(record);
        }
        self.prefetch_stats.misses.fetch_add(1, Ordering::Relaxed);

        let mut raw = [0u8; HEADER_SIZE];
        if offset + HEADER_SIZE as u64 > self.len {
            return Err(CinderError::corruption(
                address.as_u64(),
                "record header past segment end",
            ));
        }
        self.retry
            .run("cold segment read", || read_exact_at(&self.file, &mut raw, offset))?;
        let record_len = RecordHeader::from_bytes(&raw).record_len();
        if offset + record_len as u64 > self.len {
            return Err(CinderError::corruption(
                address.as_u64(),
                format!("record of {record_len} bytes runs past segment end"),
            ));
        }

        let fetch = (record_len.max(READ_AHEAD) as u64).min(self.len - offset) as usize;
        let mut data = vec![0u8; fetch];
        self.retry
            .run("cold segment read", || read_exact_at(&self.file, &mut data, offset))?;

        let record = decode_owned(&data, address)?;
        self.prefetch_buffer.write().fill(data, offset);
        Ok(record)
    }

    /// Read the record at `address` from the blocking pool
    ///
    /// Dropping the future does not cancel a read already in flight.
    pub async fn read_async(self: &Arc<Self>, address: LogAddress) -> Result<Record> {
        let segment = Arc::clone(self);
        tokio::task::spawn_blocking(move || segment.read(address))
            .await
            .map_err(|e| CinderError::Internal(format!("cold read task failed: {e}")))?
    }

    /// Read the whole segment image
    pub fn load(&self) -> Result<Vec<u8>> {
        let mut image = vec![0u8; self.len as usize];
        self.retry
            .run("cold segment load", || read_exact_at(&self.file, &mut image, 0))?;
        Ok(image)
    }

    /// Flush the segment file to stable storage
    pub fn sync(&self) -> Result<()> {
        self.retry.run("cold segment sync", || self.file.sync_all())
    }

    /// Delete the segment file once the last handle is dropped
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn read_buffered(&self, offset: u64, address: LogAddress) -> Result<Option<Record>> {
        let buffer = self.prefetch_buffer.read();
        let Some(header) = buffer.read(offset, HEADER_SIZE) else {
            return Ok(None);
        };
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(header);
        let record_len = RecordHeader::from_bytes(&raw).record_len();
        match buffer.read(offset, record_len) {
            Some(bytes) => decode_owned(bytes, address).map(Some),
            None => Ok(None),
        }
    }
}

fn decode_owned(bytes: &[u8], address: LogAddress) -> Result<Record> {
    match decode(bytes).map_err(|e| e.at(address.as_u64()))? {
        Decoded::Record(record) => Ok(record.to_owned()),
        Decoded::End => Err(CinderError::corruption(
            address.as_u64(),
            "no record at address",
        )),
    }
}

impl BlockSource for DiskSegment {
    type Output = Record;

    fn source_id(&self) -> u64 {
        self.base.as_u64()
    }

    fn read_at(&self, offset: u64) -> Result<Record> {
        self.read(self.base.advance(offset))
    }
}

impl Drop for DiskSegment {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to delete retired cold segment");
            } else {
                debug!(path = %self.path.display(), "Deleted retired cold segment");
            }
        }
    }
}

impl std::fmt::Debug for DiskSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSegment")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("path", &self.path)
            .finish()
    }
}
