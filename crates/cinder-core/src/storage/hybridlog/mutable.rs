//! Mutable Region for HybridLog
//!
//! The mutable region is the hot tier of the HybridLog. It is a bump-allocated
//! in-memory buffer covering `[base, base + capacity)` of the logical log,
//! mirrored byte for byte into its segment file (`segment-<base>.hot`).
//!
//! Key features:
//! - Lock-free space reservation with an atomic tail
//! - In-place overwrite of a record when the new encoding fits its slot
//! - Write-through to the segment file, acknowledged in log order
//! - A failed write-through seals the region: nothing more is acknowledged
//!   until the shift rewrites the whole file from the buffer
//! - Conversion into a warm segment once sealed

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
#[cfg(test)]
use std::sync::atomic::AtomicU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::address::{align_up, LogAddress, RECORD_ALIGNMENT};
use super::record::{
    compute_crc, decode, encode_filler, Decoded, Record, RecordHeader, RecordKind, HEADER_SIZE,
    MIN_FILLER,
};
use super::segment::{segment_path, SegmentKind};
use crate::config::SyncPolicy;
use crate::error::{CinderError, Result};
use crate::io::{classify, sync_dir, write_all_at, RetryPolicy};

/// Smallest buffer a region is created with
pub const MIN_CAPACITY: usize = 4096;

/// Tail bit set while the region refuses appends
const SEALED: u64 = 1 << 63;

/// Number of slot lock stripes
const STRIPES: usize = 64;

/// The mutable region - hot tier of the HybridLog
pub struct MutableRegion {
    /// Logical address of the first byte
    base: LogAddress,
    /// Pointer to the allocated memory buffer
    buffer: NonNull<u8>,
    /// Total capacity of the buffer in bytes
    capacity: usize,
    /// Next free offset, with [`SEALED`] or'ed in while sealed
    tail: AtomicU64,
    /// Offset below which every reserved slot has reached the segment file
    written: AtomicU64,
    /// Slot locks serializing in-place overwrites against readers
    stripes: Box<[RwLock<()>]>,
    file: File,
    path: PathBuf,
    sync_policy: SyncPolicy,
    retry: RetryPolicy,
    dirty: AtomicBool,
    last_sync: Mutex<Instant>,
    /// The file lags the buffer and must be rewritten before conversion
    write_through_failed: AtomicBool,
    bytes_written: AtomicU64,
    entry_count: AtomicU64,
    in_place_updates: AtomicU64,
    /// Segment file writes left to fail
    #[cfg(test)]
    injected_failures: AtomicU32,
}

// SAFETY: the buffer is only written inside reserved slots (exclusive to the
// reserving thread until published) or under the slot's stripe write lock.
unsafe impl Send for MutableRegion {}
// SAFETY: see above; all other state is atomic or lock protected.
unsafe impl Sync for MutableRegion {}

impl MutableRegion {
    /// Create an empty region starting at `base` and its segment file in `dir`
    pub fn create(
        dir: &Path,
        base: LogAddress,
        capacity: usize,
        sync_policy: SyncPolicy,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let capacity = align_up(capacity.max(MIN_CAPACITY) as u64) as usize;
        let layout = Layout::from_size_align(capacity, RECORD_ALIGNMENT as usize).map_err(|e| {
            CinderError::InvalidArgument(format!("invalid layout for mutable region: {e}"))
        })?;

        let path = segment_path(dir, base, SegmentKind::Hot);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(classify)?;
        sync_dir(dir).map_err(classify)?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(buffer) = NonNull::new(ptr) else {
            let _ = fs::remove_file(&path);
            return Err(CinderError::ResourceExhausted(format!(
                "failed to allocate {capacity} byte mutable region"
            )));
        };

        debug!(base = %base, capacity, path = %path.display(), "Created mutable region");

        Ok(Self {
            base,
            buffer,
            capacity,
            tail: AtomicU64::new(0),
            written: AtomicU64::new(0),
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
            file,
            path,
            sync_policy,
            retry,
            dirty: AtomicBool::new(false),
            last_sync: Mutex::new(Instant::now()),
            write_through_failed: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            in_place_updates: AtomicU64::new(0),
            #[cfg(test)]
            injected_failures: AtomicU32::new(0),
        })
    }

    /// Logical address of the first byte
    pub fn base(&self) -> LogAddress {
        self.base
    }

    /// Get the capacity of this region
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current used size
    pub fn used(&self) -> usize {
        (self.tail.load(Ordering::Acquire) & !SEALED) as usize
    }

    /// Address the next append would receive
    pub fn tail_address(&self) -> LogAddress {
        self.base.advance(self.used() as u64)
    }

    /// Whether `address` lies inside the allocated part of this region
    pub fn contains(&self, address: LogAddress) -> bool {
        !address.is_null()
            && address >= self.base
            && address.offset_from(self.base) < self.used() as u64
    }

    /// Whether the region refuses appends and in-place updates
    pub fn is_sealed(&self) -> bool {
        self.tail.load(Ordering::SeqCst) & SEALED != 0
    }

    /// Path of the backing segment file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get total bytes appended
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Get entry count
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Number of successful in-place overwrites
    pub fn in_place_updates(&self) -> u64 {
        self.in_place_updates.load(Ordering::Relaxed)
    }

    /// Append an encoded, aligned record
    ///
    /// Returns `Ok(None)` when the region is sealed or lacks space, or when
    /// an earlier record failed to reach the segment file. The record reaches
    /// the segment file before this returns, and never ahead of a record
    /// reserved earlier.
    ///
    /// A write or sync failure voids the slot, seals the region and returns
    /// the error.
    pub fn append(&self, record: &[u8]) -> Result<Option<LogAddress>> {
        debug_assert_eq!(record.len() as u64 % RECORD_ALIGNMENT, 0);

        let Some(offset) = self.reserve_space(record.len()) else {
            return Ok(None);
        };

        // SAFETY: [offset, offset + len) was reserved by this call and is not
        // reachable by readers until the caller publishes the address
        unsafe {
            ptr::copy_nonoverlapping(
                record.as_ptr(),
                self.buffer.as_ptr().add(offset),
                record.len(),
            );
        }

        let written = self.write_through(offset, record);
        if written.is_err() {
            self.void(offset);
        }
        self.advance_written(offset, record.len());
        written?;

        // An earlier slot never reached the file, so a crash would cut the
        // log short of this one
        if self.write_through_failed.load(Ordering::Acquire) {
            self.void(offset);
            return Ok(None);
        }
        if let Err(e) = self.apply_sync_policy() {
            self.void(offset);
            return Err(e);
        }

        self.bytes_written
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);

        Ok(Some(self.base.advance(offset as u64)))
    }

    /// Read the record at `address`
    pub fn read(&self, address: LogAddress) -> Result<Record> {
        let offset = self.offset_of(address)?;
        let _slot = self.stripe(offset).read();
        let bytes = self.slot(offset, address)?;
        match decode(bytes).map_err(|e| e.at(address.as_u64()))? {
            Decoded::Record(record) => Ok(record.to_owned()),
            Decoded::End => Err(CinderError::corruption(
                address.as_u64(),
                "no record at address",
            )),
        }
    }

    /// Overwrite the record at `address` if the new encoding fits its slot
    ///
    /// `still_current` runs under the slot lock and must confirm the index
    /// still points at `address`. A shrinking overwrite covers the rest of
    /// the slot with a filler. Returns `Ok(false)` when the caller has to
    /// append instead.
    pub fn try_update_in_place(
        &self,
        address: LogAddress,
        record: &[u8],
        still_current: impl FnOnce() -> bool,
    ) -> Result<bool> {
        if !self.contains(address) {
            return Ok(false);
        }
        let offset = address.offset_from(self.base) as usize;
        let _slot = self.stripe(offset).write();

        if self.is_sealed() || !still_current() {
            return Ok(false);
        }

        let previous = self.slot(offset, address)?.to_vec();
        let slot_len = previous.len();
        let image = match slot_len.checked_sub(record.len()) {
            Some(0) => Cow::Borrowed(record),
            Some(rest) if rest >= MIN_FILLER => {
                let mut image = Vec::with_capacity(slot_len);
                image.extend_from_slice(record);
                image.extend_from_slice(&encode_filler(rest));
                Cow::Owned(image)
            }
            _ => return Ok(false),
        };

        // SAFETY: the slot lies below the tail and the stripe write lock
        // excludes every reader of it
        unsafe {
            ptr::copy_nonoverlapping(
                image.as_ptr(),
                self.buffer.as_ptr().add(offset),
                image.len(),
            );
        }

        if let Err(e) = self
            .write_through(offset, &image)
            .and_then(|()| self.apply_sync_policy())
        {
            self.seal();
            // SAFETY: as above; the old record goes back so the rewrite at
            // shift time keeps the value the caller still sees
            unsafe {
                ptr::copy_nonoverlapping(
                    previous.as_ptr(),
                    self.buffer.as_ptr().add(offset),
                    previous.len(),
                );
            }
            return Err(e);
        }
        self.in_place_updates.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Refuse further appends, returning the bytes in use
    pub fn seal(&self) -> usize {
        (self.tail.fetch_or(SEALED, Ordering::SeqCst) & !SEALED) as usize
    }

    /// Accept appends again
    pub fn unseal(&self) {
        self.tail.fetch_and(!SEALED, Ordering::SeqCst);
    }

    /// Flush the segment file to stable storage if anything changed
    pub fn sync(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self
            .retry
            .run("hot segment sync", || self.file.sync_data());
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        *self.last_sync.lock() = Instant::now();
        result
    }

    /// Turn the sealed region's file into a warm segment file
    ///
    /// The region must be sealed and no thread may still be writing to it.
    /// Returns the warm file path, or `None` if the region was empty and its
    /// file has been removed.
    pub fn finish(&self, sync: bool) -> Result<Option<PathBuf>> {
        debug_assert!(self.is_sealed());
        let used = self.used();
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let warm = segment_path(dir, self.base, SegmentKind::Warm);

        if used == 0 {
            if self.path.exists() {
                fs::remove_file(&self.path).map_err(classify)?;
            }
            return Ok(None);
        }

        if self.path.exists() {
            if self.write_through_failed.load(Ordering::Acquire) {
                // SAFETY: sealed and quiesced, nothing mutates the buffer
                let image = unsafe { slice::from_raw_parts(self.buffer.as_ptr(), used) };
                warn!(
                    path = %self.path.display(),
                    bytes = used,
                    "Rewriting hot segment after failed write-through"
                );
                self.retry
                    .run("hot segment rewrite", || write_all_at(&self.file, image, 0))?;
                self.write_through_failed.store(false, Ordering::Release);
            }

            self.retry
                .run("hot segment truncate", || self.file.set_len(used as u64))?;
            if sync {
                self.retry
                    .run("hot segment sync", || self.file.sync_all())?;
            }
            self.retry
                .run("hot segment rename", || fs::rename(&self.path, &warm))?;
        }
        if sync {
            self.retry.run("data dir sync", || sync_dir(dir))?;
        }

        Ok(Some(warm))
    }

    fn reserve_space(&self, size: usize) -> Option<usize> {
        let mut current = self.tail.load(Ordering::Acquire);
        loop {
            if current & SEALED != 0 {
                return None;
            }
            let next = current + size as u64;
            if next > self.capacity as u64 {
                return None;
            }
            match self.tail.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current as usize),
                Err(actual) => current = actual,
            }
        }
    }

    /// Wait for every earlier slot to be written, then move the watermark
    /// past this one
    fn advance_written(&self, offset: usize, size: usize) {
        let backoff = Backoff::new();
        while self.written.load(Ordering::Acquire) != offset as u64 {
            backoff.snooze();
        }
        self.written
            .store((offset + size) as u64, Ordering::Release);
    }

    /// Whether the segment file is behind the buffer
    pub fn write_through_failed(&self) -> bool {
        self.write_through_failed.load(Ordering::Acquire)
    }

    /// Make the next `count` segment file writes fail
    #[cfg(test)]
    pub(super) fn fail_next_writes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::Release);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> std::io::Result<()> {
        let take = self
            .injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match take {
            Ok(_) => Err(std::io::Error::other("injected write failure")),
            Err(_) => Ok(()),
        }
    }

    fn write_through(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let result = self.retry.run("hot segment write", || {
            #[cfg(test)]
            self.injected_failure()?;
            write_all_at(&self.file, bytes, offset as u64)
        });
        match &result {
            Ok(()) => self.dirty.store(true, Ordering::Release),
            Err(e) => {
                warn!(path = %self.path.display(), offset, error = %e, "Write-through failed, sealing");
                self.write_through_failed.store(true, Ordering::Release);
                self.seal();
            }
        }
        result
    }

    fn apply_sync_policy(&self) -> Result<()> {
        match self.sync_policy {
            SyncPolicy::Always => {
                let result = self
                    .retry
                    .run("hot segment sync", || self.file.sync_data());
                if result.is_err() {
                    self.write_through_failed.store(true, Ordering::Release);
                    self.seal();
                }
                result
            }
            SyncPolicy::EverySecond => {
                if self.last_sync.lock().elapsed() >= Duration::from_secs(1) {
                    self.sync()
                } else {
                    Ok(())
                }
            }
            SyncPolicy::No => Ok(()),
        }
    }

    /// Turn an unpublished slot into a Tombstone in the buffer
    ///
    /// The file copy is fixed by the rewrite in [`finish`](Self::finish).
    fn void(&self, offset: usize) {
        self.rewrite_kind(offset, RecordKind::Tombstone);
    }

    /// Rewrite the header at `offset` with a new kind
    ///
    /// The caller holds the slot exclusively.
    fn rewrite_kind(&self, offset: usize, kind: RecordKind) {
        // SAFETY: the caller owns the slot, which holds a complete record
        unsafe {
            let base = self.buffer.as_ptr().add(offset);
            let mut raw = [0u8; HEADER_SIZE];
            ptr::copy_nonoverlapping(base, raw.as_mut_ptr(), HEADER_SIZE);
            let mut header = RecordHeader::from_bytes(&raw);

            let payload = slice::from_raw_parts(
                base.add(HEADER_SIZE),
                header.key_len as usize + header.value_len as usize,
            );
            let (key, value) = payload.split_at(header.key_len as usize);
            header.kind = kind as u8;
            header.crc = compute_crc(header.kind, header.key_len, header.value_len, key, value);

            let bytes = header.to_bytes();
            ptr::copy_nonoverlapping(bytes.as_ptr(), base, HEADER_SIZE);
        }
    }

    fn offset_of(&self, address: LogAddress) -> Result<usize> {
        if self.contains(address) {
            Ok(address.offset_from(self.base) as usize)
        } else {
            Err(CinderError::Internal(format!(
                "address {address} outside mutable region at {}",
                self.base
            )))
        }
    }

    /// The aligned slot of the published record at `offset`
    fn slot(&self, offset: usize, address: LogAddress) -> Result<&[u8]> {
        let used = self.used();
        if offset + HEADER_SIZE > used {
            return Err(CinderError::corruption(
                address.as_u64(),
                "record header past region tail",
            ));
        }

        let mut raw = [0u8; HEADER_SIZE];
        // SAFETY: the header lies below the tail and belongs to a published
        // record, which only changes under its stripe write lock
        unsafe {
            ptr::copy_nonoverlapping(
                self.buffer.as_ptr().add(offset),
                raw.as_mut_ptr(),
                HEADER_SIZE,
            );
        }
        let len = RecordHeader::from_bytes(&raw).aligned_len();
        if offset + len > used {
            return Err(CinderError::corruption(
                address.as_u64(),
                format!("record of {len} bytes runs past region tail"),
            ));
        }

        // SAFETY: bounds checked above; see the header read
        Ok(unsafe { slice::from_raw_parts(self.buffer.as_ptr().add(offset), len) })
    }

    fn stripe(&self, offset: usize) -> &RwLock<()> {
        &self.stripes[(offset >> 3) % STRIPES]
    }
}

impl Drop for MutableRegion {
    fn drop(&mut self) {
        // SAFETY: the buffer was allocated in `create` with this layout
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, RECORD_ALIGNMENT as usize);
            dealloc(self.buffer.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for MutableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableRegion")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("sealed", &self.is_sealed())
            .field("path", &self.path)
            .finish()
    }
}
