//! Read-Only Region for HybridLog
//!
//! The read-only region is the warm tier of the HybridLog. Each shift turns
//! the sealed mutable region's file into one warm segment, which is memory
//! mapped and never written again. Updates to keys living here append to the
//! mutable region instead.
//!
//! Key features:
//! - Memory-mapped files for zero-copy decoding
//! - Immutable after creation
//! - Deleted from disk once retired and no reader holds it

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::Mmap;
use tracing::{debug, warn};

use super::address::LogAddress;
use super::record::{decode, Decoded, Record, RecordIter};
use crate::error::{CinderError, Result};
use crate::io::classify;

/// One memory-mapped warm segment covering `[base, base + len)`
pub struct WarmSegment {
    /// Logical address of the first byte
    base: LogAddress,
    /// The path to the segment file
    path: PathBuf,
    /// The underlying file
    file: File,
    /// Memory-mapped view of the file, `None` for an empty file
    mmap: Option<Mmap>,
    /// Delete the file when the last handle goes away
    retired: AtomicBool,
    /// Reads served for statistics
    read_count: AtomicU64,
}

impl WarmSegment {
    /// Open and map an existing warm segment file
    pub fn open(path: impl AsRef<Path>, base: LogAddress) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(classify)?;
        let len = file.metadata()?.len();

        let mmap = if len > 0 {
            // SAFETY: warm segment files are never modified while mapped
            Some(unsafe { Mmap::map(&file) }.map_err(classify)?)
        } else {
            None
        };

        debug!(path = %path.display(), base = %base, len, "Mapped warm segment");

        Ok(Self {
            base,
            path,
            file,
            mmap,
            retired: AtomicBool::new(false),
            read_count: AtomicU64::new(0),
        })
    }

    /// Logical address of the first byte
    pub fn base(&self) -> LogAddress {
        self.base
    }

    /// Logical address just past the last byte
    pub fn end(&self) -> LogAddress {
        self.base.advance(self.len() as u64)
    }

    /// Size of the segment in bytes
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// Whether the segment holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `address` lies inside this segment
    pub fn contains(&self, address: LogAddress) -> bool {
        !address.is_null() && address >= self.base && address < self.end()
    }

    /// Path of the segment file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of reads served
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// The whole segment image
    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Iterate over the records in the segment
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter::new(self.bytes())
    }

    /// Read the record at `address`
    pub fn read(&self, address: LogAddress) -> Result<Record> {
        if !self.contains(address) {
            return Err(CinderError::Internal(format!(
                "address {address} outside warm segment {}",
                self.base
            )));
        }
        self.read_count.fetch_add(1, Ordering::Relaxed);

        let offset = address.offset_from(self.base) as usize;
        match decode(&self.bytes()[offset..]).map_err(|e| e.at(address.as_u64()))? {
            Decoded::Record(record) => Ok(record.to_owned()),
            Decoded::End => Err(CinderError::corruption(
                address.as_u64(),
                "no record at address",
            )),
        }
    }

    /// Flush the segment file to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(classify)
    }

    /// Delete the segment file once the last handle is dropped
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for WarmSegment {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            // Unmap before unlinking
            self.mmap = None;
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to delete retired warm segment");
            } else {
                debug!(path = %self.path.display(), "Deleted retired warm segment");
            }
        }
    }
}

impl std::fmt::Debug for WarmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmSegment")
            .field("base", &self.base)
            .field("len", &self.len())
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hybridlog::record::{encode_record, RecordKind};
    use tempfile::TempDir;

    fn write_segment(dir: &TempDir, records: &[(&[u8], &[u8])]) -> (PathBuf, Vec<u64>) {
        let path = dir.path().join("segment-0000000000001000.warm");
        let mut image = Vec::new();
        let mut offsets = Vec::new();
        for (key, value) in records {
            offsets.push(image.len() as u64);
            image.extend_from_slice(&encode_record(RecordKind::Set, key, value));
        }
        fs::write(&path, image).unwrap();
        (path, offsets)
    }

    #[test]
    fn test_open_and_read() {
        let dir = TempDir::new().unwrap();
        let (path, offsets) = write_segment(&dir, &[(b"key1", b"value1"), (b"key2", b"value2")]);

        let segment = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();
        assert_eq!(segment.base(), LogAddress::new(0x1000));
        assert_eq!(segment.end(), LogAddress::new(0x1000 + 48));

        let second = segment.read(LogAddress::new(0x1000 + offsets[1])).unwrap();
        assert_eq!(second.key.as_ref(), b"key2");
        assert_eq!(second.value.as_ref(), b"value2");
        assert_eq!(segment.read_count(), 1);
    }

    #[test]
    fn test_read_outside_segment() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_segment(&dir, &[(b"k", b"v")]);
        let segment = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();

        assert!(!segment.contains(LogAddress::new(0x0fff)));
        assert!(!segment.contains(segment.end()));
        assert!(segment.read(LogAddress::new(0x2000)).is_err());
    }

    #[test]
    fn test_corrupted_record_reported() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_segment(&dir, &[(b"key", b"value")]);
        let mut image = fs::read(&path).unwrap();
        image[12] ^= 0xFF;
        fs::write(&path, image).unwrap();

        let segment = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();
        assert!(matches!(
            segment.read(LogAddress::new(0x1000)),
            Err(CinderError::Corruption { address: 0x1000, .. })
        ));
    }

    #[test]
    fn test_records() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_segment(&dir, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let segment = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();

        let keys: Vec<Vec<u8>> = segment
            .records()
            .map(|r| r.unwrap().1.key.to_vec())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_retire_deletes_file_on_drop() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_segment(&dir, &[(b"k", b"v")]);

        let kept = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();
        drop(kept);
        assert!(path.exists());

        let retired = WarmSegment::open(&path, LogAddress::new(0x1000)).unwrap();
        retired.retire();
        drop(retired);
        assert!(!path.exists());
    }
}
