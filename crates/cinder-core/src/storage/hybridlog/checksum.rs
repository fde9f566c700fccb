//! Segment integrity scanning and repair
//!
//! A segment file is a run of records starting at offset 0. The scanner
//! verifies them in order and stops at the first unwritten slot or the first
//! record that fails to decode. Repair truncates the file at that point, which
//! drops a torn tail left by a crash mid-append.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::{error, warn};

use super::record::{encode_record, RecordIter, RecordKind};

/// Summary returned by a recovery scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Number of valid records found
    pub valid_records: u64,
    /// Number of corrupted records found
    pub corrupted_records: u64,
    /// Byte offset of the last valid record's end (safe truncation point)
    pub last_valid_end: u64,
    /// Total file size scanned
    pub file_size: u64,
}

impl RecoverySummary {
    /// Whether anything follows the last valid record
    pub fn needs_repair(&self) -> bool {
        self.last_valid_end != self.file_size
    }
}

/// Scan an in-memory segment image
pub fn scan_bytes(buf: &[u8]) -> RecoverySummary {
    let mut summary = RecoverySummary {
        file_size: buf.len() as u64,
        ..Default::default()
    };

    let mut iter = RecordIter::new(buf);
    for item in iter.by_ref() {
        match item {
            Ok(_) => summary.valid_records += 1,
            Err((offset, e)) => {
                error!(offset, error = %e, "Corrupted record in segment");
                summary.corrupted_records += 1;
            }
        }
    }
    summary.last_valid_end = iter.position() as u64;
    summary
}

/// Scan a segment file and report record integrity
pub fn recovery_scan(path: &Path) -> io::Result<RecoverySummary> {
    let mut file = File::open(path)?;
    let mut buf = Vec::with_capacity(file.metadata()?.len() as usize);
    file.read_to_end(&mut buf)?;
    Ok(scan_bytes(&buf))
}

/// Repair a segment file by truncating after the last valid record
///
/// Returns the summary of the scan that preceded the repair.
pub fn repair_segment(path: &Path) -> io::Result<RecoverySummary> {
    let summary = recovery_scan(path)?;

    if summary.needs_repair() {
        warn!(
            path = %path.display(),
            valid = summary.valid_records,
            corrupted = summary.corrupted_records,
            truncate_at = summary.last_valid_end,
            file_size = summary.file_size,
            "Repairing segment: truncating torn tail"
        );

        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(summary.last_valid_end)?;
        file.sync_all()?;
    }

    Ok(summary)
}

/// Append a record at the file's current position
pub fn write_record(
    file: &mut File,
    kind: RecordKind,
    key: &[u8],
    value: &[u8],
) -> io::Result<usize> {
    let buf = encode_record(kind, key, value);
    file.write_all(&buf)?;
    Ok(buf.len())
}
