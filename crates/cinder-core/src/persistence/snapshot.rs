//! Hash index snapshot files
//!
//! Layout (little-endian):
//!
//! ```text
//! [magic "CIDX"][version: u16][reserved: u16][count: u64]
//! count × [flags: u8][key_len: u16][key][address: u64]
//! [crc32: u32]   over every preceding byte
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use bytes::Bytes;

use crate::error::{CinderError, Result};
use crate::io::sync_dir;
use crate::storage::hybridlog::LogAddress;

/// File magic
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"CIDX";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u16 = 1;

/// Entry flag: the entry is a live mapping
pub const FLAG_VALID: u8 = 0x01;

const PREAMBLE_LEN: usize = 4 + 2 + 2 + 8;
const TRAILER_LEN: usize = 4;

/// Serialize index entries into a snapshot image
pub fn encode_snapshot(entries: &[(Bytes, LogAddress)]) -> Vec<u8> {
    let body: usize = entries.iter().map(|(k, _)| 1 + 2 + k.len() + 8).sum();
    let mut buf = Vec::with_capacity(PREAMBLE_LEN + body + TRAILER_LEN);

    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (key, address) in entries {
        buf.push(FLAG_VALID);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&address.as_u64().to_le_bytes());
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Checksum stored in a snapshot image's trailer
pub fn snapshot_checksum(buf: &[u8]) -> Option<u32> {
    let tail = buf.len().checked_sub(TRAILER_LEN)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[tail..]);
    Some(u32::from_le_bytes(raw))
}

/// Parse and verify a snapshot image
///
/// Entries without [`FLAG_VALID`] are skipped.
pub fn decode_snapshot(buf: &[u8]) -> Result<Vec<(Bytes, LogAddress)>> {
    if buf.len() < PREAMBLE_LEN + TRAILER_LEN {
        return Err(CinderError::corruption(0, "index snapshot too short"));
    }

    let body_end = buf.len() - TRAILER_LEN;
    let stored = snapshot_checksum(buf).unwrap_or_default();
    let computed = crc32fast::hash(&buf[..body_end]);
    if stored != computed {
        return Err(CinderError::corruption(
            body_end as u64,
            format!("index snapshot CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        ));
    }

    if &buf[..4] != SNAPSHOT_MAGIC {
        return Err(CinderError::corruption(0, "bad index snapshot magic"));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != SNAPSHOT_VERSION {
        return Err(CinderError::Checkpoint(format!(
            "unsupported index snapshot version {version}"
        )));
    }
    let mut count_raw = [0u8; 8];
    count_raw.copy_from_slice(&buf[8..16]);
    let count = u64::from_le_bytes(count_raw);

    let body = &buf[PREAMBLE_LEN..body_end];
    let mut entries = Vec::with_capacity(count.min(body.len() as u64 / 11) as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let at = (PREAMBLE_LEN + pos) as u64;
        if pos + 3 > body.len() {
            return Err(CinderError::corruption(at, "index snapshot entry truncated"));
        }
        let flags = body[pos];
        let key_len = u16::from_le_bytes([body[pos + 1], body[pos + 2]]) as usize;
        pos += 3;
        if pos + key_len + 8 > body.len() {
            return Err(CinderError::corruption(at, "index snapshot entry truncated"));
        }
        let key = Bytes::copy_from_slice(&body[pos..pos + key_len]);
        pos += key_len;
        let mut addr_raw = [0u8; 8];
        addr_raw.copy_from_slice(&body[pos..pos + 8]);
        pos += 8;

        if flags & FLAG_VALID != 0 {
            entries.push((key, LogAddress::from_u64(u64::from_le_bytes(addr_raw))));
        }
    }

    if pos != body.len() {
        return Err(CinderError::corruption(
            (PREAMBLE_LEN + pos) as u64,
            "trailing bytes after index snapshot entries",
        ));
    }

    Ok(entries)
}

/// Write a snapshot file atomically, returning its checksum
pub fn write_snapshot(path: &Path, entries: &[(Bytes, LogAddress)], sync: bool) -> Result<u32> {
    let image = encode_snapshot(entries);
    let checksum = snapshot_checksum(&image).unwrap_or_default();

    let tmp = path.with_extension("cidx.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&image)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CinderError::Io(e)
    })?;
    if sync {
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
    }

    Ok(checksum)
}

/// Read a snapshot file, checking its trailer against `expected_checksum`
pub fn read_snapshot(path: &Path, expected_checksum: u32) -> Result<Vec<(Bytes, LogAddress)>> {
    let mut image = Vec::new();
    File::open(path)?.read_to_end(&mut image)?;

    match snapshot_checksum(&image) {
        Some(stored) if stored == expected_checksum => decode_snapshot(&image),
        Some(stored) => Err(CinderError::Checkpoint(format!(
            "index snapshot {} has checksum {stored:#010x}, metadata expects {expected_checksum:#010x}",
            path.display()
        ))),
        None => Err(CinderError::corruption(0, "index snapshot too short")),
    }
}
