//! Log record format
//!
//! Every record starts on an 8-byte aligned address:
//!
//! ```text
//! [kind: 1B][key_len: 2B][value_len: 4B][crc32: 4B][key][value][zero padding]
//! ```
//!
//! All integers are little-endian. The CRC32 covers the kind byte, both
//! length fields, the key and the value. A kind byte of zero marks space
//! that was never written and ends a scan.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use super::address::align_up;
use crate::error::CinderError;

/// Size of the fixed record header
pub const HEADER_SIZE: usize = 11;

/// Largest key a record can carry
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Largest value a record can carry
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

/// Smallest slot remainder that can hold a filler record
pub const MIN_FILLER: usize = 16;

/// Operation recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Key was set to value
    Set = 1,
    /// Key was deleted
    Delete = 2,
    /// Bytes the log does not vouch for: skipped during replay
    Tombstone = 3,
}

impl RecordKind {
    /// Decode a kind byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Set),
            2 => Some(RecordKind::Delete),
            3 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Set => write!(f, "set"),
            RecordKind::Delete => write!(f, "delete"),
            RecordKind::Tombstone => write!(f, "tombstone"),
        }
    }
}

/// Decoded fixed-size header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Raw kind byte
    pub kind: u8,
    /// Key length in bytes
    pub key_len: u16,
    /// Value length in bytes
    pub value_len: u32,
    /// CRC32 over kind, lengths, key and value
    pub crc: u32,
}

impl RecordHeader {
    /// Build a header for the given payload, computing its checksum
    pub fn new(kind: RecordKind, key: &[u8], value: &[u8]) -> Self {
        let key_len = key.len() as u16;
        let value_len = value.len() as u32;
        Self {
            kind: kind as u8,
            key_len,
            value_len,
            crc: compute_crc(kind as u8, key_len, value_len, key, value),
        }
    }

    /// Serialize the header
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind;
        buf[1..3].copy_from_slice(&self.key_len.to_le_bytes());
        buf[3..7].copy_from_slice(&self.value_len.to_le_bytes());
        buf[7..11].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Deserialize a header without validating it
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            kind: buf[0],
            key_len: u16::from_le_bytes([buf[1], buf[2]]),
            value_len: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
            crc: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
        }
    }

    /// Header plus payload, without padding
    pub fn record_len(&self) -> usize {
        HEADER_SIZE + self.key_len as usize + self.value_len as usize
    }

    /// Space the record occupies in the log
    pub fn aligned_len(&self) -> usize {
        align_up(self.record_len() as u64) as usize
    }

    /// Verify the checksum against a payload
    pub fn verify(&self, key: &[u8], value: &[u8]) -> bool {
        self.crc == compute_crc(self.kind, self.key_len, self.value_len, key, value)
    }
}

/// CRC32 over the header fields and payload
pub fn compute_crc(kind: u8, key_len: u16, value_len: u32, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&key_len.to_le_bytes());
    hasher.update(&value_len.to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Space a record with these payload sizes occupies in the log
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    align_up((HEADER_SIZE + key_len + value_len) as u64) as usize
}

/// Encode a full record, padded to the record alignment
pub fn encode_record(kind: RecordKind, key: &[u8], value: &[u8]) -> Vec<u8> {
    let header = RecordHeader::new(kind, key, value);
    let mut buf = Vec::with_capacity(header.aligned_len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf.resize(header.aligned_len(), 0);
    buf
}

/// Encode a Tombstone that exactly covers `len` bytes
///
/// `len` must be aligned and at least [`MIN_FILLER`].
pub fn encode_filler(len: usize) -> Vec<u8> {
    debug_assert!(len >= MIN_FILLER && len % 8 == 0);
    let value = vec![0u8; len - HEADER_SIZE];
    encode_record(RecordKind::Tombstone, &[], &value)
}

/// Why a byte range failed to decode as a record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The declared record runs past the available bytes
    #[error("truncated record: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header declares
        needed: usize,
        /// Bytes available
        available: usize,
    },
    /// Unknown kind byte
    #[error("unknown record kind {0}")]
    BadKind(u8),
    /// Stored and computed checksums differ
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        /// Checksum in the header
        stored: u32,
        /// Checksum of the bytes read
        computed: u32,
    },
}

impl DecodeError {
    /// Attach the log address where decoding failed
    pub fn at(self, address: u64) -> CinderError {
        CinderError::corruption(address, self.to_string())
    }
}

/// A record borrowed from a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    /// Operation
    pub kind: RecordKind,
    /// Key bytes
    pub key: &'a [u8],
    /// Value bytes
    pub value: &'a [u8],
    /// Aligned size in the log
    pub size: usize,
}

impl RecordRef<'_> {
    /// Copy into an owned record
    pub fn to_owned(&self) -> Record {
        Record {
            kind: self.kind,
            key: Bytes::copy_from_slice(self.key),
            value: Bytes::copy_from_slice(self.value),
        }
    }
}

/// An owned record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Operation
    pub kind: RecordKind,
    /// Key bytes
    pub key: Bytes,
    /// Value bytes
    pub value: Bytes,
}

/// Outcome of decoding at a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A verified record
    Record(RecordRef<'a>),
    /// Unwritten space or end of buffer
    End,
}

/// Decode and verify the record at the start of `buf`
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>, DecodeError> {
    if buf.is_empty() || buf[0] == 0 {
        return Ok(Decoded::End);
    }
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&raw);
    let kind = RecordKind::from_u8(header.kind).ok_or(DecodeError::BadKind(header.kind))?;

    let len = header.record_len();
    if len > buf.len() {
        return Err(DecodeError::Truncated {
            needed: len,
            available: buf.len(),
        });
    }

    let key_end = HEADER_SIZE + header.key_len as usize;
    let key = &buf[HEADER_SIZE..key_end];
    let value = &buf[key_end..len];
    let computed = compute_crc(header.kind, header.key_len, header.value_len, key, value);
    if computed != header.crc {
        return Err(DecodeError::Checksum {
            stored: header.crc,
            computed,
        });
    }

    Ok(Decoded::Record(RecordRef {
        kind,
        key,
        value,
        size: header.aligned_len(),
    }))
}

/// Sequential iterator over the records in a buffer
///
/// Yields `(offset, record)` pairs and stops at the first unwritten slot.
/// A decode failure is yielded once and ends the iteration.
pub struct RecordIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> RecordIter<'a> {
    /// Iterate over `buf` starting at offset 0
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }

    /// Offset just past the last record yielded
    pub fn position(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<(usize, RecordRef<'a>), (usize, DecodeError)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }
        match decode(&self.buf[self.offset..]) {
            Ok(Decoded::Record(record)) => {
                let at = self.offset;
                self.offset = (self.offset + record.size).min(self.buf.len());
                Some(Ok((at, record)))
            }
            Ok(Decoded::End) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err((self.offset, e)))
            }
        }
    }
}
