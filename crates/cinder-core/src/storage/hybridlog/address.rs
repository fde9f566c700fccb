//! Logical addresses in the HybridLog
//!
//! An address is a byte position in one conceptually infinite, append-only
//! log. It never encodes which tier holds the record: the tier is derived by
//! comparing the address against the current [`RegionBoundaries`], so moving
//! a segment between tiers never rewrites an address.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Records start on multiples of this many bytes
pub const RECORD_ALIGNMENT: u64 = 8;

/// Round `len` up to the record alignment
pub const fn align_up(len: u64) -> u64 {
    (len + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// Tier classification of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Region {
    /// Hot data - in-memory, mutable
    Mutable = 0,
    /// Warm data - memory-mapped, read-only
    ReadOnly = 1,
    /// Cold data - on disk, read with positional I/O
    Disk = 2,
    /// Below the log head (reclaimed) or beyond the tail
    Invalid = 3,
}

/// A monotonic position in the log
///
/// The first record of a fresh log lives at address 0.
/// `u64::MAX` is reserved as the null address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogAddress(u64);

impl LogAddress {
    /// The null/invalid address
    pub const NULL: LogAddress = LogAddress(u64::MAX);

    /// The first address of a fresh log
    pub const ZERO: LogAddress = LogAddress(0);

    /// Create an address from a log position
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Create a null/invalid address
    pub const fn null() -> Self {
        Self::NULL
    }

    /// Check if this address is null/invalid
    pub fn is_null(&self) -> bool {
        self.0 == u64::MAX
    }

    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create from raw u64 value
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Advance by a given number of bytes
    pub fn advance(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to this address
    ///
    /// Callers must ensure `base <= self`.
    pub fn offset_from(&self, base: LogAddress) -> u64 {
        debug_assert!(base.0 <= self.0, "address {self} precedes base {base}");
        self.0 - base.0
    }

    /// Whether the address sits on a record boundary
    pub fn is_aligned(&self) -> bool {
        self.0 % RECORD_ALIGNMENT == 0
    }
}

impl fmt::Debug for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "LogAddress(NULL)")
        } else {
            write!(f, "LogAddress({:#x})", self.0)
        }
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// The three boundaries that split the log into tiers
///
/// `cold_start <= warm_start <= hot_start`; the tail is owned by the hot
/// region and is not part of this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionBoundaries {
    /// Oldest live address; everything below has been reclaimed
    pub cold_start: LogAddress,
    /// First address held by a memory-mapped segment
    pub warm_start: LogAddress,
    /// First address of the mutable region
    pub hot_start: LogAddress,
}

impl RegionBoundaries {
    /// Whether the ordering invariant holds
    pub fn is_ordered(&self) -> bool {
        self.cold_start <= self.warm_start && self.warm_start <= self.hot_start
    }

    /// Classify `address` given the current `tail`
    pub fn region_of(&self, address: LogAddress, tail: LogAddress) -> Region {
        if address.is_null() || address < self.cold_start || address >= tail {
            Region::Invalid
        } else if address >= self.hot_start {
            Region::Mutable
        } else if address >= self.warm_start {
            Region::ReadOnly
        } else {
            Region::Disk
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_address() {
        let addr = LogAddress::null();
        assert!(addr.is_null());
        assert!(!LogAddress::ZERO.is_null());
    }

    #[test]
    fn test_ordering_follows_log_position() {
        let a = LogAddress::new(64);
        let b = a.advance(24);
        assert!(a < b);
        assert_eq!(b.as_u64(), 88);
        assert_eq!(b.offset_from(a), 24);
        assert_eq!(LogAddress::from_u64(b.as_u64()), b);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(11), 16);
        assert_eq!(align_up(16), 16);
        assert!(LogAddress::new(40).is_aligned());
        assert!(!LogAddress::new(41).is_aligned());
    }

    #[test]
    fn test_region_of() {
        let b = RegionBoundaries {
            cold_start: LogAddress::new(100),
            warm_start: LogAddress::new(200),
            hot_start: LogAddress::new(300),
        };
        let tail = LogAddress::new(400);
        assert!(b.is_ordered());
        assert_eq!(b.region_of(LogAddress::new(50), tail), Region::Invalid);
        assert_eq!(b.region_of(LogAddress::new(100), tail), Region::Disk);
        assert_eq!(b.region_of(LogAddress::new(199), tail), Region::Disk);
        assert_eq!(b.region_of(LogAddress::new(200), tail), Region::ReadOnly);
        assert_eq!(b.region_of(LogAddress::new(300), tail), Region::Mutable);
        assert_eq!(b.region_of(LogAddress::new(400), tail), Region::Invalid);
        assert_eq!(b.region_of(LogAddress::NULL, tail), Region::Invalid);
    }

    #[test]
    fn test_empty_tiers() {
        let b = RegionBoundaries::default();
        assert!(b.is_ordered());
        assert_eq!(b.region_of(LogAddress::ZERO, LogAddress::new(8)), Region::Mutable);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", LogAddress::null()), "null");
        assert_eq!(format!("{}", LogAddress::new(0x100)), "0x100");
        assert_eq!(format!("{:?}", LogAddress::new(0x42)), "LogAddress(0x42)");
    }
}
