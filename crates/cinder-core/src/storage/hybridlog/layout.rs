//! The versioned region layout
//!
//! A [`RegionLayout`] is an immutable description of which segment serves
//! each part of the log. The engine publishes it through one `EpochPtr`, so
//! a reader resolves an address against a single consistent view, and a
//! shift or compaction installs a whole new layout with one pointer swap.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::address::{LogAddress, Region, RegionBoundaries};
use super::disk::DiskSegment;
use super::mutable::MutableRegion;
use super::readonly::WarmSegment;

/// Storage tier of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-memory mutable region
    Hot,
    /// Memory-mapped read-only segments
    Warm,
    /// On-disk segments
    Cold,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an address resolved to
pub enum Resolved<'a> {
    Hot(&'a Arc<MutableRegion>),
    Warm(&'a Arc<WarmSegment>),
    Cold(&'a Arc<DiskSegment>),
    /// Inside a segment whose index entries are being repointed; retry
    Relocating,
    /// Below the log head or past the tail
    Invalid,
}

/// One published arrangement of the log's segments
///
/// Warm and cold segments are ordered by base address and, together with
/// the hot region, cover `[cold_start, tail)` without gaps.
pub struct RegionLayout {
    /// Bumped on every installed change
    pub version: u64,
    pub hot: Arc<MutableRegion>,
    pub warm: Vec<Arc<WarmSegment>>,
    pub cold: Vec<Arc<DiskSegment>>,
    /// Addresses readers must not resolve while compaction repoints them
    pub relocating: Option<Range<LogAddress>>,
}

impl RegionLayout {
    /// A copy of this layout with the version bumped
    pub fn successor(&self) -> RegionLayout {
        RegionLayout {
            version: self.version + 1,
            hot: Arc::clone(&self.hot),
            warm: self.warm.clone(),
            cold: self.cold.clone(),
            relocating: None,
        }
    }

    /// Current region boundaries
    pub fn boundaries(&self) -> RegionBoundaries {
        let hot_start = self.hot.base();
        let warm_start = self.warm.first().map_or(hot_start, |s| s.base());
        let cold_start = self.cold.first().map_or(warm_start, |s| s.base());
        RegionBoundaries {
            cold_start,
            warm_start,
            hot_start,
        }
    }

    /// Address the next append would receive, ignoring concurrent writers
    pub fn tail(&self) -> LogAddress {
        self.hot.tail_address()
    }

    /// Find the segment holding `address`
    pub fn resolve(&self, address: LogAddress) -> Resolved<'_> {
        if self.relocating.as_ref().is_some_and(|r| r.contains(&address)) {
            return Resolved::Relocating;
        }
        match self.boundaries().region_of(address, self.tail()) {
            Region::Mutable => Resolved::Hot(&self.hot),
            Region::ReadOnly => find(&self.warm, address, |s| s.base())
                .map_or(Resolved::Invalid, Resolved::Warm),
            Region::Disk => find(&self.cold, address, |s| s.base())
                .filter(|s| s.contains(address))
                .map_or(Resolved::Invalid, Resolved::Cold),
            Region::Invalid => Resolved::Invalid,
        }
    }

    /// Bytes held by the warm segments
    pub fn warm_bytes(&self) -> u64 {
        self.warm.iter().map(|s| s.len() as u64).sum()
    }

    /// Bytes held by the cold segments
    pub fn cold_bytes(&self) -> u64 {
        self.cold.iter().map(|s| s.len()).sum()
    }
}

/// The last segment starting at or below `address`
fn find<T>(segments: &[Arc<T>], address: LogAddress, base: impl Fn(&T) -> LogAddress) -> Option<&Arc<T>> {
    let idx = segments.partition_point(|s| base(s) <= address);
    idx.checked_sub(1).map(|i| &segments[i])
}

impl fmt::Debug for RegionLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionLayout")
            .field("version", &self.version)
            .field("boundaries", &self.boundaries())
            .field("tail", &self.tail())
            .field("warm_segments", &self.warm.len())
            .field("cold_segments", &self.cold.len())
            .field("relocating", &self.relocating)
            .finish()
    }
}
