//! HybridLog - Three-tier storage engine
//!
//! The HybridLog is inspired by Microsoft's FASTER system. Every key's
//! latest record lives somewhere in one logical, append-only address space
//! that is split into three tiers:
//!
//! 1. **Mutable Region** (Hot): in-memory, written through to a segment
//!    file, updated in place when a new value fits
//! 2. **Read-Only Region** (Warm): memory-mapped immutable segments
//! 3. **Disk Region** (Cold): segment files read with positional and
//!    batched async I/O
//!
//! A lock-free hash index maps each key to its record's address, and the
//! epoch manager keeps retired segments alive while readers still use them.

pub mod address;
pub mod background;
pub mod checksum;
pub mod compaction;
pub mod disk;
pub mod index;
pub mod layout;
pub mod log;
pub mod mutable;
pub mod readonly;
pub mod record;
pub mod recovery;
pub mod segment;
mod shifter;
pub mod telemetry;

pub use address::{LogAddress, Region, RegionBoundaries};
pub use background::{start_background_tasks, BackgroundTaskConfig, BackgroundTaskHandle};
pub use checksum::{recovery_scan, repair_segment, RecoverySummary};
pub use compaction::{
    should_compact, CompactionConfig, CompactionMetrics, CompactionReport, CompactionSnapshot,
    CompactionState,
};
pub use disk::DiskSegment;
pub use index::{HashIndex, Publish};
pub use layout::{RegionLayout, Tier};
pub use log::{HybridLog, HybridLogConfig, HybridLogStats};
pub use mutable::MutableRegion;
pub use readonly::WarmSegment;
pub use record::{Record, RecordKind};
pub use recovery::RecoveryInfo;
pub use telemetry::{HybridLogTelemetry, LatencyTimer, TierMetrics, TierSnapshot};
