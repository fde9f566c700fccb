//! Storage module for Cinder
//!
//! The storage engine is the HybridLog: a hash index over a tiered,
//! log-structured address space. Lock-free reads are made safe by
//! epoch-based memory reclamation, which lives in [`epoch`] so several
//! engines can share one manager.

pub mod epoch;
pub mod hybridlog;

pub use epoch::{EpochConfig, EpochManager, EpochPtr, EpochStats, Guard};
pub use hybridlog::{
    // Maintenance
    recovery_scan,
    repair_segment,
    start_background_tasks,
    BackgroundTaskConfig,
    BackgroundTaskHandle,
    // Compaction
    CompactionConfig,
    CompactionReport,
    CompactionSnapshot,
    HybridLog,
    HybridLogConfig,
    HybridLogStats,
    LogAddress,
    RecoveryInfo,
    RecoverySummary,
    RegionBoundaries,
    Tier,
    TierSnapshot,
};
