//! # Cinder
//!
//! A tiered, log-structured key-value storage engine. Recently written data
//! lives in memory, older data in memory-mapped segments and the oldest on
//! disk, all addressed through one lock-free hash index.
//!
//! This is the top-level crate that re-exports the workspace crates for a
//! unified API. `cinder-core` can also be used on its own.
//!
//! ## Crate Organization
//!
//! | Crate | Description |
//! |-------|-------------|
//! | [`cinder-core`] | Epochs, hash index, tiered regions, checkpoints, recovery |
//!
//! [`cinder-core`]: cinder_core

// ── Re-exports from cinder-core ──────────────────────────────────────────────

pub use cinder_core::config;
pub use cinder_core::error;
pub use cinder_core::hooks;
pub use cinder_core::io;
pub use cinder_core::persistence;
pub use cinder_core::storage;
pub use cinder_core::telemetry;

// ── Top-level re-exports for convenience ─────────────────────────────────────

pub use bytes::Bytes;

pub use cinder_core::{
    init_logging, start_background_tasks, BackgroundTaskConfig, BackgroundTaskHandle,
    CheckpointId, CinderError, CompactionReport, Config, HybridLog, HybridLogConfig,
    HybridLogStats, RecoveryInfo, Result, SyncPolicy, WriteEvent, WriteObserver, WriteOp,
};

/// Open (or recover) the engine stored in `path` with the default configuration
pub fn recover(path: impl AsRef<std::path::Path>) -> Result<HybridLog> {
    HybridLog::recover(path)
}
