//! # Cinder Core
//!
//! Core engine for Cinder: epoch-based reclamation, the lock-free hash
//! index, the three-tier HybridLog, checkpoints and recovery.
//!
//! ```no_run
//! use bytes::Bytes;
//! use cinder_core::{HybridLog, HybridLogConfig};
//!
//! # fn main() -> cinder_core::Result<()> {
//! let log = HybridLog::open(HybridLogConfig::with_data_dir("/tmp/cinder"))?;
//! log.set(Bytes::from("user:1"), Bytes::from("alice"))?;
//! assert_eq!(log.get(b"user:1")?, Some(Bytes::from("alice")));
//! log.checkpoint()?;
//! log.close()?;
//! # Ok(())
//! # }
//! ```

// ── Engine ───────────────────────────────────────────────────────────────────

pub mod storage;
pub mod persistence;
pub mod io;
pub mod hooks;

// ── Ambient ──────────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod telemetry;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use config::{Config, LogFormat, LoggingConfig, SyncPolicy};
pub use error::{CinderError, Result};
pub use hooks::{WriteEvent, WriteObserver, WriteOp};
pub use persistence::{CheckpointConfig, CheckpointId, CheckpointMetadata};
pub use storage::epoch::{EpochConfig, EpochManager};
pub use storage::hybridlog::{
    start_background_tasks, BackgroundTaskConfig, BackgroundTaskHandle, CompactionConfig,
    CompactionReport, HybridLog, HybridLogConfig, HybridLogStats, LogAddress, RecoveryInfo,
};
pub use telemetry::init_logging;
