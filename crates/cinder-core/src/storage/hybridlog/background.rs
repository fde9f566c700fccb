//! Background maintenance for HybridLog
//!
//! Each enabled task runs on its own tokio interval until the handle's
//! shutdown signal:
//! - epoch advance: reclaims deferred garbage when the foreground is idle
//!   and reports guards that block it
//! - sync: flushes the hot segment for `SyncPolicy::EverySecond` style
//!   durability without waiting for the next write
//! - compaction: rewrites the oldest cold segment whose dead space crosses
//!   the configured thresholds
//! - checkpoint: bounds recovery time

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::log::HybridLog;
use crate::error::{CinderError, Result};

/// Configuration for background tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundTaskConfig {
    /// Periodically advance the epoch
    pub enable_epoch_advance: bool,
    /// Interval between epoch advances
    #[serde(with = "crate::config::duration_millis")]
    pub epoch_interval: Duration,
    /// Periodically sync the hot segment
    pub enable_sync: bool,
    /// Interval between hot segment syncs
    #[serde(with = "crate::config::duration_millis")]
    pub sync_interval: Duration,
    /// Enable background compaction
    pub enable_compaction: bool,
    /// Interval between compaction checks
    #[serde(with = "crate::config::duration_secs")]
    pub compaction_interval: Duration,
    /// Enable periodic checkpoints
    pub enable_checkpoint: bool,
    /// Interval between checkpoints
    #[serde(with = "crate::config::duration_secs")]
    pub checkpoint_interval: Duration,
}

impl Default for BackgroundTaskConfig {
    fn default() -> Self {
        Self {
            enable_epoch_advance: true,
            epoch_interval: Duration::from_millis(10),
            enable_sync: true,
            sync_interval: Duration::from_secs(1),
            enable_compaction: true,
            compaction_interval: Duration::from_secs(300), // 5 minutes
            enable_checkpoint: false,
            checkpoint_interval: Duration::from_secs(600),
        }
    }
}

impl BackgroundTaskConfig {
    /// Reject zero intervals for enabled tasks
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            (self.enable_epoch_advance, self.epoch_interval, "epoch_interval"),
            (self.enable_sync, self.sync_interval, "sync_interval"),
            (self.enable_compaction, self.compaction_interval, "compaction_interval"),
            (self.enable_checkpoint, self.checkpoint_interval, "checkpoint_interval"),
        ];
        for (enabled, interval, name) in intervals {
            if enabled && interval.is_zero() {
                return Err(CinderError::Config(format!(
                    "background.{name} must be non-zero when its task is enabled"
                )));
            }
        }
        Ok(())
    }
}

/// Handle for controlling background tasks
pub struct BackgroundTaskHandle {
    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,
    /// Spawned task handles
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTaskHandle {
    /// Signal background tasks to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of tasks that were started
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for all background tasks to complete
    pub async fn wait(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Start background tasks for the HybridLog
///
/// Must be called from within a tokio runtime. Returns a handle that stops
/// the tasks; dropping it without calling `shutdown` leaves them running.
pub fn start_background_tasks(
    log: Arc<HybridLog>,
    config: BackgroundTaskConfig,
) -> BackgroundTaskHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if config.enable_epoch_advance {
        handles.push(spawn_periodic(
            &log,
            "epoch advance",
            config.epoch_interval,
            false,
            shutdown_rx.clone(),
            |log| async move {
                let epoch = log.epoch();
                if epoch.pending() == 0 {
                    return;
                }
                if !epoch.try_advance() && epoch.since_last_advance() > epoch.stall_timeout() {
                    let stats = epoch.stats();
                    warn!(
                        global_epoch = stats.global_epoch,
                        oldest_active = ?stats.oldest_active_epoch,
                        pending_garbage = stats.pending_garbage,
                        stalled_ms = epoch.since_last_advance().as_millis() as u64,
                        "Epoch has not advanced; a long-lived guard is holding garbage"
                    );
                }
            },
        ));
    }

    if config.enable_sync {
        handles.push(spawn_periodic(
            &log,
            "hot segment sync",
            config.sync_interval,
            false,
            shutdown_rx.clone(),
            |log| async move {
                if let Err(e) = log.sync_hot() {
                    warn!(error = %e, "Background sync failed");
                }
            },
        ));
    }

    if config.enable_compaction {
        handles.push(spawn_periodic(
            &log,
            "compaction",
            config.compaction_interval,
            true,
            shutdown_rx.clone(),
            |log| async move {
                debug!("Background compaction check");
                match tokio::task::spawn_blocking(move || log.compact_if_needed()).await {
                    Ok(Ok(Some(report))) => info!(
                        segment = %report.segment,
                        bytes_reclaimed = report.bytes_reclaimed(),
                        "Background compaction completed"
                    ),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Background compaction failed"),
                    Err(e) => warn!(error = %e, "Background compaction task panicked"),
                }
            },
        ));
    }

    if config.enable_checkpoint {
        handles.push(spawn_periodic(
            &log,
            "checkpoint",
            config.checkpoint_interval,
            true,
            shutdown_rx,
            |log| async move {
                match tokio::task::spawn_blocking(move || log.checkpoint()).await {
                    Ok(Ok(id)) => info!(id, "Background checkpoint completed"),
                    Ok(Err(e)) => warn!(error = %e, "Background checkpoint failed"),
                    Err(e) => warn!(error = %e, "Background checkpoint task panicked"),
                }
            },
        ));
    }

    info!(tasks = handles.len(), "Started HybridLog background tasks");
    BackgroundTaskHandle {
        shutdown_tx,
        handles,
    }
}

/// Run `tick` every `interval` until shutdown is signalled or the log closes
fn spawn_periodic<F, Fut>(
    log: &Arc<HybridLog>,
    name: &'static str,
    interval: Duration,
    skip_first: bool,
    mut shutdown_rx: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<HybridLog>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let log = Arc::clone(log);
    log.background_tasks.fetch_add(1, Ordering::AcqRel);

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        if skip_first {
            // Avoid running right at startup
            interval_timer.tick().await;
        }

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    if log.is_closed() {
                        debug!(task = name, "Log closed, stopping background task");
                        break;
                    }
                    tick(Arc::clone(&log)).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(task = name, "Background task shutting down");
                        break;
                    }
                }
            }
        }

        log.background_tasks.fetch_sub(1, Ordering::AcqRel);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hybridlog::log::test_config;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn quick_config() -> BackgroundTaskConfig {
        BackgroundTaskConfig {
            enable_epoch_advance: true,
            epoch_interval: Duration::from_millis(5),
            enable_sync: true,
            sync_interval: Duration::from_millis(5),
            enable_compaction: true,
            compaction_interval: Duration::from_millis(20),
            enable_checkpoint: true,
            checkpoint_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(BackgroundTaskConfig::default().validate().is_ok());

        let mut config = BackgroundTaskConfig::default();
        config.sync_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.enable_sync = false;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_background_tasks_startup_shutdown() {
        let dir = tempdir().unwrap();
        let log = Arc::new(HybridLog::open(test_config(&dir)).unwrap());
        assert!(!log.are_background_tasks_active());

        let handle = start_background_tasks(Arc::clone(&log), quick_config());
        assert_eq!(handle.task_count(), 4);
        assert!(log.are_background_tasks_active());

        handle.shutdown();
        handle.wait().await;
        assert!(!log.are_background_tasks_active());
    }

    #[tokio::test]
    async fn test_disabled_tasks_are_not_spawned() {
        let dir = tempdir().unwrap();
        let log = Arc::new(HybridLog::open(test_config(&dir)).unwrap());

        let config = BackgroundTaskConfig {
            enable_epoch_advance: false,
            enable_sync: false,
            enable_compaction: false,
            enable_checkpoint: false,
            ..BackgroundTaskConfig::default()
        };
        let handle = start_background_tasks(Arc::clone(&log), config);
        assert_eq!(handle.task_count(), 0);
        assert!(!log.are_background_tasks_active());
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_background_checkpoint_and_compaction_run() {
        let dir = tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.readonly_size = 0;
        cfg.compaction.min_dead_bytes = 0;
        cfg.compaction.dead_space_threshold = 0.5;
        let log = Arc::new(HybridLog::open(cfg).unwrap());

        // Two generations of the same keys, so the oldest segment is dead
        for round in 0..2 {
            for i in 0..20 {
                log.set(
                    Bytes::from(format!("key{i:02}")),
                    Bytes::from(format!("round{round}-{i}")),
                )
                .unwrap();
            }
            log.shift().unwrap();
        }
        log.set(Bytes::from("tail"), Bytes::from("t")).unwrap();
        log.shift().unwrap();

        let handle = start_background_tasks(Arc::clone(&log), quick_config());
        let mut done = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stats = log.stats();
            if stats.checkpoints > 0 && stats.compaction.segments_compacted > 0 {
                done = true;
                break;
            }
        }
        handle.shutdown();
        handle.wait().await;

        assert!(done, "background checkpoint and compaction did not run");
        assert_eq!(log.get(b"key07").unwrap(), Some(Bytes::from("round1-7")));
    }

    #[tokio::test]
    async fn test_tasks_stop_when_log_closes() {
        let dir = tempdir().unwrap();
        let log = Arc::new(HybridLog::open(test_config(&dir)).unwrap());

        let config = BackgroundTaskConfig {
            enable_compaction: false,
            enable_checkpoint: false,
            ..quick_config()
        };
        let handle = start_background_tasks(Arc::clone(&log), config);
        log.close().unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(!log.are_background_tasks_active());
    }
}
