//! Batched positional reads
//!
//! Cold-tier lookups that arrive together are collected into a [`ReadBatch`]
//! and executed by a single blocking task, sorted by source and offset so the
//! device sees mostly sequential access. Each caller awaits its own oneshot.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{CinderError, Result};

/// Something that can serve reads at a byte offset from blocking context
pub trait BlockSource: Send + Sync + 'static {
    /// Value produced by one read
    type Output: Send + 'static;

    /// Stable identifier used to group reads against the same source
    fn source_id(&self) -> u64;

    /// Blocking read at `offset`
    fn read_at(&self, offset: u64) -> Result<Self::Output>;
}

/// A pending read in a batch
struct PendingRead<S: BlockSource> {
    source: Arc<S>,
    offset: u64,
    callback: oneshot::Sender<Result<S::Output>>,
}

/// A batch of reads waiting to be submitted
pub struct ReadBatch<S: BlockSource> {
    reads: Vec<PendingRead<S>>,
}

impl<S: BlockSource> ReadBatch<S> {
    /// Create a new batch with default size
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    /// Create a new batch with room for `capacity` reads
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            reads: Vec::with_capacity(capacity),
        }
    }

    /// Add a read to the batch
    pub fn add(&mut self, source: Arc<S>, offset: u64) -> oneshot::Receiver<Result<S::Output>> {
        let (tx, rx) = oneshot::channel();
        self.reads.push(PendingRead {
            source,
            offset,
            callback: tx,
        });
        rx
    }

    /// Check if batch is empty
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Get batch size
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    /// Execute every read on one blocking task
    ///
    /// Must be called from within a tokio runtime. Receivers whose caller
    /// has gone away are skipped silently.
    pub fn submit(mut self) -> JoinHandle<()> {
        let mut reads = std::mem::take(&mut self.reads);
        reads.sort_by_key(|r| (r.source.source_id(), r.offset));

        tokio::task::spawn_blocking(move || {
            let count = reads.len();
            let start = Instant::now();
            for read in reads {
                let result = read.source.read_at(read.offset);
                let _ = read.callback.send(result);
            }
            trace!(count, elapsed_us = start.elapsed().as_micros() as u64, "Read batch completed");
        })
    }
}

impl<S: BlockSource> Default for ReadBatch<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Await a batched read, mapping a dropped sender to an internal error
pub async fn complete<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await
        .map_err(|_| CinderError::Internal("batched read was cancelled".to_string()))?
}
