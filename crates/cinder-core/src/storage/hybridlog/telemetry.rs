//! Per-tier counters for the HybridLog
//!
//! Each tier counts the reads it served, their latency, and the bytes that
//! moved into and out of it through shifts and compaction. The counters are
//! plain atomics read by `HybridLog::stats`; nothing here exports them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::layout::Tier;

/// Counters for one tier
#[derive(Debug)]
pub struct TierMetrics {
    tier: Tier,
    reads: AtomicU64,
    read_nanos: AtomicU64,
    max_read_nanos: AtomicU64,
    read_errors: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    segments_in: AtomicU64,
    segments_out: AtomicU64,
}

impl TierMetrics {
    /// Zeroed counters for `tier`
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            reads: AtomicU64::new(0),
            read_nanos: AtomicU64::new(0),
            max_read_nanos: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            segments_in: AtomicU64::new(0),
            segments_out: AtomicU64::new(0),
        }
    }

    /// The tier these counters describe
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Count a served read and its latency
    pub fn record_read(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_read_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Count a read that failed
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a segment of `bytes` entering the tier
    pub fn record_inflow(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.segments_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a segment of `bytes` leaving the tier
    pub fn record_outflow(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.segments_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> TierSnapshot {
        let reads = self.reads.load(Ordering::Relaxed);
        let total = self.read_nanos.load(Ordering::Relaxed);

        TierSnapshot {
            tier: self.tier,
            reads,
            read_errors: self.read_errors.load(Ordering::Relaxed),
            avg_read_latency: if reads > 0 {
                Duration::from_nanos(total / reads)
            } else {
                Duration::ZERO
            },
            max_read_latency: Duration::from_nanos(self.max_read_nanos.load(Ordering::Relaxed)),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            segments_in: self.segments_in.load(Ordering::Relaxed),
            segments_out: self.segments_out.load(Ordering::Relaxed),
        }
    }
}

/// Copy of one tier's counters
#[derive(Debug, Clone, PartialEq)]
pub struct TierSnapshot {
    /// Tier
    pub tier: Tier,
    /// Reads served
    pub reads: u64,
    /// Reads that returned an error
    pub read_errors: u64,
    /// Mean read latency
    pub avg_read_latency: Duration,
    /// Slowest read seen
    pub max_read_latency: Duration,
    /// Bytes moved into the tier
    pub bytes_in: u64,
    /// Bytes moved out of the tier
    pub bytes_out: u64,
    /// Segments moved into the tier
    pub segments_in: u64,
    /// Segments moved out of the tier
    pub segments_out: u64,
}

/// Counters for all three tiers
#[derive(Debug)]
pub struct HybridLogTelemetry {
    /// In-memory tier
    pub hot: TierMetrics,
    /// Memory-mapped tier
    pub warm: TierMetrics,
    /// On-disk tier
    pub cold: TierMetrics,
}

impl Default for HybridLogTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLogTelemetry {
    pub fn new() -> Self {
        Self {
            hot: TierMetrics::new(Tier::Hot),
            warm: TierMetrics::new(Tier::Warm),
            cold: TierMetrics::new(Tier::Cold),
        }
    }

    /// Counters for `tier`
    pub fn tier(&self, tier: Tier) -> &TierMetrics {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    /// Snapshots ordered hot, warm, cold
    pub fn snapshot_all(&self) -> [TierSnapshot; 3] {
        [self.hot.snapshot(), self.warm.snapshot(), self.cold.snapshot()]
    }
}

/// Times one read and charges it to a tier
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the elapsed time as a read, or count the failure
    pub fn finish<T, E>(self, metrics: &TierMetrics, result: &Result<T, E>) {
        match result {
            Ok(_) => metrics.record_read(self.start.elapsed()),
            Err(_) => metrics.record_read_error(),
        }
    }
}
