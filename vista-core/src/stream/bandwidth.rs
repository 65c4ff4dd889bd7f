//! Bandwidth monitor for adaptive quality control.
//!
//! Tracks `(bytes, elapsed)` observations over a count-bounded rolling
//! window and derives the current throughput in megabits/second. The
//! [`QualityController`](super::quality::QualityController) uses the
//! estimate to pick a quality tier.
//!
//! Throughput is total bits over total time across the window, never a
//! mean of per-sample rates, so many small fast frames cannot inflate the
//! estimate.

use std::collections::VecDeque;

/// Default number of samples kept in the window.
pub const DEFAULT_WINDOW: usize = 30;
/// Default number of samples required before the estimate is trusted.
pub const DEFAULT_MIN_SAMPLES: usize = 3;
/// Default estimate returned while the window is cold (low tier).
pub const DEFAULT_COLD_MBPS: f64 = 1.0;

/// One frame-transmission observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub bytes: u64,
    /// Elapsed milliseconds, clamped to at least 1.
    pub elapsed_ms: u64,
}

/// Rolling-window bandwidth monitor.
#[derive(Debug, Clone)]
pub struct BandwidthMonitor {
    samples: VecDeque<BandwidthSample>,
    /// Maximum number of samples in the window.
    capacity: usize,
    /// Samples required before the estimate replaces `cold_mbps`.
    min_samples: usize,
    /// Estimate reported while cold.
    cold_mbps: f64,
    /// Running totals over the window.
    total_bytes: u64,
    total_ms: u64,
}

impl BandwidthMonitor {
    /// Create a monitor with the default window and cold estimate.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW, DEFAULT_MIN_SAMPLES, DEFAULT_COLD_MBPS)
    }

    /// Create a monitor with an explicit window size, warm-up threshold and
    /// cold-start estimate.
    pub fn with_window(capacity: usize, min_samples: usize, cold_mbps: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            min_samples: min_samples.clamp(1, capacity),
            cold_mbps: cold_mbps.max(0.0),
            total_bytes: 0,
            total_ms: 0,
        }
    }

    /// Record that `bytes` took `elapsed_ms` to produce and transmit.
    pub fn record(&mut self, bytes: u64, elapsed_ms: u64) {
        let sample = BandwidthSample {
            bytes,
            elapsed_ms: elapsed_ms.max(1),
        };
        if self.samples.len() == self.capacity {
            self.evict_oldest();
        }
        self.total_bytes = self.total_bytes.saturating_add(sample.bytes);
        self.total_ms = self.total_ms.saturating_add(sample.elapsed_ms);
        self.samples.push_back(sample);
    }

    /// Estimated throughput in megabits/second.
    ///
    /// Returns the conservative cold estimate until the window holds at
    /// least `min_samples` observations.
    pub fn estimate_mbps(&self) -> f64 {
        if !self.is_warm() || self.total_ms == 0 {
            return self.cold_mbps;
        }
        // bits / ms / 1000 == megabits / s
        (self.total_bytes as f64 * 8.0) / (self.total_ms as f64 * 1000.0)
    }

    /// Whether enough samples exist for a measured estimate.
    pub fn is_warm(&self) -> bool {
        self.samples.len() >= self.min_samples
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Drop every sample.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.total_bytes = 0;
        self.total_ms = 0;
    }

    // ── Internal ─────────────────────────────────────────────────

    fn evict_oldest(&mut self) {
        if let Some(old) = self.samples.pop_front() {
            self.total_bytes = self.total_bytes.saturating_sub(old.bytes);
            self.total_ms = self.total_ms.saturating_sub(old.elapsed_ms);
        }
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
