//! Per-session quality controller.
//!
//! Holds the target frame rate and compression quality of one session.
//! In adaptive mode the values follow a three-tier policy driven by the
//! [`BandwidthMonitor`]; in manual mode they are pinned until adaptive
//! mode is re-enabled.
//!
//! ```text
//!            set_manual(..)
//!  Adaptive ───────────────► Manual{fps, quality}
//!     ▲                          │
//!     └──── enable_adaptive() ◄──┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::stream::bandwidth::BandwidthMonitor;

/// Allowed frame-rate range.
pub const FPS_RANGE: (u8, u8) = (1, 60);
/// Allowed quality range.
pub const QUALITY_RANGE: (u8, u8) = (10, 100);

// ── QualityParams ────────────────────────────────────────────────

/// A `(fps, quality)` operating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityParams {
    pub fps: u8,
    pub quality: u8,
}

impl QualityParams {
    /// Build a validated operating point.
    pub fn new(fps: u8, quality: u8) -> Result<Self, StreamError> {
        validate_fps(fps)?;
        validate_quality(quality)?;
        Ok(Self { fps, quality })
    }

    /// Capture interval implied by `fps`.
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            fps: 30,
            quality: 85,
        }
    }
}

pub fn validate_fps(fps: u8) -> Result<(), StreamError> {
    StreamError::check_range(
        "fps",
        i64::from(fps),
        i64::from(FPS_RANGE.0),
        i64::from(FPS_RANGE.1),
    )
}

pub fn validate_quality(quality: u8) -> Result<(), StreamError> {
    StreamError::check_range(
        "quality",
        i64::from(quality),
        i64::from(QUALITY_RANGE.0),
        i64::from(QUALITY_RANGE.1),
    )
}

// ── Tier ─────────────────────────────────────────────────────────

/// A discrete operating point selected from the throughput estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Low,
    Mid,
    High,
}

/// Thresholds and operating points of the three-tier policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    /// Above this estimate (Mbps) the high tier applies.
    pub high_mbps: f64,
    /// At or above this estimate (Mbps) the mid tier applies.
    pub mid_mbps: f64,
    /// Relative band around each threshold, e.g. `0.1` for ±10 %.
    pub hysteresis: f64,
    pub high: QualityParams,
    pub mid: QualityParams,
    pub low: QualityParams,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            high_mbps: 5.0,
            mid_mbps: 1.5,
            hysteresis: 0.1,
            high: QualityParams {
                fps: 30,
                quality: 90,
            },
            mid: QualityParams {
                fps: 20,
                quality: 75,
            },
            low: QualityParams {
                fps: 10,
                quality: 50,
            },
        }
    }
}

impl TierPolicy {
    /// Cap every tier's frame rate at `max_fps`.
    pub fn with_max_fps(mut self, max_fps: u8) -> Self {
        let cap = max_fps.clamp(FPS_RANGE.0, FPS_RANGE.1);
        for p in [&mut self.high, &mut self.mid, &mut self.low] {
            p.fps = p.fps.min(cap);
        }
        self
    }

    /// Operating point of `tier`.
    pub fn params(&self, tier: Tier) -> QualityParams {
        match tier {
            Tier::High => self.high,
            Tier::Mid => self.mid,
            Tier::Low => self.low,
        }
    }

    /// Pick the tier for `mbps` given the tier currently in force.
    ///
    /// A pure function: the same inputs always give the same tier. With a
    /// current tier, crossing a threshold away from it requires clearing
    /// the hysteresis band.
    pub fn select(&self, mbps: f64, current: Option<Tier>) -> Tier {
        let h = self.hysteresis.max(0.0);
        let (high, mid) = match current {
            None => (self.high_mbps, self.mid_mbps),
            Some(cur) => (
                Self::shifted(self.high_mbps, cur == Tier::High, h),
                Self::shifted(self.mid_mbps, cur >= Tier::Mid, h),
            ),
        };

        if mbps > high {
            Tier::High
        } else if mbps >= mid {
            Tier::Mid
        } else {
            Tier::Low
        }
    }

    /// Lower a threshold we sit above (harder to drop), raise one we sit
    /// below (harder to climb).
    fn shifted(threshold: f64, above: bool, h: f64) -> f64 {
        if above {
            threshold * (1.0 - h)
        } else {
            threshold * (1.0 + h)
        }
    }
}

// ── QualityMode ──────────────────────────────────────────────────

/// Whether the parameters follow the bandwidth estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMode {
    /// Parameters follow the tier policy. `tier` is `None` until the
    /// first recomputation.
    Adaptive { tier: Option<Tier> },
    /// Parameters pinned by the user.
    Manual(QualityParams),
}

// ── QualityController ────────────────────────────────────────────

/// Settings shared by every session's controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityConfig {
    /// Operating point before any measurement.
    pub defaults: QualityParams,
    pub policy: TierPolicy,
    /// Bandwidth window size in samples.
    pub window: usize,
    /// Samples needed before the estimate is trusted.
    pub min_samples: usize,
    /// Estimate used while the window is cold.
    pub cold_mbps: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            defaults: QualityParams::default(),
            policy: TierPolicy::default(),
            window: crate::stream::bandwidth::DEFAULT_WINDOW,
            min_samples: crate::stream::bandwidth::DEFAULT_MIN_SAMPLES,
            cold_mbps: crate::stream::bandwidth::DEFAULT_COLD_MBPS,
        }
    }
}

/// Per-session quality controller.
#[derive(Debug, Clone)]
pub struct QualityController {
    monitor: BandwidthMonitor,
    policy: TierPolicy,
    defaults: QualityParams,
    mode: QualityMode,
    /// Parameters currently in force.
    params: QualityParams,
}

impl QualityController {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            monitor: BandwidthMonitor::with_window(
                config.window,
                config.min_samples,
                config.cold_mbps,
            ),
            policy: config.policy,
            defaults: config.defaults,
            mode: QualityMode::Adaptive { tier: None },
            params: config.defaults,
        }
    }

    /// Parameters currently in force.
    pub fn current_params(&self) -> QualityParams {
        self.params
    }

    pub fn mode(&self) -> QualityMode {
        self.mode
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self.mode, QualityMode::Adaptive { .. })
    }

    /// Current throughput estimate in Mbps.
    pub fn estimate_mbps(&self) -> f64 {
        self.monitor.estimate_mbps()
    }

    /// Feed one transmission observation.
    ///
    /// Returns the new parameters when they changed.
    pub fn on_sample(&mut self, bytes: u64, elapsed_ms: u64) -> Option<QualityParams> {
        self.monitor.record(bytes, elapsed_ms);
        match self.mode {
            QualityMode::Adaptive { tier } => self.apply_tier(tier),
            QualityMode::Manual(_) => None,
        }
    }

    /// Pin the given values and disable adaptation.
    ///
    /// Values not supplied keep their current setting. On a range error
    /// nothing changes.
    pub fn set_manual(
        &mut self,
        fps: Option<u8>,
        quality: Option<u8>,
    ) -> Result<QualityParams, StreamError> {
        if let Some(fps) = fps {
            validate_fps(fps)?;
        }
        if let Some(quality) = quality {
            validate_quality(quality)?;
        }
        let pinned = QualityParams {
            fps: fps.unwrap_or(self.params.fps),
            quality: quality.unwrap_or(self.params.quality),
        };
        self.mode = QualityMode::Manual(pinned);
        self.params = pinned;
        Ok(pinned)
    }

    /// Re-enable adaptation, recomputing from the latest estimate.
    ///
    /// With no sample ever recorded the configured defaults come back.
    pub fn enable_adaptive(&mut self) -> QualityParams {
        if self.monitor.sample_count() == 0 {
            self.mode = QualityMode::Adaptive { tier: None };
            self.params = self.defaults;
        } else {
            self.mode = QualityMode::Adaptive { tier: None };
            self.apply_tier(None);
        }
        self.params
    }

    // ── Internal ─────────────────────────────────────────────────

    fn apply_tier(&mut self, current: Option<Tier>) -> Option<QualityParams> {
        let next = self.policy.select(self.monitor.estimate_mbps(), current);
        self.mode = QualityMode::Adaptive { tier: Some(next) };
        if current == Some(next) {
            return None;
        }
        let params = self.policy.params(next);
        if params == self.params {
            return None;
        }
        self.params = params;
        Some(params)
    }
}

// ── Tests ────────────────────────────────────────────────────────
