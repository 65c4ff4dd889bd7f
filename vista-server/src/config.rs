//! Configuration for the Vista streaming server.
//!
//! Loaded from a TOML file, then overlaid with `VISTA_*` environment
//! variables. Out-of-range values are clamped when converted into the
//! core [`StreamConfig`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vista_core::stream::quality::{FPS_RANGE, QUALITY_RANGE};
use vista_core::{InputLimits, QualityConfig, QualityParams, StreamConfig, TierPolicy, Viewport};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Session lifetime settings.
    pub sessions: SessionsConfig,
    /// Frame rate and quality policy.
    pub quality: QualitySection,
    /// Render driver sidecar.
    pub driver: DriverConfig,
    /// Performance tuning.
    pub performance: PerformanceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address subscribers connect to.
    pub listen_addr: String,
    /// Outbound messages buffered per connection.
    pub outbound_queue: usize,
}

/// Session lifetime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Seconds without activity before a session is evicted.
    pub idle_timeout_secs: u64,
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum concurrently live sessions.
    pub max_sessions: usize,
    /// Viewport for sessions created without one.
    pub viewport_width: u32,
    pub viewport_height: u32,
}

/// Frame rate and quality policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    /// Frame rate before any bandwidth measurement.
    pub default_fps: u8,
    /// Quality before any bandwidth measurement.
    pub default_quality: u8,
    /// Cap applied to every tier's frame rate.
    pub max_fps: u8,
    /// Estimate (Mbps) above which the high tier applies.
    pub high_mbps: f64,
    /// Estimate (Mbps) at or above which the mid tier applies.
    pub mid_mbps: f64,
    /// Relative hysteresis band around each threshold.
    pub hysteresis: f64,
    /// Bandwidth samples in the rolling window.
    pub window: usize,
    /// Samples required before the estimate is trusted.
    pub min_samples: usize,
    /// Estimate (Mbps) assumed while the window is cold.
    pub cold_mbps: f64,
    /// zstd level of the built-in encoder.
    pub encoder_level: i32,
}

/// Render driver sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Address of the browser automation driver.
    pub addr: String,
    pub connect_timeout_ms: u64,
    /// Per-request read/write timeout.
    pub io_timeout_ms: u64,
}

/// Performance tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrent blocking renderer/encoder calls.
    pub worker_threads: usize,
    /// Frames a subscriber may skip in a row before it is dropped.
    pub stall_limit: u32,
    pub max_scroll_delta: i32,
    pub max_text_len: usize,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive: "trace", "debug", "info", ...
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7440".into(),
            outbound_queue: vista_core::stream::transport::DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 15,
            max_sessions: 32,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            default_fps: 30,
            default_quality: 85,
            max_fps: 60,
            high_mbps: 5.0,
            mid_mbps: 1.5,
            hysteresis: 0.1,
            window: 30,
            min_samples: 3,
            cold_mbps: 1.0,
            encoder_level: 3,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9515".into(),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 10_000,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 8,
            stall_limit: 300,
            max_scroll_delta: 10_000,
            max_text_len: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Overlay `VISTA_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`. Unparseable values are ignored with
    /// a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!("ignoring {key}={raw}: not a valid value"),
                }
            }
        }

        set(&lookup, "VISTA_LISTEN_ADDR", &mut self.network.listen_addr);
        set(&lookup, "VISTA_IDLE_TIMEOUT_SECS", &mut self.sessions.idle_timeout_secs);
        set(&lookup, "VISTA_SWEEP_INTERVAL_SECS", &mut self.sessions.sweep_interval_secs);
        set(&lookup, "VISTA_MAX_SESSIONS", &mut self.sessions.max_sessions);
        set(&lookup, "VISTA_DEFAULT_FPS", &mut self.quality.default_fps);
        set(&lookup, "VISTA_DEFAULT_QUALITY", &mut self.quality.default_quality);
        set(&lookup, "VISTA_MAX_FPS", &mut self.quality.max_fps);
        set(&lookup, "VISTA_HIGH_MBPS", &mut self.quality.high_mbps);
        set(&lookup, "VISTA_MID_MBPS", &mut self.quality.mid_mbps);
        set(&lookup, "VISTA_HYSTERESIS", &mut self.quality.hysteresis);
        set(&lookup, "VISTA_WORKER_THREADS", &mut self.performance.worker_threads);
        set(&lookup, "VISTA_DRIVER_ADDR", &mut self.driver.addr);
        set(&lookup, "VISTA_LOG", &mut self.logging.level);
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.network.listen_addr.parse()
    }

    /// Convert into the core configuration, clamping out-of-range values.
    pub fn to_stream_config(&self) -> StreamConfig {
        let q = &self.quality;
        let mid_mbps = q.mid_mbps.max(0.0);
        let policy = TierPolicy {
            high_mbps: q.high_mbps.max(mid_mbps),
            mid_mbps,
            hysteresis: q.hysteresis.clamp(0.0, 0.5),
            ..TierPolicy::default()
        }
        .with_max_fps(q.max_fps);

        let defaults = QualityParams {
            fps: q.default_fps.clamp(FPS_RANGE.0, FPS_RANGE.1),
            quality: q.default_quality.clamp(QUALITY_RANGE.0, QUALITY_RANGE.1),
        };

        let viewport = Viewport::new(self.sessions.viewport_width, self.sessions.viewport_height)
            .unwrap_or_default();

        StreamConfig {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs.max(1)),
            sweep_interval: Duration::from_secs(self.sessions.sweep_interval_secs.max(1)),
            max_sessions: self.sessions.max_sessions.max(1),
            worker_threads: self.performance.worker_threads.clamp(1, 256),
            stall_limit: self.performance.stall_limit.max(1),
            default_viewport: viewport,
            quality: QualityConfig {
                defaults,
                policy,
                window: q.window.max(1),
                min_samples: q.min_samples.clamp(1, q.window.max(1)),
                cold_mbps: q.cold_mbps.max(0.0),
            },
            input: InputLimits {
                max_scroll_delta: self.performance.max_scroll_delta.max(1),
                max_text_len: self.performance.max_text_len.max(1),
            },
        }
    }

    pub fn driver_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.connect_timeout_ms.max(1))
    }

    pub fn driver_io_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.io_timeout_ms.max(1))
    }
}

// ── Tests ────────────────────────────────────────────────────────
