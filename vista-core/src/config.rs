//! Runtime configuration for the streaming core.
//!
//! The server builds a [`StreamConfig`] from its TOML file and
//! environment; tests build one directly.

use std::time::Duration;

use crate::session::SweeperConfig;
use crate::stream::fanout::DEFAULT_STALL_LIMIT;
use crate::stream::input::InputLimits;
use crate::stream::quality::QualityConfig;
use crate::stream::types::Viewport;
use crate::task::DEFAULT_WORKERS;

/// Default idle timeout before a session is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default expiry sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// Default cap on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_sessions: usize,
    /// Concurrent blocking renderer/encoder calls.
    pub worker_threads: usize,
    /// Consecutive skipped frames before a subscriber is dropped.
    pub stall_limit: u32,
    /// Viewport for sessions created without one.
    pub default_viewport: Viewport,
    pub quality: QualityConfig,
    pub input: InputLimits,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
            worker_threads: DEFAULT_WORKERS,
            stall_limit: DEFAULT_STALL_LIMIT,
            default_viewport: Viewport::default(),
            quality: QualityConfig::default(),
            input: InputLimits::default(),
        }
    }
}

impl StreamConfig {
    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            idle_timeout: self.idle_timeout,
            interval: self.sweep_interval,
        }
    }
}
