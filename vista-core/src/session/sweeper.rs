//! Idle-session expiry sweeper.
//!
//! Wakes every `interval` and closes sessions idle for longer than
//! `idle_timeout`, so an abandoned session is gone at most
//! `idle_timeout + interval` after its last activity. Exits when the
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::message::EndReason;
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    pub idle_timeout: Duration,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Run the sweeper until `cancel` fires.
#[instrument(skip_all, name = "vista.task.expiry_sweeper")]
pub async fn run_expiry_sweeper(
    registry: Arc<SessionRegistry>,
    config: SweeperConfig,
    cancel: CancellationToken,
) {
    info!(
        idle_timeout_secs = config.idle_timeout.as_secs(),
        interval_secs = config.interval.as_secs(),
        "starting expiry sweeper"
    );

    let mut interval = tokio::time::interval(config.interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_once(&registry, config.idle_timeout).await;
            }
            _ = cancel.cancelled() => {
                info!("expiry sweeper received shutdown signal, exiting");
                break;
            }
        }
    }
}

/// One sweep. Returns the number of sessions evicted.
pub async fn sweep_once(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
    let expired = registry.expired(idle_timeout);
    if expired.is_empty() {
        return 0;
    }

    let evicted = join_all(
        expired
            .iter()
            .map(|id| registry.remove_with_reason(id, EndReason::IdleTimeout)),
    )
    .await
    .into_iter()
    .filter(|closed| *closed)
    .count();

    if evicted > 0 {
        info!(evicted, ?expired, "evicted idle sessions");
    }
    evicted
}
