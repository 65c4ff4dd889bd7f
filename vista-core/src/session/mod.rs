//! Sessions and their registry.
//!
//! A [`Session`] is the unit of ownership: one render handle, one
//! quality controller, one subscriber set and one capture task. The
//! [`SessionRegistry`](registry::SessionRegistry) owns every live
//! session; everything else borrows an `Arc<Session>` for the length of a
//! call or task.
//!
//! Lock order inside a session is `subscribers` before `core`. No path
//! acquires `subscribers` while holding `core`.

pub mod registry;
pub mod sweeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::state::SessionState;
use crate::stream::fanout::SubscriberSet;
use crate::stream::quality::{QualityConfig, QualityController, QualityParams};
use crate::stream::render::{RenderHandle, RenderSlot};
use crate::stream::types::{Viewport, unix_millis};

pub use registry::SessionRegistry;
pub use sweeper::{SweeperConfig, run_expiry_sweeper, sweep_once};

// ── SessionSummary ───────────────────────────────────────────────

/// Point-in-time view of a session, as returned by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub idle_ms: u64,
    pub subscribers: usize,
    pub fps: u8,
    pub quality: u8,
    pub adaptive: bool,
    pub url: Option<String>,
    pub viewport: Viewport,
}

/// Identity of a freshly created session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: SystemTime,
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionCore {
    state: SessionState,
    last_activity: Instant,
    url: Option<String>,
}

/// One remote-rendering session.
pub struct Session {
    id: String,
    viewport: Viewport,
    created_at: SystemTime,
    created_instant: Instant,
    core: Mutex<SessionCore>,
    quality: Mutex<QualityController>,
    subscribers: Mutex<SubscriberSet>,
    render: RenderSlot,
    cancel: CancellationToken,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    /// Latest send→ack round trip observed by the fan-out.
    delivery_rtt_ms: AtomicU64,
}

impl Session {
    /// A new session in `Created` with no render handle.
    pub fn new(id: impl Into<String>, viewport: Viewport, quality: &QualityConfig) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            viewport,
            created_at: SystemTime::now(),
            created_instant: now,
            core: Mutex::new(SessionCore {
                state: SessionState::Created,
                last_activity: now,
                url: None,
            }),
            quality: Mutex::new(QualityController::new(quality)),
            subscribers: Mutex::new(SubscriberSet::default()),
            render: RenderSlot::empty(),
            cancel: CancellationToken::new(),
            capture_task: Mutex::new(None),
            delivery_rtt_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().state
    }

    pub fn current_url(&self) -> Option<String> {
        self.core.lock().url.clone()
    }

    /// `SessionClosed` once teardown has started.
    pub fn ensure_live(&self) -> Result<SessionState, StreamError> {
        let state = self.state();
        if state.is_terminating() {
            return Err(StreamError::SessionClosed(self.id.clone()));
        }
        Ok(state)
    }

    // ── Activity ─────────────────────────────────────────────────

    /// Record activity now. Returns the new wall-clock activity time.
    pub fn touch(&self) -> SystemTime {
        let now = Instant::now();
        self.core.lock().last_activity = now;
        self.wall_clock(now)
    }

    pub fn last_activity(&self) -> Instant {
        self.core.lock().last_activity
    }

    /// `last_activity` projected onto the wall clock.
    pub fn last_activity_wall(&self) -> SystemTime {
        self.wall_clock(self.last_activity())
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    fn wall_clock(&self, at: Instant) -> SystemTime {
        self.created_at + at.saturating_duration_since(self.created_instant)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Install the render handle and become `Ready`.
    ///
    /// If teardown started while the handle was launching, the handle is
    /// handed back so the caller can close it.
    pub fn attach_render(
        &self,
        handle: Box<dyn RenderHandle>,
    ) -> Result<(), Box<dyn RenderHandle>> {
        let mut core = self.core.lock();
        if core.state != SessionState::Created {
            return Err(handle);
        }
        if let Err(handle) = self.render.install(handle) {
            return Err(handle);
        }
        core.state = SessionState::Ready;
        Ok(())
    }

    pub fn fail_init(&self) -> Result<(), StreamError> {
        self.core.lock().state.fail_init()
    }

    pub fn begin_load(&self) -> Result<(), StreamError> {
        self.core.lock().state.begin_load(&self.id)
    }

    /// Leave `Loading`. On success `url` becomes the current page and the
    /// session counts as active.
    pub fn finish_load(&self, url: Option<String>) -> Result<(), StreamError> {
        let mut core = self.core.lock();
        core.state.finish_load()?;
        if let Some(url) = url {
            core.url = Some(url);
            core.last_activity = Instant::now();
        }
        Ok(())
    }

    /// Enter `Closing`. Returns `false` if teardown already started.
    pub fn begin_close(&self) -> bool {
        self.core.lock().state.begin_close(&self.id).is_ok()
    }

    pub fn finish_close(&self) -> Result<(), StreamError> {
        self.core.lock().state.finish_close()
    }

    pub fn render_slot(&self) -> &RenderSlot {
        &self.render
    }

    // ── Capture task ─────────────────────────────────────────────

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn set_capture_task(&self, handle: JoinHandle<()>) {
        *self.capture_task.lock() = Some(handle);
    }

    pub fn take_capture_task(&self) -> Option<JoinHandle<()>> {
        self.capture_task.lock().take()
    }

    // ── Quality ──────────────────────────────────────────────────

    pub fn current_params(&self) -> QualityParams {
        self.quality.lock().current_params()
    }

    pub fn is_adaptive(&self) -> bool {
        self.quality.lock().is_adaptive()
    }

    /// Current parameters and whether they are adaptive, read together.
    pub fn quality_snapshot(&self) -> (QualityParams, bool) {
        let quality = self.quality.lock();
        (quality.current_params(), quality.is_adaptive())
    }

    pub fn estimate_mbps(&self) -> f64 {
        self.quality.lock().estimate_mbps()
    }

    /// Feed one capture cycle to the quality controller.
    pub fn record_sample(&self, bytes: u64, elapsed_ms: u64) -> Option<QualityParams> {
        self.quality.lock().on_sample(bytes, elapsed_ms)
    }

    pub fn set_manual(&self, fps: Option<u8>, quality: Option<u8>) -> Result<QualityParams, StreamError> {
        self.quality.lock().set_manual(fps, quality)
    }

    pub fn enable_adaptive(&self) -> QualityParams {
        self.quality.lock().enable_adaptive()
    }

    pub fn record_delivery_rtt(&self, rtt: Duration) {
        self.delivery_rtt_ms
            .store(rtt.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn delivery_rtt_ms(&self) -> u64 {
        self.delivery_rtt_ms.load(Ordering::Relaxed)
    }

    // ── Subscribers ──────────────────────────────────────────────

    pub(crate) fn subscribers(&self) -> &Mutex<SubscriberSet> {
        &self.subscribers
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.lock().ids()
    }

    // ── Snapshot ─────────────────────────────────────────────────

    pub fn summary(&self) -> SessionSummary {
        let subscribers = self.subscriber_count();
        let (params, adaptive) = self.quality_snapshot();
        let (state, last_activity, url) = {
            let core = self.core.lock();
            (core.state, core.last_activity, core.url.clone())
        };
        SessionSummary {
            id: self.id.clone(),
            state,
            created_at_ms: unix_millis(self.created_at),
            last_activity_ms: unix_millis(self.wall_clock(last_activity)),
            idle_ms: Instant::now()
                .saturating_duration_since(last_activity)
                .as_millis() as u64,
            subscribers,
            fps: params.fps,
            quality: params.quality,
            adaptive,
            url,
            viewport: self.viewport,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("viewport", &self.viewport)
            .field("render", &self.render)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
