//! Authoritative map of live sessions.
//!
//! Sharded by id through `DashMap`, so operations on different sessions
//! never contend. The registry also owns the close sequence:
//!
//! 1. `Closing`: no new subscriptions, no new capture cycles
//! 2. cancel the capture task and await it
//! 3. release the render handle
//! 4. seal the subscriber set with `SessionEnded`
//! 5. `Closed`, then drop the entry

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::message::{EndReason, ServerMessage};
use crate::session::{Session, SessionSummary};
use crate::stream::encoder::FrameEncoder;
use crate::stream::fanout::DeliveryFanout;
use crate::stream::pipeline::{CapturePipeline, PipelineExit};
use crate::stream::quality::QualityConfig;
use crate::stream::render::{RenderLauncher, RenderSlot};
use crate::stream::types::Viewport;
use crate::task::WorkerPool;

/// Longest accepted caller-supplied session id, in characters.
pub const MAX_ID_LEN: usize = 128;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    /// Entries plus in-flight creations, bounded by `max_sessions`.
    reserved: AtomicUsize,
    max_sessions: usize,
    default_viewport: Viewport,
    quality: QualityConfig,
    launcher: Arc<dyn RenderLauncher>,
    encoder: Arc<dyn FrameEncoder>,
    fanout: Arc<DeliveryFanout>,
    pool: WorkerPool,
}

impl SessionRegistry {
    pub fn new(
        config: &StreamConfig,
        launcher: Arc<dyn RenderLauncher>,
        encoder: Arc<dyn FrameEncoder>,
        fanout: Arc<DeliveryFanout>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions: config.max_sessions.max(1),
            default_viewport: config.default_viewport,
            quality: config.quality,
            launcher,
            encoder,
            fanout,
            pool,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn fanout(&self) -> &Arc<DeliveryFanout> {
        &self.fanout
    }

    /// Create a session, launch its renderer and start capturing.
    ///
    /// The entry is visible in `Created` while the renderer launches. On
    /// launch failure it is removed again and `RenderInitFailed` is
    /// returned.
    pub async fn create(
        self: &Arc<Self>,
        id: Option<String>,
        viewport: Option<Viewport>,
    ) -> Result<Arc<Session>, StreamError> {
        let id = match id {
            Some(id) => {
                let len = id.chars().count();
                StreamError::check_range("session id length", len as i64, 1, MAX_ID_LEN as i64)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let viewport = viewport.unwrap_or(self.default_viewport);
        Viewport::new(viewport.width, viewport.height)?;

        self.reserve()?;
        let session = Arc::new(Session::new(id.clone(), viewport, &self.quality));
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.unreserve();
                return Err(StreamError::AlreadyExists(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
            }
        }

        let launcher = Arc::clone(&self.launcher);
        let launched = self.pool.run(move || launcher.launch(viewport)).await;
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = %id, error = %e, "renderer launch failed");
                let _ = session.fail_init();
                self.forget(&session);
                return Err(match e {
                    StreamError::RenderInitFailed(_) => e,
                    other => StreamError::RenderInitFailed(other.to_string()),
                });
            }
        };

        if let Err(handle) = session.attach_render(handle) {
            // Closed while launching; the close sequence already ran.
            let slot = RenderSlot::new(handle);
            let _ = self.pool.run(move || Ok(slot.release())).await;
            return Err(StreamError::SessionClosed(id));
        }

        self.start_capture(&session);
        info!(
            session_id = %id,
            width = viewport.width,
            height = viewport.height,
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, StreamError> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StreamError::session_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Close `id` on request. See [`remove_with_reason`](Self::remove_with_reason).
    pub async fn remove(&self, id: &str) -> bool {
        self.remove_with_reason(id, EndReason::Closed).await
    }

    /// Run the close sequence for `id`.
    ///
    /// Returns `true` if this call closed the session; `false` if it was
    /// absent or already closing. Idempotent.
    pub async fn remove_with_reason(&self, id: &str, reason: EndReason) -> bool {
        let Ok(session) = self.get(id) else {
            return false;
        };
        if !session.begin_close() {
            return false;
        }

        session.cancel();
        if let Some(task) = session.take_capture_task() {
            if let Err(e) = task.await {
                error!(session_id = %id, error = %e, "capture task panicked");
            }
        }

        let slot = session.render_slot().clone();
        if let Err(e) = self.pool.run(move || Ok(slot.release())).await {
            warn!(session_id = %id, error = %e, "render handle release failed");
        }

        let notified = self.fanout.seal(
            &session,
            ServerMessage::SessionEnded {
                session_id: id.to_string(),
                reason: reason.clone(),
            },
        );

        let _ = session.finish_close();
        self.forget(&session);
        info!(session_id = %id, %reason, subscribers = notified, "session closed");
        true
    }

    /// Snapshot of every session, oldest first, ties broken by id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        sessions.iter().map(|s| s.summary()).collect()
    }

    /// Ids of live sessions idle for longer than `timeout`.
    pub fn expired(&self, timeout: std::time::Duration) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                !s.state().is_terminating() && s.idle_for() > timeout
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Close every session with `reason`.
    pub async fn close_all(&self, reason: EndReason) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let closed = join_all(
            ids.iter()
                .map(|id| self.remove_with_reason(id, reason.clone())),
        )
        .await;
        closed.into_iter().filter(|c| *c).count()
    }

    // ── Internal ─────────────────────────────────────────────────

    fn reserve(&self) -> Result<(), StreamError> {
        let max = self.max_sessions;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| StreamError::CapacityExceeded { max })
    }

    fn unreserve(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop the entry if it still holds `session`.
    fn forget(&self, session: &Arc<Session>) {
        if self
            .sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session))
            .is_some()
        {
            self.unreserve();
        }
    }

    /// Spawn the capture task. A lost renderer closes the session from a
    /// separate task, since the close sequence awaits this one.
    fn start_capture(self: &Arc<Self>, session: &Arc<Session>) {
        let pipeline = CapturePipeline::new(
            Arc::clone(session),
            Arc::clone(&self.fanout),
            Arc::clone(&self.encoder),
            self.pool.clone(),
        );
        let registry = Arc::clone(self);
        let id = session.id().to_string();
        let task = tokio::spawn(async move {
            if let PipelineExit::RenderLost(cause) = pipeline.run().await {
                error!(session_id = %id, %cause, "renderer lost; closing session");
                tokio::spawn(async move {
                    registry
                        .remove_with_reason(&id, EndReason::RenderLost(cause))
                        .await;
                });
            }
        });
        session.set_capture_task(task);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}
