//! Relays user input to a session's renderer.
//!
//! Events are validated against the session before anything touches the
//! renderer; a rejected event leaves the session exactly as it was. An
//! accepted event counts as activity and is dispatched on the worker
//! pool, independent of the capture cadence.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;
use crate::session::{Session, SessionRegistry};
use crate::state::SessionState;
use crate::task::WorkerPool;

/// Default bound on a single scroll delta, in pixels.
pub const DEFAULT_MAX_SCROLL_DELTA: i32 = 10_000;
/// Default bound on typed text, in characters.
pub const DEFAULT_MAX_TEXT_LEN: usize = 4096;

/// One user input event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Click { x: i32, y: i32 },
    Scroll { dx: i32, dy: i32 },
    Text(String),
}

impl InputEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::Text(_) => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLimits {
    pub max_scroll_delta: i32,
    pub max_text_len: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_scroll_delta: DEFAULT_MAX_SCROLL_DELTA,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

impl InputLimits {
    /// Check `event` against these limits and `session`'s viewport.
    pub fn validate(&self, session: &Session, event: &InputEvent) -> Result<(), StreamError> {
        match event {
            InputEvent::Click { x, y } => {
                let viewport = session.viewport();
                StreamError::check_range("x", *x as i64, 0, viewport.width as i64 - 1)?;
                StreamError::check_range("y", *y as i64, 0, viewport.height as i64 - 1)?;
            }
            InputEvent::Scroll { dx, dy } => {
                let max = self.max_scroll_delta as i64;
                StreamError::check_range("dx", *dx as i64, -max, max)?;
                StreamError::check_range("dy", *dy as i64, -max, max)?;
            }
            InputEvent::Text(value) => {
                let len = value.chars().count();
                StreamError::check_range("text length", len as i64, 1, self.max_text_len as i64)?;
            }
        }
        Ok(())
    }
}

/// Forwards validated input to render handles.
#[derive(Debug)]
pub struct InputRelay {
    registry: Arc<SessionRegistry>,
    pool: WorkerPool,
    limits: InputLimits,
}

impl InputRelay {
    pub fn new(registry: Arc<SessionRegistry>, pool: WorkerPool, limits: InputLimits) -> Self {
        Self {
            registry,
            pool,
            limits,
        }
    }

    pub fn limits(&self) -> InputLimits {
        self.limits
    }

    pub async fn click(&self, session_id: &str, x: i32, y: i32) -> Result<(), StreamError> {
        self.dispatch(session_id, InputEvent::Click { x, y }).await
    }

    pub async fn scroll(&self, session_id: &str, dx: i32, dy: i32) -> Result<(), StreamError> {
        self.dispatch(session_id, InputEvent::Scroll { dx, dy }).await
    }

    pub async fn text(&self, session_id: &str, value: &str) -> Result<(), StreamError> {
        self.dispatch(session_id, InputEvent::Text(value.to_string()))
            .await
    }

    /// Validate and forward `event` to the session's renderer.
    pub async fn dispatch(&self, session_id: &str, event: InputEvent) -> Result<(), StreamError> {
        let session = self.registry.get(session_id)?;
        if session.ensure_live()? == SessionState::Created {
            return Err(StreamError::Busy(format!("{session_id}: renderer starting")));
        }
        self.limits.validate(&session, &event)?;

        session.touch();
        debug!(session_id, kind = event.kind(), "relaying input");

        let slot = session.render_slot().clone();
        let result = self
            .pool
            .run(move || {
                slot.with(|handle| match &event {
                    InputEvent::Click { x, y } => handle.dispatch_click(*x as u32, *y as u32),
                    InputEvent::Scroll { dx, dy } => handle.dispatch_scroll(*dx, *dy),
                    InputEvent::Text(value) => handle.dispatch_text(value),
                })
            })
            .await;

        match result {
            Err(StreamError::RenderLost(_)) if session.state().is_terminating() => {
                Err(StreamError::SessionClosed(session_id.to_string()))
            }
            other => other,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
