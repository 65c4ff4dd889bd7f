//! Remote page renderer seam.
//!
//! A [`RenderHandle`] is one live connection to a headless browser page
//! behind an automation driver. Every method is a **blocking** call (a
//! screenshot can take tens of milliseconds), so the pipeline only ever
//! invokes them from the [`WorkerPool`](crate::task::WorkerPool).
//!
//! [`RenderLauncher`] opens new handles for freshly created sessions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::stream::types::{RawFrame, Viewport};

/// One remote-rendering connection. Exclusively owned by its session.
pub trait RenderHandle: Send {
    /// Load `url` in the page.
    fn navigate(&mut self, url: &str) -> Result<(), StreamError>;

    /// Take a screenshot of the current page.
    fn capture_frame(&mut self) -> Result<RawFrame, StreamError>;

    /// Click at viewport coordinates.
    fn dispatch_click(&mut self, x: u32, y: u32) -> Result<(), StreamError>;

    /// Scroll by a delta in pixels.
    fn dispatch_scroll(&mut self, dx: i32, dy: i32) -> Result<(), StreamError>;

    /// Type text into the focused element.
    fn dispatch_text(&mut self, text: &str) -> Result<(), StreamError>;

    /// Release the remote page. Called exactly once.
    fn close(&mut self);
}

/// Opens render handles.
pub trait RenderLauncher: Send + Sync {
    fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderHandle>, StreamError>;
}

// ── RenderSlot ───────────────────────────────────────────────────

/// Shared slot holding a session's render handle until it is released.
///
/// Blocking workers lock the slot for the duration of one renderer call,
/// which serialises calls into a single page. `release` takes the handle
/// out so it is closed exactly once.
#[derive(Clone)]
pub struct RenderSlot {
    inner: Arc<Mutex<Option<Box<dyn RenderHandle>>>>,
}

impl RenderSlot {
    pub fn new(handle: Box<dyn RenderHandle>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// A slot with no handle yet.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Put `handle` into an empty slot. An occupied slot hands it back.
    pub fn install(&self, handle: Box<dyn RenderHandle>) -> Result<(), Box<dyn RenderHandle>> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(handle);
        }
        *guard = Some(handle);
        Ok(())
    }

    /// Run `f` against the handle. Blocking; call from a worker.
    ///
    /// Fails with [`StreamError::RenderLost`] once the handle is released.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn RenderHandle) -> Result<R, StreamError>,
    ) -> Result<R, StreamError> {
        let mut guard = self.inner.lock();
        match guard.as_mut() {
            Some(handle) => f(handle.as_mut()),
            None => Err(StreamError::RenderLost("render handle released".into())),
        }
    }

    /// Take the handle out and close it. Returns `false` if it was
    /// already released. Blocking; call from a worker.
    pub fn release(&self) -> bool {
        let taken = self.inner.lock().take();
        match taken {
            Some(mut handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl std::fmt::Debug for RenderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSlot")
            .field("released", &self.is_released())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
