//! Domain-specific error types for the Vista streaming core.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Every variant belongs to one [`ErrorClass`] so callers can tell
//! caller-fixable input errors from session-lifecycle errors from
//! transient conditions without string matching.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── ErrorClass ───────────────────────────────────────────────────

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad input from the caller. Rejected synchronously, session untouched.
    Input,
    /// The session is absent, closed, or its renderer is unusable.
    Lifecycle,
    /// Temporary condition; retrying may succeed.
    Transient,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

// ── StreamError ──────────────────────────────────────────────────

/// The canonical error type for the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Input Errors ─────────────────────────────────────────────
    /// A numeric parameter fell outside its allowed range.
    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    InvalidRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A navigation target could not be parsed or is not http(s).
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// An inbound message was malformed or not valid in this context.
    #[error("protocol violation: {0}")]
    Protocol(String),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// Unknown session or subscriber.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// A session with the supplied id already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// The session is closing or closed.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The configured maximum number of live sessions is reached.
    #[error("session limit reached ({max})")]
    CapacityExceeded { max: usize },

    /// The renderer could not be started for a new session.
    #[error("render init failed: {0}")]
    RenderInitFailed(String),

    /// The renderer of a running session became unusable.
    #[error("render lost: {0}")]
    RenderLost(String),

    /// The renderer rejected a navigation. The session stays live.
    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    // ── Transient Errors ─────────────────────────────────────────
    /// The session is busy with a conflicting operation (e.g. a navigation).
    #[error("session busy: {0}")]
    Busy(String),

    /// Encoding a captured frame failed. The cycle is skipped.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The transport could not deliver a message to a subscriber.
    #[error("delivery to {subscriber} failed: {reason}")]
    Delivery { subscriber: String, reason: String },

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Encoding or decoding of a wire payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker panicked or was cancelled.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl StreamError {
    /// Shorthand for an unknown session.
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "session",
            id: id.into(),
        }
    }

    /// Shorthand for an unknown subscriber.
    pub fn subscriber_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "subscriber",
            id: id.into(),
        }
    }

    /// Range check helper used by every validated parameter.
    pub fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), Self> {
        if value < min || value > max {
            return Err(Self::InvalidRange {
                field,
                value,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Which class of failure this is.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRange { .. } | Self::InvalidUrl(_) | Self::Protocol(_) => {
                ErrorClass::Input
            }
            Self::NotFound { .. }
            | Self::AlreadyExists(_)
            | Self::SessionClosed(_)
            | Self::CapacityExceeded { .. }
            | Self::RenderInitFailed(_)
            | Self::RenderLost(_)
            | Self::NavigationFailed(_) => ErrorClass::Lifecycle,
            Self::Busy(_)
            | Self::Encode(_)
            | Self::Delivery { .. }
            | Self::ChannelClosed
            | Self::Timeout(_)
            | Self::Encoding(_)
            | Self::Io(_)
            | Self::Worker(_) => ErrorClass::Transient,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for StreamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StreamError::Encoding(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(e: tokio::task::JoinError) -> Self {
        StreamError::Worker(e.to_string())
    }
}
