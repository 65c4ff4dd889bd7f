//! Wire messages exchanged with subscribers.
//!
//! Inbound and outbound traffic are closed enums. Dispatch is an
//! exhaustive `match` in [`StreamService::handle_message`], so adding a
//! message kind is a compile error until every site handles it.
//!
//! Payloads are serialised with `serde` + `bincode` and framed by
//! [`WireCodec`](crate::codec::WireCodec).
//!
//! [`StreamService::handle_message`]: crate::service::StreamService::handle_message

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, StreamError};
use crate::session::SessionSummary;
use crate::stream::types::{EncodedFrame, Viewport};

// ── ClientMessage ────────────────────────────────────────────────

/// Messages sent by a subscriber.
///
/// Input and quality messages act on the session the subscriber is
/// currently attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    CreateSession {
        session_id: Option<String>,
        viewport: Option<Viewport>,
    },
    CloseSession {
        session_id: String,
    },
    Navigate {
        session_id: String,
        url: String,
    },
    Keepalive {
        session_id: String,
    },
    ListSessions,
    Subscribe {
        session_id: String,
    },
    Unsubscribe,
    /// Receipt of the frame with `sequence`.
    Ack {
        sequence: u64,
    },
    Click {
        x: i32,
        y: i32,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
    Text {
        value: String,
    },
    /// Pin quality (10..=100); disables adaptive mode.
    SetQuality {
        quality: u8,
    },
    /// Pin frame rate (1..=60); disables adaptive mode.
    SetFps {
        fps: u8,
    },
    SetAdaptive {
        enabled: bool,
    },
}

impl ClientMessage {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ── ServerMessage ────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Closed on request.
    Closed,
    /// Evicted by the expiry sweeper.
    IdleTimeout,
    /// The renderer became unusable.
    RenderLost(String),
    /// The server is shutting down.
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::RenderLost(msg) => write!(f, "render lost: {msg}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One encoded frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub session_id: String,
    pub sequence: u64,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub size_bytes: u32,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl FrameMessage {
    pub fn from_frame(session_id: &str, frame: &EncodedFrame) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
            size_bytes: frame.size_bytes() as u32,
            width: frame.width,
            height: frame.height,
            data: frame.data.clone(),
        }
    }
}

/// Messages sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
        created_at_ms: u64,
    },
    /// Confirmation of a subscription with the parameters in force.
    Subscribed {
        session_id: String,
        fps: u8,
        quality: u8,
        adaptive: bool,
    },
    Unsubscribed,
    Frame(FrameMessage),
    QualityChanged {
        session_id: String,
        fps: u8,
        quality: u8,
        adaptive: bool,
    },
    Navigated {
        session_id: String,
        url: String,
    },
    KeepaliveAck {
        session_id: String,
        last_activity_ms: u64,
    },
    /// Result of an input event, sent to the initiating subscriber only.
    InputAck {
        ok: bool,
        error: Option<String>,
    },
    Sessions(Vec<SessionSummary>),
    /// Terminal message; no frame follows it.
    SessionEnded {
        session_id: String,
        reason: EndReason,
    },
    SessionClosed {
        session_id: String,
    },
    Error {
        class: ErrorClass,
        message: String,
    },
}

impl ServerMessage {
    /// Error reply for a failed request.
    pub fn error(err: &StreamError) -> Self {
        Self::Error {
            class: err.class(),
            message: err.to_string(),
        }
    }

    /// Whether this message carries a frame.
    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Frame(_))
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// ── Tests ────────────────────────────────────────────────────────
