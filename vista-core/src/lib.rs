//! # vista-core
//!
//! Core library for Vista, a remote page streaming service: headless
//! browser pages rendered elsewhere are captured, compressed and pushed
//! to subscribers, and their input is relayed back.
//!
//! This crate contains:
//! - **Session**: `Session`, `SessionRegistry`, the close sequence and the
//!   idle expiry sweeper
//! - **State**: `SessionState` lifecycle machine
//! - **Stream**: capture pipeline, quality controller, bandwidth monitor,
//!   frame encoder, delivery fan-out and input relay
//! - **Messages**: `ClientMessage` / `ServerMessage` wire enums
//! - **Codec**: `WireCodec` for framed TCP I/O via `tokio_util`
//! - **Task**: `WorkerPool` bounding blocking renderer and encoder calls
//! - **Service**: `StreamService`, the façade a connection layer drives
//! - **Error**: `StreamError`: typed, `thiserror`-based error hierarchy

pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod service;
pub mod session;
pub mod state;
pub mod stream;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{ClientCodec, MAX_FRAME_SIZE, ServerCodec, WireCodec};
pub use config::StreamConfig;
pub use error::{ErrorClass, StreamError};
pub use message::{ClientMessage, EndReason, FrameMessage, ServerMessage};
pub use service::StreamService;
pub use session::{Session, SessionInfo, SessionRegistry, SessionSummary, SweeperConfig};
pub use state::SessionState;
pub use stream::{
    BandwidthMonitor, ChannelTransport, DeliveryFanout, EncodedFrame, FrameEncoder, InputEvent,
    InputLimits, PixelFormat, QualityConfig, QualityController, QualityMode, QualityParams,
    RawFrame, RenderHandle, RenderLauncher, Tier, TierPolicy, Transport, Viewport, ZstdEncoder,
};
pub use task::WorkerPool;
