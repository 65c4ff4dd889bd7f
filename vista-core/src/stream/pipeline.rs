//! Per-session capture → encode → deliver loop.
//!
//! One [`CapturePipeline`] runs as a tokio task per session. Capture and
//! encode are blocking and go through the shared [`WorkerPool`]; the
//! loop itself only paces, measures and hands frames to the fan-out.
//!
//! ```text
//!   ┌──────────┐  pool  ┌──────────┐  pool  ┌──────────┐       ┌────────┐
//!   │  render  │──────►│  encoder  │──────►│ quality  │──────►│ fanout │
//!   │ capture  │ raw    │ (zstd)   │ bytes  │ sample   │ frame │        │
//!   └──────────┘        └──────────┘        └──────────┘       └────────┘
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::message::ServerMessage;
use crate::session::Session;
use crate::stream::encoder::FrameEncoder;
use crate::stream::fanout::DeliveryFanout;
use crate::stream::types::{EncodedFrame, unix_millis};
use crate::task::WorkerPool;

/// Why the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// The session's cancellation token fired.
    Cancelled,
    /// The renderer failed; the session must be closed.
    RenderLost(String),
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Frame handed to this many subscribers.
    Delivered(usize),
    /// Session not `Ready`.
    NotReady,
    /// Nobody is watching.
    NoSubscribers,
    /// Encoding failed; the session continues.
    EncodeFailed,
    /// Cancelled between capture and delivery.
    Cancelled,
}

pub struct CapturePipeline {
    session: Arc<Session>,
    fanout: Arc<DeliveryFanout>,
    encoder: Arc<dyn FrameEncoder>,
    pool: WorkerPool,
    sequence: u64,
}

impl CapturePipeline {
    pub fn new(
        session: Arc<Session>,
        fanout: Arc<DeliveryFanout>,
        encoder: Arc<dyn FrameEncoder>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            session,
            fanout,
            encoder,
            pool,
            sequence: 0,
        }
    }

    /// Sequence number of the last frame produced.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn spawn(self) -> JoinHandle<PipelineExit> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled or the renderer is lost.
    ///
    /// The cadence is re-read from the quality controller every cycle.
    pub async fn run(mut self) -> PipelineExit {
        let cancel = self.session.cancel_token();
        info!(session_id = %self.session.id(), "capture pipeline started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let cycle_start = Instant::now();
            let interval = self.session.current_params().frame_interval();

            match self.cycle().await {
                Ok(CycleOutcome::Delivered(n)) => {
                    debug!(
                        session_id = %self.session.id(),
                        sequence = self.sequence,
                        subscribers = n,
                        "frame delivered"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        session_id = %self.session.id(),
                        error = %e,
                        "capture failed; renderer lost"
                    );
                    return PipelineExit::RenderLost(e.to_string());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = Self::pace(cycle_start, interval) => {}
            }
        }

        info!(
            session_id = %self.session.id(),
            frames = self.sequence,
            "capture pipeline stopped"
        );
        PipelineExit::Cancelled
    }

    /// One capture cycle. An `Err` means the renderer is unusable.
    pub async fn cycle(&mut self) -> Result<CycleOutcome, StreamError> {
        if !self.session.state().is_capturable() {
            return Ok(CycleOutcome::NotReady);
        }
        if self.session.subscriber_count() == 0 {
            return Ok(CycleOutcome::NoSubscribers);
        }

        let started = Instant::now();
        let captured_wall = SystemTime::now();

        // 1. Capture.
        let slot = self.session.render_slot().clone();
        let raw = self
            .pool
            .run(move || slot.with(|handle| handle.capture_frame()))
            .await?;

        if self.session.cancel_token().is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        // 2. Encode.
        let (width, height) = (raw.width, raw.height);
        let quality = self.session.current_params().quality;
        let encoder = Arc::clone(&self.encoder);
        let data = match self
            .pool
            .run(move || {
                raw.validate()?;
                encoder.encode(&raw, quality)
            })
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "encode failed; skipping frame");
                return Ok(CycleOutcome::EncodeFailed);
            }
        };

        // 3. Bandwidth feedback.
        let elapsed_ms = started.elapsed().as_millis() as u64 + self.session.delivery_rtt_ms();
        if let Some(params) = self.session.record_sample(data.len() as u64, elapsed_ms) {
            info!(
                session_id = %self.session.id(),
                fps = params.fps,
                quality = params.quality,
                mbps = self.session.estimate_mbps(),
                "quality tier changed"
            );
            self.fanout.notify(
                &self.session,
                ServerMessage::QualityChanged {
                    session_id: self.session.id().to_string(),
                    fps: params.fps,
                    quality: params.quality,
                    adaptive: true,
                },
            );
        }

        // 4. Deliver.
        self.sequence += 1;
        let frame = EncodedFrame {
            sequence: self.sequence,
            captured_at: started,
            timestamp_ms: unix_millis(captured_wall),
            width,
            height,
            quality,
            data,
        };
        Ok(CycleOutcome::Delivered(
            self.fanout.broadcast(&self.session, &frame),
        ))
    }

    /// Sleep for the remainder of the frame interval.
    async fn pace(cycle_start: Instant, interval: Duration) {
        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
