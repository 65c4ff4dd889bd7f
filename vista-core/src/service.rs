//! The streaming service façade.
//!
//! [`StreamService`] wires the registry, fan-out, input relay and worker
//! pool together and exposes every operation a connection layer needs.
//! [`handle_message`](StreamService::handle_message) maps one inbound
//! [`ClientMessage`] to those operations and sends any reply back to the
//! initiating subscriber only.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::message::{ClientMessage, EndReason, ServerMessage};
use crate::session::{Session, SessionInfo, SessionRegistry, SessionSummary, run_expiry_sweeper};
use crate::stream::encoder::FrameEncoder;
use crate::stream::fanout::DeliveryFanout;
use crate::stream::input::{InputEvent, InputRelay};
use crate::stream::quality::QualityParams;
use crate::stream::render::RenderLauncher;
use crate::stream::transport::Transport;
use crate::stream::types::{Viewport, unix_millis};
use crate::task::WorkerPool;

/// Parse a navigation target. Only absolute `http`/`https` URLs with a
/// host are accepted.
pub fn parse_target(raw: &str) -> Result<Url, StreamError> {
    let url = Url::parse(raw.trim()).map_err(|e| StreamError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(StreamError::InvalidUrl(format!(
                "{raw}: unsupported scheme {other}"
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(StreamError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

pub struct StreamService {
    config: StreamConfig,
    registry: Arc<SessionRegistry>,
    fanout: Arc<DeliveryFanout>,
    relay: InputRelay,
    pool: WorkerPool,
}

impl StreamService {
    pub fn new(
        config: StreamConfig,
        launcher: Arc<dyn RenderLauncher>,
        encoder: Arc<dyn FrameEncoder>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let pool = WorkerPool::new(config.worker_threads);
        let fanout = Arc::new(DeliveryFanout::new(transport, config.stall_limit));
        let registry = Arc::new(SessionRegistry::new(
            &config,
            launcher,
            encoder,
            Arc::clone(&fanout),
            pool.clone(),
        ));
        let relay = InputRelay::new(Arc::clone(&registry), pool.clone(), config.input);
        Self {
            config,
            registry,
            fanout,
            relay,
            pool,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn fanout(&self) -> &Arc<DeliveryFanout> {
        &self.fanout
    }

    pub fn relay(&self) -> &InputRelay {
        &self.relay
    }

    // ── Session operations ───────────────────────────────────────

    pub async fn create_session(
        &self,
        id: Option<String>,
        viewport: Option<Viewport>,
    ) -> Result<SessionInfo, StreamError> {
        let session = self.registry.create(id, viewport).await?;
        Ok(session.info())
    }

    /// Load `url` in the session's page. Returns the normalised URL.
    ///
    /// A failed navigation leaves the session live on its previous page.
    /// A renderer lost mid-navigation ends the session with `RenderLost`.
    pub async fn navigate(&self, id: &str, url: &str) -> Result<String, StreamError> {
        let target = parse_target(url)?;
        let session = self.registry.get(id)?;
        session.begin_load()?;

        let slot = session.render_slot().clone();
        let href = target.to_string();
        let page = href.clone();
        let result = self
            .pool
            .run(move || slot.with(|handle| handle.navigate(&page)))
            .await;

        match result {
            Ok(()) => {
                session.finish_load(Some(href.clone()))?;
                info!(session_id = %id, url = %href, "navigated");
                Ok(href)
            }
            Err(e) => {
                let _ = session.finish_load(None);
                warn!(session_id = %id, url = %href, error = %e, "navigation failed");
                if session.state().is_terminating() {
                    return Err(StreamError::SessionClosed(id.to_string()));
                }
                if let StreamError::RenderLost(cause) = &e {
                    self.registry
                        .remove_with_reason(id, EndReason::RenderLost(cause.clone()))
                        .await;
                    return Err(e);
                }
                Err(match e {
                    StreamError::NavigationFailed(_) => e,
                    other => StreamError::NavigationFailed(format!("{href}: {other}")),
                })
            }
        }
    }

    /// Mark the session active. Returns the new activity time.
    pub fn keepalive(&self, id: &str) -> Result<SystemTime, StreamError> {
        let session = self.registry.get(id)?;
        session.ensure_live()?;
        Ok(session.touch())
    }

    pub fn subscribe(&self, session_id: &str, subscriber: &str) -> Result<QualityParams, StreamError> {
        let session = self.registry.get(session_id)?;
        self.fanout.subscribe(&session, subscriber)
    }

    pub fn unsubscribe(&self, subscriber: &str) -> bool {
        self.fanout.unsubscribe(subscriber)
    }

    /// Close a session. Closing an absent session is not an error.
    pub async fn close_session(&self, id: &str) -> Result<(), StreamError> {
        self.registry.remove(id).await;
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list()
    }

    // ── Quality ──────────────────────────────────────────────────

    /// Pin quality and disable adaptation.
    pub fn set_quality(&self, id: &str, quality: u8) -> Result<QualityParams, StreamError> {
        self.apply_quality(id, |s| s.set_manual(None, Some(quality)))
    }

    /// Pin the frame rate and disable adaptation.
    pub fn set_fps(&self, id: &str, fps: u8) -> Result<QualityParams, StreamError> {
        self.apply_quality(id, |s| s.set_manual(Some(fps), None))
    }

    /// Turn adaptation on, or off (pinning the current values).
    pub fn set_adaptive(&self, id: &str, enabled: bool) -> Result<QualityParams, StreamError> {
        self.apply_quality(id, |s| {
            if enabled {
                Ok(s.enable_adaptive())
            } else {
                s.set_manual(None, None)
            }
        })
    }

    fn apply_quality(
        &self,
        id: &str,
        change: impl FnOnce(&Session) -> Result<QualityParams, StreamError>,
    ) -> Result<QualityParams, StreamError> {
        let session = self.registry.get(id)?;
        session.ensure_live()?;
        let params = change(&session)?;
        let adaptive = session.is_adaptive();
        debug!(
            session_id = %id,
            fps = params.fps,
            quality = params.quality,
            adaptive,
            "quality updated"
        );
        self.fanout.notify(
            &session,
            ServerMessage::QualityChanged {
                session_id: id.to_string(),
                fps: params.fps,
                quality: params.quality,
                adaptive,
            },
        );
        Ok(params)
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Handle one inbound message from `subscriber`.
    pub async fn handle_message(&self, subscriber: &str, message: ClientMessage) {
        let reply = match message {
            ClientMessage::CreateSession {
                session_id,
                viewport,
            } => self
                .create_session(session_id, viewport)
                .await
                .map(|info| {
                    Some(ServerMessage::SessionCreated {
                        session_id: info.id,
                        created_at_ms: unix_millis(info.created_at),
                    })
                }),
            ClientMessage::CloseSession { session_id } => self
                .close_session(&session_id)
                .await
                .map(|()| Some(ServerMessage::SessionClosed { session_id })),
            ClientMessage::Navigate { session_id, url } => self
                .navigate(&session_id, &url)
                .await
                .map(|url| Some(ServerMessage::Navigated { session_id, url })),
            ClientMessage::Keepalive { session_id } => self.keepalive(&session_id).map(|at| {
                Some(ServerMessage::KeepaliveAck {
                    session_id,
                    last_activity_ms: unix_millis(at),
                })
            }),
            ClientMessage::ListSessions => Ok(Some(ServerMessage::Sessions(self.list_sessions()))),
            // Confirmation is sent by the fan-out ahead of any frame.
            ClientMessage::Subscribe { session_id } => {
                self.subscribe(&session_id, subscriber).map(|_| None)
            }
            ClientMessage::Unsubscribe => {
                self.unsubscribe(subscriber);
                Ok(Some(ServerMessage::Unsubscribed))
            }
            ClientMessage::Ack { sequence } => self.fanout.ack(subscriber, sequence).map(|()| None),
            ClientMessage::Click { x, y } => {
                Ok(Some(self.relay_input(subscriber, InputEvent::Click { x, y }).await))
            }
            ClientMessage::Scroll { dx, dy } => {
                Ok(Some(self.relay_input(subscriber, InputEvent::Scroll { dx, dy }).await))
            }
            ClientMessage::Text { value } => {
                Ok(Some(self.relay_input(subscriber, InputEvent::Text(value)).await))
            }
            // QualityChanged reaches every subscriber, this one included.
            ClientMessage::SetQuality { quality } => self
                .attached(subscriber)
                .and_then(|id| self.set_quality(&id, quality))
                .map(|_| None),
            ClientMessage::SetFps { fps } => self
                .attached(subscriber)
                .and_then(|id| self.set_fps(&id, fps))
                .map(|_| None),
            ClientMessage::SetAdaptive { enabled } => self
                .attached(subscriber)
                .and_then(|id| self.set_adaptive(&id, enabled))
                .map(|_| None),
        };

        let reply = match reply {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                debug!(subscriber_id = %subscriber, error = %e, class = %e.class(), "request failed");
                ServerMessage::error(&e)
            }
        };
        if let Err(e) = self.fanout.transport().send(subscriber, reply) {
            debug!(subscriber_id = %subscriber, error = %e, "reply not delivered");
        }
    }

    async fn relay_input(&self, subscriber: &str, event: InputEvent) -> ServerMessage {
        let result = match self.attached(subscriber) {
            Ok(session_id) => self.relay.dispatch(&session_id, event).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ServerMessage::InputAck {
                ok: true,
                error: None,
            },
            Err(e) => ServerMessage::InputAck {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Session `subscriber` is attached to.
    fn attached(&self, subscriber: &str) -> Result<String, StreamError> {
        self.fanout
            .session_of(subscriber)
            .ok_or_else(|| StreamError::Protocol("not subscribed to a session".into()))
    }

    // ── Connection and process lifecycle ─────────────────────────

    /// The connection behind `subscriber` went away.
    pub fn disconnect(&self, subscriber: &str) {
        if self.fanout.unsubscribe(subscriber) {
            debug!(subscriber_id = %subscriber, "subscriber disconnected");
        }
    }

    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_expiry_sweeper(
            Arc::clone(&self.registry),
            self.config.sweeper(),
            cancel,
        ))
    }

    /// Close every session with `Shutdown`.
    pub async fn shutdown(&self) -> usize {
        let closed = self.registry.close_all(EndReason::Shutdown).await;
        info!(closed, "stream service shut down");
        closed
    }
}

impl std::fmt::Debug for StreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamService")
            .field("registry", &self.registry)
            .field("fanout", &self.fanout)
            .field("pool", &self.pool)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        assert_eq!(
            parse_target("https://example.com").unwrap().as_str(),
            "https://example.com/"
        );
        assert!(parse_target("http://localhost:8080/a?b=c").is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        for raw in ["ftp://example.com", "file:///etc/passwd", "not a url", "", "https://"] {
            assert!(
                matches!(parse_target(raw), Err(StreamError::InvalidUrl(_))),
                "{raw} should be rejected"
            );
        }
    }
}
