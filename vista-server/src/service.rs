//! Subscriber-facing TCP server.
//!
//! Every accepted connection is one subscriber. Inbound messages are
//! decoded with [`ServerCodec`] and handed to the [`StreamService`];
//! outbound messages flow through the shared [`ChannelTransport`] queue
//! registered for that subscriber and are written by a per-connection
//! writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vista_core::{
    ChannelTransport, ClientMessage, ServerCodec, ServerMessage, StreamError, StreamService, Transport,
};

// ── StreamServer ─────────────────────────────────────────────────

pub struct StreamServer {
    service: Arc<StreamService>,
    transport: Arc<ChannelTransport>,
    next_id: AtomicU64,
}

impl StreamServer {
    /// `transport` must be the one `service` delivers through.
    pub fn new(service: Arc<StreamService>, transport: Arc<ChannelTransport>) -> Self {
        Self {
            service,
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn service(&self) -> &Arc<StreamService> {
        &self.service
    }

    /// Accept subscribers until `cancel` fires. Open connections are
    /// told to wind down through the same token.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        info!(addr = %listener.local_addr()?, "vista server listening");

        loop {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = cancel.cancelled() => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                server.serve_connection(stream, peer, cancel).await;
            });
        }

        info!("vista server stopped accepting");
        Ok(())
    }

    /// Drive one subscriber connection to completion.
    pub async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {e}");
        }

        let subscriber = format!("{peer}#{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(subscriber_id = %subscriber, "subscriber connected");

        let (mut sink, mut inbound) = Framed::new(stream, ServerCodec::new()).split();
        let mut outbound = self.transport.register(&subscriber);
        let writer = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound.recv().await {
                    if let Err(e) = sink.send(message).await {
                        debug!(subscriber_id = %subscriber, "write failed: {e}");
                        break;
                    }
                }
            })
        };

        loop {
            let next = tokio::select! {
                next = inbound.next() => next,
                _ = cancel.cancelled() => break,
            };

            match next {
                Some(Ok(message)) if runs_long(&message) => {
                    let service = Arc::clone(&self.service);
                    let subscriber = subscriber.clone();
                    tokio::spawn(async move {
                        service.handle_message(&subscriber, message).await;
                    });
                }
                Some(Ok(message)) => self.service.handle_message(&subscriber, message).await,
                Some(Err(e)) => {
                    warn!(subscriber_id = %subscriber, "malformed inbound message: {e}");
                    let reply = ServerMessage::error(&StreamError::Protocol(e.to_string()));
                    let _ = self.transport.send(&subscriber, reply);
                    break;
                }
                None => break,
            }
        }

        self.service.disconnect(&subscriber);
        // Dropping the queue sender lets the writer drain and exit.
        self.transport.unregister(&subscriber);
        if let Err(e) = writer.await {
            warn!(subscriber_id = %subscriber, "writer task failed: {e}");
        }
        info!(subscriber_id = %subscriber, "subscriber disconnected");
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("subscribers", &self.transport.len())
            .finish()
    }
}

/// Requests that wait on the render driver. They run off the read loop
/// so acks and input on the same connection keep flowing meanwhile.
fn runs_long(message: &ClientMessage) -> bool {
    matches!(
        message,
        ClientMessage::CreateSession { .. }
            | ClientMessage::Navigate { .. }
            | ClientMessage::CloseSession { .. }
    )
}

// ── Tests ────────────────────────────────────────────────────────
