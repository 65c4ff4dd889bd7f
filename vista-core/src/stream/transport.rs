//! Push transport seam.
//!
//! The fan-out never blocks on a subscriber: [`Transport::send`] must
//! either enqueue immediately or fail. A failed send removes only that
//! subscriber.
//!
//! [`ChannelTransport`] maps each subscriber to a bounded
//! `tokio::sync::mpsc` queue drained by a per-connection writer task.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::StreamError;
use crate::message::ServerMessage;

/// Default per-subscriber outbound queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Outbound half of the subscriber connection layer.
pub trait Transport: Send + Sync {
    /// Enqueue `message` for `subscriber` without blocking.
    fn send(&self, subscriber: &str, message: ServerMessage) -> Result<(), StreamError>;
}

// ── ChannelTransport ─────────────────────────────────────────────

/// Transport backed by one bounded mpsc queue per subscriber.
#[derive(Debug)]
pub struct ChannelTransport {
    queues: DashMap<String, mpsc::Sender<ServerMessage>>,
    depth: usize,
}

impl ChannelTransport {
    pub fn new(depth: usize) -> Self {
        Self {
            queues: DashMap::new(),
            depth: depth.max(1),
        }
    }

    /// Register `subscriber` and return the receiving end of its queue.
    ///
    /// Registering an id again replaces the previous queue.
    pub fn register(&self, subscriber: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.depth);
        self.queues.insert(subscriber.to_string(), tx);
        rx
    }

    /// Forget `subscriber`. Its receiver sees the channel close.
    pub fn unregister(&self, subscriber: &str) {
        self.queues.remove(subscriber);
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, subscriber: &str, message: ServerMessage) -> Result<(), StreamError> {
        let Some(tx) = self.queues.get(subscriber).map(|e| e.value().clone()) else {
            return Err(StreamError::subscriber_not_found(subscriber));
        };
        tx.try_send(message).map_err(|e| StreamError::Delivery {
            subscriber: subscriber.to_string(),
            reason: match e {
                TrySendError::Full(_) => "outbound queue full".into(),
                TrySendError::Closed(_) => "connection closed".into(),
            },
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
