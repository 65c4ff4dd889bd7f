//! Frame delivery to a session's subscribers.
//!
//! Each session keeps its own [`SubscriberSet`] behind a per-session
//! lock; the fan-out only adds a `subscriber → session` index on top of
//! it. Delivery never blocks on a subscriber: the [`Transport`] either
//! enqueues or fails, and a failure removes only that subscriber.
//!
//! Backpressure is one frame in flight. While a subscriber has not acked
//! its last frame, newer frames skip it rather than queue, so a stalled
//! client is never more than one frame ahead of its last ack and always
//! resumes on the freshest frame. A subscriber that skips more than
//! `stall_limit` frames in a row is dropped.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::message::{FrameMessage, ServerMessage};
use crate::session::Session;
use crate::stream::quality::QualityParams;
use crate::stream::transport::Transport;
use crate::stream::types::EncodedFrame;

/// Default consecutive skips tolerated before a subscriber is dropped.
pub const DEFAULT_STALL_LIMIT: u32 = 300;

// ── SubscriberSet ────────────────────────────────────────────────

/// Delivery bookkeeping for one subscriber of one session.
#[derive(Debug, Clone)]
pub struct SubscriberSlot {
    pub id: String,
    pub attached_at: Instant,
    /// Sequence and send time of the frame awaiting ack.
    in_flight: Option<(u64, Instant)>,
    pub last_acked_sequence: Option<u64>,
    pub last_frame_acked_at: Option<Instant>,
    /// Frames skipped in a row because of an unacked frame.
    pub skipped: u32,
}

impl SubscriberSlot {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            attached_at: Instant::now(),
            in_flight: None,
            last_acked_sequence: None,
            last_frame_acked_at: None,
            skipped: 0,
        }
    }

    pub fn awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// The subscribers of one session.
///
/// Once sealed the set stays empty and accepts nobody.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    slots: Vec<SubscriberSlot>,
    sealed: bool,
}

impl SubscriberSet {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.id.clone()).collect()
    }

    pub fn get(&self, subscriber: &str) -> Option<&SubscriberSlot> {
        self.slots.iter().find(|s| s.id == subscriber)
    }

    fn get_mut(&mut self, subscriber: &str) -> Option<&mut SubscriberSlot> {
        self.slots.iter_mut().find(|s| s.id == subscriber)
    }

    fn contains(&self, subscriber: &str) -> bool {
        self.get(subscriber).is_some()
    }

    fn remove(&mut self, subscriber: &str) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.id != subscriber);
        self.slots.len() != before
    }
}

// ── DeliveryFanout ───────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Attachment {
    session_id: String,
    session: Weak<Session>,
}

/// Distributes frames and notifications to subscribers.
pub struct DeliveryFanout {
    transport: Arc<dyn Transport>,
    attachments: DashMap<String, Attachment>,
    stall_limit: u32,
}

impl DeliveryFanout {
    pub fn new(transport: Arc<dyn Transport>, stall_limit: u32) -> Self {
        Self {
            transport,
            attachments: DashMap::new(),
            stall_limit: stall_limit.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Session id `subscriber` is attached to.
    pub fn session_of(&self, subscriber: &str) -> Option<String> {
        self.attachments
            .get(subscriber)
            .map(|a| a.session_id.clone())
    }

    /// Attach `subscriber` to `session` and confirm with `Subscribed`.
    ///
    /// Detaches it from any previous session first. Subscribing again to
    /// the same session keeps its delivery state and repeats the
    /// confirmation.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        subscriber: &str,
    ) -> Result<QualityParams, StreamError> {
        let moving = self
            .session_of(subscriber)
            .is_some_and(|previous| previous != session.id());
        if moving {
            self.unsubscribe(subscriber);
        }

        let mut set = session.subscribers().lock();
        if set.sealed || session.state().is_terminating() {
            return Err(StreamError::SessionClosed(session.id().to_string()));
        }

        let (params, adaptive) = session.quality_snapshot();
        let fresh = !set.contains(subscriber);
        if fresh {
            set.slots.push(SubscriberSlot::new(subscriber));
        }
        self.attachments.insert(
            subscriber.to_string(),
            Attachment {
                session_id: session.id().to_string(),
                session: Arc::downgrade(session),
            },
        );

        // Sent under the lock so the confirmation precedes the first frame.
        let confirm = ServerMessage::Subscribed {
            session_id: session.id().to_string(),
            fps: params.fps,
            quality: params.quality,
            adaptive,
        };
        if let Err(e) = self.transport.send(subscriber, confirm) {
            set.remove(subscriber);
            drop(set);
            self.detach_index(subscriber, session);
            return Err(e);
        }
        drop(set);

        debug!(
            session_id = %session.id(),
            subscriber_id = %subscriber,
            fresh,
            "subscriber attached"
        );
        Ok(params)
    }

    /// Detach `subscriber` from whatever session it is attached to.
    ///
    /// Returns `false` if it was not attached. Idempotent.
    pub fn unsubscribe(&self, subscriber: &str) -> bool {
        let Some((_, attachment)) = self.attachments.remove(subscriber) else {
            return false;
        };
        if let Some(session) = attachment.session.upgrade() {
            session.subscribers().lock().remove(subscriber);
        }
        debug!(
            session_id = %attachment.session_id,
            subscriber_id = %subscriber,
            "subscriber detached"
        );
        true
    }

    /// Deliver `frame` to every subscriber that is not awaiting an ack.
    ///
    /// Returns the number of subscribers the frame was handed to. A
    /// delivery to at least one subscriber counts as session activity.
    pub fn broadcast(&self, session: &Arc<Session>, frame: &EncodedFrame) -> usize {
        let mut set = session.subscribers().lock();
        if set.sealed || set.slots.is_empty() {
            return 0;
        }

        let message = ServerMessage::Frame(FrameMessage::from_frame(session.id(), frame));
        let now = Instant::now();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for slot in set.slots.iter_mut() {
            if slot.awaiting_ack() {
                slot.skipped += 1;
                if slot.skipped > self.stall_limit {
                    warn!(
                        session_id = %session.id(),
                        subscriber_id = %slot.id,
                        skipped = slot.skipped,
                        "subscriber stalled; dropping"
                    );
                    dropped.push(slot.id.clone());
                }
                continue;
            }
            match self.transport.send(&slot.id, message.clone()) {
                Ok(()) => {
                    slot.in_flight = Some((frame.sequence, now));
                    slot.skipped = 0;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        session_id = %session.id(),
                        subscriber_id = %slot.id,
                        error = %e,
                        "frame delivery failed; dropping subscriber"
                    );
                    dropped.push(slot.id.clone());
                }
            }
        }

        for id in &dropped {
            set.remove(id);
        }
        drop(set);

        for id in &dropped {
            self.detach_index(id, session);
        }
        if delivered > 0 {
            session.touch();
        }
        delivered
    }

    /// Record that `subscriber` received the frame with `sequence`.
    ///
    /// Acks for anything but the frame in flight are ignored.
    pub fn ack(&self, subscriber: &str, sequence: u64) -> Result<(), StreamError> {
        let session = self
            .attachments
            .get(subscriber)
            .and_then(|a| a.session.upgrade())
            .ok_or_else(|| StreamError::subscriber_not_found(subscriber))?;

        let mut set = session.subscribers().lock();
        let slot = set
            .get_mut(subscriber)
            .ok_or_else(|| StreamError::subscriber_not_found(subscriber))?;

        match slot.in_flight {
            Some((in_flight, sent_at)) if in_flight == sequence => {
                let now = Instant::now();
                slot.in_flight = None;
                slot.skipped = 0;
                slot.last_acked_sequence = Some(sequence);
                slot.last_frame_acked_at = Some(now);
                drop(set);
                session.record_delivery_rtt(now.saturating_duration_since(sent_at));
            }
            _ => {
                debug!(
                    session_id = %session.id(),
                    subscriber_id = %subscriber,
                    sequence,
                    "ignoring stale ack"
                );
            }
        }
        Ok(())
    }

    /// Send a non-frame message to every subscriber of `session`.
    pub fn notify(&self, session: &Arc<Session>, message: ServerMessage) {
        let mut set = session.subscribers().lock();
        if set.sealed {
            return;
        }
        let mut dropped = Vec::new();
        for slot in &set.slots {
            if let Err(e) = self.transport.send(&slot.id, message.clone()) {
                warn!(
                    session_id = %session.id(),
                    subscriber_id = %slot.id,
                    error = %e,
                    "notification failed; dropping subscriber"
                );
                dropped.push(slot.id.clone());
            }
        }
        for id in &dropped {
            set.remove(id);
        }
        drop(set);
        for id in &dropped {
            self.detach_index(id, session);
        }
    }

    /// Send `terminal` to every subscriber, detach them all and refuse
    /// any further delivery for `session`.
    pub fn seal(&self, session: &Arc<Session>, terminal: ServerMessage) -> usize {
        let mut set = session.subscribers().lock();
        set.sealed = true;
        let slots = std::mem::take(&mut set.slots);
        for slot in &slots {
            if let Err(e) = self.transport.send(&slot.id, terminal.clone()) {
                debug!(
                    session_id = %session.id(),
                    subscriber_id = %slot.id,
                    error = %e,
                    "terminal message not delivered"
                );
            }
        }
        drop(set);
        for slot in &slots {
            self.detach_index(&slot.id, session);
        }
        slots.len()
    }

    /// Number of attached subscribers across all sessions.
    pub fn attached(&self) -> usize {
        self.attachments.len()
    }

    /// Remove the index entry only if it still points at `session`.
    fn detach_index(&self, subscriber: &str, session: &Arc<Session>) {
        self.attachments
            .remove_if(subscriber, |_, a| Weak::as_ptr(&a.session) == Arc::as_ptr(session));
    }
}

impl std::fmt::Debug for DeliveryFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryFanout")
            .field("attached", &self.attachments.len())
            .field("stall_limit", &self.stall_limit)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::message::EndReason;
    use crate::stream::quality::QualityConfig;
    use crate::stream::types::Viewport;

    /// Records every message; subscribers listed in `failing` reject sends.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, ServerMessage)>>,
        failing: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn frames_for(&self, subscriber: &str) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter_map(|(id, m)| match m {
                    ServerMessage::Frame(f) if id == subscriber => Some(f.sequence),
                    _ => None,
                })
                .collect()
        }

        fn last_for(&self, subscriber: &str) -> Option<ServerMessage> {
            self.sent
                .lock()
                .iter()
                .rev()
                .find(|(id, _)| id == subscriber)
                .map(|(_, m)| m.clone())
        }
    }

    impl Transport for Recorder {
        fn send(&self, subscriber: &str, message: ServerMessage) -> Result<(), StreamError> {
            if self.failing.lock().iter().any(|f| f == subscriber) {
                return Err(StreamError::Delivery {
                    subscriber: subscriber.into(),
                    reason: "gone".into(),
                });
            }
            self.sent.lock().push((subscriber.into(), message));
            Ok(())
        }
    }

    fn setup(stall_limit: u32) -> (Arc<Recorder>, DeliveryFanout, Arc<Session>) {
        let recorder = Arc::new(Recorder::default());
        let fanout = DeliveryFanout::new(recorder.clone(), stall_limit);
        let session = Arc::new(Session::new(
            "s1",
            Viewport::default(),
            &QualityConfig::default(),
        ));
        (recorder, fanout, session)
    }

    fn frame(sequence: u64) -> EncodedFrame {
        EncodedFrame {
            sequence,
            captured_at: Instant::now(),
            timestamp_ms: 0,
            width: 1,
            height: 1,
            quality: 85,
            data: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn subscribe_confirms_with_current_params() {
        let (rec, fanout, session) = setup(10);
        let params = fanout.subscribe(&session, "c1").unwrap();
        assert_eq!((params.fps, params.quality), (30, 85));
        assert_eq!(
            rec.last_for("c1"),
            Some(ServerMessage::Subscribed {
                session_id: "s1".into(),
                fps: 30,
                quality: 85,
                adaptive: true,
            })
        );
        assert_eq!(fanout.session_of("c1").as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn unacked_subscriber_skips_frames() {
        let (rec, fanout, session) = setup(10);
        fanout.subscribe(&session, "c1").unwrap();

        assert_eq!(fanout.broadcast(&session, &frame(1)), 1);
        assert_eq!(fanout.broadcast(&session, &frame(2)), 0);
        assert_eq!(fanout.broadcast(&session, &frame(3)), 0);
        fanout.ack("c1", 1).unwrap();
        assert_eq!(fanout.broadcast(&session, &frame(4)), 1);

        assert_eq!(rec.frames_for("c1"), vec![1, 4]);
    }

    #[tokio::test]
    async fn stale_ack_does_not_release_in_flight_frame() {
        let (_rec, fanout, session) = setup(10);
        fanout.subscribe(&session, "c1").unwrap();
        fanout.broadcast(&session, &frame(5));
        fanout.ack("c1", 4).unwrap();
        assert_eq!(fanout.broadcast(&session, &frame(6)), 0);
    }

    #[tokio::test]
    async fn stalled_subscriber_is_dropped_after_limit() {
        let (rec, fanout, session) = setup(2);
        fanout.subscribe(&session, "c1").unwrap();
        for seq in 1..=10 {
            fanout.broadcast(&session, &frame(seq));
        }
        assert_eq!(rec.frames_for("c1"), vec![1]);
        assert_eq!(session.subscriber_count(), 0);
        assert!(fanout.session_of("c1").is_none());
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let (rec, fanout, session) = setup(10);
        fanout.subscribe(&session, "c1").unwrap();
        fanout.subscribe(&session, "c2").unwrap();
        rec.failing.lock().push("c1".into());

        assert_eq!(fanout.broadcast(&session, &frame(1)), 1);
        assert_eq!(session.subscriber_ids(), vec!["c2".to_string()]);
        assert_eq!(rec.frames_for("c2"), vec![1]);
    }

    #[tokio::test]
    async fn resubscribe_moves_between_sessions() {
        let (_rec, fanout, s1) = setup(10);
        let s2 = Arc::new(Session::new(
            "s2",
            Viewport::default(),
            &QualityConfig::default(),
        ));
        fanout.subscribe(&s1, "c1").unwrap();
        fanout.subscribe(&s2, "c1").unwrap();
        assert_eq!(s1.subscriber_count(), 0);
        assert_eq!(s2.subscriber_count(), 1);
        assert_eq!(fanout.session_of("c1").as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (_rec, fanout, session) = setup(10);
        fanout.subscribe(&session, "c1").unwrap();
        assert!(fanout.unsubscribe("c1"));
        assert!(!fanout.unsubscribe("c1"));
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn seal_sends_terminal_and_blocks_delivery() {
        let (rec, fanout, session) = setup(10);
        fanout.subscribe(&session, "c1").unwrap();
        let terminal = ServerMessage::SessionEnded {
            session_id: "s1".into(),
            reason: EndReason::Closed,
        };
        assert_eq!(fanout.seal(&session, terminal.clone()), 1);
        assert_eq!(rec.last_for("c1"), Some(terminal.clone()));

        assert_eq!(fanout.broadcast(&session, &frame(1)), 0);
        assert_eq!(rec.last_for("c1"), Some(terminal));
        assert!(matches!(
            fanout.subscribe(&session, "c2"),
            Err(StreamError::SessionClosed(_))
        ));
        assert_eq!(fanout.attached(), 0);
    }

    #[tokio::test]
    async fn ack_from_unknown_subscriber_is_not_found() {
        let (_rec, fanout, _session) = setup(10);
        assert!(matches!(
            fanout.ack("ghost", 1),
            Err(StreamError::NotFound { .. })
        ));
    }
}
