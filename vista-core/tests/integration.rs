//! Integration tests: session lifecycle, frame delivery, backpressure,
//! eviction and renderer failure, driven through `StreamService` with an
//! in-memory renderer and the channel transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use vista_core::{
    ChannelTransport, ClientMessage, EndReason, ErrorClass, FrameEncoder, FrameMessage,
    PixelFormat, RawFrame, RenderHandle, RenderLauncher, ServerMessage, SessionState,
    StreamConfig, StreamError, StreamService, Viewport, ZstdEncoder,
};

// ── Fake renderer ────────────────────────────────────────────────

#[derive(Default)]
struct PageLog {
    url: Mutex<Option<String>>,
    clicks: Mutex<Vec<(u32, u32)>>,
    typed: Mutex<Vec<String>>,
    crashed: AtomicBool,
    closes: AtomicUsize,
}

struct FakePage {
    log: Arc<PageLog>,
    viewport: Viewport,
    nav_delay: Duration,
    tick: u8,
}

impl RenderHandle for FakePage {
    fn navigate(&mut self, url: &str) -> Result<(), StreamError> {
        std::thread::sleep(self.nav_delay);
        if url.contains("hang") {
            return Err(StreamError::RenderLost("driver timed out".into()));
        }
        if url.contains("unreachable") {
            return Err(StreamError::NavigationFailed("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        *self.log.url.lock() = Some(url.to_string());
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<RawFrame, StreamError> {
        if self.log.crashed.load(Ordering::SeqCst) {
            return Err(StreamError::RenderLost("target closed".into()));
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(RawFrame::filled(
            self.viewport.width,
            self.viewport.height,
            PixelFormat::Bgra8,
            self.tick,
        ))
    }

    fn dispatch_click(&mut self, x: u32, y: u32) -> Result<(), StreamError> {
        self.log.clicks.lock().push((x, y));
        Ok(())
    }

    fn dispatch_scroll(&mut self, _dx: i32, _dy: i32) -> Result<(), StreamError> {
        Ok(())
    }

    fn dispatch_text(&mut self, text: &str) -> Result<(), StreamError> {
        self.log.typed.lock().push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeBrowser {
    refuse: AtomicBool,
    nav_delay: Mutex<Duration>,
    pages: Mutex<Vec<Arc<PageLog>>>,
}

impl FakeBrowser {
    fn page(&self, index: usize) -> Arc<PageLog> {
        Arc::clone(&self.pages.lock()[index])
    }
}

impl RenderLauncher for FakeBrowser {
    fn launch(&self, viewport: Viewport) -> Result<Box<dyn RenderHandle>, StreamError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::RenderInitFailed("browser unavailable".into()));
        }
        let log = Arc::new(PageLog::default());
        self.pages.lock().push(Arc::clone(&log));
        Ok(Box::new(FakePage {
            log,
            viewport,
            nav_delay: *self.nav_delay.lock(),
            tick: 0,
        }))
    }
}

/// Emits a fixed large payload per frame, so any realistic cycle time
/// measures well above the high-tier threshold.
struct BulkyEncoder;

impl FrameEncoder for BulkyEncoder {
    fn encode(&self, _frame: &RawFrame, _quality: u8) -> Result<Bytes, StreamError> {
        Ok(Bytes::from(vec![0u8; 256 * 1024]))
    }
}

// ── Helpers ──────────────────────────────────────────────────────

struct Harness {
    service: Arc<StreamService>,
    transport: Arc<ChannelTransport>,
    browser: Arc<FakeBrowser>,
}

fn small_viewport() -> Option<Viewport> {
    Some(Viewport::new(64, 48).unwrap())
}

fn harness(config: StreamConfig) -> Harness {
    harness_with_encoder(config, Arc::new(ZstdEncoder::default()))
}

fn harness_with_encoder(config: StreamConfig, encoder: Arc<dyn FrameEncoder>) -> Harness {
    let transport = Arc::new(ChannelTransport::new(256));
    let browser = Arc::new(FakeBrowser::default());
    let service = Arc::new(StreamService::new(
        config,
        browser.clone(),
        encoder,
        transport.clone(),
    ));
    Harness {
        service,
        transport,
        browser,
    }
}

async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("transport closed")
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> FrameMessage {
    loop {
        if let ServerMessage::Frame(frame) = next_message(rx).await {
            return frame;
        }
    }
}

fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

async fn create(h: &Harness, id: &str) {
    h.service
        .create_session(Some(id.into()), small_viewport())
        .await
        .unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_then_first_frame() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");

    create(&h, "s1").await;
    let url = h.service.navigate("s1", "https://example.com").await.unwrap();
    assert_eq!(url, "https://example.com/");
    assert_eq!(
        h.browser.page(0).url.lock().as_deref(),
        Some("https://example.com/")
    );

    h.service
        .handle_message("c1", ClientMessage::Subscribe { session_id: "s1".into() })
        .await;
    assert_eq!(
        next_message(&mut rx).await,
        ServerMessage::Subscribed {
            session_id: "s1".into(),
            fps: 30,
            quality: 85,
            adaptive: true,
        }
    );

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame.session_id, "s1");
    assert_eq!(frame.sequence, 1);
    assert_eq!((frame.width, frame.height), (64, 48));
    assert_eq!(frame.size_bytes as usize, frame.data.len());
    assert!(frame.timestamp_ms > 0);
}

#[tokio::test]
async fn unsubscribing_one_leaves_the_other_streaming() {
    let h = harness(StreamConfig::default());
    let mut rx1 = h.transport.register("c1");
    let mut rx2 = h.transport.register("c2");
    create(&h, "s1").await;

    for c in ["c1", "c2"] {
        h.service
            .handle_message(c, ClientMessage::Subscribe { session_id: "s1".into() })
            .await;
    }
    next_frame(&mut rx1).await;

    h.service.handle_message("c1", ClientMessage::Unsubscribe).await;
    let after: Vec<_> = drain(&mut rx1);
    assert!(after.contains(&ServerMessage::Unsubscribed));

    let mut last = 0;
    for _ in 0..3 {
        let frame = next_frame(&mut rx2).await;
        assert!(frame.sequence > last);
        last = frame.sequence;
        h.service
            .handle_message("c2", ClientMessage::Ack { sequence: frame.sequence })
            .await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut rx1).iter().all(|m| !m.is_frame()));
    assert_eq!(h.service.registry().get("s1").unwrap().subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_evicted_within_timeout_plus_interval() {
    let config = StreamConfig {
        idle_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(1),
        ..StreamConfig::default()
    };
    let h = harness(config);
    create(&h, "s1").await;
    let cancel = CancellationToken::new();
    let sweeper = h.service.spawn_sweeper(cancel.clone());

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert_eq!(h.service.list_sessions().len(), 1);

    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert!(h.service.list_sessions().is_empty());
    assert_eq!(h.browser.page(0).closes.load(Ordering::SeqCst), 1);

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn keepalive_defers_eviction() {
    let config = StreamConfig {
        idle_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(1),
        ..StreamConfig::default()
    };
    let h = harness(config);
    create(&h, "s1").await;
    let cancel = CancellationToken::new();
    let _sweeper = h.service.spawn_sweeper(cancel.clone());

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_ok!(h.service.keepalive("s1"));
    }
    assert_eq!(h.service.list_sessions().len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn no_frame_follows_session_ended() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    create(&h, "s1").await;
    h.service.subscribe("s1", "c1").unwrap();
    let frame = next_frame(&mut rx).await;
    assert_ok!(h.service.fanout().ack("c1", frame.sequence));

    h.service
        .handle_message("c1", ClientMessage::CloseSession { session_id: "s1".into() })
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let tail = drain(&mut rx);
    let ended = tail
        .iter()
        .position(|m| {
            matches!(
                m,
                ServerMessage::SessionEnded { reason: EndReason::Closed, .. }
            )
        })
        .expect("terminal message delivered");
    assert!(tail[ended..].iter().all(|m| !m.is_frame()));
    assert!(tail.contains(&ServerMessage::SessionClosed { session_id: "s1".into() }));

    assert!(!h.service.registry().contains("s1"));
    assert_eq!(h.browser.page(0).closes.load(Ordering::SeqCst), 1);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    // Closing again is a no-op.
    assert_ok!(h.service.close_session("s1").await);
    assert_eq!(h.browser.page(0).closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stalled_subscriber_gets_at_most_one_frame_ahead() {
    let h = harness(StreamConfig::default());
    let mut slow = h.transport.register("slow");
    let mut fast = h.transport.register("fast");
    create(&h, "s1").await;
    h.service.subscribe("s1", "slow").unwrap();
    h.service.subscribe("s1", "fast").unwrap();

    for _ in 0..5 {
        let frame = next_frame(&mut fast).await;
        h.service
            .handle_message("fast", ClientMessage::Ack { sequence: frame.sequence })
            .await;
    }

    let frames: Vec<_> = drain(&mut slow).into_iter().filter(|m| m.is_frame()).collect();
    assert_eq!(frames.len(), 1);
}

#[tokio::test]
async fn lost_renderer_closes_only_that_session() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    let mut other = h.transport.register("c2");
    create(&h, "s1").await;
    create(&h, "s2").await;
    h.service.subscribe("s1", "c1").unwrap();
    h.service.subscribe("s2", "c2").unwrap();
    next_frame(&mut rx).await;

    h.browser.page(0).crashed.store(true, Ordering::SeqCst);

    loop {
        if let ServerMessage::SessionEnded { session_id, reason } = next_message(&mut rx).await {
            assert_eq!(session_id, "s1");
            assert!(matches!(reason, EndReason::RenderLost(_)));
            break;
        }
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.service.registry().contains("s1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session removed");
    assert_eq!(h.browser.page(0).closes.load(Ordering::SeqCst), 1);

    // The neighbour keeps streaming.
    assert_eq!(h.service.registry().get("s2").unwrap().state(), SessionState::Ready);
    next_frame(&mut other).await;
}

// ── Registry errors ──────────────────────────────────────────────

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let h = harness(StreamConfig::default());
    create(&h, "s1").await;
    let err = h
        .service
        .create_session(Some("s1".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::AlreadyExists(_)));
    assert_eq!(h.service.list_sessions().len(), 1);
}

#[tokio::test]
async fn capacity_is_enforced() {
    let h = harness(StreamConfig {
        max_sessions: 1,
        ..StreamConfig::default()
    });
    create(&h, "s1").await;
    let err = h.service.create_session(None, None).await.unwrap_err();
    assert!(matches!(err, StreamError::CapacityExceeded { max: 1 }));

    assert_ok!(h.service.close_session("s1").await);
    let info = h.service.create_session(None, small_viewport()).await.unwrap();
    assert_eq!(info.id.len(), 36);
}

#[tokio::test]
async fn session_id_limit_counts_characters() {
    let h = harness(StreamConfig::default());
    // 128 two-byte characters: 256 bytes, still within the limit.
    let wide = "é".repeat(128);
    assert_ok!(h.service.create_session(Some(wide), small_viewport()).await);

    let err = h
        .service
        .create_session(Some("é".repeat(129)), small_viewport())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidRange { field: "session id length", .. }));
}

#[tokio::test]
async fn viewport_too_large_to_capture_is_rejected() {
    let h = harness(StreamConfig::default());
    let err = h
        .service
        .create_session(
            Some("4k".into()),
            Some(Viewport {
                width: 4096,
                height: 2160,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Input);
    assert!(!h.service.registry().contains("4k"));
    assert!(h.browser.pages.lock().is_empty());
}

#[tokio::test]
async fn launch_failure_leaves_no_entry() {
    let h = harness(StreamConfig::default());
    h.browser.refuse.store(true, Ordering::SeqCst);
    let err = h
        .service
        .create_session(Some("s1".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::RenderInitFailed(_)));
    assert!(!h.service.registry().contains("s1"));

    h.browser.refuse.store(false, Ordering::SeqCst);
    create(&h, "s1").await;
}

#[tokio::test]
async fn unknown_session_reports_lifecycle_error() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    h.service
        .handle_message("c1", ClientMessage::Subscribe { session_id: "nope".into() })
        .await;
    match next_message(&mut rx).await {
        ServerMessage::Error { class, message } => {
            assert_eq!(class, ErrorClass::Lifecycle);
            assert!(message.contains("nope"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ── Navigation ───────────────────────────────────────────────────

#[tokio::test]
async fn bad_urls_are_rejected_before_touching_the_page() {
    let h = harness(StreamConfig::default());
    create(&h, "s1").await;
    for url in ["ftp://example.com", "example.com", ""] {
        assert!(matches!(
            h.service.navigate("s1", url).await,
            Err(StreamError::InvalidUrl(_))
        ));
    }
    assert!(h.browser.page(0).url.lock().is_none());
    assert!(matches!(
        h.service.navigate("ghost", "https://example.com").await,
        Err(StreamError::NotFound { .. })
    ));
}

#[tokio::test]
async fn failed_navigation_keeps_session_live() {
    let h = harness(StreamConfig::default());
    create(&h, "s1").await;
    h.service.navigate("s1", "https://example.com").await.unwrap();
    let err = h
        .service
        .navigate("s1", "https://unreachable.invalid")
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::NavigationFailed(_)));

    let session = h.service.registry().get("s1").unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.current_url().as_deref(), Some("https://example.com/"));
}

#[tokio::test]
async fn renderer_lost_during_navigation_ends_the_session() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    create(&h, "s1").await;
    h.service.subscribe("s1", "c1").unwrap();

    let err = h
        .service
        .navigate("s1", "https://hang.example")
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::RenderLost(_)));
    assert!(!h.service.registry().contains("s1"));

    loop {
        match next_message(&mut rx).await {
            ServerMessage::SessionEnded { reason, .. } => {
                assert!(matches!(reason, EndReason::RenderLost(_)));
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn navigation_in_progress_is_busy() {
    let h = harness(StreamConfig::default());
    *h.browser.nav_delay.lock() = Duration::from_millis(300);
    create(&h, "s1").await;

    let service = Arc::clone(&h.service);
    let first = tokio::spawn(async move { service.navigate("s1", "https://a.example").await });

    let session = h.service.registry().get("s1").unwrap();
    while session.state() != SessionState::Loading {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        h.service.navigate("s1", "https://b.example").await,
        Err(StreamError::Busy(_))
    ));
    first.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

// ── Input and quality ────────────────────────────────────────────

#[tokio::test]
async fn input_is_validated_and_acked_to_sender_only() {
    let h = harness(StreamConfig::default());
    let mut rx1 = h.transport.register("c1");
    let mut rx2 = h.transport.register("c2");
    create(&h, "s1").await;
    h.service.subscribe("s1", "c1").unwrap();
    h.service.subscribe("s1", "c2").unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    h.service
        .handle_message("c1", ClientMessage::Click { x: 10, y: 20 })
        .await;
    h.service
        .handle_message("c1", ClientMessage::Click { x: 64, y: 0 })
        .await;
    h.service
        .handle_message("c1", ClientMessage::Text { value: "hello".into() })
        .await;

    let acks: Vec<_> = drain(&mut rx1)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::InputAck { .. }))
        .collect();
    assert_eq!(acks.len(), 3);
    assert_eq!(acks[0], ServerMessage::InputAck { ok: true, error: None });
    assert!(matches!(&acks[1], ServerMessage::InputAck { ok: false, error: Some(e) } if e.contains('x')));
    assert_eq!(acks[2], ServerMessage::InputAck { ok: true, error: None });

    assert!(drain(&mut rx2)
        .iter()
        .all(|m| !matches!(m, ServerMessage::InputAck { .. })));
    assert_eq!(*h.browser.page(0).clicks.lock(), vec![(10, 20)]);
    assert_eq!(*h.browser.page(0).typed.lock(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn input_without_subscription_is_refused() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    h.service
        .handle_message("c1", ClientMessage::Scroll { dx: 0, dy: 100 })
        .await;
    assert!(matches!(
        next_message(&mut rx).await,
        ServerMessage::InputAck { ok: false, .. }
    ));
}

#[tokio::test]
async fn manual_quality_is_broadcast_and_sticks() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    create(&h, "s1").await;
    h.service.subscribe("s1", "c1").unwrap();
    // The first sample settles the tier; pin only after it.
    next_frame(&mut rx).await;

    h.service
        .handle_message("c1", ClientMessage::SetQuality { quality: 40 })
        .await;
    h.service
        .handle_message("c1", ClientMessage::SetFps { fps: 5 })
        .await;

    let changes: Vec<_> = {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::QualityChanged { .. }))
            .collect()
    };
    assert_eq!(
        changes.last(),
        Some(&ServerMessage::QualityChanged {
            session_id: "s1".into(),
            fps: 5,
            quality: 40,
            adaptive: false,
        })
    );

    h.service
        .handle_message("c1", ClientMessage::SetQuality { quality: 101 })
        .await;
    let errors: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::Error { class: ErrorClass::Input, .. }))
        .collect();
    assert_eq!(errors.len(), 1);

    let session = h.service.registry().get("s1").unwrap();
    assert_eq!((session.current_params().fps, session.current_params().quality), (5, 40));
    assert!(!session.is_adaptive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_link_climbs_to_high_tier_and_paces_faster() {
    let h = harness_with_encoder(StreamConfig::default(), Arc::new(BulkyEncoder));
    let mut rx = h.transport.register("c1");
    create(&h, "s1").await;
    h.service.subscribe("s1", "c1").unwrap();

    let mut changes = Vec::new();
    loop {
        match next_message(&mut rx).await {
            ServerMessage::Frame(frame) => {
                h.service
                    .handle_message("c1", ClientMessage::Ack { sequence: frame.sequence })
                    .await;
            }
            change @ ServerMessage::QualityChanged { .. } => {
                let high = matches!(change, ServerMessage::QualityChanged { quality: 90, .. });
                changes.push(change);
                if high {
                    break;
                }
            }
            _ => {}
        }
    }

    // Cold start reads as the low tier; the warm estimate lifts it to high.
    assert_eq!(
        changes.first(),
        Some(&ServerMessage::QualityChanged {
            session_id: "s1".into(),
            fps: 10,
            quality: 50,
            adaptive: true,
        })
    );
    assert_eq!(
        changes.last(),
        Some(&ServerMessage::QualityChanged {
            session_id: "s1".into(),
            fps: 30,
            quality: 90,
            adaptive: true,
        })
    );
    let session = h.service.registry().get("s1").unwrap();
    assert!(session.is_adaptive());
    assert_eq!((session.current_params().fps, session.current_params().quality), (30, 90));

    // Nine frames at the low tier's 100 ms cadence take at least 800 ms.
    let started = std::time::Instant::now();
    for _ in 0..9 {
        let frame = next_frame(&mut rx).await;
        h.service
            .handle_message("c1", ClientMessage::Ack { sequence: frame.sequence })
            .await;
    }
    assert!(
        started.elapsed() < Duration::from_millis(800),
        "frames still paced at the low tier: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn list_is_ordered_by_creation() {
    let h = harness(StreamConfig::default());
    for id in ["b", "a", "c"] {
        create(&h, id).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let ids: Vec<_> = h.service.list_sessions().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn shutdown_ends_every_session() {
    let h = harness(StreamConfig::default());
    let mut rx = h.transport.register("c1");
    create(&h, "s1").await;
    create(&h, "s2").await;
    h.service.subscribe("s2", "c1").unwrap();

    assert_eq!(h.service.shutdown().await, 2);
    assert!(h.service.registry().is_empty());
    assert!(drain(&mut rx).contains(&ServerMessage::SessionEnded {
        session_id: "s2".into(),
        reason: EndReason::Shutdown,
    }));
}
