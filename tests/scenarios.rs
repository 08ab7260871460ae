use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use synthflow::config::SynthesisConfig;
use synthflow::coordinator::RequestCoordinator;
use synthflow::error::{TtsError, TtsErrorKind};
use synthflow::event::{EventReceiver, FinishReason, SessionEvent};
use synthflow::supervisor::SessionState;
use synthflow::synthesis::{SynthesisClient, SynthesisEvent, SynthesisType};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// How many times each submitted fragment is repeated into audio bytes, so
/// byte counts are big enough to give non-zero playable durations.
const ECHO_FACTOR: usize = 100;

#[derive(Debug, Clone, Copy)]
enum FakeBehavior {
    /// Echo each fragment as audio, finish on the terminal fragment.
    Echo,
    /// Refuse to open the session.
    FailOpen(TtsErrorKind),
    /// Open fine, then fail the stream on the first submitted fragment.
    FailOnFragment(TtsErrorKind),
    /// Echo the first fragment, then fail the stream on the next one.
    FailMidway(TtsErrorKind),
    /// Never complete the open at all, ignoring cancellation.
    HangOpen,
}

fn make_error(kind: TtsErrorKind) -> anyhow::Error {
    match kind {
        TtsErrorKind::AuthError => TtsError::Auth("invalid credentials".into()),
        TtsErrorKind::RateLimit => TtsError::RateLimit("throttled".into()),
        TtsErrorKind::Network => TtsError::Network("connection refused".into()),
        TtsErrorKind::VendorBusiness => TtsError::Vendor {
            code: 400,
            message: "unsupported voice".into(),
        },
        TtsErrorKind::Unknown => TtsError::Unknown("unexplained".into()),
    }
    .into()
}

struct FakeInner {
    /// Consumed one per start(); an empty queue means Echo.
    behaviors: Mutex<VecDeque<FakeBehavior>>,
    session: Mutex<Option<(FakeBehavior, mpsc::UnboundedSender<Result<SynthesisEvent>>)>>,
    session_fragments: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

/// Scriptable in-process vendor. Behaves like the real strategies at the
/// trait boundary: start() hands back a per-request stream, synthesize()
/// pushes into it, stop() tears the session down.
#[derive(Clone)]
struct FakeClient {
    inner: Arc<FakeInner>,
}

impl FakeClient {
    fn new(behaviors: Vec<FakeBehavior>) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                behaviors: Mutex::new(behaviors.into()),
                session: Mutex::new(None),
                session_fragments: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
            }),
        }
    }

    fn start_calls(&self) -> usize {
        self.inner.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisClient for FakeClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Duplex
    }

    async fn start(
        &self,
        _token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        self.inner.start_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .inner
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeBehavior::Echo);
        match behavior {
            FakeBehavior::FailOpen(kind) => return Err(make_error(kind)),
            FakeBehavior::HangOpen => futures::future::pending::<()>().await,
            _ => {}
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.session_fragments.store(0, Ordering::SeqCst);
        *self.inner.session.lock().unwrap() = Some((behavior, tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()> {
        let session = self.inner.session.lock().unwrap();
        let (behavior, tx) = session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no session open"))?;
        match behavior {
            FakeBehavior::FailOnFragment(kind) => {
                let _ = tx.send(Err(make_error(*kind)));
            }
            FakeBehavior::FailMidway(kind) => {
                let fragment = self.inner.session_fragments.fetch_add(1, Ordering::SeqCst);
                if fragment == 0 {
                    let audio = text.as_bytes().repeat(ECHO_FACTOR);
                    let _ = tx.send(Ok(SynthesisEvent::AudioChunk(Bytes::from(audio))));
                } else {
                    let _ = tx.send(Err(make_error(*kind)));
                }
            }
            _ => {
                if !text.is_empty() {
                    let audio = text.as_bytes().repeat(ECHO_FACTOR);
                    let _ = tx.send(Ok(SynthesisEvent::AudioChunk(Bytes::from(audio))));
                }
                if end_of_stream {
                    let _ = tx.send(Ok(SynthesisEvent::Finished));
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.inner.session.lock().unwrap() = None;
        Ok(())
    }
}

fn test_config() -> SynthesisConfig {
    SynthesisConfig {
        max_retries: 3,
        backoff_base_ms: 2,
        backoff_max_ms: 10,
        request_timeout_ms: 2000,
        release_timeout_ms: 1000,
        prewarm: false,
        reuse_session: false,
        ..Default::default()
    }
}

fn coordinator_with(
    behaviors: Vec<FakeBehavior>,
) -> (RequestCoordinator, FakeClient, EventReceiver) {
    let _ = tracing_subscriber::fmt::try_init();
    let client = FakeClient::new(behaviors);
    let (tx, rx) = broadcast::channel(128);
    let coordinator = RequestCoordinator::new(test_config(), Box::new(client.clone()), tx);
    (coordinator, client, rx)
}

async fn next_event(rx: &mut EventReceiver) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Drain events until the given request's audio_end arrives, returning
/// everything seen in order (the audio_end included).
async fn drain_until_end(rx: &mut EventReceiver, request_id: &str) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(
            &event,
            SessionEvent::AudioEnd { request_id: id, .. } if id == request_id
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_single_request_emits_start_data_end_with_metrics() {
    let (coordinator, _client, mut rx) = coordinator_with(vec![]);

    coordinator.submit_fragment("r1", "Hello ", false).await.unwrap();
    coordinator.submit_fragment("r1", "world", true).await.unwrap();

    match next_event(&mut rx).await {
        SessionEvent::TtfbMetric { request_id, .. } => assert_eq!(request_id, "r1"),
        other => panic!("expected ttfb first, got {:?}", other),
    }
    match next_event(&mut rx).await {
        SessionEvent::AudioStart { request_id, .. } => assert_eq!(request_id, "r1"),
        other => panic!("expected audio_start, got {:?}", other),
    }

    let mut audio = Vec::new();
    loop {
        match next_event(&mut rx).await {
            SessionEvent::AudioData { data, .. } => audio.extend_from_slice(&data),
            SessionEvent::AudioEnd {
                request_id,
                duration_ms,
                reason,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(reason, FinishReason::RequestEnd);
                assert!(duration_ms > 0);
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // Every submitted byte comes back in order, nothing added or dropped.
    let mut expected = b"Hello ".repeat(ECHO_FACTOR);
    expected.extend_from_slice(&b"world".repeat(ECHO_FACTOR));
    assert_eq!(audio, expected);

    // Metrics are recorded just after the terminal event.
    let metrics = loop {
        if let Some(metrics) = coordinator.metrics("r1") {
            break metrics;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(metrics.byte_count, expected.len());
    assert!(metrics.total_audio_ms > 0);
}

#[tokio::test]
async fn test_new_request_id_interrupts_the_previous_request() {
    let (coordinator, _client, mut rx) = coordinator_with(vec![]);

    coordinator.submit_fragment("r1", "first turn", false).await.unwrap();
    // r1 is live once its audio shows up.
    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::AudioData { .. }) {
            break;
        }
    }

    coordinator.submit_fragment("r2", "second turn", true).await.unwrap();

    // r1 closes with reason interrupted before anything of r2 appears.
    let mut saw_r1_end = false;
    loop {
        let event = next_event(&mut rx).await;
        match &event {
            SessionEvent::AudioEnd {
                request_id, reason, ..
            } if request_id == "r1" => {
                assert_eq!(*reason, FinishReason::Interrupted);
                saw_r1_end = true;
                break;
            }
            other => {
                assert_eq!(
                    other.request_id(),
                    "r1",
                    "r2 event arrived before r1 was finalized: {:?}",
                    other
                );
            }
        }
    }
    assert!(saw_r1_end);

    let r2_events = drain_until_end(&mut rx, "r2").await;
    assert!(r2_events.iter().all(|e| e.request_id() == "r2"));
    assert!(matches!(
        r2_events.last(),
        Some(SessionEvent::AudioEnd {
            reason: FinishReason::RequestEnd,
            ..
        })
    ));

    // A trailing fragment for the interrupted request is dropped silently.
    coordinator.submit_fragment("r1", "late straggler", true).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_credential_failure_halts_until_reset() {
    let (coordinator, client, mut rx) = coordinator_with(vec![FakeBehavior::FailOnFragment(
        TtsErrorKind::AuthError,
    )]);

    coordinator.submit_fragment("r1", "hello", true).await.unwrap();

    let events = drain_until_end(&mut rx, "r1").await;
    let errors: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1, "credential failure must surface exactly once");
    match errors[0] {
        SessionEvent::Error { kind, .. } => assert_eq!(*kind, TtsErrorKind::AuthError),
        _ => unreachable!(),
    }
    assert!(matches!(
        events.last(),
        Some(SessionEvent::AudioEnd {
            reason: FinishReason::Error,
            ..
        })
    ));

    // No reconnect attempt was made for a credential rejection.
    assert_eq!(client.start_calls(), 1);
    assert!(coordinator.is_halted());

    // New work is rejected while halted; nothing reaches the vendor.
    assert!(coordinator.submit_fragment("r2", "hello", true).await.is_err());
    assert_eq!(client.start_calls(), 1);

    // Reset clears the halt and the next request runs normally.
    coordinator.reset();
    assert!(!coordinator.is_halted());
    coordinator.submit_fragment("r3", "try again", true).await.unwrap();
    let events = drain_until_end(&mut rx, "r3").await;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::AudioEnd {
            reason: FinishReason::RequestEnd,
            ..
        })
    ));
}

#[tokio::test]
async fn test_transient_open_failures_recover_transparently() {
    let (coordinator, client, mut rx) = coordinator_with(vec![
        FakeBehavior::FailOpen(TtsErrorKind::Network),
        FakeBehavior::FailOpen(TtsErrorKind::Network),
    ]);

    coordinator.submit_fragment("r1", "resilient", true).await.unwrap();

    let events = drain_until_end(&mut rx, "r1").await;
    // Two connect failures, then success, all inside one request.
    assert_eq!(client.start_calls(), 3);
    assert!(
        events.iter().all(|e| !matches!(e, SessionEvent::Error { .. })),
        "transient recovery must not surface an error event"
    );
    assert!(matches!(
        events.last(),
        Some(SessionEvent::AudioEnd {
            reason: FinishReason::RequestEnd,
            ..
        })
    ));
}

#[tokio::test]
async fn test_mid_stream_failure_retries_and_replays_fragments() {
    let (coordinator, client, mut rx) = coordinator_with(vec![FakeBehavior::FailOnFragment(
        TtsErrorKind::Network,
    )]);

    coordinator.submit_fragment("r1", "retry me", true).await.unwrap();

    let events = drain_until_end(&mut rx, "r1").await;
    // First session dies on the fragment, the second replays it and finishes.
    assert_eq!(client.start_calls(), 2);
    assert!(events.iter().all(|e| !matches!(e, SessionEvent::Error { .. })));

    let audio: usize = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::AudioData { data, .. } => Some(data.len()),
            _ => None,
        })
        .sum();
    assert_eq!(audio, "retry me".len() * ECHO_FACTOR);
}

#[tokio::test]
async fn test_mid_stream_retry_does_not_duplicate_delivered_audio() {
    let (coordinator, client, mut rx) =
        coordinator_with(vec![FakeBehavior::FailMidway(TtsErrorKind::Network)]);

    coordinator.submit_fragment("r1", "AAAA", false).await.unwrap();
    coordinator.submit_fragment("r1", "BBBB", true).await.unwrap();

    let events = drain_until_end(&mut rx, "r1").await;
    // The first session delivered the first fragment's audio, then died on
    // the second; the retry replays both fragments.
    assert_eq!(client.start_calls(), 2);
    assert!(events.iter().all(|e| !matches!(e, SessionEvent::Error { .. })));

    let mut audio = Vec::new();
    for event in &events {
        if let SessionEvent::AudioData { data, .. } = event {
            audio.extend_from_slice(data);
        }
    }
    let mut expected = b"AAAA".repeat(ECHO_FACTOR);
    expected.extend_from_slice(&b"BBBB".repeat(ECHO_FACTOR));
    assert_eq!(
        audio, expected,
        "audio already delivered before the failure was re-emitted"
    );

    let metrics = loop {
        if let Some(metrics) = coordinator.metrics("r1") {
            break metrics;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(metrics.byte_count, expected.len());
}

#[tokio::test]
async fn test_forced_abort_interrupt_still_emits_audio_end() {
    let client = FakeClient::new(vec![FakeBehavior::HangOpen]);
    let (tx, mut rx) = broadcast::channel(128);
    let config = SynthesisConfig {
        release_timeout_ms: 200,
        ..test_config()
    };
    let coordinator = RequestCoordinator::new(config, Box::new(client.clone()), tx);

    coordinator.submit_fragment("r1", "stuck", true).await.unwrap();
    // Let the request task get stuck inside the vendor open.
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.interrupt().await.unwrap();

    // Even a forced teardown releases downstream with a terminal event.
    match next_event(&mut rx).await {
        SessionEvent::AudioEnd {
            request_id, reason, ..
        } => {
            assert_eq!(request_id, "r1");
            assert_eq!(reason, FinishReason::Interrupted);
        }
        other => panic!("expected audio_end, got {:?}", other),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "exactly one terminal event per request"
    );
}

#[tokio::test]
async fn test_interrupt_tears_down_within_the_release_bound() {
    let (coordinator, _client, mut rx) = coordinator_with(vec![]);

    coordinator.submit_fragment("r1", "long answer", false).await.unwrap();
    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::AudioData { .. }) {
            break;
        }
    }

    let before = Instant::now();
    coordinator.interrupt().await.unwrap();
    assert!(
        before.elapsed() < Duration::from_millis(900),
        "interrupt must return within the release bound"
    );

    match next_event(&mut rx).await {
        SessionEvent::AudioEnd {
            request_id, reason, ..
        } => {
            assert_eq!(request_id, "r1");
            assert_eq!(reason, FinishReason::Interrupted);
        }
        other => panic!("expected audio_end, got {:?}", other),
    }
    assert_eq!(
        coordinator.supervisor().session_state(),
        SessionState::Closed
    );

    // Nothing for r1 leaks downstream after the interrupt returned.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_fragments_after_the_terminal_flag_are_dropped() {
    let (coordinator, _client, mut rx) = coordinator_with(vec![]);

    coordinator.submit_fragment("r1", "done", true).await.unwrap();
    drain_until_end(&mut rx, "r1").await;

    // Both a duplicate terminal and a plain straggler are no-ops.
    coordinator.submit_fragment("r1", "", true).await.unwrap();
    coordinator.submit_fragment("r1", "more", false).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}
