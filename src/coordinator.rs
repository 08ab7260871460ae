use crate::cancellation::{
    CancellationController, ReleaseGuard, ReleaseSignal, RequestHandle,
};
use crate::config::SynthesisConfig;
use crate::emitter::EmitterSession;
use crate::error::{TtsError, TtsErrorKind};
use crate::event::{EventReceiver, EventSender, FinishReason, SessionEvent};
use crate::metrics::Metrics;
use crate::supervisor::ConnectionSupervisor;
use crate::synthesis::{create_synthesis_client, SynthesisClient};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many finalized request ids are remembered for idempotent drops of
/// trailing fragments.
const FINALIZED_MEMORY: usize = 64;

/// Append-only fragment log for one request. The feeder task replays it from
/// the start on every attempt, so transparent retries resubmit exactly what
/// upstream sent.
struct FragmentQueue {
    items: std::sync::Mutex<Vec<(String, bool)>>,
    notify: Notify,
}

impl FragmentQueue {
    fn new(first: (String, bool)) -> Arc<Self> {
        Arc::new(Self {
            items: std::sync::Mutex::new(vec![first]),
            notify: Notify::new(),
        })
    }

    fn push(&self, text: String, end: bool) {
        self.items.lock().unwrap().push((text, end));
        self.notify.notify_waiters();
    }

    async fn next(&self, cursor: usize) -> (String, bool) {
        loop {
            if let Some(item) = self.items.lock().unwrap().get(cursor) {
                return item.clone();
            }
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().unwrap().get(cursor) {
                return item.clone();
            }
            notified.await;
        }
    }
}

struct ActiveRequest {
    id: String,
    end_of_stream: bool,
    started_at: Instant,
    queue: Arc<FragmentQueue>,
    discard: Arc<AtomicBool>,
    token: CancellationToken,
    released: Arc<ReleaseSignal>,
    /// Set once the request's audio_end went out, by whichever side got
    /// there first.
    finalized_event: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

struct CoordinatorInner {
    config: SynthesisConfig,
    supervisor: Arc<ConnectionSupervisor>,
    cancellation: CancellationController,
    event_sender: EventSender,
    current: tokio::sync::Mutex<Option<ActiveRequest>>,
    finalized: std::sync::Mutex<VecDeque<String>>,
    halted: AtomicBool,
    metrics: std::sync::Mutex<HashMap<String, Metrics>>,
}

impl CoordinatorInner {
    fn mark_finalized(&self, request_id: &str) {
        let mut finalized = self.finalized.lock().unwrap();
        if finalized.iter().any(|id| id == request_id) {
            return;
        }
        if finalized.len() == FINALIZED_MEMORY {
            finalized.pop_front();
        }
        finalized.push_back(request_id.to_string());
    }

    fn is_finalized(&self, request_id: &str) -> bool {
        self.finalized
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == request_id)
    }

    fn record_metrics(&self, request_id: &str, metrics: Metrics) {
        self.metrics
            .lock()
            .unwrap()
            .insert(request_id.to_string(), metrics);
    }
}

/// Top-level entry point: receives ordered text fragments keyed by request
/// id, keeps at most one request in flight, and drives the supervisor,
/// emitter and cancellation controller.
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestCoordinator {
    pub fn new(
        config: SynthesisConfig,
        client: Box<dyn SynthesisClient>,
        event_sender: EventSender,
    ) -> Self {
        let client: Arc<dyn SynthesisClient> = Arc::from(client);
        let supervisor = Arc::new(ConnectionSupervisor::new(client, config.clone()));
        let cancellation = CancellationController::new(config.release_timeout());
        let inner = Arc::new(CoordinatorInner {
            config,
            supervisor,
            cancellation,
            event_sender,
            current: tokio::sync::Mutex::new(None),
            finalized: std::sync::Mutex::new(VecDeque::new()),
            halted: AtomicBool::new(false),
            metrics: std::sync::Mutex::new(HashMap::new()),
        });
        if inner.config.prewarm {
            let supervisor = inner.supervisor.clone();
            tokio::spawn(async move {
                let _ = supervisor.prewarm().await;
            });
        }
        Self { inner }
    }

    pub fn from_config(config: SynthesisConfig, event_sender: EventSender) -> Result<Self> {
        let client = create_synthesis_client(&config)?;
        Ok(Self::new(config, client, event_sender))
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_sender.subscribe()
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        self.inner.supervisor.clone()
    }

    pub fn metrics(&self, request_id: &str) -> Option<Metrics> {
        self.inner.metrics.lock().unwrap().get(request_id).cloned()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// External reconfiguration hook: clears the credential halt.
    pub fn reset(&self) {
        self.inner.halted.store(false, Ordering::SeqCst);
        self.inner.supervisor.reset();
    }

    /// Feed one upstream fragment. A fragment for a new request id finalizes
    /// the previous request with reason Interrupted before the new one
    /// begins; fragments for finalized ids are dropped silently.
    pub async fn submit_fragment(
        &self,
        request_id: &str,
        text: &str,
        is_end: bool,
    ) -> Result<()> {
        if self.inner.halted.load(Ordering::SeqCst) {
            return Err(
                TtsError::Auth("halted by credential failure, reset required".into()).into(),
            );
        }

        let to_interrupt = {
            let mut current = self.inner.current.lock().await;
            match current.as_mut() {
                Some(active) if active.id == request_id => {
                    if active.end_of_stream {
                        debug!(request_id, "fragment after terminal flag dropped");
                        return Ok(());
                    }
                    if is_end {
                        active.end_of_stream = true;
                    }
                    active.queue.push(text.to_string(), is_end);
                    return Ok(());
                }
                Some(_) => current.take(),
                None => None,
            }
        };

        if let Some(active) = to_interrupt {
            debug!(
                previous = %active.id,
                next = request_id,
                "turn change, interrupting previous request"
            );
            self.interrupt_active(active).await?;
        }

        if self.inner.is_finalized(request_id) {
            debug!(request_id, "fragment for finalized request dropped");
            return Ok(());
        }

        let active = self.start_request(request_id, text, is_end);
        *self.inner.current.lock().await = Some(active);
        Ok(())
    }

    /// Barge-in: tear down the in-flight request, if any. When this returns,
    /// the transport session is closed and no further audio_data for the
    /// interrupted request will be emitted.
    pub async fn interrupt(&self) -> Result<()> {
        let active = self.inner.current.lock().await.take();
        if let Some(active) = active {
            self.interrupt_active(active).await?;
        }
        Ok(())
    }

    async fn interrupt_active(&self, active: ActiveRequest) -> Result<()> {
        self.inner.mark_finalized(&active.id);
        let request_id = active.id.clone();
        let started_at = active.started_at;
        let finalized_event = active.finalized_event.clone();
        let handle = RequestHandle {
            id: active.id,
            discard: active.discard,
            token: active.token,
            released: active.released,
            task: active.task,
        };
        self.inner.cancellation.interrupt(handle).await?;
        // A forced abort kills the request task before it can finalize; the
        // terminal event still has to release downstream consumers.
        if !finalized_event.swap(true, Ordering::SeqCst) {
            let _ = self.inner.event_sender.send(SessionEvent::AudioEnd {
                request_id,
                interval_ms: started_at.elapsed().as_millis() as u64,
                duration_ms: 0,
                reason: FinishReason::Interrupted,
            });
        }
        self.inner.supervisor.close_session().await?;
        Ok(())
    }

    fn start_request(&self, request_id: &str, text: &str, is_end: bool) -> ActiveRequest {
        let queue = FragmentQueue::new((text.to_string(), is_end));
        let discard = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let released = ReleaseSignal::new();
        let finalized_event = Arc::new(AtomicBool::new(false));
        let started_at = Instant::now();

        let task = tokio::spawn(run_request(
            self.inner.clone(),
            request_id.to_string(),
            started_at,
            queue.clone(),
            discard.clone(),
            token.clone(),
            released.clone(),
            finalized_event.clone(),
        ));

        ActiveRequest {
            id: request_id.to_string(),
            end_of_stream: is_end,
            started_at,
            queue,
            discard,
            token,
            released,
            finalized_event,
            task,
        }
    }
}

/// Replay the fragment log into the transport, then follow it live. Ends at
/// the terminal fragment; submission failures are left to surface through
/// the event stream.
async fn feed_fragments(
    client: Arc<dyn SynthesisClient>,
    queue: Arc<FragmentQueue>,
    token: CancellationToken,
) {
    let mut cursor = 0usize;
    loop {
        let (text, end) = tokio::select! {
            _ = token.cancelled() => return,
            item = queue.next(cursor) => item,
        };
        cursor += 1;
        if let Err(e) = client.synthesize(&text, end).await {
            warn!("fragment submission failed: {}", e);
            return;
        }
        if end {
            return;
        }
    }
}

/// One spawned task per request: opens a session through the supervisor,
/// feeds fragments, drains events through the emitter, retries retryable
/// failures within budget, and finalizes exactly once.
#[allow(clippy::too_many_arguments)]
async fn run_request(
    inner: Arc<CoordinatorInner>,
    request_id: String,
    started_at: Instant,
    queue: Arc<FragmentQueue>,
    discard: Arc<AtomicBool>,
    token: CancellationToken,
    released: Arc<ReleaseSignal>,
    finalized_event: Arc<AtomicBool>,
) {
    let _guard = ReleaseGuard::new(released);
    let mut emitter = EmitterSession::new(
        &request_id,
        started_at,
        &inner.config,
        inner.event_sender.clone(),
        finalized_event,
    );
    let read_timeout = inner.config.request_timeout();
    let client = inner.supervisor.client();

    let mut attempt: u32 = 0;
    let outcome: Result<FinishReason> = loop {
        let mut stream = match inner.supervisor.open_session(token.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if token.is_cancelled() {
                    break Ok(FinishReason::Interrupted);
                }
                break Err(e);
            }
        };

        let feeder = tokio::spawn(feed_fragments(
            client.clone(),
            queue.clone(),
            token.clone(),
        ));
        let result = emitter
            .consume(&mut stream, &discard, &token, read_timeout)
            .await;
        feeder.abort();

        match result {
            Ok(reason) => break Ok(reason),
            Err(e) => {
                let kind = TtsError::classify(&e);
                let _ = inner.supervisor.close_session().await;
                attempt += 1;
                if !kind.is_retryable() || attempt >= inner.config.max_retries {
                    break Err(e);
                }
                // The next attempt replays the fragment log from the top, so
                // audio already delivered must be swallowed, not re-emitted.
                emitter.begin_replay();
                let delay = inner.supervisor.backoff_delay(attempt);
                warn!(
                    %request_id,
                    attempt,
                    "request failed mid-stream ({}), retrying in {:?}",
                    e,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break Ok(FinishReason::Interrupted),
                }
            }
        }
    };

    match outcome {
        Ok(FinishReason::RequestEnd) => {
            let metrics = emitter.finalize(FinishReason::RequestEnd);
            inner.record_metrics(&request_id, metrics);
            if !inner.config.reuse_session {
                let _ = inner.supervisor.close_session().await;
            }
            if inner.config.prewarm || inner.config.reuse_session {
                // Pre-open the next session so the following turn starts hot.
                let supervisor = inner.supervisor.clone();
                tokio::spawn(async move {
                    let _ = supervisor.prewarm().await;
                });
            }
        }
        Ok(_) => {
            let _ = inner.supervisor.close_session().await;
            let metrics = emitter.finalize(FinishReason::Interrupted);
            inner.record_metrics(&request_id, metrics);
        }
        Err(e) => {
            let kind = TtsError::classify(&e);
            if kind.is_fatal() {
                // Halt before surfacing so nothing sneaks in between the
                // error event and the rejection of new requests.
                inner.halted.store(true, Ordering::SeqCst);
                inner.supervisor.mark_failed();
            }
            let _ = inner.supervisor.close_session().await;
            let _ = inner.event_sender.send(SessionEvent::Error {
                request_id: request_id.clone(),
                kind,
                message: e.to_string(),
            });
            let metrics = emitter.finalize(FinishReason::Error);
            inner.record_metrics(&request_id, metrics);
        }
    }

    inner.mark_finalized(&request_id);
    let mut current = inner.current.lock().await;
    if current
        .as_ref()
        .map(|active| active.id == request_id)
        .unwrap_or(false)
    {
        current.take();
    }
}
