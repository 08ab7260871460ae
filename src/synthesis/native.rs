use super::{
    receiver_stream, SynthesisClient, SynthesisEvent, SynthesisEventSender, SynthesisType,
};
use crate::config::SynthesisConfig;
use crate::error::TtsError;
use anyhow::Result;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What a vendor SDK pushes into its callback.
#[derive(Debug, Clone)]
pub enum NativeChunk {
    Audio(Vec<u8>),
    /// The SDK finished the fragment it was given.
    End,
    Failure(String),
}

pub type NativeCallback = Arc<dyn Fn(NativeChunk) + Send + Sync>;

/// The vendor-supplied streaming primitive. The SDK may invoke the callback
/// from its own thread; it must push `End` exactly once per `synthesize`
/// call, after the last audio chunk for that fragment.
pub trait NativeSynthesizer: Send + Sync {
    fn synthesize(&self, text: &str, handler: NativeCallback) -> Result<()>;
    fn cancel(&self) {}
}

/// Adapter that turns push-style SDK callbacks into the pollable, finite
/// per-request event stream the rest of the core consumes.
pub struct NativeTtsClient {
    #[allow(dead_code)]
    option: SynthesisConfig,
    engine: Arc<dyn NativeSynthesizer>,
    tx: Mutex<Option<SynthesisEventSender>>,
    /// Fragments handed to the SDK whose End has not come back yet.
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl NativeTtsClient {
    pub fn create(
        option: &SynthesisConfig,
        engine: Arc<dyn NativeSynthesizer>,
    ) -> Result<Box<dyn SynthesisClient>> {
        Ok(Box::new(Self::new(option.clone(), engine)))
    }

    pub fn new(option: SynthesisConfig, engine: Arc<dyn NativeSynthesizer>) -> Self {
        Self {
            option,
            engine,
            tx: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    fn callback(&self, tx: SynthesisEventSender) -> NativeCallback {
        let pending = self.pending.clone();
        let drained = self.drained.clone();
        Arc::new(move |chunk| match chunk {
            NativeChunk::Audio(data) => {
                let _ = tx.send(Ok(SynthesisEvent::AudioChunk(data.into())));
            }
            NativeChunk::End => {
                pending.fetch_sub(1, Ordering::SeqCst);
                drained.notify_waiters();
            }
            NativeChunk::Failure(message) => {
                let _ = tx.send(Err(TtsError::Unknown(message).into()));
                pending.fetch_sub(1, Ordering::SeqCst);
                drained.notify_waiters();
            }
        })
    }
}

#[async_trait::async_trait]
impl SynthesisClient for NativeTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Native
    }

    async fn start(
        &self,
        _token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        self.pending.store(0, Ordering::SeqCst);
        Ok(receiver_stream(rx))
    }

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("native tts: should call start first"))?;

        if !text.is_empty() {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.engine.synthesize(text, self.callback(tx.clone())) {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                warn!("native engine rejected fragment: {}", e);
                let _ = tx.send(Err(e));
                return Ok(());
            }
        }

        if end_of_stream {
            // The SDK may still be pushing from its own thread; the terminal
            // event must trail every chunk already accepted.
            while self.pending.load(Ordering::SeqCst) > 0 {
                let notified = self.drained.notified();
                if self.pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
            let _ = tx.send(Ok(SynthesisEvent::Finished));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.engine.cancel();
        *self.tx.lock().unwrap() = None;
        Ok(())
    }
}
