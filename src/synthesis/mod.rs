use crate::config::SynthesisConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod duplex;
mod http;
mod native;
mod streaming;

pub use duplex::DuplexTtsClient;
pub use http::HttpTtsClient;
pub use native::{NativeCallback, NativeChunk, NativeSynthesizer, NativeTtsClient};
pub use streaming::StreamTtsClient;


/// The four structural transport patterns a vendor can expose. Selected once
/// at construction, never switched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisType {
    /// Persistent bidirectional websocket, text sent incrementally.
    Duplex,
    /// One command pair per request, one response stream back.
    Streaming,
    /// One pooled HTTP request/response cycle per request.
    Http,
    /// Vendor SDK push callbacks bridged behind the same contract.
    Native,
}

/// One item of a per-request event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    AudioChunk(Bytes),
    /// Vendor acknowledged a flush; pending output has been drained.
    Flushed,
    /// Terminal event, the stream ends after this.
    Finished,
}

pub type SynthesisEventSender = mpsc::UnboundedSender<Result<SynthesisEvent>>;
pub type SynthesisEventReceiver = mpsc::UnboundedReceiver<Result<SynthesisEvent>>;

/// Uniform session contract over the four transport patterns.
///
/// `start` opens the session and returns the event stream for exactly one
/// request; it is not restartable, a new call is a new request. Fragments go
/// in through `synthesize`, `end_of_stream = true` finishes and drains.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    fn provider(&self) -> SynthesisType;

    /// Pre-open the underlying connection without binding it to a request.
    /// Connection-oriented strategies use this for pre-warming; the rest
    /// treat it as a no-op.
    async fn prepare(&self, _token: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn start(
        &self,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>>;

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()>;

    /// Tear down the live session. Safe to call more than once.
    async fn stop(&self) -> Result<()>;
}

/// Build the configured strategy. The native strategy needs a vendor engine
/// and is constructed directly with [`NativeTtsClient::new`].
pub fn create_synthesis_client(config: &SynthesisConfig) -> Result<Box<dyn SynthesisClient>> {
    match config.provider {
        SynthesisType::Duplex => DuplexTtsClient::create(config),
        SynthesisType::Streaming => StreamTtsClient::create(config),
        SynthesisType::Http => HttpTtsClient::create(config),
        SynthesisType::Native => Err(anyhow!(
            "native strategy wraps a vendor SDK, construct it with NativeTtsClient::new"
        )),
    }
}

/// Bridge an event receiver into the finite per-request stream the contract
/// requires. Shared by the strategies that deliver through a channel.
pub(crate) fn receiver_stream(
    rx: SynthesisEventReceiver,
) -> BoxStream<'static, Result<SynthesisEvent>> {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Some(event) => {
                let terminal = matches!(event, Ok(SynthesisEvent::Finished) | Err(_));
                if terminal {
                    // Yield the terminal item, then end on the next poll.
                    Some((event, closed_receiver()))
                } else {
                    Some((event, rx))
                }
            }
            None => None,
        }
    }))
}

fn closed_receiver() -> SynthesisEventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tx);
    rx
}
