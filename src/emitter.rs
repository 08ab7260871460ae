use crate::config::SynthesisConfig;
use crate::error::TtsError;
use crate::event::{EventSender, FinishReason, SessionEvent};
use crate::get_timestamp;
use crate::metrics::{audio_duration_ms, Metrics};
use crate::synthesis::SynthesisEvent;
use anyhow::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-request audio assembly: turns the transport event stream into
/// downstream notifications and collects the request's metrics.
///
/// State survives across consume() calls so a transparent retry does not
/// re-announce audio_start or reset the byte count.
pub struct EmitterSession {
    request_id: String,
    sender: EventSender,
    samplerate: u32,
    channels: u32,
    bits_per_sample: u32,
    started_at: Instant,
    first_byte_at: Option<Instant>,
    ttfb_ms: u64,
    byte_count: usize,
    /// Bytes of a replayed attempt to swallow before emitting again.
    replay_skip: usize,
    /// Shared with the coordinator so an interrupt can tell whether the
    /// terminal event already went out.
    finalized: Arc<AtomicBool>,
}

impl EmitterSession {
    pub fn new(
        request_id: &str,
        started_at: Instant,
        config: &SynthesisConfig,
        sender: EventSender,
        finalized: Arc<AtomicBool>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            sender,
            samplerate: config.samplerate,
            channels: config.channels,
            bits_per_sample: config.bits_per_sample,
            started_at,
            first_byte_at: None,
            ttfb_ms: 0,
            byte_count: 0,
            replay_skip: 0,
            finalized,
        }
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// Arm the next consume() pass for a replayed attempt: the transport will
    /// re-send the request from the top, so everything already delivered
    /// downstream has to be swallowed instead of emitted twice.
    pub fn begin_replay(&mut self) {
        self.replay_skip = self.byte_count;
    }

    /// Drain one transport stream. Returns the finish reason on a clean end;
    /// transport failures bubble up for the caller to classify and maybe
    /// retry. Chunks arriving after the discard flag is set are dropped.
    pub async fn consume(
        &mut self,
        stream: &mut BoxStream<'static, Result<SynthesisEvent>>,
        discard: &AtomicBool,
        token: &CancellationToken,
        read_timeout: Duration,
    ) -> Result<FinishReason> {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => return Ok(FinishReason::Interrupted),
                item = tokio::time::timeout(read_timeout, stream.next()) => match item {
                    Ok(item) => item,
                    Err(_) => {
                        return Err(TtsError::Network("vendor read timed out".into()).into());
                    }
                },
            };
            match item {
                None => {
                    return Err(TtsError::Network(
                        "vendor closed the stream before completion".into(),
                    )
                    .into());
                }
                Some(Ok(SynthesisEvent::AudioChunk(data))) => {
                    if discard.load(Ordering::SeqCst) || data.is_empty() {
                        // Keepalive/control payloads and post-interrupt
                        // stragglers never reach downstream.
                        continue;
                    }
                    let data = if self.replay_skip > 0 {
                        let skip = self.replay_skip.min(data.len());
                        self.replay_skip -= skip;
                        if skip == data.len() {
                            continue;
                        }
                        data.slice(skip..)
                    } else {
                        data
                    };
                    if self.first_byte_at.is_none() {
                        let now = Instant::now();
                        self.first_byte_at = Some(now);
                        self.ttfb_ms = now.duration_since(self.started_at).as_millis() as u64;
                        let _ = self.sender.send(SessionEvent::TtfbMetric {
                            request_id: self.request_id.clone(),
                            ms: self.ttfb_ms,
                        });
                        let _ = self.sender.send(SessionEvent::AudioStart {
                            request_id: self.request_id.clone(),
                            timestamp: get_timestamp(),
                        });
                    }
                    self.byte_count += data.len();
                    let _ = self.sender.send(SessionEvent::AudioData {
                        request_id: self.request_id.clone(),
                        data: data.to_vec(),
                    });
                }
                Some(Ok(SynthesisEvent::Flushed)) => {
                    debug!(request_id = %self.request_id, "vendor flushed pending output");
                }
                Some(Ok(SynthesisEvent::Finished)) => return Ok(FinishReason::RequestEnd),
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Emit the terminal notification and hand back the request metrics.
    /// Idempotent: a second call returns the same metrics without re-emitting.
    pub fn finalize(&mut self, reason: FinishReason) -> Metrics {
        let duration_ms = audio_duration_ms(
            self.byte_count,
            self.samplerate,
            self.channels,
            self.bits_per_sample,
        );
        let metrics = Metrics {
            ttfb_ms: self.ttfb_ms,
            total_audio_ms: duration_ms,
            byte_count: self.byte_count,
        };
        if self.finalized.swap(true, Ordering::SeqCst) {
            return metrics;
        }
        let interval_ms = self.started_at.elapsed().as_millis() as u64;
        let _ = self.sender.send(SessionEvent::AudioEnd {
            request_id: self.request_id.clone(),
            interval_ms,
            duration_ms,
            reason,
        });
        metrics
    }
}
