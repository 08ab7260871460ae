use crate::error::TtsErrorKind;
use serde::{Deserialize, Serialize};

/// Why a request stopped producing audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    RequestEnd,
    Interrupted,
    Error,
}

/// SessionEvent is everything the core emits downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// First real audio byte of a request arrived.
    #[serde(rename = "audio_start")]
    AudioStart { request_id: String, timestamp: u64 },

    /// One audio chunk, in vendor order.
    #[serde(rename = "audio_data")]
    AudioData { request_id: String, data: Vec<u8> },

    /// Request finished. interval_ms is wall time since the first fragment,
    /// duration_ms is the playable length of the emitted audio.
    #[serde(rename = "audio_end")]
    AudioEnd {
        request_id: String,
        interval_ms: u64,
        duration_ms: u64,
        reason: FinishReason,
    },

    /// Time to first audio byte.
    #[serde(rename = "ttfb")]
    TtfbMetric { request_id: String, ms: u64 },

    /// Request-scoped failure, always paired with an audio_end.
    #[serde(rename = "error")]
    Error {
        request_id: String,
        kind: TtsErrorKind,
        message: String,
    },
}

impl SessionEvent {
    pub fn request_id(&self) -> &str {
        match self {
            SessionEvent::AudioStart { request_id, .. } => request_id,
            SessionEvent::AudioData { request_id, .. } => request_id,
            SessionEvent::AudioEnd { request_id, .. } => request_id,
            SessionEvent::TtfbMetric { request_id, .. } => request_id,
            SessionEvent::Error { request_id, .. } => request_id,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;
