use crate::synthesis::SynthesisType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Synthesis client configuration, filled in by an external loader.
///
/// Vendor endpoint and credentials are optional because each strategy has a
/// sensible default endpoint and some vendors authenticate with a single key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SynthesisConfig {
    pub provider: SynthesisType,
    pub endpoint: Option<String>,
    pub app_id: Option<String>,
    pub secret_id: Option<String>,
    pub secret_key: Option<String>,
    pub speaker: Option<String>,
    pub codec: Option<String>,
    pub volume: Option<i32>,
    pub speed: Option<f32>,
    /// Declared audio format of the vendor session. Duration math depends on
    /// these, they must match what the vendor actually sends.
    pub samplerate: u32,
    pub channels: u32,
    pub bits_per_sample: u32,
    /// Retry budget shared by connect and mid-request recovery.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Vendor-side idle disconnect window. A keepalive frame is sent slightly
    /// before this elapses on the duplex strategy.
    pub idle_keepalive_ms: u64,
    /// Bounded wait for a single vendor read; overrun is a network failure.
    pub request_timeout_ms: u64,
    /// Bounded wait for resource release inside interrupt().
    pub release_timeout_ms: u64,
    /// Open a connection proactively at startup / after each request.
    pub prewarm: bool,
    /// Keep the vendor session alive across requests where the strategy
    /// supports it.
    pub reuse_session: bool,
    /// Whether an empty text submission is forwarded as an idle keepalive
    /// frame. Vendors disagree on what an empty frame means, so this is
    /// policy, not behavior.
    pub empty_text_is_keepalive: bool,
    pub extra: Option<HashMap<String, String>>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisType::Duplex,
            endpoint: None,
            app_id: None,
            secret_id: None,
            secret_key: None,
            speaker: None,
            codec: Some("pcm".to_string()),
            volume: None,
            speed: None,
            samplerate: 16000,
            channels: 1,
            bits_per_sample: 16,
            max_retries: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            idle_keepalive_ms: 8000,
            request_timeout_ms: 15000,
            release_timeout_ms: 3000,
            prewarm: false,
            reuse_session: false,
            empty_text_is_keepalive: true,
            extra: None,
        }
    }
}

impl SynthesisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.samplerate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }
}
