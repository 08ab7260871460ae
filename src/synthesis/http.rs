use super::{
    receiver_stream, SynthesisClient, SynthesisEvent, SynthesisEventSender, SynthesisType,
};
use crate::config::SynthesisConfig;
use crate::error::TtsError;
use anyhow::{anyhow, Result};
use futures::{stream::BoxStream, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HttpTtsRequest {
    text: String,
    session_id: String,
    voice_type: String,
    volume: i32,
    speed: f32,
    sample_rate: u32,
    codec: String,
}

/// Chunked HTTP strategy: fragments are buffered until the terminal one, then
/// a single signed POST streams the audio body back over a pooled connection.
/// Nothing persists between requests except the connection pool itself.
pub struct HttpTtsClient {
    option: SynthesisConfig,
    http_client: HttpClient,
    buffer: Mutex<String>,
    tx: Mutex<Option<SynthesisEventSender>>,
}

impl HttpTtsClient {
    pub fn create(option: &SynthesisConfig) -> Result<Box<dyn SynthesisClient>> {
        if option.endpoint.is_none() {
            return Err(anyhow!("http strategy requires a vendor endpoint"));
        }
        Ok(Box::new(Self::new(option.clone())))
    }

    pub fn new(option: SynthesisConfig) -> Self {
        let http_client = HttpClient::builder()
            .connect_timeout(option.request_timeout())
            .build()
            .unwrap_or_default();
        Self {
            option,
            http_client,
            buffer: Mutex::new(String::new()),
            tx: Mutex::new(None),
        }
    }

    /// TC3-style request signature: hash the canonical request, derive the
    /// signing key through the date/service/request chain, hex-encode.
    fn generate_signature(
        secret_key: &str,
        host: &str,
        method: &str,
        timestamp: u64,
        request_body: &str,
    ) -> Result<String> {
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();

        let canonical_headers = format!(
            "content-type:application/json\nhost:{}\nx-tc-action:texttovoice\n",
            host
        );
        let signed_headers = "content-type;host;x-tc-action";
        let hashed_request_payload = hex::encode(Sha256::digest(request_body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, "/", "", canonical_headers, signed_headers, hashed_request_payload
        );

        let credential_scope = format!("{}/tts/tc3_request", date);
        let hashed_canonical_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = format!(
            "TC3-HMAC-SHA256\n{}\n{}\n{}",
            timestamp, credential_scope, hashed_canonical_request
        );

        let tc3_secret = format!("TC3{}", secret_key);
        let mut mac = Hmac::<Sha256>::new_from_slice(tc3_secret.as_bytes())?;
        mac.update(date.as_bytes());
        let secret_date = mac.finalize().into_bytes();

        let mut mac = Hmac::<Sha256>::new_from_slice(&secret_date)?;
        mac.update(b"tts");
        let secret_service = mac.finalize().into_bytes();

        let mut mac = Hmac::<Sha256>::new_from_slice(&secret_service)?;
        mac.update(b"tc3_request");
        let secret_signing = mac.finalize().into_bytes();

        let mut mac = Hmac::<Sha256>::new_from_slice(&secret_signing)?;
        mac.update(string_to_sign.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(hex::encode(signature))
    }

    async fn run_request(
        option: SynthesisConfig,
        http_client: HttpClient,
        text: String,
        tx: SynthesisEventSender,
    ) -> Result<()> {
        let endpoint = option
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("http strategy requires a vendor endpoint"))?;
        let uri = endpoint.parse::<http::Uri>()?;
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("endpoint has no host"))?
            .to_string();

        let secret_id = option.secret_id.clone().unwrap_or_default();
        let secret_key = option.secret_key.clone().unwrap_or_default();
        if secret_id.is_empty() || secret_key.is_empty() {
            return Err(TtsError::Auth("missing vendor credentials".into()).into());
        }

        let request = HttpTtsRequest {
            text,
            session_id: Uuid::new_v4().to_string(),
            voice_type: option.speaker.clone().unwrap_or_else(|| "default".into()),
            volume: option.volume.unwrap_or(0),
            speed: option.speed.unwrap_or(0.0),
            sample_rate: option.samplerate,
            codec: option.codec.clone().unwrap_or_else(|| "pcm".into()),
        };
        let request_body = serde_json::to_string(&request)?;

        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let signature =
            Self::generate_signature(&secret_key, &host, "POST", timestamp, &request_body)?;
        let authorization = format!(
            "TC3-HMAC-SHA256 Credential={}/{}/tts/tc3_request, SignedHeaders=content-type;host;x-tc-action, Signature={}",
            secret_id, date, signature
        );

        let response = http_client
            .post(endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", authorization)
            .header("Host", &host)
            .header("X-TC-Action", "TextToVoice")
            .header("X-TC-Timestamp", timestamp.to_string())
            .body(request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::from_vendor_code(status.as_u16() as i64, body).into());
        }

        debug!("http tts response started, streaming body");
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| TtsError::Network(e.to_string()))?;
            tx.send(Ok(SynthesisEvent::AudioChunk(chunk)))?;
        }
        tx.send(Ok(SynthesisEvent::Finished))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SynthesisClient for HttpTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Http
    }

    async fn start(
        &self,
        _token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        self.buffer.lock().unwrap().clear();
        Ok(receiver_stream(rx))
    }

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()> {
        if !text.is_empty() {
            self.buffer.lock().unwrap().push_str(text);
        }
        if !end_of_stream {
            return Ok(());
        }

        let text = std::mem::take(&mut *self.buffer.lock().unwrap());
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("http tts: should call start first"))?;

        let option = self.option.clone();
        let http_client = self.http_client.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::run_request(option, http_client, text, tx.clone()).await {
                let _ = tx.send(Err(e));
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Dropping the sender ends the per-request stream; the pooled
        // connection stays with the reqwest client.
        *self.tx.lock().unwrap() = None;
        Ok(())
    }
}
