use super::{SynthesisClient, SynthesisEvent, SynthesisType};
use crate::config::SynthesisConfig;
use crate::error::TtsError;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{
    stream::{BoxStream, SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::{net::TcpStream, select, sync::mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type WSSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WSStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Sent a little before the vendor's idle window closes.
const KEEPALIVE_MARGIN_MS: u64 = 500;

#[derive(Debug, Serialize)]
struct DuplexCommand {
    session_id: String,
    message_id: String,
    action: String,
    data: String,
}

impl DuplexCommand {
    fn synthesis(session_id: &str, text: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            action: "ACTION_SYNTHESIS".to_string(),
            data: text.to_string(),
        }
    }

    fn complete(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
            action: "ACTION_COMPLETE".to_string(),
            data: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DuplexResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    ready: u32,
    #[serde(default)]
    r#final: u32,
    #[serde(default)]
    heartbeat: u32,
    #[serde(default)]
    flushed: u32,
}

/// Persistent duplex websocket strategy. Text goes out incrementally on a
/// writer task, audio comes back on the split read half, and an empty-content
/// frame keeps the vendor from dropping an idle session.
pub struct DuplexTtsClient {
    option: SynthesisConfig,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    token: Mutex<CancellationToken>,
    /// Pre-warmed connection with the session id its URL was signed for;
    /// commands over it must carry the same id.
    prepared: tokio::sync::Mutex<Option<(String, WSSink, WSStream)>>,
}

impl DuplexTtsClient {
    pub fn create(option: &SynthesisConfig) -> Result<Box<dyn SynthesisClient>> {
        if option.endpoint.is_none() {
            return Err(anyhow!("duplex strategy requires a vendor endpoint"));
        }
        Ok(Box::new(Self::new(option.clone())))
    }

    pub fn new(option: SynthesisConfig) -> Self {
        Self {
            option,
            tx: Mutex::new(None),
            token: Mutex::new(CancellationToken::new()),
            prepared: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect(&self, session_id: &str) -> Result<(WSSink, WSStream)> {
        let url = self.signed_url(session_id)?;
        let request = url.into_client_request()?;
        let (mut ws_stream, _resp) = connect_async(request).await?;
        // The vendor confirms session setup before any synthesis may start.
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let response = serde_json::from_str::<DuplexResponse>(&text)
                        .map_err(|e| TtsError::Unknown(format!("bad setup frame: {}", e)))?;
                    if response.code != 0 {
                        return Err(
                            TtsError::from_vendor_code(response.code, response.message).into()
                        );
                    }
                    if response.ready == 1 {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    return Err(
                        TtsError::Network("vendor closed during session setup".into()).into(),
                    );
                }
                Err(e) => return Err(TtsError::Network(e.to_string()).into()),
                _ => {}
            }
        }
        Ok(ws_stream.split())
    }

    /// Signed query-string URL: sorted params, HMAC-SHA1 over
    /// `GET{host}{path}?{query}`, signature appended url-encoded.
    fn signed_url(&self, session_id: &str) -> Result<String> {
        let endpoint = self
            .option
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("duplex strategy requires a vendor endpoint"))?;
        let uri = endpoint.parse::<http::Uri>()?;
        let scheme = uri.scheme_str().unwrap_or("wss").to_string();
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| anyhow!("endpoint has no host"))?;
        let path = uri.path();

        let app_id = self.option.app_id.clone().unwrap_or_default();
        let secret_id = self.option.secret_id.clone().unwrap_or_default();
        let secret_key = self.option.secret_key.clone().unwrap_or_default();
        let speaker = self
            .option
            .speaker
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let codec = self
            .option
            .codec
            .clone()
            .unwrap_or_else(|| "pcm".to_string());

        let timestamp = chrono::Utc::now().timestamp() as u64;
        let expired = timestamp + 24 * 60 * 60;

        let samplerate_str = self.option.samplerate.to_string();
        let volume_str = self.option.volume.unwrap_or(0).to_string();
        let speed_str = self.option.speed.unwrap_or(0.0).to_string();
        let timestamp_str = timestamp.to_string();
        let expired_str = expired.to_string();

        let mut query_params = vec![
            ("AppId", app_id.as_str()),
            ("SecretId", secret_id.as_str()),
            ("Timestamp", timestamp_str.as_str()),
            ("Expired", expired_str.as_str()),
            ("SessionId", session_id),
            ("VoiceType", speaker.as_str()),
            ("Volume", volume_str.as_str()),
            ("Speed", speed_str.as_str()),
            ("SampleRate", samplerate_str.as_str()),
            ("Codec", codec.as_str()),
        ];
        query_params.sort_by(|a, b| a.0.cmp(b.0));

        let query_string = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let string_to_sign = format!("GET{}{}?{}", authority, path, query_string);
        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret_key.as_bytes());
        let tag = hmac::sign(&key, string_to_sign.as_bytes());
        let signature = STANDARD.encode(tag.as_ref());

        Ok(format!(
            "{}://{}{}?{}&Signature={}",
            scheme,
            authority,
            path,
            query_string,
            urlencoding::encode(&signature)
        ))
    }
}

fn event_stream(ws_stream: WSStream) -> BoxStream<'static, Result<SynthesisEvent>> {
    let stream = ws_stream.filter_map(move |message| async move {
        match message {
            Ok(Message::Binary(data)) => Some(Ok(SynthesisEvent::AudioChunk(data.into()))),
            Ok(Message::Text(text)) => {
                let response = match serde_json::from_str::<DuplexResponse>(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        return Some(Err(
                            TtsError::Unknown(format!("bad vendor frame: {}", e)).into()
                        ))
                    }
                };
                if response.code != 0 {
                    return Some(Err(TtsError::from_vendor_code(
                        response.code,
                        response.message,
                    )
                    .into()));
                }
                if response.r#final == 1 {
                    return Some(Ok(SynthesisEvent::Finished));
                }
                if response.flushed == 1 {
                    return Some(Ok(SynthesisEvent::Flushed));
                }
                if response.heartbeat == 1 {
                    return None;
                }
                None
            }
            Ok(Message::Close(_)) => None,
            Err(e) => Some(Err(TtsError::Network(e.to_string()).into())),
            _ => None,
        }
    });
    Box::pin(stream)
}

/// Writer half of the duplex session. Forwards text as it arrives, sends an
/// empty-content keepalive when the channel has been quiet for almost the
/// vendor idle window, and completes the session when the channel closes.
async fn text_sending_task(
    mut text_rx: mpsc::UnboundedReceiver<String>,
    session_id: String,
    mut ws_sink: WSSink,
    keepalive: Duration,
    token: CancellationToken,
) -> Result<()> {
    loop {
        select! {
            text = text_rx.recv() => {
                match text {
                    Some(text) => {
                        // An empty string is the keepalive sentinel, the
                        // vendor must never see it as synthesis content.
                        let request = DuplexCommand::synthesis(&session_id, &text);
                        let data = serde_json::to_string(&request)?;
                        ws_sink.send(Message::Text(data.into())).await?;
                    }
                    None => {
                        let request = DuplexCommand::complete(&session_id);
                        let data = serde_json::to_string(&request)?;
                        ws_sink.send(Message::Text(data.into())).await?;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(keepalive) => {
                debug!(%session_id, "sending idle keepalive frame");
                let request = DuplexCommand::synthesis(&session_id, "");
                let data = serde_json::to_string(&request)?;
                ws_sink.send(Message::Text(data.into())).await?;
            }
            _ = token.cancelled() => {
                let _ = ws_sink.close().await;
                break;
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl SynthesisClient for DuplexTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Duplex
    }

    async fn prepare(&self, _token: CancellationToken) -> Result<()> {
        let mut prepared = self.prepared.lock().await;
        if prepared.is_some() {
            return Ok(());
        }
        let session_id = Uuid::new_v4().to_string();
        let (ws_sink, ws_stream) = self.connect(&session_id).await?;
        debug!(%session_id, "duplex connection pre-warmed");
        *prepared = Some((session_id, ws_sink, ws_stream));
        Ok(())
    }

    async fn start(
        &self,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let conn = self.prepared.lock().await.take();
        let (session_id, ws_sink, ws_stream) = match conn {
            // The signed URL binds the vendor session to the id it was
            // pre-warmed with; keep using it.
            Some(prewarmed) => prewarmed,
            None => {
                let session_id = Uuid::new_v4().to_string();
                let (ws_sink, ws_stream) = self.connect(&session_id).await?;
                (session_id, ws_sink, ws_stream)
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);
        *self.token.lock().unwrap() = token.clone();

        let keepalive = Duration::from_millis(
            self.option
                .idle_keepalive_ms
                .saturating_sub(KEEPALIVE_MARGIN_MS)
                .max(250),
        );
        let writer_session = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) =
                text_sending_task(rx, writer_session, ws_sink, keepalive, token).await
            {
                warn!("duplex writer stopped: {}", e);
            }
        });

        Ok(event_stream(ws_stream))
    }

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()> {
        let mut sender = self.tx.lock().unwrap();
        if !text.is_empty() {
            let tx = sender
                .as_ref()
                .ok_or_else(|| anyhow!("duplex tts: should call start first"))?;
            tx.send(text.to_string())?;
        } else if self.option.empty_text_is_keepalive {
            if let Some(tx) = sender.as_ref() {
                tx.send(String::new())?;
            }
        }
        if end_of_stream {
            // Dropping the sender makes the writer emit the complete action.
            *sender = None;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.tx.lock().unwrap() = None;
        self.token.lock().unwrap().cancel();
        if let Some((_, mut sink, _stream)) = self.prepared.lock().await.take() {
            let _ = sink.close().await;
        }
        Ok(())
    }
}
