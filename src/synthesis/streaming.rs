use super::{SynthesisClient, SynthesisEvent, SynthesisType};
use crate::config::SynthesisConfig;
use crate::error::TtsError;
use anyhow::{anyhow, Result};
use futures::{
    stream::{self, BoxStream, SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type WSSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WSStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Serialize)]
struct TaskCommand {
    header: CommandHeader,
    payload: TaskPayload,
}

#[derive(Debug, Serialize)]
struct CommandHeader {
    action: String,
    task_id: String,
}

#[derive(Debug, Serialize)]
struct TaskPayload {
    task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<TaskParameters>,
    input: TaskInput,
}

#[derive(Debug, Serialize)]
struct TaskParameters {
    voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate: Option<f32>,
}

#[derive(Debug, Serialize)]
struct TaskInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskEvent {
    header: TaskEventHeader,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct TaskEventHeader {
    task_id: String,
    event: String,
    error_code: Option<String>,
    error_message: Option<String>,
}

fn classify_task_failure(code: Option<String>, message: Option<String>) -> TtsError {
    let message = message.unwrap_or_else(|| "task failed".to_string());
    let code = code.unwrap_or_default();
    if let Ok(numeric) = code.parse::<i64>() {
        return TtsError::from_vendor_code(numeric, message);
    }
    let lowered = code.to_lowercase();
    if lowered.contains("auth") || lowered.contains("apikey") || lowered.contains("credential") {
        TtsError::Auth(format!("{}: {}", code, message))
    } else if lowered.contains("throttl") || lowered.contains("ratelimit") {
        TtsError::RateLimit(format!("{}: {}", code, message))
    } else {
        TtsError::Vendor { code: -1, message }
    }
}

/// Request/response streaming strategy: each request is one task opened with
/// a run command, optionally extended with continue commands, and drained
/// after a finish command. The connection is reopened per request.
pub struct StreamTtsClient {
    option: SynthesisConfig,
    sink: tokio::sync::Mutex<Option<WSSink>>,
    task_id: Mutex<String>,
    task_opened: Mutex<bool>,
}

impl StreamTtsClient {
    pub fn create(option: &SynthesisConfig) -> Result<Box<dyn SynthesisClient>> {
        if option.endpoint.is_none() {
            return Err(anyhow!("streaming strategy requires a vendor endpoint"));
        }
        Ok(Box::new(Self::new(option.clone())))
    }

    pub fn new(option: SynthesisConfig) -> Self {
        Self {
            option,
            sink: tokio::sync::Mutex::new(None),
            task_id: Mutex::new(String::new()),
            task_opened: Mutex::new(false),
        }
    }

    fn api_key(&self) -> Result<String> {
        self.option
            .secret_key
            .clone()
            .ok_or_else(|| anyhow!("streaming strategy requires secret_key as the API key"))
    }

    fn command(&self, action: &str, task_id: &str, text: Option<String>) -> TaskCommand {
        let parameters = if action == "run-task" {
            Some(TaskParameters {
                voice: self
                    .option
                    .speaker
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
                format: self.option.codec.clone(),
                sample_rate: Some(self.option.samplerate),
                volume: self.option.volume.map(|v| (v * 10) as u32),
                rate: self.option.speed,
            })
        } else {
            None
        };
        TaskCommand {
            header: CommandHeader {
                action: action.to_string(),
                task_id: task_id.to_string(),
            },
            payload: TaskPayload {
                task: "tts".to_string(),
                parameters,
                input: TaskInput { text },
            },
        }
    }

    async fn send_command(&self, command: &TaskCommand) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| anyhow!("streaming tts: should call start first"))?;
        let data = serde_json::to_string(command)?;
        sink.send(Message::text(data))
            .await
            .map_err(|e| TtsError::Network(e.to_string()).into())
    }
}

fn event_stream(
    ws_stream: WSStream,
    token: CancellationToken,
) -> BoxStream<'static, Result<SynthesisEvent>> {
    Box::pin(stream::unfold(
        (ws_stream, token, false),
        |(mut ws_stream, token, finished)| async move {
            if finished {
                return None;
            }
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => return None,
                    message = ws_stream.next() => message,
                };
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        return Some((
                            Ok(SynthesisEvent::AudioChunk(data.into())),
                            (ws_stream, token, false),
                        ));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let event = match serde_json::from_str::<TaskEvent>(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("unparseable task event: {}", e);
                                continue;
                            }
                        };
                        match event.header.event.as_str() {
                            "task-finished" => {
                                return Some((
                                    Ok(SynthesisEvent::Finished),
                                    (ws_stream, token, true),
                                ));
                            }
                            "task-failed" => {
                                let err = classify_task_failure(
                                    event.header.error_code,
                                    event.header.error_message,
                                );
                                return Some((Err(err.into()), (ws_stream, token, true)));
                            }
                            other => {
                                debug!("ignoring task event: {}", other);
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Err(e)) => {
                        return Some((
                            Err(TtsError::Network(e.to_string()).into()),
                            (ws_stream, token, true),
                        ));
                    }
                    _ => continue,
                }
            }
        },
    ))
}

#[async_trait::async_trait]
impl SynthesisClient for StreamTtsClient {
    fn provider(&self) -> SynthesisType {
        SynthesisType::Streaming
    }

    async fn start(
        &self,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        let endpoint = self
            .option
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("streaming strategy requires a vendor endpoint"))?;
        let api_key = self.api_key()?;

        let mut request = endpoint.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", api_key).parse()?);

        let (ws_stream, response) = connect_async(request).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(TtsError::from_http_status(
                response.status(),
                "websocket upgrade rejected",
            )
            .into());
        }
        debug!("streaming tts connected");

        let (ws_sink, ws_read) = ws_stream.split();
        *self.sink.lock().await = Some(ws_sink);
        *self.task_id.lock().unwrap() = Uuid::new_v4().to_string();
        *self.task_opened.lock().unwrap() = false;

        Ok(event_stream(ws_read, token))
    }

    async fn synthesize(&self, text: &str, end_of_stream: bool) -> Result<()> {
        let task_id = self.task_id.lock().unwrap().clone();
        if !text.is_empty() {
            let opened = *self.task_opened.lock().unwrap();
            let action = if opened { "continue-task" } else { "run-task" };
            self.send_command(&self.command(action, &task_id, Some(text.to_string())))
                .await?;
            *self.task_opened.lock().unwrap() = true;
        }
        if end_of_stream {
            // A finish command for a task that was never run is a protocol
            // violation the vendor answers with task-failed.
            if !*self.task_opened.lock().unwrap() {
                return Err(anyhow!(
                    "streaming tts: finish before any synthesis task was opened"
                ));
            }
            self.send_command(&self.command("finish-task", &task_id, None))
                .await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        Ok(())
    }
}
