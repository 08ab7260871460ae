use crate::config::SynthesisConfig;
use crate::error::{TtsError, TtsErrorKind};
use crate::synthesis::{SynthesisClient, SynthesisEvent};
use anyhow::Result;
use futures::stream::BoxStream;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the underlying vendor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Fatal, reached only on credential rejection. Cleared by reset().
    Failed,
}

/// Lifecycle of the session bound to the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Draining,
    Closed,
}

/// Owns the live transport connection. Everything else goes through this
/// narrow API; no other component touches the socket or its state.
pub struct ConnectionSupervisor {
    client: Arc<dyn SynthesisClient>,
    config: SynthesisConfig,
    connection: Mutex<ConnectionState>,
    session: Mutex<SessionState>,
}

impl ConnectionSupervisor {
    pub fn new(client: Arc<dyn SynthesisClient>, config: SynthesisConfig) -> Self {
        Self {
            client,
            config,
            connection: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(SessionState::Idle),
        }
    }

    pub fn client(&self) -> Arc<dyn SynthesisClient> {
        self.client.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().unwrap()
    }

    pub fn session_state(&self) -> SessionState {
        *self.session.lock().unwrap()
    }

    fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock().unwrap() = state;
    }

    fn set_session(&self, state: SessionState) {
        *self.session.lock().unwrap() = state;
    }

    /// Exponential backoff with jitter, so a vendor outage is not met with a
    /// thundering herd of reconnects.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_max_ms);
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    /// Open a session for one request, retrying transient connect failures
    /// within the retry budget. Credential rejection fails immediately and
    /// permanently.
    pub async fn open_session(
        &self,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<SynthesisEvent>>> {
        if self.connection_state() == ConnectionState::Failed {
            return Err(TtsError::Auth("supervisor halted by credential failure".into()).into());
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let state = if attempt == 1 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };
            self.set_connection(state);
            self.set_session(SessionState::Connecting);

            match self.client.start(token.child_token()).await {
                Ok(stream) => {
                    self.set_connection(ConnectionState::Connected);
                    self.set_session(SessionState::Active);
                    debug!(attempt, "transport session active");
                    return Ok(stream);
                }
                Err(e) => {
                    let kind = TtsError::classify(&e);
                    if kind == TtsErrorKind::AuthError {
                        warn!("credential failure, not retrying: {}", e);
                        self.mark_failed();
                        return Err(e);
                    }
                    if !kind.is_retryable() || attempt >= self.config.max_retries {
                        self.set_connection(ConnectionState::Disconnected);
                        self.set_session(SessionState::Idle);
                        return Err(e);
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        "transport open failed ({}), retrying in {:?}", e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            self.set_connection(ConnectionState::Disconnected);
                            self.set_session(SessionState::Idle);
                            return Err(TtsError::Network("cancelled while reconnecting".into()).into());
                        }
                    }
                }
            }
        }
    }

    /// Proactively open a connection so the next request skips connect
    /// latency. Only meaningful for connection-oriented strategies.
    pub async fn prewarm(&self) -> Result<()> {
        if self.connection_state() == ConnectionState::Failed {
            return Ok(());
        }
        match self.client.prepare(CancellationToken::new()).await {
            Ok(()) => {
                info!("transport pre-warmed");
                Ok(())
            }
            Err(e) => {
                let kind = TtsError::classify(&e);
                if kind == TtsErrorKind::AuthError {
                    self.mark_failed();
                }
                warn!("pre-warm failed: {}", e);
                Err(e)
            }
        }
    }

    /// Drive the active session down. Idempotent; the next open starts clean.
    pub async fn close_session(&self) -> Result<()> {
        let current = self.session_state();
        if current == SessionState::Closed || current == SessionState::Idle {
            return Ok(());
        }
        self.set_session(SessionState::Draining);
        let result = self.client.stop().await;
        self.set_session(SessionState::Closed);
        if !self.config.reuse_session {
            if self.connection_state() != ConnectionState::Failed {
                self.set_connection(ConnectionState::Disconnected);
            }
        }
        result
    }

    pub fn mark_failed(&self) {
        self.set_connection(ConnectionState::Failed);
        self.set_session(SessionState::Closed);
    }

    /// External reconfiguration hook: clears the fatal halt.
    pub fn reset(&self) {
        self.set_connection(ConnectionState::Disconnected);
        self.set_session(SessionState::Idle);
    }
}
