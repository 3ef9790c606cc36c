//! WebSocket push channel with reconnect backoff.
//!
//! Decodes item lifecycle frames into [`ChannelSignal`]s for the
//! invalidator. Undecodable frames are logged and skipped; events sent while
//! disconnected are not replayed.

use futures_util::StreamExt;
use mosaic_core::{ChannelSignal, ItemEvent};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AuthConfig, ClientConfig, ReconnectConfig};
use crate::error::ClientError;

pub type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct PushChannel {
    endpoint: String,
    auth: AuthConfig,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("endpoint", &self.endpoint)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl PushChannel {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.ws_endpoint.clone(),
            auth: config.auth.clone(),
            reconnect: config.reconnect.clone(),
            connect_timeout: config.request_timeout(),
        }
    }

    /// Unauthenticated channel, for local endpoints.
    pub fn anonymous(endpoint: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth: AuthConfig {
                api_key: None,
                jwt: None,
            },
            reconnect,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    pub async fn connect(&self) -> Result<PushStream, ClientError> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(api_key) = &self.auth.api_key {
            headers.insert(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_str(api_key)
                    .map_err(|_| ClientError::InvalidHeader { name: "x-api-key" })?,
            );
        }
        if let Some(jwt) = &self.auth.jwt {
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&format!("Bearer {}", jwt))
                    .map_err(|_| ClientError::InvalidHeader { name: "authorization" })?,
            );
        }
        let connect = tokio_tungstenite::connect_async(request);
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "push channel connect timed out",
                ))
            })??;
        Ok(stream)
    }

    /// Keep the channel connected until `sender` is dropped.
    pub fn spawn(self, sender: mpsc::Sender<ChannelSignal>) -> JoinHandle<()> {
        tokio::spawn(self.run(sender))
    }

    async fn run(self, sender: mpsc::Sender<ChannelSignal>) {
        let mut backoff = Backoff::new(&self.reconnect);
        loop {
            let connection_id = Uuid::now_v7();
            match self.connect().await {
                Ok(mut stream) => {
                    info!(connection_id = %connection_id, endpoint = %self.endpoint, "Push channel connected");
                    backoff.reset();
                    if sender.send(ChannelSignal::Connected).await.is_err() {
                        return;
                    }

                    let reason = loop {
                        match stream.next().await {
                            Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                                Ok(event) => {
                                    debug!(
                                        connection_id = %connection_id,
                                        event_type = event.event_type(),
                                        item_id = %event.item_id(),
                                        "Push event received"
                                    );
                                    if sender.send(ChannelSignal::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(connection_id = %connection_id, error = %err, "Skipping undecodable push frame");
                                }
                            },
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.to_string())
                                    .filter(|reason| !reason.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                let message = err.to_string();
                                if sender
                                    .send(ChannelSignal::Error {
                                        message: message.clone(),
                                    })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                                break message;
                            }
                            None => break "stream ended".to_string(),
                        }
                    };

                    info!(connection_id = %connection_id, reason = %reason, "Push channel disconnected");
                    if sender
                        .send(ChannelSignal::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "Push channel connect failed");
                    if sender
                        .send(ChannelSignal::Error {
                            message: err.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting push channel");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = sender.closed() => return,
            }
        }
    }
}

/// Parse one text frame.
pub fn decode_frame(text: &str) -> Result<ItemEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Exponential reconnect delay with a cap and additive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial_ms: config.initial_ms,
            max_ms: config.max_ms,
            multiplier: config.multiplier,
            jitter_ms: config.jitter_ms,
            current_ms: config.initial_ms,
        }
    }

    /// Back to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }

    /// Delay before the next attempt; the base grows for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_backoff(self.current_ms, self.jitter_ms);
        let next = (self.current_ms as f64 * self.multiplier) as u64;
        self.current_ms = next.min(self.max_ms);
        Duration::from_millis(delay)
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}
