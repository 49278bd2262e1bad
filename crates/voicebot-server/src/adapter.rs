use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use voicebot_contracts::{ModeChangeRequest, OutboundMessage, CONTRACT_VERSION};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("adapter transport error: {0}")]
    Transport(String),
    #[error("adapter answered HTTP {0}")]
    Status(u16),
}

/// Commands the engine issues against the real channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn set_channel_mode(
        &self,
        channel: &str,
        nickname: &str,
        voice: bool,
    ) -> Result<(), ProtocolError>;

    async fn send_message(&self, target: &str, text: &str) -> Result<(), ProtocolError>;
}

/// Posts commands to the protocol adapter's HTTP endpoint.
pub struct HttpAdapter {
    endpoint: String,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    client: Client,
}

impl HttpAdapter {
    pub fn new(cfg: &voicebot_config::Adapter) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            client,
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), ProtocolError> {
        let url = format!("{}{}", self.endpoint, path);
        let mut last_error = ProtocolError::Transport("no attempt made".to_string());
        for attempt in 0..self.retry_max_attempts {
            match self.client.post(&url).json(body).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = ProtocolError::Status(response.status().as_u16());
                }
                Err(err) => {
                    last_error = ProtocolError::Transport(err.to_string());
                }
            }
            tracing::debug!(url = %url, attempt = attempt + 1, error = %last_error, "adapter call failed");
            if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl ChannelAdapter for HttpAdapter {
    async fn set_channel_mode(
        &self,
        channel: &str,
        nickname: &str,
        voice: bool,
    ) -> Result<(), ProtocolError> {
        self.post("/v1/mode", &ModeChangeRequest::new(channel, nickname, voice))
            .await
    }

    async fn send_message(&self, target: &str, text: &str) -> Result<(), ProtocolError> {
        self.post(
            "/v1/messages",
            &OutboundMessage {
                v: CONTRACT_VERSION,
                target: target.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn record(State(seen): State<Seen>, Json(body): Json<Value>) -> StatusCode {
        seen.lock().await.push(body);
        StatusCode::NO_CONTENT
    }

    async fn refuse() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn spawn_fake(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn adapter_cfg(endpoint: String, attempts: usize) -> voicebot_config::Adapter {
        voicebot_config::Adapter {
            endpoint,
            timeout_ms: 2_000,
            retry_max_attempts: attempts,
            retry_backoff_ms: 0,
        }
    }

    #[tokio::test]
    async fn posts_mode_changes_and_messages() {
        let seen: Seen = Arc::default();
        let endpoint = spawn_fake(
            Router::new()
                .route("/v1/mode", post(record))
                .route("/v1/messages", post(record))
                .with_state(seen.clone()),
        )
        .await;
        let adapter = HttpAdapter::new(&adapter_cfg(format!("{endpoint}/"), 1)).unwrap();

        adapter.set_channel_mode("#lounge", "alice", true).await.unwrap();
        adapter.send_message("alice", "Nickname added.").await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["mode"], "+v");
        assert_eq!(seen[0]["nickname"], "alice");
        assert_eq!(seen[1]["target"], "alice");
        assert_eq!(seen[1]["text"], "Nickname added.");
    }

    #[tokio::test]
    async fn non_success_status_is_a_protocol_error() {
        let endpoint = spawn_fake(Router::new().route("/v1/mode", post(refuse))).await;
        let adapter = HttpAdapter::new(&adapter_cfg(endpoint, 3)).unwrap();
        let err = adapter
            .set_channel_mode("#lounge", "alice", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Status(503)));
    }
}
