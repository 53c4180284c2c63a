//! Remote transport: envelope over HTTP, subscriptions over WebSocket

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::{debug, info, warn};

use super::transport::{Subscription, Transport};
use crate::events::EntityEvent;
use crate::protocol::{OperationRequest, OperationResponse};
use crate::types::{Result, ScriptoriumError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a remote gateway
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ScriptoriumError::Config(format!("Invalid gateway URL {}: {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScriptoriumError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn operations_url(&self) -> Result<Url> {
        self.base_url
            .join("api/operations")
            .map_err(|e| ScriptoriumError::Config(format!("Invalid gateway URL: {}", e)))
    }

    /// `ws(s)://host/subscriptions/{id}?token=...`
    pub fn subscription_url(&self, entity_id: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("subscriptions/{}", entity_id))
            .map_err(|e| ScriptoriumError::Config(format!("Invalid gateway URL: {}", e)))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ScriptoriumError::Config(format!("Cannot use {} for WebSockets", url)))?;

        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: OperationRequest) -> Result<Value> {
        let mut builder = self.client.post(self.operations_url()?).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        // Refused tokens and unreadable envelopes still carry an envelope
        match serde_json::from_str::<OperationResponse>(&body) {
            Ok(envelope) => envelope.into_result(),
            Err(_) => Err(ScriptoriumError::Http(format!(
                "{} returned {}: {}",
                request.operation, status, body
            ))),
        }
    }

    async fn subscribe(&self, entity_id: &str) -> Result<Subscription> {
        let url = self.subscription_url(entity_id)?;
        let (ws, _) = connect_async_with_config(url.as_str(), None, false).await?;
        info!("Subscribed to {} at {}", entity_id, self.base_url);

        let (mut write, mut read) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let id = entity_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<EntityEvent>(&text) {
                                Ok(event) => {
                                    let deleted = matches!(event, EntityEvent::Deleted { .. });
                                    if tx.send(event).is_err() || deleted {
                                        break;
                                    }
                                }
                                Err(_) => debug!("Ignoring message on {}: {}", id, text),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("Subscription to {} failed: {}", id, e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
            debug!("Subscription to {} closed", id);
        });

        Ok(Subscription::new(entity_id.to_string(), rx, close_tx, task))
    }
}
