// HTTP client for the business backend webhooks

use async_trait::async_trait;
use iiot_shared::{BackendConfig, DeviceConfigResponse, StatusEnvelope, TopicSet};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Every failure mode of a backend call, transport and application alike.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The backend answered but refused (invalid token, unknown device, ...).
    #[error("{0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Request(err.to_string())
        }
    }

    /// Worth another attempt: the request may not have reached the backend.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout | BackendError::Request(_) => true,
            BackendError::Http { .. } => matches!(self.status(), Some(502 | 503 | 504)),
            BackendError::Rejected(_) | BackendError::InvalidResponse(_) => false,
        }
    }

    /// HTTP status returned by the backend, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> StatusEnvelope {
        StatusEnvelope::error(self.to_string())
    }
}

/// The four outbound calls the gateway makes.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_device_config(
        &self,
        serial: &str,
        token: &str,
    ) -> Result<DeviceConfigResponse, BackendError>;

    async fn send_telemetry(
        &self,
        device_id: &str,
        topic: &str,
        payload: &Value,
    ) -> Result<Value, BackendError>;

    async fn send_ota_status(&self, device_id: &str, payload: &Value) -> Result<Value, BackendError>;

    async fn send_command_to_device(
        &self,
        device_id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError>;
}

/// Backend reachable over HTTP webhooks.
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    topics: TopicSet,
}

impl HttpBackend {
    pub fn new(config: BackendConfig, topics: TopicSet) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()?;

        info!("Backend client targeting {}", config.base_url);

        Ok(Self {
            client,
            config,
            topics,
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config.retry_delay().saturating_mul(factor)
    }

    /// POST with bounded retry on transient failures.
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, BackendError> {
        let mut attempt = 0;

        loop {
            match self.post_once(url, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.retry_count => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        "Backend call to {} failed ({}), retry {}/{} in {:?}",
                        url, e, attempt, self.config.retry_count, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<Value, BackendError> {
        let mut request = self.client.post(url).json(body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(BackendError::from_reqwest)?;
        let status = response.status();

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        debug!("Backend {} answered {}", url, value);
        normalize_reply(value)
    }
}

/// Unwrap a JSON-RPC `result` envelope and turn `status: error` into an error.
fn normalize_reply(value: Value) -> Result<Value, BackendError> {
    let value = match value {
        Value::Object(mut object) if object.contains_key("jsonrpc") => {
            if let Some(error) = object.remove("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(BackendError::Rejected(message));
            }
            object.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    };

    match value.get("status").and_then(Value::as_str) {
        Some("error") => {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            Err(BackendError::Rejected(message))
        }
        _ => Ok(value),
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_device_config(
        &self,
        serial: &str,
        token: &str,
    ) -> Result<DeviceConfigResponse, BackendError> {
        let url = self.config.config_url();
        let body = json!({ "serial": serial, "token": token });

        let value = self.post_json(&url, &body).await.map_err(|e| {
            error!("Failed to get device config for {}: {}", serial, e);
            e
        })?;

        if value.get("status").and_then(Value::as_str) != Some("success") {
            return Err(BackendError::InvalidResponse(format!(
                "unexpected config reply: {}",
                value
            )));
        }

        serde_json::from_value(value).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    async fn send_telemetry(
        &self,
        device_id: &str,
        topic: &str,
        payload: &Value,
    ) -> Result<Value, BackendError> {
        let url = self.config.webhook_url(device_id);
        let body = json!({ "topic": topic, "payload": payload });

        self.post_json(&url, &body).await.map_err(|e| {
            error!("Failed to send telemetry for {}: {}", device_id, e);
            e
        })
    }

    async fn send_ota_status(&self, device_id: &str, payload: &Value) -> Result<Value, BackendError> {
        let url = self.config.webhook_url(device_id);
        let topic = self
            .topics
            .ota_status_topic(device_id)
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let body = json!({ "topic": topic, "payload": payload });

        self.post_json(&url, &body).await.map_err(|e| {
            error!("Failed to send OTA status for {}: {}", device_id, e);
            e
        })
    }

    async fn send_command_to_device(
        &self,
        device_id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        let url = self.config.command_url(device_id);
        let body = json!({ "action": action, "params": params });

        self.post_json(&url, &body).await.map_err(|e| {
            error!("Failed to send command {} for {}: {}", action, device_id, e);
            e
        })
    }
}
