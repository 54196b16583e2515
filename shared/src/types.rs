use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::mqtt::TopicMap;

// 设备配置请求 (device -> gateway, HTTP or MQTT)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfigRequest {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub token: String,
}

impl DeviceConfigRequest {
    pub fn is_complete(&self) -> bool {
        !self.serial.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// Broker connection parameters handed to a provisioned device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Successful provisioning answer from the backend.
///
/// The backend historically names the sub-documents `mqtt` and `topics`;
/// both spellings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfigResponse {
    pub status: String,
    pub device_id: String,
    #[serde(alias = "mqtt")]
    pub broker_credentials: BrokerCredentials,
    #[serde(alias = "topics")]
    pub topic_map: TopicMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

// 设备命令 (HTTP control surface -> device)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    pub device_id: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Status report published by a device on its OTA status topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtaStatusReport {
    #[serde(default)]
    pub update_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply published by a device on its command-response topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResponse {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

/// Firmware image reference attached to an OTA update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareRef {
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

// 设备状态快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatusSnapshot {
    pub device_id: String,
    pub connected: bool,
    pub has_config: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub pending_commands: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusList {
    pub devices: HashMap<String, DeviceStatusSnapshot>,
}

// 网关健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeHealthStatus {
    pub status: String,
    pub mqtt_connected: bool,
    pub active_connections: usize,
    pub timestamp: DateTime<Utc>,
}

/// Uniform `{status, ...}` envelope used on both the MQTT and HTTP side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEnvelope {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl StatusEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            error: None,
            command_id: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: None,
            error: Some(error.into()),
            command_id: None,
        }
    }

    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}
