// 本地设备注册表: 一次性配置令牌, 不依赖外部后端

use async_trait::async_trait;
use iiot_shared::{
    BrokerCredentials, DeviceConfigResponse, MqttConfig, ProvisionedDevice, TopicMap, TopicSet,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend_client::{Backend, BackendError};

#[derive(Debug, Clone)]
struct Registration {
    device_id: String,
    config_token: Option<String>,
    firmware_version: Option<String>,
}

/// What the gateway hands to provisioned devices for reaching the broker.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl From<&MqttConfig> for BrokerEndpoint {
    fn from(config: &MqttConfig) -> Self {
        Self {
            host: config.broker_host.clone(),
            port: config.broker_port,
            use_tls: config.use_tls,
        }
    }
}

/// In-process backend keyed by serial number.
pub struct LocalBackend {
    registrations: Mutex<HashMap<String, Registration>>,
    topics: TopicSet,
    broker: BrokerEndpoint,
}

impl LocalBackend {
    pub fn new(topics: TopicSet, broker: BrokerEndpoint) -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            topics,
            broker,
        }
    }

    pub async fn from_devices(
        topics: TopicSet,
        broker: BrokerEndpoint,
        devices: &[ProvisionedDevice],
    ) -> Self {
        let backend = Self::new(topics, broker);
        {
            let mut registrations = backend.registrations.lock().await;
            for device in devices {
                registrations.insert(
                    device.serial.clone(),
                    Registration {
                        device_id: device.device_id.clone(),
                        config_token: Some(device.token.clone()),
                        firmware_version: device.firmware_version.clone(),
                    },
                );
            }
        }
        info!("Local backend loaded {} provisioned devices", devices.len());
        backend
    }

    async fn ensure_known(&self, device_id: &str) -> Result<(), BackendError> {
        let registrations = self.registrations.lock().await;
        if registrations.values().any(|r| r.device_id == device_id) {
            Ok(())
        } else {
            Err(BackendError::Rejected(format!("Unknown device: {}", device_id)))
        }
    }
}

#[cfg(test)]
impl LocalBackend {
    /// Register (or re-arm) a device; returns a fresh single-use token.
    pub(crate) async fn register_device(&self, serial: &str, device_id: &str) -> Result<String, BackendError> {
        if serial.trim().is_empty() || !iiot_shared::validate_device_id(device_id) {
            return Err(BackendError::Rejected(format!(
                "Invalid registration for serial '{}'",
                serial
            )));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut registrations = self.registrations.lock().await;
        let entry = registrations
            .entry(serial.to_string())
            .or_insert_with(|| Registration {
                device_id: device_id.to_string(),
                config_token: None,
                firmware_version: None,
            });
        entry.device_id = device_id.to_string();
        entry.config_token = Some(token.clone());

        info!("Registered device {} (serial {})", device_id, serial);
        Ok(token)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get_device_config(
        &self,
        serial: &str,
        token: &str,
    ) -> Result<DeviceConfigResponse, BackendError> {
        if serial.is_empty() || token.is_empty() {
            return Err(BackendError::Rejected("Missing serial or token".to_string()));
        }

        let mut registrations = self.registrations.lock().await;
        let registration = registrations
            .get_mut(serial)
            .filter(|r| r.config_token.as_deref() == Some(token))
            .ok_or_else(|| {
                warn!("Rejected config request for serial {}", serial);
                BackendError::Rejected("Invalid serial or token".to_string())
            })?;

        let topic_map = TopicMap::for_device(&self.topics, &registration.device_id)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;

        // 令牌只能使用一次
        registration.config_token = None;

        info!("Issued config for device {}", registration.device_id);
        Ok(DeviceConfigResponse {
            status: "success".to_string(),
            device_id: registration.device_id.clone(),
            broker_credentials: BrokerCredentials {
                host: self.broker.host.clone(),
                port: self.broker.port,
                use_tls: self.broker.use_tls,
                client_id: registration.device_id.clone(),
                username: registration.device_id.clone(),
                password: token.to_string(),
            },
            topic_map,
            firmware_version: registration.firmware_version.clone(),
        })
    }

    async fn send_telemetry(
        &self,
        device_id: &str,
        _topic: &str,
        _payload: &Value,
    ) -> Result<Value, BackendError> {
        self.ensure_known(device_id).await?;
        Ok(json!({"status": "success"}))
    }

    async fn send_ota_status(&self, device_id: &str, _payload: &Value) -> Result<Value, BackendError> {
        self.ensure_known(device_id).await?;
        Ok(json!({"status": "success"}))
    }

    async fn send_command_to_device(
        &self,
        device_id: &str,
        action: &str,
        _params: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        self.ensure_known(device_id).await?;
        Ok(json!({"status": "success", "action": action}))
    }
}
