use anyhow::{bail, Result};
use config::{Config, Environment, File};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::mqtt::TopicSet;
use crate::utils::validate_device_id;

// 配置相关类型
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub backend: BackendConfig,
    pub topics: TopicsConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When non-empty, `/api/v1/*` requires this key.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Consecutive failed reconnects before giving up; 0 retries forever.
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Forward to the business backend over HTTP webhooks.
    Http,
    /// Serve provisioning from the in-process registry.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
    pub base_url: String,
    pub config_endpoint: String,
    pub webhook_endpoint: String,
    pub command_endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Devices pre-registered for `local` mode.
    pub devices: Vec<ProvisionedDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedDevice {
    pub serial: String,
    pub device_id: String,
    pub token: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub tenant_prefix: String,
    pub config_request: String,
    pub config_response: String,
    pub telemetry: String,
    pub command: String,
    pub command_response: String,
    pub ota_notify: String,
    pub ota_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub device_config_ttl_secs: u64,
    pub max_device_connections: usize,
    pub max_queued_commands: usize,
    pub shards: usize,
    pub cleanup_interval_secs: u64,
    /// Silence after which a device no longer counts as connected.
    pub idle_timeout_secs: u64,
    /// How long finished OTA updates stay queryable.
    pub ota_retention_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: String::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "mqtt.factory.com".to_string(),
            broker_port: 8883,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            client_id: format!("iiot_bridge_{}", std::process::id()),
            keep_alive_secs: 60,
            clean_session: true,
            max_reconnect_attempts: 0,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            channel_capacity: 100,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Http,
            base_url: "http://localhost:8069".to_string(),
            config_endpoint: "/iiot/config".to_string(),
            webhook_endpoint: "/iiot/webhook".to_string(),
            command_endpoint: "/iiot/command".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 1000,
            devices: Vec::new(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            tenant_prefix: "company_1".to_string(),
            config_request: "iiot/config/request".to_string(),
            config_response: "iiot/config/{device}".to_string(),
            telemetry: "telemetry/{device}/data".to_string(),
            command: "cmd/{device}/request".to_string(),
            command_response: "cmd/{device}/response".to_string(),
            ota_notify: "ota/{device}/notify".to_string(),
            ota_status: "ota/{device}/status".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            device_config_ttl_secs: 3600, // 1 小时
            max_device_connections: 1000,
            max_queued_commands: 100,
            shards: 16,
            cleanup_interval_secs: 300,
            idle_timeout_secs: 600,
            ota_retention_secs: 86_400, // 1 天
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    pub fn config_url(&self) -> String {
        self.url(&self.config_endpoint)
    }

    pub fn webhook_url(&self, device_id: &str) -> String {
        format!("{}/{}", self.url(&self.webhook_endpoint), device_id)
    }

    pub fn command_url(&self, device_id: &str) -> String {
        format!("{}/{}", self.url(&self.command_endpoint), device_id)
    }
}

impl CacheConfig {
    pub fn device_config_ttl(&self) -> Duration {
        Duration::from_secs(self.device_config_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ota_retention(&self) -> Duration {
        Duration::from_secs(self.ota_retention_secs)
    }
}

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let environment = env::var("ENV").unwrap_or_else(|_| "development".to_string());
    build_config(Path::new("config"), &environment)
}

/// Layer `<dir>/default`, `<dir>/<environment>` and `IIOT_*` variables.
pub fn build_config(config_dir: &Path, environment: &str) -> Result<AppConfig> {
    let settings = Config::builder()
        // 添加默认配置文件
        .add_source(File::from(config_dir.join("default")).required(false))
        // 添加环境特定配置文件
        .add_source(File::from(config_dir.join(environment)).required(false))
        // 添加环境变量，例如 IIOT_MQTT__BROKER_HOST
        .add_source(
            Environment::with_prefix("IIOT")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;

    // 验证必要配置
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.mqtt.broker_host.trim().is_empty() {
        bail!("MQTT broker host cannot be empty");
    }

    if config.mqtt.broker_port == 0 || config.server.port == 0 {
        bail!("Ports must be non-zero");
    }

    if config.mqtt.client_id.trim().is_empty() {
        bail!("MQTT client id cannot be empty");
    }

    if config.mqtt.reconnect_initial_delay_ms == 0
        || config.mqtt.reconnect_max_delay_ms < config.mqtt.reconnect_initial_delay_ms
    {
        bail!("MQTT reconnect delays must satisfy 0 < initial <= max");
    }

    if config.backend.mode == BackendMode::Http
        && !(config.backend.base_url.starts_with("http://")
            || config.backend.base_url.starts_with("https://"))
    {
        bail!("Backend base URL must start with http:// or https://");
    }

    if config.backend.timeout_secs == 0 {
        bail!("Backend timeout cannot be zero");
    }

    if config.cache.device_config_ttl_secs == 0 {
        bail!("Device config TTL cannot be zero");
    }

    if config.cache.shards == 0 || config.cache.max_queued_commands == 0 {
        bail!("Cache shards and command queue capacity must be non-zero");
    }

    if config.cache.cleanup_interval_secs == 0 || config.cache.idle_timeout_secs == 0 {
        bail!("Cleanup interval and idle timeout must be non-zero");
    }

    if config.mqtt.channel_capacity == 0 {
        bail!("MQTT channel capacity must be non-zero");
    }

    for device in &config.backend.devices {
        if !validate_device_id(&device.device_id) || device.serial.is_empty() || device.token.is_empty() {
            bail!("Invalid provisioned device entry for serial '{}'", device.serial);
        }
    }

    TopicSet::from_config(&config.topics)?;

    Ok(())
}
