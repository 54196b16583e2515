// IIoT Bridge 共享库: 配置, 消息类型, 主题模板

pub mod config;
pub mod mqtt;
pub mod types;
pub mod utils;

pub use config::{
    build_config, load_config, validate_config, AppConfig, BackendConfig, BackendMode,
    CacheConfig, MqttConfig, ProvisionedDevice, ServerConfig, TopicsConfig,
};
pub use mqtt::{InboundTopic, MqttError, QoS, TopicFilter, TopicMap, TopicSet, TopicTemplate};
pub use types::*;
pub use utils::{
    generate_command_id, generate_update_id, now_utc, truncate_string, validate_device_id,
    validate_firmware_url, validate_firmware_version,
};
