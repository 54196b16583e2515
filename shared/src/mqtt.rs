use serde::{Deserialize, Serialize};

use crate::config::TopicsConfig;
use crate::utils::validate_device_id;

pub(crate) mod qos_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use super::QoS;

    pub fn serialize<S>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*qos as u8)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<QoS, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        QoS::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid QoS value: {}", value)))
    }
}

// MQTT 消息质量等级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl Default for QoS {
    fn default() -> Self {
        QoS::AtLeastOnce
    }
}

const DEVICE_PLACEHOLDER: &str = "{device}";

/// A per-device topic template such as `telemetry/{device}/data`.
///
/// Device ids are validated before substitution so that neither a level
/// separator nor a wildcard can end up inside a rendered topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    template: String,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, MqttError> {
        let template = template.trim_matches('/');
        let placeholders = template
            .split('/')
            .filter(|segment| *segment == DEVICE_PLACEHOLDER)
            .count();

        if placeholders != 1 {
            return Err(MqttError::InvalidTopic(format!(
                "template '{}' must contain exactly one '{}' level",
                template, DEVICE_PLACEHOLDER
            )));
        }

        if template.contains('+') || template.contains('#') {
            return Err(MqttError::InvalidTopic(format!(
                "template '{}' must not contain wildcards",
                template
            )));
        }

        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render the concrete topic for one device.
    pub fn render(&self, prefix: &str, device_id: &str) -> Result<String, MqttError> {
        if !validate_device_id(device_id) {
            return Err(MqttError::InvalidDeviceId(device_id.to_string()));
        }
        Ok(format!(
            "{}{}",
            prefix,
            self.template.replace(DEVICE_PLACEHOLDER, device_id)
        ))
    }

    /// Wildcard filter matching every device (and every tenant when prefixed).
    pub fn filter(&self, tenant_wildcard: bool) -> String {
        let filter = self.template.replace(DEVICE_PLACEHOLDER, "+");
        if tenant_wildcard {
            format!("+/{}", filter)
        } else {
            filter
        }
    }

    /// Extract the device id if `topic` has this template's shape, with or
    /// without one leading tenant level.
    pub fn extract_device_id(&self, topic: &str) -> Option<String> {
        let pattern: Vec<&str> = self.template.split('/').collect();
        let mut levels: Vec<&str> = topic.split('/').collect();

        if levels.len() == pattern.len() + 1 {
            levels.remove(0);
        }
        if levels.len() != pattern.len() {
            return None;
        }

        let mut device_id = None;
        for (expected, actual) in pattern.iter().zip(levels.iter()) {
            if *expected == DEVICE_PLACEHOLDER {
                device_id = Some(*actual);
            } else if expected != actual {
                return None;
            }
        }

        device_id
            .filter(|id| validate_device_id(id))
            .map(str::to_string)
    }
}

/// Classification of an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    ConfigRequest,
    Telemetry { device_id: String },
    OtaStatus { device_id: String },
    CommandResponse { device_id: String },
    Unknown,
}

impl InboundTopic {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundTopic::ConfigRequest => "config_request",
            InboundTopic::Telemetry { .. } => "telemetry",
            InboundTopic::OtaStatus { .. } => "ota_status",
            InboundTopic::CommandResponse { .. } => "command_response",
            InboundTopic::Unknown => "unknown",
        }
    }
}

/// The validated set of topic templates the gateway works with.
#[derive(Debug, Clone)]
pub struct TopicSet {
    prefix: String,
    config_request: String,
    config_response: TopicTemplate,
    telemetry: TopicTemplate,
    command: TopicTemplate,
    command_response: TopicTemplate,
    ota_notify: TopicTemplate,
    ota_status: TopicTemplate,
    subscriptions: Vec<TopicFilter>,
}

impl TopicSet {
    pub fn from_config(config: &TopicsConfig) -> Result<Self, MqttError> {
        let prefix = match config.tenant_prefix.trim_matches('/') {
            "" => String::new(),
            tenant => format!("{}/", tenant),
        };

        let config_request = config.config_request.trim_matches('/').to_string();
        if config_request.is_empty() || config_request.contains('+') || config_request.contains('#') {
            return Err(MqttError::InvalidTopic(format!(
                "invalid config request topic '{}'",
                config.config_request
            )));
        }

        let mut topics = Self {
            prefix,
            config_request,
            config_response: TopicTemplate::parse(&config.config_response)?,
            telemetry: TopicTemplate::parse(&config.telemetry)?,
            command: TopicTemplate::parse(&config.command)?,
            command_response: TopicTemplate::parse(&config.command_response)?,
            ota_notify: TopicTemplate::parse(&config.ota_notify)?,
            ota_status: TopicTemplate::parse(&config.ota_status)?,
            subscriptions: Vec::new(),
        };
        topics.subscriptions = topics.build_subscriptions();
        Ok(topics)
    }

    // 租户段可选: 带前缀和不带前缀的两种形式都订阅
    fn build_subscriptions(&self) -> Vec<TopicFilter> {
        let prefixed = !self.prefix.is_empty();

        let mut filters = vec![TopicFilter::new(self.config_request.clone(), QoS::AtLeastOnce)];
        if prefixed {
            filters.push(TopicFilter::new(
                format!("+/{}", self.config_request),
                QoS::AtLeastOnce,
            ));
        }

        for template in [&self.telemetry, &self.ota_status, &self.command_response] {
            filters.push(TopicFilter::new(template.filter(false), QoS::AtLeastOnce));
            if prefixed {
                filters.push(TopicFilter::new(template.filter(true), QoS::AtLeastOnce));
            }
        }
        filters
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config_request_topic(&self) -> &str {
        &self.config_request
    }

    /// The config response goes to a fixed, unprefixed family: the device
    /// does not know its tenant before provisioning.
    pub fn config_response_topic(&self, key: &str) -> Result<String, MqttError> {
        self.config_response.render("", key)
    }

    pub fn telemetry_topic(&self, device_id: &str) -> Result<String, MqttError> {
        self.telemetry.render(&self.prefix, device_id)
    }

    pub fn command_topic(&self, device_id: &str) -> Result<String, MqttError> {
        self.command.render(&self.prefix, device_id)
    }

    pub fn ota_notify_topic(&self, device_id: &str) -> Result<String, MqttError> {
        self.ota_notify.render(&self.prefix, device_id)
    }

    pub fn ota_status_topic(&self, device_id: &str) -> Result<String, MqttError> {
        self.ota_status.render(&self.prefix, device_id)
    }

    /// Filters the gateway subscribes to once connected.
    pub fn subscriptions(&self) -> &[TopicFilter] {
        &self.subscriptions
    }

    /// 根据主题结构分类入站消息
    ///
    /// Topics outside the subscribed filters are never classified.
    pub fn classify(&self, topic: &str) -> InboundTopic {
        if !self.subscriptions.iter().any(|filter| filter.matches(topic)) {
            return InboundTopic::Unknown;
        }

        let unprefixed = topic.split_once('/').map(|(_, rest)| rest);
        if topic == self.config_request || unprefixed == Some(self.config_request.as_str()) {
            return InboundTopic::ConfigRequest;
        }

        if let Some(device_id) = self.telemetry.extract_device_id(topic) {
            return InboundTopic::Telemetry { device_id };
        }
        if let Some(device_id) = self.ota_status.extract_device_id(topic) {
            return InboundTopic::OtaStatus { device_id };
        }
        if let Some(device_id) = self.command_response.extract_device_id(topic) {
            return InboundTopic::CommandResponse { device_id };
        }

        InboundTopic::Unknown
    }
}

/// Per-device topic map handed out during provisioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicMap {
    pub telemetry: String,
    pub command: String,
    pub ota_notify: String,
    pub ota_status: String,
}

impl TopicMap {
    pub fn for_device(topics: &TopicSet, device_id: &str) -> Result<Self, MqttError> {
        Ok(Self {
            telemetry: topics.telemetry_topic(device_id)?,
            command: topics.command_topic(device_id)?,
            ota_notify: topics.ota_notify_topic(device_id)?,
            ota_status: topics.ota_status_topic(device_id)?,
        })
    }
}

// MQTT 错误类型
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Max reconnect attempts reached")]
    MaxReconnectAttemptsReached,
}

// 主题过滤器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub topic_pattern: String,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(topic_pattern: String, qos: QoS) -> Self {
        Self {
            topic_pattern,
            qos,
        }
    }

    /// MQTT filter semantics: `+` is exactly one level, `#` the remainder.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for pattern in self.topic_pattern.split('/') {
            if pattern == "#" {
                return true;
            }
            match levels.next() {
                Some(level) if pattern == "+" || pattern == level => {}
                _ => return false,
            }
        }
        levels.next().is_none()
    }
}
