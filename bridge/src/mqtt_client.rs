use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iiot_shared::{truncate_string, InboundTopic, MqttConfig, MqttError, QoS, TopicSet};
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS as RumqttQoS, Transport,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishing side of the broker connection.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;
}

/// A parsed message from a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub kind: InboundTopic,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

/// Parse and classify a raw publish; `None` when it should be dropped.
pub fn parse_inbound(topics: &TopicSet, topic: &str, payload: &[u8]) -> Option<InboundMessage> {
    let kind = topics.classify(topic);
    if kind == InboundTopic::Unknown {
        warn!("Ignoring message on unexpected topic {}", topic);
        return None;
    }

    let payload: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Dropping non-JSON payload on {}: {} ({})",
                topic,
                e,
                truncate_string(&String::from_utf8_lossy(payload), 64)
            );
            return None;
        }
    };

    Some(InboundMessage {
        topic: topic.to_string(),
        kind,
        payload,
        received_at: Utc::now(),
    })
}

// 重连退避策略: 指数增长, 带抖动
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        )
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << exponent).min(self.max)
    }

    /// Delay before reconnect `attempt` (1-based), jittered into `[base/2, base]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let factor = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
        base.mul_f64(factor)
    }
}

/// Broker connection owned by the gateway.
pub struct BridgeMqttClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
}

// 事件循环驱动: 独立任务, 负责订阅, 入站分发和重连
struct MqttDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: TopicSet,
    inbound: mpsc::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    backoff: ReconnectBackoff,
    max_reconnect_attempts: u32,
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(config.clean_session);

    // 设置认证信息
    if !config.username.is_empty() && !config.password.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }

    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

impl BridgeMqttClient {
    /// Connect, wait for the first CONNACK, then drive the loop in the background.
    ///
    /// `inbound` is bounded: a full channel stops the loop from reading the
    /// broker until the dispatcher catches up.
    pub async fn connect(
        config: &MqttConfig,
        topics: TopicSet,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), MqttError> {
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.broker_host, config.broker_port, config.client_id
        );

        let (client, eventloop) = AsyncClient::new(mqtt_options(config), config.channel_capacity.max(10));
        let connected = Arc::new(AtomicBool::new(false));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let mut driver = MqttDriver {
            client: client.clone(),
            eventloop,
            topics,
            inbound,
            connected: connected.clone(),
            shutting_down: shutting_down.clone(),
            backoff: ReconnectBackoff::from_config(config),
            max_reconnect_attempts: config.max_reconnect_attempts,
        };

        tokio::time::timeout(CONNECT_TIMEOUT, driver.wait_for_connack())
            .await
            .map_err(|_| MqttError::Connection("timed out waiting for CONNACK".to_string()))??;

        let handle = tokio::spawn(driver.run());

        Ok((
            Arc::new(Self {
                client,
                connected,
                shutting_down,
            }),
            handle,
        ))
    }

    pub async fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            warn!("Error while disconnecting from MQTT broker: {}", e);
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("MQTT client disconnected");
    }
}

#[async_trait]
impl Publisher for BridgeMqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::ConnectionLost);
        }

        self.client
            .publish(topic, to_rumqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| MqttError::Publish(format!("{}: {}", topic, e)))?;

        debug!("Published MQTT message to topic: {}", topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MqttDriver {
    async fn wait_for_connack(&mut self) -> Result<(), MqttError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    self.on_connected();
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return Err(MqttError::Connection(format!("broker refused: {:?}", ack.code)));
                }
                Ok(_) => continue,
                Err(e) => return Err(MqttError::Connection(e.to_string())),
            }
        }
    }

    fn on_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!("MQTT connection established");

        // 事件循环内不能 await 请求通道, 用 try_subscribe
        for filter in self.topics.subscriptions() {
            match self
                .client
                .try_subscribe(&filter.topic_pattern, to_rumqtt_qos(filter.qos))
            {
                Ok(()) => info!("Subscribed to MQTT topic: {}", filter.topic_pattern),
                Err(e) => error!("Failed to subscribe to {}: {}", filter.topic_pattern, e),
            }
        }
    }

    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        failures = 0;
                        self.on_connected();
                    } else {
                        warn!("MQTT broker refused reconnect: {:?}", ack.code);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("Received MQTT message on topic: {}", publish.topic);
                    if let Some(message) = parse_inbound(&self.topics, &publish.topic, &publish.payload) {
                        if self.inbound.send(message).await.is_err() {
                            warn!("Inbound dispatcher gone, stopping MQTT event loop");
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!("Subscription acknowledged: {:?}", suback.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker initiated disconnect");
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.shutting_down.load(Ordering::SeqCst) {
                        info!("MQTT event loop stopped");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.shutting_down.load(Ordering::SeqCst) {
                        info!("MQTT event loop stopped");
                        break;
                    }

                    failures += 1;
                    if self.max_reconnect_attempts > 0 && failures > self.max_reconnect_attempts {
                        error!("{} after {} failures: {}", MqttError::MaxReconnectAttemptsReached, failures - 1, e);
                        break;
                    }

                    let delay = self.backoff.delay(failures);
                    warn!("MQTT connection error: {}; reconnecting in {:?} (attempt {})", e, delay, failures);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Typed outbound messages to devices, built on any `Publisher`.
#[derive(Clone)]
pub struct DeviceMessenger {
    publisher: Arc<dyn Publisher>,
    topics: TopicSet,
}

impl DeviceMessenger {
    pub fn new(publisher: Arc<dyn Publisher>, topics: TopicSet) -> Self {
        Self { publisher, topics }
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let bytes = serde_json::to_vec(payload)?;
        self.publisher.publish(topic, bytes, qos, false).await
    }

    /// Provisioning answer, keyed by serial since the device id is not yet known.
    pub async fn send_config_response(&self, key: &str, payload: &Value) -> Result<(), MqttError> {
        let topic = self.topics.config_response_topic(key)?;
        self.publish_json(&topic, payload, QoS::AtLeastOnce).await
    }

    pub async fn send_device_command(&self, device_id: &str, payload: &Value) -> Result<(), MqttError> {
        let topic = self.topics.command_topic(device_id)?;
        self.publish_json(&topic, payload, QoS::AtLeastOnce).await?;
        info!("Sent command to {} on {}", device_id, topic);
        Ok(())
    }

    pub async fn send_ota_notification(&self, device_id: &str, payload: &Value) -> Result<(), MqttError> {
        let mut payload = payload.clone();
        if let Value::Object(object) = &mut payload {
            object.insert("command_type".to_string(), json!("ota"));
        }
        self.send_ota_command(device_id, &payload).await
    }

    pub async fn send_ota_command(&self, device_id: &str, payload: &Value) -> Result<(), MqttError> {
        let topic = self.topics.ota_notify_topic(device_id)?;
        self.publish_json(&topic, payload, QoS::AtLeastOnce).await?;
        info!("Sent OTA command to {} on {}", device_id, topic);
        Ok(())
    }
}
