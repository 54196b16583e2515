// 桥接服务: 把设备侧 MQTT 消息和后端 HTTP webhook 连接起来

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use iiot_shared::{
    generate_command_id, now_utc, validate_device_id, BridgeHealthStatus, CacheConfig,
    CommandMessage, CommandResponse, DeviceConfigRequest, DeviceConfigResponse,
    DeviceStatusSnapshot, FirmwareRef, InboundTopic, OtaStatusReport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend_client::Backend;
use crate::device_manager::{DeviceManager, QueuedCommand};
use crate::error::GatewayError;
use crate::mqtt_client::{DeviceMessenger, InboundMessage};
use crate::ota::{OtaError, OtaTracker, OtaUpdate};

/// What one housekeeping pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub expired_configs: usize,
    pub idle_devices: usize,
    pub pruned_updates: usize,
}

pub struct BridgeService {
    messenger: DeviceMessenger,
    backend: Arc<dyn Backend>,
    devices: Arc<DeviceManager>,
    ota: Arc<OtaTracker>,
}

fn ensure_device_id(device_id: &str) -> Result<(), GatewayError> {
    if validate_device_id(device_id) {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput(format!("Invalid device id: {}", device_id)))
    }
}

impl BridgeService {
    pub fn new(
        messenger: DeviceMessenger,
        backend: Arc<dyn Backend>,
        devices: Arc<DeviceManager>,
        ota: Arc<OtaTracker>,
    ) -> Self {
        Self {
            messenger,
            backend,
            devices,
            ota,
        }
    }

    /// Consume inbound broker messages, one task per message and at most
    /// `max_in_flight` handlers at a time.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        max_in_flight: usize,
    ) {
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        info!("Inbound dispatcher started ({} handlers max)", max_in_flight.max(1));

        while let Some(message) = inbound.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let service = self.clone();
            tokio::spawn(async move {
                service.handle_inbound(message).await;
                drop(permit);
            });
        }
        info!("Inbound dispatcher stopped");
    }

    /// Route one message; failures are logged and never propagate.
    pub async fn handle_inbound(&self, message: InboundMessage) {
        let kind = message.kind.kind();
        debug!(
            "Handling {} message on {} (queued {}ms)",
            kind,
            message.topic,
            (now_utc() - message.received_at).num_milliseconds()
        );

        let outcome = match &message.kind {
            InboundTopic::ConfigRequest => self.handle_config_request(&message.payload).await,
            InboundTopic::Telemetry { device_id } => {
                self.handle_telemetry(device_id, &message.topic, &message.payload).await
            }
            InboundTopic::OtaStatus { device_id } => self.handle_ota_status(device_id, &message.payload).await,
            InboundTopic::CommandResponse { device_id } => {
                self.handle_command_response(device_id, &message.payload).await
            }
            InboundTopic::Unknown => {
                warn!("Unhandled topic: {}", message.topic);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!("Error handling {} message on {}: {:#}", kind, message.topic, e);
        }
    }

    async fn handle_config_request(&self, payload: &Value) -> Result<()> {
        let request: DeviceConfigRequest =
            serde_json::from_value(payload.clone()).context("malformed config request")?;
        if !request.is_complete() {
            bail!("config request missing serial or token");
        }

        info!("Config request from serial {}", request.serial);

        match self.backend.get_device_config(&request.serial, &request.token).await {
            Ok(config) => {
                self.devices.set_device_config(&config.device_id, &config).await;

                let reply = json!({
                    "device_id": config.device_id,
                    "mqtt_config": config.broker_credentials,
                    "topics": config.topic_map,
                    "timestamp": now_utc(),
                });
                self.messenger
                    .send_config_response(&config.device_id, &reply)
                    .await
                    .with_context(|| format!("failed to publish config for {}", config.device_id))?;

                info!("Sent config to device {}", config.device_id);
            }
            Err(e) => {
                warn!("Config request for serial {} rejected: {}", request.serial, e);
                let reply = json!({
                    "error": e.to_string(),
                    "timestamp": now_utc(),
                });
                self.messenger
                    .send_config_response(&request.serial, &reply)
                    .await
                    .with_context(|| format!("failed to publish config error for {}", request.serial))?;
            }
        }

        Ok(())
    }

    async fn handle_telemetry(&self, device_id: &str, topic: &str, payload: &Value) -> Result<()> {
        self.devices.touch_device(device_id).await;

        self.backend
            .send_telemetry(device_id, topic, payload)
            .await
            .with_context(|| format!("telemetry for {} not delivered", device_id))?;

        debug!("Telemetry forwarded for {}", device_id);
        Ok(())
    }

    async fn handle_ota_status(&self, device_id: &str, payload: &Value) -> Result<()> {
        self.devices.update_device_last_seen(device_id).await;

        match serde_json::from_value::<OtaStatusReport>(payload.clone()) {
            Ok(report) => match self.ota.apply_device_report(device_id, &report).await {
                Ok(update) => debug!("OTA {} mirrored as {}", update.update_id, update.status),
                Err(e @ (OtaError::NotFound(_) | OtaError::NoActiveUpdate(_))) => {
                    debug!("OTA report from {} not tracked locally: {}", device_id, e)
                }
                Err(e) => warn!("Ignoring OTA report from {}: {}", device_id, e),
            },
            Err(e) => warn!("Malformed OTA status from {}: {}", device_id, e),
        }

        self.backend
            .send_ota_status(device_id, payload)
            .await
            .with_context(|| format!("OTA status for {} not delivered", device_id))?;

        info!("OTA status forwarded for {}", device_id);
        Ok(())
    }

    async fn handle_command_response(&self, device_id: &str, payload: &Value) -> Result<()> {
        self.devices.update_device_last_seen(device_id).await;

        let response: CommandResponse =
            serde_json::from_value(payload.clone()).context("malformed command response")?;

        match &response.command_id {
            Some(command_id) => match self.devices.acknowledge_command(device_id, command_id).await {
                Some(command) => info!(
                    "Command {} ({}) for {} answered: {}",
                    command_id,
                    command.command["action"].as_str().unwrap_or("?"),
                    device_id,
                    response.status
                ),
                None => warn!("Response for unknown command {} from {}", command_id, device_id),
            },
            None => info!(
                "Command response from {}: {} {}",
                device_id,
                response.action.as_deref().unwrap_or("?"),
                response.status
            ),
        }

        Ok(())
    }

    // HTTP 控制面调用的操作

    pub async fn download_config(&self, request: &DeviceConfigRequest) -> Result<DeviceConfigResponse, GatewayError> {
        if !request.is_complete() {
            return Err(GatewayError::InvalidInput("Missing serial or token".to_string()));
        }

        let config = self.backend.get_device_config(&request.serial, &request.token).await?;
        self.devices.set_device_config(&config.device_id, &config).await;
        Ok(config)
    }

    pub async fn send_command(&self, command: &CommandMessage) -> Result<QueuedCommand, GatewayError> {
        ensure_device_id(&command.device_id)?;
        if command.action.trim().is_empty() {
            return Err(GatewayError::InvalidInput("Missing action".to_string()));
        }

        if self.devices.get_device_config(&command.device_id).await.is_none() {
            warn!("No cached config for {}, sending command anyway", command.device_id);
        }
        if !self.devices.is_device_connected(&command.device_id).await {
            debug!("Device {} has not been seen on the broker yet", command.device_id);
        }

        let command_id = generate_command_id();
        let payload = json!({
            "command_id": command_id,
            "action": command.action,
            "params": command.params,
            "timestamp": command.timestamp,
        });

        let queued = QueuedCommand {
            command_id,
            device_id: command.device_id.clone(),
            command: payload.clone(),
            queued_at: now_utc(),
        };
        self.devices.push_command(queued.clone()).await;

        self.messenger.send_device_command(&command.device_id, &payload).await?;
        Ok(queued)
    }

    pub async fn send_ota(&self, command: &CommandMessage) -> Result<(), GatewayError> {
        ensure_device_id(&command.device_id)?;

        let payload = json!({
            "action": command.action,
            "params": command.params,
            "timestamp": command.timestamp,
        });
        self.messenger.send_ota_notification(&command.device_id, &payload).await?;
        Ok(())
    }

    pub async fn schedule_ota(&self, device_id: &str, firmware: FirmwareRef) -> Result<OtaUpdate, GatewayError> {
        ensure_device_id(device_id)?;
        Ok(self.ota.schedule(device_id, firmware).await?)
    }

    pub async fn get_ota(&self, update_id: &str) -> Result<OtaUpdate, GatewayError> {
        self.ota
            .get(update_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("OTA update not found: {}", update_id)))
    }

    /// Push a pending update to its device over the command channel.
    pub async fn dispatch_ota(&self, update_id: &str) -> Result<OtaUpdate, GatewayError> {
        // 先占用 pending → sent, 再发布
        let update = self.ota.begin_dispatch(update_id).await?;
        let payload = update.dispatch_payload();

        match self.messenger.send_device_command(&update.device_id, &payload).await {
            Ok(()) => Ok(self.ota.finish_dispatch(update_id, None).await?),
            Err(e) => {
                error!("Failed to dispatch OTA {}: {}", update_id, e);
                self.ota.finish_dispatch(update_id, Some(&e.to_string())).await?;
                Err(e.into())
            }
        }
    }

    pub async fn cancel_ota(&self, update_id: &str) -> Result<OtaUpdate, GatewayError> {
        Ok(self.ota.cancel(update_id).await?)
    }

    pub async fn device_status(&self, device_id: &str) -> Result<DeviceStatusSnapshot, GatewayError> {
        ensure_device_id(device_id)?;
        Ok(self.devices.get_device_status(device_id).await)
    }

    pub async fn all_device_statuses(&self) -> HashMap<String, DeviceStatusSnapshot> {
        self.devices.get_all_device_statuses().await
    }

    pub async fn pending_commands(&self, device_id: &str) -> Result<Vec<QueuedCommand>, GatewayError> {
        ensure_device_id(device_id)?;
        Ok(self.devices.get_pending_commands(device_id).await)
    }

    pub async fn clear_commands(&self, device_id: &str) -> Result<usize, GatewayError> {
        ensure_device_id(device_id)?;
        Ok(self.devices.clear_commands(device_id).await)
    }

    pub fn health(&self) -> BridgeHealthStatus {
        BridgeHealthStatus {
            status: "healthy".to_string(),
            mqtt_connected: self.messenger.is_connected(),
            active_connections: self.devices.active_connections(),
            timestamp: now_utc(),
        }
    }

    /// One sweep over expired configs, idle devices and finished OTA updates.
    pub async fn housekeeping_pass(&self, ota_retention: ChronoDuration) -> HousekeepingReport {
        HousekeepingReport {
            expired_configs: self.devices.cleanup_expired_configs().await,
            idle_devices: self.devices.cleanup_idle_devices().await,
            pruned_updates: self.ota.prune_finished(now_utc() - ota_retention).await,
        }
    }

    // 定期清理
    pub fn start_housekeeping(self: &Arc<Self>, cache: &CacheConfig) -> JoinHandle<()> {
        let service = self.clone();
        let period = cache.cleanup_interval();
        let ota_retention =
            ChronoDuration::from_std(cache.ota_retention()).unwrap_or_else(|_| ChronoDuration::days(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = service.housekeeping_pass(ota_retention).await;
                debug!(
                    "Housekeeping: {:?}, {} devices connected",
                    report,
                    service.devices.active_connections()
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::BackendError;
    use crate::device_manager::tests::ManualClock;
    use crate::mqtt_client::tests::RecordingPublisher;
    use crate::ota::OtaStatus;
    use crate::provisioning::{BrokerEndpoint, LocalBackend};
    use async_trait::async_trait;
    use chrono::Utc;
    use iiot_shared::{BrokerCredentials, MqttConfig, TopicMap, TopicSet, TopicsConfig};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Config(String, String),
        Telemetry(String, String, Value),
        OtaStatus(String, Value),
    }

    struct MockBackend {
        calls: Mutex<Vec<Call>>,
        config: Result<DeviceConfigResponse, BackendError>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockBackend {
        fn new(config: Result<DeviceConfigResponse, BackendError>) -> Arc<Self> {
            Self::slow(config, Duration::ZERO)
        }

        fn slow(config: Result<DeviceConfigResponse, BackendError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                config,
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn get_device_config(&self, serial: &str, token: &str) -> Result<DeviceConfigResponse, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Config(serial.to_string(), token.to_string()));
            self.config.clone()
        }

        async fn send_telemetry(&self, device_id: &str, topic: &str, payload: &Value) -> Result<Value, BackendError> {
            self.calls.lock().unwrap().push(Call::Telemetry(
                device_id.to_string(),
                topic.to_string(),
                payload.clone(),
            ));

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"status": "success"}))
        }

        async fn send_ota_status(&self, device_id: &str, payload: &Value) -> Result<Value, BackendError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::OtaStatus(device_id.to_string(), payload.clone()));
            Ok(json!({"status": "success"}))
        }

        async fn send_command_to_device(
            &self,
            _device_id: &str,
            _action: &str,
            _params: &Map<String, Value>,
        ) -> Result<Value, BackendError> {
            Ok(json!({"status": "success"}))
        }
    }

    fn topics() -> TopicSet {
        TopicSet::from_config(&TopicsConfig::default()).unwrap()
    }

    fn dev1_config() -> DeviceConfigResponse {
        DeviceConfigResponse {
            status: "success".to_string(),
            device_id: "dev1".to_string(),
            broker_credentials: BrokerCredentials {
                host: "mqtt.factory.com".to_string(),
                port: 8883,
                use_tls: true,
                client_id: "dev1".to_string(),
                username: "dev1".to_string(),
                password: "T1".to_string(),
            },
            topic_map: TopicMap::for_device(&topics(), "dev1").unwrap(),
            firmware_version: None,
        }
    }

    fn service(backend: Arc<dyn Backend>) -> (Arc<BridgeService>, Arc<RecordingPublisher>) {
        let publisher = RecordingPublisher::new();
        let service = BridgeService::new(
            DeviceMessenger::new(publisher.clone(), topics()),
            backend,
            Arc::new(DeviceManager::new(&CacheConfig::default())),
            Arc::new(OtaTracker::new()),
        );
        (Arc::new(service), publisher)
    }

    fn inbound(topic: &str, payload: Value) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            kind: topics().classify(topic),
            payload,
            received_at: Utc::now(),
        }
    }

    fn firmware() -> FirmwareRef {
        FirmwareRef {
            version: "2.0.0".to_string(),
            url: "https://fw.example.com/2.0.0.bin".to_string(),
            checksum: Some("abc".to_string()),
        }
    }

    #[tokio::test]
    async fn test_config_request_publishes_and_caches() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, publisher) = service(backend.clone());

        service
            .handle_inbound(inbound("iiot/config/request", json!({"serial": "SN1", "token": "T1"})))
            .await;

        assert_eq!(backend.calls(), vec![Call::Config("SN1".into(), "T1".into())]);

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "iiot/config/dev1");
        assert_eq!(published[0].payload["device_id"], "dev1");
        assert_eq!(published[0].payload["mqtt_config"]["client_id"], "dev1");
        assert_eq!(published[0].payload["topics"]["command"], "company_1/cmd/dev1/request");

        let cached = service.devices.get_device_config("dev1").await.unwrap();
        assert_eq!(cached.broker_credentials, dev1_config().broker_credentials);
    }

    #[tokio::test]
    async fn test_config_request_failure_replies_on_serial_topic() {
        let backend = MockBackend::new(Err(BackendError::Rejected("Invalid serial or token".into())));
        let (service, publisher) = service(backend);

        service
            .handle_inbound(inbound("iiot/config/request", json!({"serial": "SN1", "token": "bad"})))
            .await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "iiot/config/SN1");
        assert_eq!(published[0].payload["error"], "Invalid serial or token");
        assert!(published[0].payload.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_incomplete_config_request_is_dropped() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, publisher) = service(backend.clone());

        service
            .handle_inbound(inbound("iiot/config/request", json!({"serial": "SN1"})))
            .await;
        service.handle_inbound(inbound("iiot/config/request", json!([1, 2]))).await;

        assert!(backend.calls().is_empty());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_single_use_token_through_mqtt_flow() {
        let local = LocalBackend::new(topics(), BrokerEndpoint::from(&MqttConfig::default()));
        let token = local.register_device("SN1", "dev1").await.unwrap();
        let (service, publisher) = service(Arc::new(local));

        let request = json!({"serial": "SN1", "token": token});
        service.handle_inbound(inbound("iiot/config/request", request.clone())).await;
        service.handle_inbound(inbound("iiot/config/request", request)).await;

        let published = publisher.published();
        assert_eq!(published[0].topic, "iiot/config/dev1");
        assert_eq!(published[1].topic, "iiot/config/SN1");
        assert_eq!(published[1].payload["error"], "Invalid serial or token");
    }

    #[tokio::test]
    async fn test_telemetry_forwarded_once() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, _publisher) = service(backend.clone());
        // 不带租户前缀的主题同样在订阅范围内
        assert!(topics()
            .subscriptions()
            .iter()
            .any(|f| f.matches("telemetry/dev1/data")));

        service
            .handle_inbound(inbound("telemetry/dev1/data", json!({"t": 22.5})))
            .await;

        assert_eq!(
            backend.calls(),
            vec![Call::Telemetry("dev1".into(), "telemetry/dev1/data".into(), json!({"t": 22.5}))]
        );

        let status = service.device_status("dev1").await.unwrap();
        assert!(status.connected);
        assert!(status.last_seen.is_some());
        assert_eq!(service.health().active_connections, 1);
    }

    #[tokio::test]
    async fn test_dispatcher_spawns_handlers() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, _publisher) = service(backend.clone());
        let (tx, rx) = mpsc::channel(8);

        let dispatcher = tokio::spawn(service.clone().run_dispatcher(rx, 4));
        tx.send(inbound("company_1/telemetry/dev1/data", json!({"n": 1}))).await.unwrap();
        tx.send(inbound("company_1/telemetry/dev2/data", json!({"n": 2}))).await.unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        for _ in 0..100 {
            if backend.calls().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatcher_caps_handlers_in_flight() {
        let backend = MockBackend::slow(Ok(dev1_config()), Duration::from_millis(30));
        let (service, _publisher) = service(backend.clone());
        let (tx, rx) = mpsc::channel(2);

        let dispatcher = tokio::spawn(service.clone().run_dispatcher(rx, 2));
        for n in 0..6 {
            let topic = format!("company_1/telemetry/dev{}/data", n);
            tx.send(inbound(&topic, json!({"n": n}))).await.unwrap();
        }
        drop(tx);
        dispatcher.await.unwrap();

        for _ in 0..100 {
            if backend.calls().len() == 6 && backend.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.calls().len(), 6);
        let peak = backend.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {} handlers", peak);
    }

    #[tokio::test]
    async fn test_command_correlation() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, publisher) = service(backend);

        let command = CommandMessage {
            device_id: "dev1".to_string(),
            action: "reset".to_string(),
            params: Map::new(),
            timestamp: Utc::now(),
        };
        let queued = service.send_command(&command).await.unwrap();
        assert!(queued.command_id.starts_with("cmd_"));

        let published = publisher.published();
        assert_eq!(published[0].topic, "company_1/cmd/dev1/request");
        assert_eq!(published[0].payload["command_id"], queued.command_id.as_str());
        assert_eq!(published[0].payload["action"], "reset");
        assert_eq!(service.pending_commands("dev1").await.unwrap().len(), 1);

        service
            .handle_inbound(inbound(
                "company_1/cmd/dev1/response",
                json!({"command_id": queued.command_id, "status": "ok"}),
            ))
            .await;
        assert!(service.pending_commands("dev1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_input_validation() {
        let (service, publisher) = service(MockBackend::new(Ok(dev1_config())));

        let bad = CommandMessage {
            device_id: "dev/#".to_string(),
            action: "reset".to_string(),
            params: Map::new(),
            timestamp: Utc::now(),
        };
        assert!(matches!(
            service.send_command(&bad).await,
            Err(GatewayError::InvalidInput(_))
        ));

        let no_action = CommandMessage {
            device_id: "dev1".to_string(),
            action: " ".to_string(),
            ..bad
        };
        assert!(service.send_command(&no_action).await.is_err());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_manual_ota_send() {
        let (service, publisher) = service(MockBackend::new(Ok(dev1_config())));
        let mut params = Map::new();
        params.insert("version".to_string(), json!("2.0.0"));

        service
            .send_ota(&CommandMessage {
                device_id: "dev1".to_string(),
                action: "update".to_string(),
                params,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published[0].topic, "company_1/ota/dev1/notify");
        assert_eq!(published[0].payload["command_type"], "ota");
        assert_eq!(published[0].payload["params"]["version"], "2.0.0");
    }

    #[tokio::test]
    async fn test_ota_dispatch_and_device_reports() {
        let backend = MockBackend::new(Ok(dev1_config()));
        let (service, publisher) = service(backend.clone());

        let update = service.schedule_ota("dev1", firmware()).await.unwrap();
        let sent = service.dispatch_ota(&update.update_id).await.unwrap();
        assert_eq!(sent.status, OtaStatus::Sent);
        assert!(sent.start_time.is_some());
        assert!(sent.end_time.is_none());

        let published = publisher.published();
        assert_eq!(published[0].topic, "company_1/cmd/dev1/request");
        assert_eq!(published[0].payload["command"], "ota_update");
        assert_eq!(published[0].payload["update_id"], update.update_id.as_str());

        // 重复派发被拒绝
        assert!(matches!(
            service.dispatch_ota(&update.update_id).await,
            Err(GatewayError::Conflict(_))
        ));

        let report = json!({"update_id": update.update_id, "status": "success"});
        service
            .handle_inbound(inbound("company_1/ota/dev1/status", report.clone()))
            .await;

        let done = service.get_ota(&update.update_id).await.unwrap();
        assert_eq!(done.status, OtaStatus::Success);
        assert_eq!(done.progress, 100.0);
        assert!(done.end_time.is_some());
        assert_eq!(backend.calls(), vec![Call::OtaStatus("dev1".into(), report)]);
    }

    #[tokio::test]
    async fn test_ota_dispatch_failure_marks_failed() {
        let (service, publisher) = service(MockBackend::new(Ok(dev1_config())));
        publisher.fail.store(true, Ordering::SeqCst);

        let update = service.schedule_ota("dev1", firmware()).await.unwrap();
        assert!(service.dispatch_ota(&update.update_id).await.is_err());

        let failed = service.get_ota(&update.update_id).await.unwrap();
        assert_eq!(failed.status, OtaStatus::Failed);
        assert!(failed.end_time.is_some());
        assert!(failed.error_message.unwrap().contains("broker unavailable"));
    }

    #[tokio::test]
    async fn test_cancel_waits_for_inflight_dispatch() {
        let (service, publisher) = service(MockBackend::new(Ok(dev1_config())));
        publisher.delay_ms.store(100, Ordering::SeqCst);
        let update = service.schedule_ota("dev1", firmware()).await.unwrap();

        let dispatch = {
            let service = service.clone();
            let update_id = update.update_id.clone();
            tokio::spawn(async move { service.dispatch_ota(&update_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            service.cancel_ota(&update.update_id).await,
            Err(GatewayError::Conflict(_))
        ));
        let sent = dispatch.await.unwrap().unwrap();
        assert_eq!(sent.status, OtaStatus::Sent);
        assert_eq!(publisher.published().len(), 1);

        // 发布完成后设备上报照常生效
        service
            .handle_inbound(inbound(
                "company_1/ota/dev1/status",
                json!({"update_id": update.update_id, "status": "downloading", "progress": 10}),
            ))
            .await;
        let downloading = service.get_ota(&update.update_id).await.unwrap();
        assert_eq!(downloading.status, OtaStatus::Downloading);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_publishes_once() {
        let (service, publisher) = service(MockBackend::new(Ok(dev1_config())));
        publisher.delay_ms.store(50, Ordering::SeqCst);
        let update = service.schedule_ota("dev1", firmware()).await.unwrap();

        let (a, b) = tokio::join!(
            service.dispatch_ota(&update.update_id),
            service.dispatch_ota(&update.update_id)
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(GatewayError::Conflict(_))));
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(service.get_ota(&update.update_id).await.unwrap().status, OtaStatus::Sent);
    }

    #[tokio::test]
    async fn test_housekeeping_pass_sweeps_idle_state() {
        let clock = ManualClock::new();
        let service = BridgeService::new(
            DeviceMessenger::new(RecordingPublisher::new(), topics()),
            MockBackend::new(Ok(dev1_config())),
            Arc::new(DeviceManager::with_clock(&CacheConfig::default(), clock.clone())),
            Arc::new(OtaTracker::new()),
        );

        service
            .handle_inbound(inbound("company_1/telemetry/dev1/data", json!({"t": 1})))
            .await;
        let finished = service.schedule_ota("dev1", firmware()).await.unwrap();
        service.cancel_ota(&finished.update_id).await.unwrap();
        let pending = service.schedule_ota("dev1", firmware()).await.unwrap();
        assert_eq!(service.health().active_connections, 1);

        clock.advance(ChronoDuration::seconds(601));
        let report = service.housekeeping_pass(ChronoDuration::zero()).await;
        assert_eq!(
            report,
            HousekeepingReport {
                expired_configs: 0,
                idle_devices: 1,
                pruned_updates: 1,
            }
        );

        assert!(!service.device_status("dev1").await.unwrap().connected);
        assert_eq!(service.health().active_connections, 0);
        assert!(service.get_ota(&pending.update_id).await.is_ok());
        assert!(matches!(
            service.get_ota(&finished.update_id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ota_cancel_rules() {
        let (service, _publisher) = service(MockBackend::new(Ok(dev1_config())));

        let update = service.schedule_ota("dev1", firmware()).await.unwrap();
        let cancelled = service.cancel_ota(&update.update_id).await.unwrap();
        assert_eq!(cancelled.status, OtaStatus::Cancelled);
        assert!(cancelled.end_time.is_some());
        assert!(matches!(
            service.dispatch_ota(&update.update_id).await,
            Err(GatewayError::Conflict(_))
        ));

        assert!(matches!(
            service.cancel_ota("missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_config_caches() {
        let (service, _publisher) = service(MockBackend::new(Ok(dev1_config())));

        let config = service
            .download_config(&DeviceConfigRequest {
                serial: "SN1".into(),
                token: "T1".into(),
            })
            .await
            .unwrap();
        assert_eq!(config.device_id, "dev1");
        assert!(service.device_status("dev1").await.unwrap().has_config);

        assert!(matches!(
            service
                .download_config(&DeviceConfigRequest {
                    serial: "SN1".into(),
                    token: String::new(),
                })
                .await,
            Err(GatewayError::InvalidInput(_))
        ));
    }
}
