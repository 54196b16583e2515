mod api_handlers;
mod backend_client;
mod bridge_service;
mod device_manager;
mod error;
mod middleware;
mod mqtt_client;
mod ota;
mod provisioning;

use anyhow::{Context, Result};
use iiot_shared::{load_config, AppConfig, BackendMode, TopicSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api_handlers::ApiState;
use crate::backend_client::{Backend, HttpBackend};
use crate::bridge_service::BridgeService;
use crate::device_manager::DeviceManager;
use crate::mqtt_client::{BridgeMqttClient, DeviceMessenger};
use crate::ota::OtaTracker;
use crate::provisioning::{BrokerEndpoint, LocalBackend};

async fn build_backend(config: &AppConfig, topics: &TopicSet) -> Result<Arc<dyn Backend>> {
    match config.backend.mode {
        BackendMode::Http => {
            let backend = HttpBackend::new(config.backend.clone(), topics.clone())
                .context("Failed to build backend HTTP client")?;
            Ok(Arc::new(backend))
        }
        BackendMode::Local => {
            warn!("Running with the local provisioning backend; nothing is forwarded upstream");
            let backend = LocalBackend::from_devices(
                topics.clone(),
                BrokerEndpoint::from(&config.mqtt),
                &config.backend.devices,
            )
            .await;
            Ok(Arc::new(backend))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting IIoT MQTT Bridge...");

    let config = load_config().context("Failed to load configuration")?;
    let topics = TopicSet::from_config(&config.topics).context("Invalid topic configuration")?;

    let backend = build_backend(&config, &topics).await?;
    let devices = Arc::new(DeviceManager::new(&config.cache));
    let ota = Arc::new(OtaTracker::new());

    // 连接 MQTT broker, 启动失败直接退出
    let (inbound_tx, inbound_rx) = mpsc::channel(config.mqtt.channel_capacity);
    let (mqtt_client, mqtt_task) = BridgeMqttClient::connect(&config.mqtt, topics.clone(), inbound_tx)
        .await
        .context("Failed to connect to MQTT broker")?;

    let bridge = Arc::new(BridgeService::new(
        DeviceMessenger::new(mqtt_client.clone(), topics),
        backend,
        devices,
        ota,
    ));

    tokio::spawn(bridge.clone().run_dispatcher(inbound_rx, config.mqtt.channel_capacity));
    let housekeeping = bridge.start_housekeeping(&config.cache);

    let app = api_handlers::router(ApiState { bridge }, &config.server.api_key);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {}", addr))?;

    info!("IIoT MQTT Bridge listening on {}", addr);
    info!("Backend mode: {:?}, broker {}:{}", config.backend.mode, config.mqtt.broker_host, config.mqtt.broker_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal, stopping IIoT MQTT Bridge...");
        })
        .await
        .context("HTTP server error")?;

    housekeeping.abort();
    mqtt_client.disconnect().await;
    if let Err(e) = mqtt_task.await {
        warn!("MQTT task ended abnormally: {}", e);
    }

    info!("IIoT MQTT Bridge stopped");
    Ok(())
}
