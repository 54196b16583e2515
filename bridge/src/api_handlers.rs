// HTTP control surface for operators and the backend

use axum::{
    extract::{FromRequest, Path, Request, State},
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use iiot_shared::{
    BridgeHealthStatus, CommandMessage, DeviceConfigRequest, DeviceConfigResponse,
    DeviceStatusList, DeviceStatusSnapshot, FirmwareRef, StatusEnvelope,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge_service::BridgeService;
use crate::device_manager::QueuedCommand;
use crate::error::GatewayError;
use crate::middleware::{api_key_auth, request_logging, ApiKey};
use crate::ota::OtaUpdate;

// API State
#[derive(Clone)]
pub struct ApiState {
    pub bridge: Arc<BridgeService>,
}

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct ScheduleOtaRequest {
    pub device_id: String,
    pub firmware: FirmwareRef,
}

#[derive(Debug, Serialize)]
pub struct PendingCommands {
    pub device_id: String,
    pub commands: Vec<QueuedCommand>,
}

type ApiResult<T> = Result<Json<T>, GatewayError>;

/// JSON body whose rejections come back as `{status:"error", error}`.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub fn router(state: ApiState, api_key: &str) -> Router {
    let api_key = ApiKey(Arc::from(api_key));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/config/download", post(download_config))
        .route("/api/v1/command/send", post(send_command))
        .route("/api/v1/device/{device_id}/status", get(device_status))
        .route(
            "/api/v1/device/{device_id}/commands",
            get(pending_commands).delete(clear_commands),
        )
        .route("/api/v1/devices/status", get(all_device_statuses))
        .route("/api/v1/ota/send", post(send_ota))
        .route("/api/v1/ota/updates", post(schedule_ota))
        .route("/api/v1/ota/updates/{update_id}", get(get_ota))
        .route("/api/v1/ota/updates/{update_id}/dispatch", post(dispatch_ota))
        .route("/api/v1/ota/updates/{update_id}/cancel", post(cancel_ota))
        .layer(middleware::from_fn_with_state(api_key, api_key_auth))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ========================================================================
// API Handlers
// ========================================================================

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Json<BridgeHealthStatus> {
    Json(state.bridge.health())
}

/// POST /api/v1/config/download
pub async fn download_config(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<DeviceConfigRequest>,
) -> ApiResult<DeviceConfigResponse> {
    info!("API: Config download for serial {}", request.serial);
    Ok(Json(state.bridge.download_config(&request).await?))
}

/// POST /api/v1/command/send
pub async fn send_command(
    State(state): State<ApiState>,
    ApiJson(command): ApiJson<CommandMessage>,
) -> ApiResult<StatusEnvelope> {
    info!("API: Sending {} to {}", command.action, command.device_id);

    let queued = state.bridge.send_command(&command).await.map_err(|e| match e {
        GatewayError::Mqtt(inner) if !matches!(inner, iiot_shared::MqttError::InvalidDeviceId(_)) => {
            GatewayError::Internal(anyhow::anyhow!("Failed to send command to device: {}", inner))
        }
        other => other,
    })?;

    Ok(Json(
        StatusEnvelope::success(format!("Command sent to device {}", command.device_id))
            .with_command_id(queued.command_id),
    ))
}

/// GET /api/v1/device/{device_id}/status
pub async fn device_status(
    Path(device_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<DeviceStatusSnapshot> {
    Ok(Json(state.bridge.device_status(&device_id).await?))
}

/// GET /api/v1/devices/status
pub async fn all_device_statuses(State(state): State<ApiState>) -> Json<DeviceStatusList> {
    Json(DeviceStatusList {
        devices: state.bridge.all_device_statuses().await,
    })
}

/// GET /api/v1/device/{device_id}/commands
pub async fn pending_commands(
    Path(device_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<PendingCommands> {
    let commands = state.bridge.pending_commands(&device_id).await?;
    Ok(Json(PendingCommands { device_id, commands }))
}

/// DELETE /api/v1/device/{device_id}/commands
pub async fn clear_commands(
    Path(device_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<StatusEnvelope> {
    let cleared = state.bridge.clear_commands(&device_id).await?;
    Ok(Json(StatusEnvelope::success(format!(
        "Cleared {} commands for device {}",
        cleared, device_id
    ))))
}

/// POST /api/v1/ota/send
pub async fn send_ota(
    State(state): State<ApiState>,
    ApiJson(command): ApiJson<CommandMessage>,
) -> ApiResult<StatusEnvelope> {
    info!("API: OTA notification to {}", command.device_id);
    state.bridge.send_ota(&command).await?;
    Ok(Json(StatusEnvelope::success(format!(
        "OTA command sent to device {}",
        command.device_id
    ))))
}

/// POST /api/v1/ota/updates
pub async fn schedule_ota(
    State(state): State<ApiState>,
    ApiJson(request): ApiJson<ScheduleOtaRequest>,
) -> ApiResult<OtaUpdate> {
    Ok(Json(state.bridge.schedule_ota(&request.device_id, request.firmware).await?))
}

/// GET /api/v1/ota/updates/{update_id}
pub async fn get_ota(
    Path(update_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<OtaUpdate> {
    Ok(Json(state.bridge.get_ota(&update_id).await?))
}

/// POST /api/v1/ota/updates/{update_id}/dispatch
pub async fn dispatch_ota(
    Path(update_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<OtaUpdate> {
    info!("API: Dispatching OTA update {}", update_id);
    Ok(Json(state.bridge.dispatch_ota(&update_id).await?))
}

/// POST /api/v1/ota/updates/{update_id}/cancel
pub async fn cancel_ota(
    Path(update_id): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<OtaUpdate> {
    info!("API: Cancelling OTA update {}", update_id);
    Ok(Json(state.bridge.cancel_ota(&update_id).await?))
}
