use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use iiot_shared::{MqttError, StatusEnvelope};
use tracing::error;

use crate::backend_client::BackendError;
use crate::ota::OtaError;

/// Errors surfaced on the HTTP control surface.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<OtaError> for GatewayError {
    fn from(err: OtaError) -> Self {
        match err {
            OtaError::NotFound(_) | OtaError::NoActiveUpdate(_) => GatewayError::NotFound(err.to_string()),
            OtaError::InvalidTransition { .. } | OtaError::DispatchInProgress(_) => {
                GatewayError::Conflict(err.to_string())
            }
            OtaError::UnknownStatus(_) | OtaError::DeviceMismatch { .. } | OtaError::Invalid(_) => {
                GatewayError::InvalidInput(err.to_string())
            }
        }
    }
}

// 请求体缺字段或类型不对, 统一按 400 返回
impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        GatewayError::InvalidInput(rejection.body_text())
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            // 设备 id 非法属于调用方输入错误
            GatewayError::Mqtt(MqttError::InvalidDeviceId(_)) => StatusCode::BAD_REQUEST,
            // 业务错误照常返回 200, 由 body 的 status 字段区分
            GatewayError::Backend(_) | GatewayError::Mqtt(_) => StatusCode::OK,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Internal error: {:#}", self);
        }
        let body = match &self {
            GatewayError::Backend(e) => e.to_envelope(),
            other => StatusEnvelope::error(other.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
