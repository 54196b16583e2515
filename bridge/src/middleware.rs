use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::GatewayError;

pub async fn request_logging(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;
    let status = response.status();
    let elapsed = start.elapsed().as_millis();

    if status.is_success() {
        info!("{} {} - {} ({}ms)", method, uri, status, elapsed);
    } else if status.is_client_error() {
        warn!("Client error: {} {} - {} ({}ms)", method, uri, status, elapsed);
    } else {
        error!("Server error: {} {} - {} ({}ms)", method, uri, status, elapsed);
    }

    response
}

/// Key required on `/api/v1/*`; empty disables the check.
#[derive(Clone)]
pub struct ApiKey(pub Arc<str>);

fn presented_key(req: &Request) -> Option<&str> {
    let headers = req.headers();

    // 优先 Authorization: Bearer, 其次 X-API-Key
    if let Some(token) = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(token.trim());
    }

    headers.get("x-api-key").and_then(|h| h.to_str().ok()).map(str::trim)
}

pub async fn api_key_auth(State(expected): State<ApiKey>, req: Request, next: Next) -> Response {
    if expected.0.is_empty() || !req.uri().path().starts_with("/api/") {
        return next.run(req).await;
    }

    let authorized = presented_key(&req).is_some_and(|key| key == &*expected.0);
    if authorized {
        next.run(req).await
    } else {
        warn!("Rejected unauthenticated request to {}", req.uri().path());
        GatewayError::Unauthorized.into_response()
    }
}
