use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::AppState;

/// Extract the caller's token from `Authorization` (with or without the
/// `Bearer ` prefix) or `X-API-Key`.
fn request_token(request: &Request<Body>) -> Option<&str> {
    let headers = request.headers();
    if let Some(header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        return Some(header.strip_prefix("Bearer ").unwrap_or(header));
    }
    headers.get("X-API-Key").and_then(|h| h.to_str().ok())
}

/// Reject requests that don't carry the configured admin token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = request_token(&request) else {
        return ApiError::unauthorized("Missing API token").into_response();
    };

    // Constant-time comparison; lengths are compared first
    let admin_token = state.config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();
    if admin_token.len() == provided.len() && bool::from(admin_token.ct_eq(provided)) {
        return next.run(request).await;
    }

    ApiError::unauthorized("Invalid API token").into_response()
}
