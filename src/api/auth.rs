//! API key and admin token checks.
//!
//! - User routes require `X-API-Key` naming an open ledger account; the key
//!   becomes the request's `Credential`.
//! - Admin routes require `X-Admin-Token` and are hidden (404) when no admin
//!   token is configured.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;
use super::routes::AppState;
use crate::util::constant_time_eq;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// The authenticated API key of a request.
#[derive(Debug, Clone)]
pub struct Credential(pub String);

fn header_value<'a>(req: &'a Request<Body>, name: &str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let key = header_value(&req, API_KEY_HEADER).to_string();
    if key.is_empty() {
        return ApiError::unauthorized("Missing X-API-Key header").into_response();
    }
    if !state.ledger.has_account(&key).await {
        return ApiError::unauthorized("Unknown API key").into_response();
    }
    req.extensions_mut().insert(Credential(key));
    next.run(req).await
}

pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return ApiError::not_found("Not found").into_response();
    };
    let token = header_value(&req, ADMIN_TOKEN_HEADER);
    if token.is_empty() || !constant_time_eq(token, expected) {
        return ApiError::unauthorized("Invalid admin token").into_response();
    }
    next.run(req).await
}
