//! Shared state and trigger authentication

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use outreach_core::Dispatcher;
use outreach_storage::DatabasePool;
use prometheus::Registry;
use std::sync::Arc;
use tracing::warn;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Present for the postgres backend; readiness pings it
    pub db_pool: Option<DatabasePool>,
    /// Bearer token required on the trigger routes, if any
    pub trigger_token: Option<String>,
    pub registry: Registry,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, registry: Registry) -> Self {
        Self {
            dispatcher,
            db_pool: None,
            trigger_token: None,
            registry,
        }
    }

    pub fn with_db_pool(mut self, db_pool: DatabasePool) -> Self {
        self.db_pool = Some(db_pool);
        self
    }

    /// Empty tokens are treated as unset
    pub fn with_trigger_token(mut self, token: Option<String>) -> Self {
        self.trigger_token = token.filter(|t| !t.is_empty());
        self
    }
}

/// Extract the caller's token from `Authorization: Bearer` or `X-API-Key`
pub fn extract_token(req: &Request) -> Option<&str> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
    }

    req.headers()
        .get("x-api-key")
        .and_then(|key| key.to_str().ok())
}

/// Byte comparison that does not stop at the first mismatch
fn tokens_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Rejects trigger calls without the configured token. Open when no token is set.
pub async fn trigger_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.trigger_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let token = extract_token(&request).ok_or_else(|| {
        warn!("Missing trigger token in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    if !tokens_match(token, expected) {
        warn!("Invalid trigger token in request to {}", request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
