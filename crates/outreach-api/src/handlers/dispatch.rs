//! Dispatch trigger handler

use axum::{extract::State, http::StatusCode, Json};
use outreach_core::DispatchSummary;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::auth::AppState;

/// Error body returned by API routes
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Run one dispatch pass and return its summary
#[utoipa::path(
    post,
    path = "/api/v1/dispatch/run",
    tag = "dispatch",
    responses(
        (status = 200, description = "Dispatch pass summary"),
        (status = 401, description = "Missing or invalid trigger token"),
        (status = 500, description = "Candidate campaigns could not be loaded", body = ErrorResponse)
    )
)]
pub async fn run_dispatch(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DispatchSummary>, (StatusCode, Json<ErrorResponse>)> {
    info!("Dispatch run triggered");

    match state.dispatcher.run().await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            error!("Dispatch run failed: {}", e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Err((
                status,
                Json(ErrorResponse {
                    error: e.code().to_string(),
                    message: e.to_string(),
                }),
            ))
        }
    }
}
