use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, CaptureConfig};
use crate::error::{AppError, Result};
use crate::relay::RelayStatus;
use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Which peers are connected and the current session, if any
pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    Json(state.relay.status())
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json((*state.config.get()).clone())
}

/// Replace the capture section; applies from the next session on
pub async fn update_capture_config(
    State(state): State<Arc<AppState>>,
    Json(capture): Json<CaptureConfig>,
) -> Result<Json<CaptureConfig>> {
    capture.validate().map_err(AppError::BadRequest)?;

    let updated = capture.clone();
    state.config.update(move |config| config.capture = capture).await?;
    info!(
        "Capture config updated: enabled={}, mode={:?}",
        updated.enabled, updated.mode
    );
    Ok(Json(updated))
}
