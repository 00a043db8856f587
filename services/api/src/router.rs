//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the application: the voice
//! WebSocket endpoint, a service banner and a health check.

use crate::{config::SttMode, state::AppState, ws::ws_handler};

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;

async fn root(stt_mode: SttMode) -> Json<Value> {
    Json(json!({
        "message": "RxConnect Voice Agent Demo",
        "status": "running",
        "stt_mode": stt_mode.as_str(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let stt_mode = app_state.config.stt_mode;
    Router::new()
        .route("/", get(move || root(stt_mode)))
        .route("/ws/voice", get(ws_handler))
        .with_state(app_state)
        .route("/health", get(health))
}
