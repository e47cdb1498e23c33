// Keystone Orchestrator — HTTP Surface
// Handoff triggers, the status dashboard, and the maintenance switch.
// State-machine precondition failures map to 409.

use crate::atoms::error::EngineError;
use crate::orchestrator::Orchestrator;
use crate::shared::maintenance::{disable_maintenance, enable_maintenance, maintenance_active};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/handoff/prime-to-study", post(handoff_to_study))
        .route("/handoff/study-to-prime", post(handoff_to_core))
        .route("/status", get(status))
        .route("/maintenance", post(maintenance))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::State(_) => StatusCode::CONFLICT,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("[orchestrator] request failed: {e}");
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

async fn handoff_to_study(State(orch): State<Arc<Orchestrator>>) -> Response {
    match orch.handoff.handoff_to_study().await {
        Ok(()) => Json(json!({"gpu_owner": orch.handoff.owner()})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handoff_to_core(State(orch): State<Arc<Orchestrator>>) -> Response {
    match orch.handoff.handoff_to_core().await {
        Ok(()) => Json(json!({"gpu_owner": orch.handoff.owner()})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn status(State(orch): State<Arc<Orchestrator>>) -> Response {
    Json(json!({
        "gpu_owner": orch.handoff.owner(),
        "maintenance": maintenance_active(&orch.live_volume),
        "services": orch.watchdog.snapshot(),
        "last_sync": *orch.last_sync.lock(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct MaintenanceBody {
    on: bool,
}

async fn maintenance(
    State(orch): State<Arc<Orchestrator>>,
    Json(body): Json<MaintenanceBody>,
) -> Response {
    let result = if body.on {
        enable_maintenance(&orch.live_volume)
    } else {
        disable_maintenance(&orch.live_volume)
    };
    match result {
        Ok(()) => Json(json!({"maintenance": body.on})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health() -> Response {
    Json(json!({"status": "healthy"})).into_response()
}
