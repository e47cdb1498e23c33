// Keystone Engine — HTTP Surface
// Thin axum layer over the Engine: packet ingress, health, sleep status,
// and the GPU lifecycle endpoints the orchestrator drives during handoff.
// Handlers map EngineError domains onto status codes and never leak
// internals to callers.

use crate::atoms::constants::GPU_WAIT_MAX_SECS;
use crate::atoms::error::EngineError;
use crate::atoms::packet::CognitionPacket;
use crate::engine::sleep::SleepState;
use crate::engine::Engine;
use crate::orchestrator::vram::{NvidiaSmiProbe, VramProbe};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/process_packet", post(process_packet))
        .route("/health", get(health))
        .route("/sleep/status", get(sleep_status))
        .route("/sleep/enter", post(sleep_enter))
        .route("/sleep/wake", post(sleep_wake))
        .route("/gpu/status", get(gpu_status))
        .route("/gpu/release", post(gpu_release))
        .route("/gpu/reclaim", post(gpu_reclaim))
        .route("/gpu/wait", post(gpu_wait))
        .route("/cognition/checkpoint", post(checkpoint))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::State(_) => StatusCode::CONFLICT,
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::Security(_) => StatusCode::FORBIDDEN,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("[engine] request failed: {e}");
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

async fn process_packet(
    State(engine): State<Arc<Engine>>,
    Json(packet): Json<CognitionPacket>,
) -> Response {
    if let Err(e) = Engine::validate_ingress(&packet) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response();
    }
    info!(
        "[engine] packet {} for session {}",
        packet.header.packet_id, packet.header.session_id
    );
    match engine.process_packet(packet).await {
        Ok(done) => {
            // Completed packets also flow to the gateway's output router;
            // delivery there is deduped by packet_id.
            let engine = engine.clone();
            let for_router = done.clone();
            tokio::spawn(async move { engine.route_to_gateway(&for_router).await });
            Json(done).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn health(State(engine): State<Arc<Engine>>) -> Response {
    // Healthy means the pipeline can answer: at least Lite is usable
    let lite_usable = !engine.pool.candidates_for_role("lite").is_empty();
    if lite_usable {
        Json(json!({"status": "healthy"})).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "error"}))).into_response()
    }
}

async fn sleep_status(State(engine): State<Arc<Engine>>) -> Response {
    Json(engine.sleep.status()).into_response()
}

async fn sleep_enter(State(engine): State<Arc<Engine>>) -> Response {
    match engine.enter_sleep().await {
        Ok(()) => Json(json!({"state": engine.sleep.state()})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn sleep_wake(State(engine): State<Arc<Engine>>) -> Response {
    match engine.wake().await {
        Ok(()) => Json(json!({"state": engine.sleep.state()})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn gpu_status(State(engine): State<Arc<Engine>>) -> Response {
    let snapshot = engine.pool.snapshot();
    let gpu_info = NvidiaSmiProbe.info().await.ok();
    Json(json!({
        "gpu_released": snapshot.gpu_released,
        "gpu_models_loaded": snapshot.gpu_models_loaded,
        "gpu_info": gpu_info,
    }))
    .into_response()
}

async fn gpu_release(State(engine): State<Arc<Engine>>) -> Response {
    // A release mid-transition would tear models out from under an active
    // wake; the orchestrator retries after the transition settles.
    let state = engine.sleep.state();
    if state == SleepState::Waking {
        return error_response(EngineError::State(format!(
            "cannot release GPU while {state:?}"
        )));
    }
    let released = engine.pool.release_gpu();
    Json(json!({"status": "gpu_released", "demoted": released})).into_response()
}

async fn gpu_reclaim(State(engine): State<Arc<Engine>>) -> Response {
    match engine.pool.reclaim_gpu().await {
        Ok(restored) => Json(json!({"status": "gpu_reclaimed", "restored": restored})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct GpuWaitBody {
    timeout_seconds: u64,
}

/// Clamp the wait into the schema-enforced [1, 60] window.
fn clamp_wait_secs(requested: u64) -> u64 {
    requested.clamp(1, GPU_WAIT_MAX_SECS)
}

async fn gpu_wait(State(engine): State<Arc<Engine>>, Json(body): Json<GpuWaitBody>) -> Response {
    let timeout = Duration::from_secs(clamp_wait_secs(body.timeout_seconds));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !engine.pool.snapshot().gpu_released {
            return Json(json!({"available": true})).into_response();
        }
        if tokio::time::Instant::now() >= deadline {
            return Json(json!({"available": false})).into_response();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn checkpoint(State(engine): State<Arc<Engine>>) -> Response {
    let narrative = engine.narrate_checkpoint().await;
    match engine.sleep.checkpoint_now(&narrative, "Checkpoint requested over HTTP.") {
        Ok(()) => Json(json!({"status": "checkpointed"})).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_clamp() {
        assert_eq!(clamp_wait_secs(0), 1);
        assert_eq!(clamp_wait_secs(30), 30);
        assert_eq!(clamp_wait_secs(600), 60);
    }
}
