// Keystone Trainer — HTTP Surface
// Handoff-readiness endpoints the orchestrator drives, plus the index
// writer the tool server relays to.

use crate::trainer::Trainer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(trainer: Arc<Trainer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/study/gpu-ready", post(gpu_ready))
        .route("/study/gpu-release", post(gpu_release))
        .route("/index/embed", post(index_embed))
        .layer(CorsLayer::permissive())
        .with_state(trainer)
}

async fn health() -> Response {
    Json(json!({"status": "healthy"})).into_response()
}

async fn gpu_ready(State(trainer): State<Arc<Trainer>>) -> Response {
    trainer.gpu_ready();
    Json(json!({"gpu_held": true})).into_response()
}

async fn gpu_release(State(trainer): State<Arc<Trainer>>) -> Response {
    trainer.gpu_release();
    Json(json!({"gpu_held": false})).into_response()
}

#[derive(Deserialize)]
struct EmbedBody {
    paths: Vec<String>,
}

async fn index_embed(State(trainer): State<Arc<Trainer>>, Json(body): Json<EmbedBody>) -> Response {
    match trainer.embed_documents(&body.paths).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}
