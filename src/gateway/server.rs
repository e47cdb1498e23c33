// Keystone Gateway — HTTP Surface
// Ingress for chat surfaces plus the engine-facing output router. The
// surface adapters themselves (Discord bot, web chat page) live outside
// this crate and speak these endpoints.

use crate::atoms::packet::CognitionPacket;
use crate::gateway::Gateway;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/message", post(inbound_message))
        .route("/output_router", post(output_router))
        .route("/deliveries/:destination", get(deliveries))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

#[derive(Deserialize)]
struct InboundMessage {
    session_id: String,
    text: String,
    /// Destination for the reply; defaults to the session itself.
    #[serde(default)]
    destination: Option<String>,
}

async fn inbound_message(
    State(gateway): State<Arc<Gateway>>,
    Json(body): Json<InboundMessage>,
) -> Response {
    if body.session_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "session_id is required"})))
            .into_response();
    }
    let destination = body.destination.unwrap_or_else(|| body.session_id.clone());
    let packet = gateway.packet_for(&body.session_id, &body.text, &destination);
    let packet_id = packet.header.packet_id.clone();

    match gateway.send_to_engine(packet).await {
        Ok(done) => {
            // The engine also POSTs to /output_router; routing here too is
            // safe because delivery is deduped by packet_id.
            gateway.route_output(&done);
            Json(json!({
                "packet_id": packet_id,
                "response": done.response.candidate,
            }))
            .into_response()
        }
        Err(e) => {
            warn!("[gateway] engine unreachable for {}: {}", packet_id, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "the assistant is unreachable right now"})),
            )
                .into_response()
        }
    }
}

async fn output_router(
    State(gateway): State<Arc<Gateway>>,
    Json(packet): Json<CognitionPacket>,
) -> Response {
    if packet.response.candidate.is_empty() {
        // An empty candidate must never reach a destination
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "packet has no response candidate"})),
        )
            .into_response();
    }
    let delivered = gateway.route_output(&packet);
    Json(json!({"delivered": delivered, "packet_id": packet.header.packet_id})).into_response()
}

async fn deliveries(
    State(gateway): State<Arc<Gateway>>,
    Path(destination): Path<String>,
) -> Response {
    Json(gateway.take_deliveries(&destination)).into_response()
}

async fn health() -> Response {
    Json(json!({"status": "healthy"})).into_response()
}
