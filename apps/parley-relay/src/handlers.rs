use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::websocket::{websocket_handler, RelayState};

pub const ROOT_ACK: &str = "Parley WebRTC Signaling Server";

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub channels: usize,
}

pub async fn root() -> &'static str {
    ROOT_ACK
}

pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        channels: state.relay.len(),
    })
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
