pub mod pty;
pub mod registry;
pub mod session;
pub mod transport;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::registry::Registry;
use crate::session::Session;

pub struct AppState {
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/terminal", get(ws_handler))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Upgrade the connection and hand it to a fresh session. Any origin is
/// accepted; gating the endpoint is the embedder's job.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let registry = state.registry.clone();
        let (writer, reader) = transport::split(socket);
        let session = Session::new(writer, registry.clone());
        registry.insert(&session);
        session.run(reader).await;
    })
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}
