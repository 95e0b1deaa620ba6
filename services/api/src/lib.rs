pub mod config;
pub mod question_bank;
pub mod ws;

use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use viva_core::SessionRegistry;
use viva_core::credentials::CredentialValidator;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub credentials: Arc<dyn CredentialValidator>,
}

/// Builds the HTTP application: the quiz WebSocket at `/real_time_answer`
/// and a liveness probe at `/health`.
pub fn router(state: AppState) -> Router {
    // Permissive CORS so a browser frontend served elsewhere can connect.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/real_time_answer", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.registry.active_sessions().await,
    }))
}
