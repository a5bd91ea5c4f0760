use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use notes_core::config::CoreConfig;
use notes_orchestrator::Orchestrator;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CoreConfig,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(config: CoreConfig, orchestrator: Orchestrator) -> Self {
        Self { config, orchestrator }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/v1/chat-stream", post(crate::http::chat::chat_stream_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
