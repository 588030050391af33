//! HTTP routes.

pub mod completions;
pub mod health;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(completions::create_chat_completion))
        .route("/v2/health/ready", get(health::ready))
        .route("/v2/health/live", get(health::live))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
