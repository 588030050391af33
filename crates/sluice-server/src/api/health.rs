//! Health probes.
//!
//! `ready` answers whether this process can accept work at all; `live`
//! additionally checks that the engine is initialized and its loop has run
//! within the configured interval. Failures return HTTP 500 with
//! `{error_code, error_msg}`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crate::state::AppState;

pub async fn ready(State(state): State<AppState>) -> Response {
    match state.engine.health().check_ready() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            info!("check_health: Bad ({})", e.error_msg);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(e)).into_response()
        }
    }
}

pub async fn live(State(state): State<AppState>) -> Response {
    match state.engine.health().check_live() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            info!("check_health: Bad ({})", e.error_msg);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(e)).into_response()
        }
    }
}
