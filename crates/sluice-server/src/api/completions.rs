//! Chat completion endpoint.
//!
//! Streaming mode returns the request's result events as JSON lines over
//! `text/event-stream`; non-streaming mode consumes the stream server-side
//! under the request's deadline and returns the terminal event with the
//! accumulated text.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use sluice_core::ResultEvent;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub async fn create_chat_completion(
    State(state): State<AppState>,
    Json(req): Json<sluice_core::GenerateRequest>,
) -> Response {
    let req_id = req.req_id.clone().unwrap_or_default();
    let stream_mode = req.stream;
    let timeout = Duration::from_secs(req.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
    info!("receive request: {}", req_id);

    // Submission validates and enqueues; the queue put can block briefly
    // while a prior batch is mid-consumption, so keep it off the runtime.
    let engine = state.engine.clone();
    let submitted = tokio::task::spawn_blocking(move || engine.submit(req)).await;
    let rx = match submitted {
        Ok(Ok(rx)) => rx,
        Ok(Err(e)) => return ApiError::from(e).into_response(),
        Err(e) => return ApiError::internal(e.to_string()).into_response(),
    };

    let response = if stream_mode {
        stream_response(rx)
    } else {
        aggregate_response(rx, timeout).await
    };
    info!("finish request: {}", req_id);
    response
}

/// Forward events to the client as they arrive, one JSON object per line.
fn stream_response(mut rx: UnboundedReceiver<ResultEvent>) -> Response {
    let body = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_end = event.is_end == 1 || event.error_code != 0;
            match serde_json::to_string(&event) {
                Ok(line) => yield Ok::<String, Infallible>(line + "\n"),
                Err(e) => {
                    let fallback = json!({"error_msg": e.to_string(), "error_code": 500});
                    yield Ok(fallback.to_string() + "\n");
                    break;
                }
            }
            if is_end {
                break;
            }
        }
    };
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

/// Consume the stream server-side and answer with the terminal event.
async fn aggregate_response(mut rx: UnboundedReceiver<ResultEvent>, timeout: Duration) -> Response {
    let terminal = tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if event.is_end == 1 || event.error_code != 0 {
                return Some(event);
            }
        }
        None
    })
    .await;

    match terminal {
        Ok(Some(event)) if event.error_code == 0 => Json(event).into_response(),
        // Keep the engine's verdict: an oversize rejection stays a 400, a
        // transport fault stays a 500, same as the streaming path.
        Ok(Some(event)) => {
            let status = u16::try_from(event.error_code)
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            ApiError {
                status,
                error_msg: event.error_msg,
                error_code: event.error_code,
            }
            .into_response()
        }
        // The stream closed without a terminal event: the engine lost the
        // task (executor fault) and the supervisor owns recovery.
        Ok(None) => ApiError::internal("result stream ended unexpectedly").into_response(),
        Err(_) => ApiError::internal("request timed out waiting for results").into_response(),
    }
}
