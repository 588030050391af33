//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
///
/// Serialized as `{error_msg, error_code, result}` so streaming and
/// non-streaming clients can parse failures the same way.
pub struct ApiError {
    pub status: StatusCode,
    pub error_msg: String,
    pub error_code: i32,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_msg: msg.into(),
            error_code: 400,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error_msg: msg.into(),
            error_code: 500,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error_msg": self.error_msg,
            "error_code": self.error_code,
            "result": "",
        }));
        (self.status, body).into_response()
    }
}

impl From<sluice_core::Error> for ApiError {
    fn from(err: sluice_core::Error) -> Self {
        match &err {
            sluice_core::Error::ValidationError(errors) => ApiError::bad_request(errors.join("; ")),
            sluice_core::Error::DuplicateRequest(_) => ApiError::bad_request(err.to_string()),
            sluice_core::Error::TokenizationError(_) => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}
