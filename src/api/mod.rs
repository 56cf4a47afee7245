//! HTTP API for the gateway.
//!
//! ## Endpoints
//!
//! - `GET /v1/models` - Model listing (OpenAI shape with bearer auth,
//!   Gemini shape with `?key=`)
//! - `POST /v1/chat/completions` - OpenAI-format chat completions,
//!   unary or SSE streaming
//! - `GET /antigravity/v1/models`, `POST /antigravity/v1/chat/completions` -
//!   the same surface over the antigravity credential namespace

mod auth;
mod openai;
mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

pub use routes::{serve, AppState, SharedState};

/// Minimal error response matching OpenAI's format.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: String,
    code: Option<String>,
}

pub(crate) fn error_response(status: StatusCode, message: String, code: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorBody {
            message,
            r#type: "error".to_string(),
            code: Some(code.to_string()),
        },
    };
    (status, Json(body)).into_response()
}
