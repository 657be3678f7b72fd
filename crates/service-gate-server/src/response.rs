// crates/service-gate-server/src/response.rs
// ============================================================================
// Module: Response Envelope
// Description: JSON success/error envelopes and HTTP error mapping.
// Purpose: Map every handler failure to a status code in one place.
// Dependencies: axum, serde, tracing
// ============================================================================

//! ## Overview
//! Success bodies are `{"code":0,"message":"success","data":...}` and error
//! bodies are `{"code":1,"message":"..."}`. The HTTP status carries the
//! error class. [`log_failures`] is the request logging layer.

// ============================================================================
// SECTION: Imports
// ============================================================================

use axum::Json;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;
use tracing::warn;

// ============================================================================
// SECTION: Envelopes
// ============================================================================

/// Error code carried by every error body.
pub const ERROR_CODE: i32 = 1;

/// Wire envelope shared by success and error bodies.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// Zero on success.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Success response carrying `data`.
pub fn success<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: 0,
        message: "success".to_string(),
        data: Some(data),
    })
    .into_response()
}

/// Success response without a payload.
#[must_use]
pub fn success_empty() -> Response {
    Json(Envelope::<()> {
        code: 0,
        message: "success".to_string(),
        data: None,
    })
    .into_response()
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Handler failure with its HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    /// Response status.
    pub status: StatusCode,
    /// Message placed in the envelope.
    pub message: String,
}

impl ApiError {
    /// Error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 400.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 403.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 500.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            code: ERROR_CODE,
            message: self.message,
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// SECTION: Request Logging
// ============================================================================

/// Logs every response above 400 with its method, path, and status.
pub async fn log_failures(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    let status = response.status();
    if status.as_u16() > 400 {
        warn!(method = %method, path = %path, status = status.as_u16(), "request failed");
    }
    response
}
