use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// HTTP-facing error of the relay's plain endpoints.
///
/// ```json
/// {
///   "error": {
///     "code": "origin_not_allowed",
///     "message": "Origin 'https://evil.example' may not open a relay socket.",
///     "status": 403
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        } else if self.status.is_client_error() {
            tracing::warn!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl ApiError {
    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 403: the socket's `Origin` is not on the allow-list.
    pub fn origin_not_allowed(origin: &str) -> Self {
        Self {
            code: "origin_not_allowed",
            message: format!("Origin '{origin}' may not open a relay socket."),
            status: StatusCode::FORBIDDEN,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
