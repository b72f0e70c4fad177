//! Mapping of dispatch failures onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{DispatchError, ProtocolError};

/// An error response: status plus a JSON body `{"error": kind, "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::WorkerFailure { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::CapacityExceeded { .. } | DispatchError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::Payload(ProtocolError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::Payload(_) => StatusCode::BAD_REQUEST,
            DispatchError::Spawn { .. } | DispatchError::ChannelClosed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.kind,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}
