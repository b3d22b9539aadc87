//! Caller-facing errors and their JSON rendering.
//!
//! Every error leaves the gateway as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::{HeaderValue, StatusCode};
use axum::http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed body or a message with an unsupported role.
    #[error("{0}")]
    Validation(String),

    #[error("model {0} is not supported")]
    UnknownModel(String),

    #[error("missing or invalid access token")]
    Unauthorized,

    #[error("{0}")]
    PoolExhausted(String),

    /// Upstream failed before the response started.
    #[error("{0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::UnknownModel(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PoolExhausted(_) | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::UnknownModel(_) => "invalid_request_error",
            Self::Unauthorized => "authentication_error",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Upstream(_) => "upstream_error",
        }
    }

    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        let mut response = (
            self.status(),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if matches!(self, Self::Unauthorized) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Metric label for an upstream failure.
pub fn upstream_error_type(err: &UpstreamError) -> &'static str {
    match err {
        UpstreamError::Transport(_) => "transport",
        UpstreamError::Status { .. } => "status",
        UpstreamError::Protocol(_) => "protocol",
    }
}
