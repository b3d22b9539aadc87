//! Optional bearer-token gate for caller requests.
//!
//! Enabled only when `access_tokens` is configured. Preflight `OPTIONS`
//! requests always pass so browsers can discover the CORS policy.

use crate::error::GatewayError;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, header::AUTHORIZATION};
use axum::middleware::Next;
use axum::response::Response;
use common::Secret;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Default)]
pub struct AccessGate {
    tokens: Arc<Vec<Secret<String>>>,
}

impl AccessGate {
    pub fn new(tokens: Vec<Secret<String>>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Whether the request carries `Authorization: Bearer <token>` for one of
    /// the configured tokens. Always true when the gate is disabled.
    pub fn permits(&self, headers: &HeaderMap) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let Some(presented) = bearer_token(headers) else {
            return false;
        };
        // Check every entry so timing does not reveal which one matched.
        self.tokens
            .iter()
            .fold(false, |found, token| token.matches(presented) | found)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

/// axum middleware enforcing the gate.
pub async fn require_access(
    State(gate): State<AccessGate>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || gate.permits(request.headers()) {
        return next.run(request).await;
    }

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    warn!(
        request_id = %request_id,
        path = %request.uri().path(),
        "rejected request without a valid access token"
    );
    GatewayError::Unauthorized.to_response(&request_id)
}
