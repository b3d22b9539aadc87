//! Chat completion handling
//!
//! Validates the caller's conversation, resolves the model, leases one
//! upstream session and hands the exchange to the relay. Ordering matters:
//! nothing is leased until the request is known to be well formed, and the
//! lease lives exactly as long as the exchange (for streams, as long as the
//! response body).

use crate::error::{GatewayError, upstream_error_type};
use crate::metrics;
use crate::models::ModelRegistry;
use crate::relay::{Conversation, RelayFrame, RelaySession};
use crate::wire::ChatCompletionRequest;
use axum::Json;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use session_pool::{Lease, Pool};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use upstream::SessionAdapter;

/// Literal payload of the completion sentinel event.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Shared state for completion requests
#[derive(Clone)]
pub struct ChatState {
    pub pool: Arc<Pool>,
    pub adapter: Arc<dyn SessionAdapter>,
    pub models: Arc<ModelRegistry>,
    pub idle_timeout: Duration,
}

/// Serve one chat completion request.
///
/// Errors returned here happen before any response bytes are written; once
/// a stream has started, failures travel in-band as `error` events.
#[instrument(skip_all, fields(request_id = %request_id, model = %request.model, stream = request.stream))]
pub async fn chat_completions(
    state: &ChatState,
    request: ChatCompletionRequest,
    request_id: &str,
) -> Result<Response, GatewayError> {
    let messages = request.validate().map_err(|e| {
        GatewayError::Validation(format!("role of message validation failed: {}", e.0))
    })?;

    let bot = state
        .models
        .resolve(&request.model)
        .ok_or_else(|| GatewayError::UnknownModel(request.model.clone()))?
        .to_string();

    let lease = state.pool.acquire().map_err(|e| {
        metrics::record_pool_exhausted();
        GatewayError::PoolExhausted(e.to_string())
    })?;

    let conversation = Conversation {
        messages,
        model: request.model,
        bot,
    };
    let session = RelaySession::new(conversation.model.clone(), state.idle_timeout);

    if request.stream {
        info!(
            session_id = lease.id(),
            credential = %lease.credential().fingerprint(),
            conversation_id = session.id(),
            "stream using credential"
        );
        let frames = session
            .run_stream(state.adapter.as_ref(), lease.token(), &conversation)
            .await
            .inspect_err(|e| metrics::record_upstream_error(upstream_error_type(e)))?;

        let events =
            Leased::new(frames, lease).map(|frame| Ok::<_, Infallible>(frame_event(frame)));
        Ok(Sse::new(events).into_response())
    } else {
        info!(
            session_id = lease.id(),
            credential = %lease.credential().fingerprint(),
            conversation_id = session.id(),
            "ask using credential"
        );
        let completion = session
            .run_blocking(state.adapter.as_ref(), lease.token(), &conversation)
            .await
            .inspect_err(|e| metrics::record_upstream_error(upstream_error_type(e)))?;
        lease.release();
        Ok(Json(completion).into_response())
    }
}

/// Render one relay frame as a server-sent event.
fn frame_event(frame: RelayFrame) -> Event {
    match frame {
        RelayFrame::Chunk(chunk) => match serde_json::to_string(&chunk) {
            Ok(json) => Event::default().data(json),
            Err(e) => {
                error!(error = %e, "failed to encode completion chunk");
                Event::default().event("error").data("internal error")
            }
        },
        RelayFrame::Done => Event::default().data(DONE_SENTINEL),
        RelayFrame::Failed(err) => {
            metrics::record_upstream_error(err.error_type());
            Event::default().event("error").data(err.to_string())
        }
    }
}

pin_project! {
    /// Holds a session lease for as long as the wrapped stream is live.
    ///
    /// The lease is released as soon as the stream ends, or when the
    /// response body is dropped because the caller went away.
    pub struct Leased<S> {
        #[pin]
        inner: S,
        lease: Option<Lease>,
    }
}

impl<S> Leased<S> {
    pub fn new(inner: S, lease: Lease) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl<S: Stream> Stream for Leased<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));
        if item.is_none() {
            if let Some(lease) = this.lease.take() {
                debug!(session_id = lease.id(), "stream finished, releasing session");
            }
        }
        Poll::Ready(item)
    }
}
