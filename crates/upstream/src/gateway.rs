//! HTTP gateway adapter: reaches the conversational backend through an
//! external gateway service.
//!
//! The gateway exposes two form-encoded endpoints, both taking `token`, `bot`
//! and `content` (the rendered prompt):
//! - `POST /ask` replies with the whole answer as a JSON string.
//! - `POST /stream` replies with a chunked body of newline-delimited JSON
//!   strings, one per fragment. End of body marks completion.
//!
//! Non-2xx replies carry `{"message": "..."}` or plain text.

use crate::prompt::{RoleSimulation, render_prompt};
use crate::{
    FRAGMENT_BUFFER, Fragment, FragmentReceiver, Message, Result, Role, SessionAdapter,
    UpstreamError,
};
use futures_util::{Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Adapter that forwards exchanges to the configured gateway URL.
pub struct HttpGatewayAdapter {
    client: reqwest::Client,
    base_url: String,
    roles: RoleSimulation,
    ask_timeout: Duration,
}

impl HttpGatewayAdapter {
    /// `ask_timeout` bounds a whole blocking exchange. Streaming exchanges are
    /// bounded by the relay's idle timeout instead.
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        roles: RoleSimulation,
        ask_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            roles,
            ask_timeout,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post(
        &self,
        path: &str,
        token: &str,
        messages: &[Message],
        bot: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let content = render_prompt(messages, self.roles);
        let mut request = self
            .client
            .post(self.endpoint(path))
            .form(&[("token", token), ("bot", bot), ("content", content.as_str())]);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), path, "gateway rejected exchange");
        Err(UpstreamError::Status {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}

impl SessionAdapter for HttpGatewayAdapter {
    fn id(&self) -> &str {
        "http-gateway"
    }

    fn ask<'a>(
        &'a self,
        token: &'a str,
        messages: &'a [Message],
        bot: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .post("ask", token, messages, bot, Some(self.ask_timeout))
                .await?;
            let body = response
                .text()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            let content: String = serde_json::from_str(&body)
                .map_err(|e| UpstreamError::Protocol(format!("ask reply is not a JSON string: {e}")))?;
            Ok(Message::new(Role::Assistant, content))
        })
    }

    fn stream<'a>(
        &'a self,
        token: &'a str,
        messages: &'a [Message],
        bot: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FragmentReceiver>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.post("stream", token, messages, bot, None).await?;
            let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
            tokio::spawn(pump_fragments(response.bytes_stream(), tx));
            Ok(rx)
        })
    }
}

/// Extract a readable message from a gateway error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Decode one body line. Blank lines are skipped.
fn decode_line(line: &[u8]) -> std::result::Result<Option<String>, String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<String>(line)
        .map(Some)
        .map_err(|e| format!("malformed fragment line: {e}"))
}

/// Longest fragment line accepted before a newline arrives.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Split a chunked body into fragments and forward them to the relay.
///
/// Ends with `Fragment::Done` when the body completes, or `Fragment::Failed`
/// on a transport or framing error. Returns as soon as the receiver is gone,
/// even while the body is idle, which drops the upstream connection.
async fn pump_fragments<S, B, E>(body: S, tx: mpsc::Sender<Fragment>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => {
                debug!("relay stopped consuming, abandoning upstream stream");
                return;
            }
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(Fragment::Failed(e.to_string())).await;
                return;
            }
            None => break,
        };
        pending.extend_from_slice(chunk.as_ref());

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if !forward_line(&line, &tx).await {
                return;
            }
        }

        if pending.len() > MAX_LINE_BYTES {
            warn!(buffered = pending.len(), "fragment line exceeds limit");
            let _ = tx
                .send(Fragment::Failed(format!(
                    "fragment line exceeds {MAX_LINE_BYTES} bytes"
                )))
                .await;
            return;
        }
    }

    if !pending.is_empty() && !forward_line(&pending, &tx).await {
        return;
    }
    let _ = tx.send(Fragment::Done).await;
}

/// Returns false when pumping should stop.
async fn forward_line(line: &[u8], tx: &mpsc::Sender<Fragment>) -> bool {
    let fragment = match decode_line(line) {
        Ok(Some(text)) => Fragment::Text(text),
        Ok(None) => return true,
        Err(e) => {
            let _ = tx.send(Fragment::Failed(e)).await;
            return false;
        }
    };
    if tx.send(fragment).await.is_err() {
        debug!("relay stopped consuming, abandoning upstream stream");
        return false;
    }
    true
}
