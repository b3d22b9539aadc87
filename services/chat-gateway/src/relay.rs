//! Relay state machine
//!
//! Drives one exchange with the upstream session adapter and re-frames its
//! output for the caller. Streaming exchanges produce, strictly in order:
//!
//! 1. a role announcement (`delta.role = "assistant"`, empty content),
//! 2. one content chunk per upstream fragment,
//! 3. a finish chunk (`finish_reason = "stop"`),
//! 4. the completion sentinel.
//!
//! Each wait for the next fragment races an idle timer. When the timer wins,
//! or the upstream fails mid-stream, a single error frame replaces steps 3
//! and 4 and the relay stops reading from the producer.
//!
//! The relay never touches the session pool; whoever holds the lease releases
//! it once the frame stream is finished or dropped.

use crate::wire::{
    CHUNK_OBJECT, COMPLETION_OBJECT, ChatCompletion, ChatCompletionChunk, ChunkChoice,
    CompletionChoice, Delta, FINISH_STOP, Usage,
};
use futures_util::Stream;
use rand::RngExt;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use upstream::{Fragment, FragmentReceiver, Message, Role, SessionAdapter, UpstreamError};

pub const CONVERSATION_ID_PREFIX: &str = "chatcmpl-";
const CONVERSATION_ID_LEN: usize = 29;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// `chatcmpl-` followed by 29 random ASCII letters.
pub fn conversation_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..CONVERSATION_ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{CONVERSATION_ID_PREFIX}{suffix}")
}

/// Caller-facing frames of one streamed completion.
pub type RelayStream = Pin<Box<dyn Stream<Item = RelayFrame> + Send>>;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A validated conversation bound for one upstream bot.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub messages: Vec<Message>,
    /// Caller-facing model name, echoed back in every frame.
    pub model: String,
    /// Upstream bot id the model resolved to.
    pub bot: String,
}

/// Why a stream ended without its finish frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("timeout")]
    IdleTimeout,

    #[error("{0}")]
    Upstream(String),
}

impl RelayError {
    /// Metric label.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::IdleTimeout => "idle_timeout",
            RelayError::Upstream(_) => "stream_failed",
        }
    }
}

/// One caller-facing event of a streamed completion.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Chunk(ChatCompletionChunk),
    /// The `[DONE]` sentinel.
    Done,
    /// Terminal in-band error; nothing follows it.
    Failed(RelayError),
}

/// Per-request relay state. Consumed by whichever path runs it.
#[derive(Debug)]
pub struct RelaySession {
    id: String,
    model: String,
    idle_timeout: Duration,
}

impl RelaySession {
    pub fn new(model: impl Into<String>, idle_timeout: Duration) -> Self {
        Self {
            id: conversation_id(),
            model: model.into(),
            idle_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT,
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    fn role_chunk(&self) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: Some(Role::Assistant),
                content: Some(String::new()),
            },
            None,
        )
    }

    fn content_chunk(&self, text: String) -> ChatCompletionChunk {
        self.chunk(
            Delta {
                role: None,
                content: Some(text),
            },
            None,
        )
    }

    fn finish_chunk(&self) -> ChatCompletionChunk {
        self.chunk(Delta::default(), Some(FINISH_STOP))
    }

    /// Open a streaming exchange and return its caller-facing frames.
    ///
    /// Fails before any frame exists if the upstream refuses the exchange,
    /// so the caller can still answer with an HTTP error.
    pub async fn run_stream(
        self,
        adapter: &dyn SessionAdapter,
        token: &str,
        conversation: &Conversation,
    ) -> Result<RelayStream, UpstreamError> {
        let fragments = adapter
            .stream(token, &conversation.messages, &conversation.bot)
            .await?;
        debug!(
            conversation_id = %self.id,
            adapter = adapter.id(),
            bot = %conversation.bot,
            "upstream stream opened"
        );
        Ok(self.relay(fragments))
    }

    /// Re-frame an already open fragment channel.
    pub fn relay(self, fragments: FragmentReceiver) -> RelayStream {
        let state = RelayState {
            session: self,
            fragments,
            phase: Phase::Announce,
        };
        Box::pin(futures_util::stream::unfold(state, |mut state| async move {
            let frame = state.step().await?;
            Some((frame, state))
        }))
    }

    /// Run a blocking exchange and wrap the answer as a single completion.
    pub async fn run_blocking(
        self,
        adapter: &dyn SessionAdapter,
        token: &str,
        conversation: &Conversation,
    ) -> Result<ChatCompletion, UpstreamError> {
        let reply = adapter
            .ask(token, &conversation.messages, &conversation.bot)
            .await?;
        Ok(ChatCompletion {
            id: self.id,
            object: COMPLETION_OBJECT,
            created: unix_now(),
            model: self.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: Message::new(Role::Assistant, reply.content),
                finish_reason: FINISH_STOP,
            }],
            usage: Usage::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Announce,
    Relaying,
    Finished,
    Closed,
}

struct RelayState {
    session: RelaySession,
    fragments: FragmentReceiver,
    phase: Phase,
}

impl RelayState {
    async fn step(&mut self) -> Option<RelayFrame> {
        match self.phase {
            Phase::Announce => {
                self.phase = Phase::Relaying;
                Some(RelayFrame::Chunk(self.session.role_chunk()))
            }
            Phase::Relaying => Some(self.next_fragment().await),
            Phase::Finished => {
                self.phase = Phase::Closed;
                Some(RelayFrame::Done)
            }
            Phase::Closed => None,
        }
    }

    async fn next_fragment(&mut self) -> RelayFrame {
        let idle = self.session.idle_timeout;
        match tokio::time::timeout(idle, self.fragments.recv()).await {
            Ok(Some(Fragment::Text(text))) => RelayFrame::Chunk(self.session.content_chunk(text)),
            Ok(Some(Fragment::Done)) => {
                self.phase = Phase::Finished;
                RelayFrame::Chunk(self.session.finish_chunk())
            }
            Ok(Some(Fragment::Failed(message))) => self.abort(RelayError::Upstream(message)),
            Ok(None) => self.abort(RelayError::Upstream(
                "upstream closed the stream before completing".into(),
            )),
            Err(_) => self.abort(RelayError::IdleTimeout),
        }
    }

    fn abort(&mut self, error: RelayError) -> RelayFrame {
        warn!(
            conversation_id = %self.session.id,
            idle_timeout_secs = self.session.idle_timeout.as_secs_f64(),
            error = %error,
            "relay aborted"
        );
        self.phase = Phase::Closed;
        self.fragments.close();
        RelayFrame::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedAdapter};
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    fn conversation() -> Conversation {
        Conversation {
            messages: vec![Message::new(Role::User, "hi")],
            model: "gpt-4".into(),
            bot: "GPT-4".into(),
        }
    }

    fn content(frame: &RelayFrame) -> Option<&str> {
        match frame {
            RelayFrame::Chunk(chunk) => chunk.choices[0].delta.content.as_deref(),
            _ => None,
        }
    }

    fn is_role_frame(frame: &RelayFrame) -> bool {
        matches!(
            frame,
            RelayFrame::Chunk(c)
                if c.choices[0].delta.role == Some(Role::Assistant)
                    && c.choices[0].delta.content.as_deref() == Some("")
                    && c.choices[0].finish_reason.is_none()
        )
    }

    fn is_finish_frame(frame: &RelayFrame) -> bool {
        matches!(
            frame,
            RelayFrame::Chunk(c) if c.choices[0].finish_reason == Some("stop")
        )
    }

    #[test]
    fn conversation_id_shape() {
        let id = conversation_id();
        assert!(id.starts_with("chatcmpl-"));
        let suffix = &id[CONVERSATION_ID_PREFIX.len()..];
        assert_eq!(suffix.len(), 29);
        assert!(suffix.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(conversation_id(), id);
    }

    #[tokio::test]
    async fn stream_emits_frames_in_order() {
        let adapter = ScriptedAdapter::text(&["Hel", "lo"]);
        let session = RelaySession::new("gpt-4", Duration::from_secs(5));
        let id = session.id().to_string();

        let frames: Vec<RelayFrame> = session
            .run_stream(&adapter, "p-token", &conversation())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 5);
        assert!(is_role_frame(&frames[0]));
        assert_eq!(content(&frames[1]), Some("Hel"));
        assert_eq!(content(&frames[2]), Some("lo"));
        assert!(is_finish_frame(&frames[3]));
        assert!(matches!(frames[4], RelayFrame::Done));

        for frame in &frames[..4] {
            let RelayFrame::Chunk(chunk) = frame else {
                panic!("expected chunk, got {frame:?}");
            };
            assert_eq!(chunk.id, id);
            assert_eq!(chunk.model, "gpt-4");
            assert_eq!(chunk.object, "chat.completion.chunk");
            assert_eq!(chunk.choices.len(), 1);
            assert_eq!(chunk.choices[0].index, 0);
        }
        assert_eq!(adapter.last_bot().as_deref(), Some("GPT-4"));
        assert_eq!(adapter.last_token().as_deref(), Some("p-token"));
    }

    #[tokio::test]
    async fn empty_answer_still_finishes() {
        let adapter = ScriptedAdapter::text(&[]);
        let frames: Vec<RelayFrame> = RelaySession::new("gpt-4", Duration::from_secs(5))
            .run_stream(&adapter, "t", &conversation())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert!(is_role_frame(&frames[0]));
        assert!(is_finish_frame(&frames[1]));
        assert!(matches!(frames[2], RelayFrame::Done));
    }

    #[tokio::test]
    async fn refused_stream_fails_before_any_frame() {
        let adapter = ScriptedAdapter::new(Reply::Fail("token expired".into()));
        let result = RelaySession::new("gpt-4", Duration::from_secs(5))
            .run_stream(&adapter, "t", &conversation())
            .await;

        match result {
            Err(UpstreamError::Status { message, .. }) => assert_eq!(message, "token expired"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stream should have been refused"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_emits_single_error_and_ends() {
        let (tx, rx) = mpsc::channel(4);
        let session = RelaySession::new("gpt-4", Duration::from_secs(1));
        let mut frames = session.relay(rx);

        assert!(is_role_frame(&frames.next().await.unwrap()));

        let started = tokio::time::Instant::now();
        let frame = frames.next().await.unwrap();
        assert!(matches!(frame, RelayFrame::Failed(RelayError::IdleTimeout)));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(frames.next().await.is_none());

        // The relay stopped consuming: the producer sees a closed channel.
        assert!(tx.send(Fragment::Text("late".into())).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_fragment_resets_the_idle_window() {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for part in ["a", "b", "c"] {
                tokio::time::sleep(Duration::from_millis(800)).await;
                tx.send(Fragment::Text(part.into())).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(800)).await;
            tx.send(Fragment::Done).await.unwrap();
        });

        let frames: Vec<RelayFrame> = RelaySession::new("gpt-4", Duration::from_secs(1))
            .relay(rx)
            .collect()
            .await;

        let texts: Vec<&str> = frames.iter().filter_map(content).collect();
        assert_eq!(texts, vec!["", "a", "b", "c"]);
        assert!(is_finish_frame(&frames[4]));
        assert!(matches!(frames[5], RelayFrame::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_partial_output() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Fragment::Text("partial".into())).await.unwrap();

        let frames: Vec<RelayFrame> = RelaySession::new("gpt-4", Duration::from_secs(1))
            .relay(rx)
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(content(&frames[1]), Some("partial"));
        assert!(matches!(frames[2], RelayFrame::Failed(RelayError::IdleTimeout)));
        drop(tx);
    }

    #[tokio::test]
    async fn upstream_failure_mid_stream_is_terminal() {
        let adapter = ScriptedAdapter::new(Reply::Fragments(vec![
            Fragment::Text("Hel".into()),
            Fragment::Failed("connection reset".into()),
            Fragment::Text("never".into()),
        ]));
        let frames: Vec<RelayFrame> = RelaySession::new("gpt-4", Duration::from_secs(5))
            .run_stream(&adapter, "t", &conversation())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(content(&frames[1]), Some("Hel"));
        match &frames[2] {
            RelayFrame::Failed(RelayError::Upstream(message)) => {
                assert_eq!(message, "connection reset")
            }
            other => panic!("expected upstream failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_hanging_up_without_done_is_an_error() {
        let adapter =
            ScriptedAdapter::new(Reply::Fragments(vec![Fragment::Text("cut".into())]));
        let frames: Vec<RelayFrame> = RelaySession::new("gpt-4", Duration::from_secs(5))
            .run_stream(&adapter, "t", &conversation())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert!(matches!(
            frames[2],
            RelayFrame::Failed(RelayError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn blocking_wraps_answer_with_zero_usage() {
        let adapter = ScriptedAdapter::new(Reply::Answer("Hello there".into()));
        let session = RelaySession::new("gpt-4", Duration::from_secs(5));
        let id = session.id().to_string();

        let completion = session
            .run_blocking(&adapter, "t", &conversation())
            .await
            .unwrap();

        assert_eq!(completion.id, id);
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(
            completion.choices[0].message,
            Message::new(Role::Assistant, "Hello there")
        );
        assert_eq!(completion.usage.prompt_tokens, 0);
        assert_eq!(completion.usage.completion_tokens, 0);
        assert_eq!(completion.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn blocking_passes_upstream_error_through() {
        let adapter = ScriptedAdapter::new(Reply::Fail("bot unavailable".into()));
        let err = RelaySession::new("gpt-4", Duration::from_secs(5))
            .run_blocking(&adapter, "t", &conversation())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bot unavailable"));
        assert_eq!(adapter.calls(), 1);
    }

    #[test]
    fn relay_error_display_matches_event_payload() {
        assert_eq!(RelayError::IdleTimeout.to_string(), "timeout");
        assert_eq!(RelayError::Upstream("boom".into()).to_string(), "boom");
        assert_eq!(RelayError::IdleTimeout.error_type(), "idle_timeout");
    }
}
