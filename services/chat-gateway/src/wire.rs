//! OpenAI-compatible request and response bodies.

use serde::{Deserialize, Serialize};
use upstream::{Message, Role, UnknownRole};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const FINISH_STOP: &str = "stop";

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: bool,
}

/// A message as sent by the caller. The role stays a raw string until
/// validation so the offending value can be reported back.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatCompletionRequest {
    /// Check every role and convert the conversation.
    ///
    /// The first message whose role is not exactly `system`, `user` or
    /// `assistant` fails the whole request.
    pub fn validate(&self) -> Result<Vec<Message>, UnknownRole> {
        self.messages
            .iter()
            .map(|m| {
                let role: Role = m.role.parse()?;
                Ok(Message::new(role, m.content.clone()))
            })
            .collect()
    }
}

/// One server-sent frame of a streamed completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    /// Serialized as `null` until the closing frame.
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Response of a blocking completion.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: &'static str,
}

/// The upstream reports no token accounting, so every field is zero.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response of `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "",
            created: 0,
            owned_by: "",
        }
    }
}
