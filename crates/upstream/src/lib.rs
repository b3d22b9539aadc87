//! Upstream session adapter contract
//!
//! Defines the `SessionAdapter` trait that decouples the gateway's relay from
//! the transport used to reach the conversational backend. An adapter is
//! handed a leased session token and a conversation, and either returns the
//! finished assistant message (`ask`) or a live channel of text fragments
//! terminated by `Fragment::Done` (`stream`).
//!
//! `HttpGatewayAdapter` is the production implementation; tests substitute
//! scripted adapters that implement the same trait.

pub mod gateway;
pub mod prompt;

pub use gateway::HttpGatewayAdapter;
pub use prompt::{RoleSimulation, render_prompt};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Capacity of the fragment channel between an adapter's producer task and
/// the relay consuming it.
pub const FRAGMENT_BUFFER: usize = 64;

/// Conversation participant. Only these three roles are accepted from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role string that is not exactly `system`, `user` or `assistant`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    /// Exact, case-sensitive match.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Incremental output of a streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A piece of assistant text, in arrival order.
    Text(String),
    /// The exchange broke off; no `Done` follows.
    Failed(String),
    /// Terminal sentinel: the upstream finished generating.
    Done,
}

/// Receiving half of a streaming exchange.
pub type FragmentReceiver = tokio::sync::mpsc::Receiver<Fragment>;

/// Errors from upstream exchanges.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid upstream response: {0}")]
    Protocol(String),
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Abstraction over the backend conversational service.
///
/// Implementations must not retry internally; retry policy belongs to the
/// caller. Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SessionAdapter>`).
pub trait SessionAdapter: Send + Sync {
    /// Identifier for logging (e.g. "http-gateway")
    fn id(&self) -> &str;

    /// Run one blocking exchange and return the complete assistant message.
    ///
    /// `token` is the leased session credential, `bot` the upstream model id.
    fn ask<'a>(
        &'a self,
        token: &'a str,
        messages: &'a [Message],
        bot: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + 'a>>;

    /// Open a streaming exchange.
    ///
    /// Resolves once the upstream has accepted the exchange. Fragments are
    /// then delivered asynchronously on the returned channel and terminated by
    /// `Fragment::Done` (or `Fragment::Failed`). Dropping the receiver cancels
    /// the producer.
    fn stream<'a>(
        &'a self,
        token: &'a str,
        messages: &'a [Message],
        bot: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FragmentReceiver>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_exact_names_only() {
        assert_eq!("system".parse::<Role>(), Ok(Role::System));
        assert_eq!("user".parse::<Role>(), Ok(Role::User));
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));

        assert_eq!(
            "Assistant".parse::<Role>(),
            Err(UnknownRole("Assistant".into()))
        );
        assert_eq!("tool".parse::<Role>(), Err(UnknownRole("tool".into())));
        assert_eq!("".parse::<Role>(), Err(UnknownRole(String::new())));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::new(Role::Assistant, "hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn unknown_role_names_the_offender() {
        let err = "bot".parse::<Role>().unwrap_err();
        assert_eq!(err.to_string(), "unknown role: bot");
    }

    #[test]
    fn status_error_display_carries_message() {
        let err = UpstreamError::Status {
            status: 402,
            message: "daily limit reached".into(),
        };
        assert_eq!(err.to_string(), "upstream returned 402: daily limit reached");
    }
}
