use crate::constants::prompts;
use crate::error::GpytError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
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

/// A message as sent to a provider: role and text, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Token counts reported by the provider for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Events delivered on a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    /// A chunk arrived without the expected text field. Consumers skip it.
    Unrecognized(String),
    Usage(Usage),
    Done,
    Error(String),
}

/// Finite, single-pass sequence of stream events.
pub type ChunkStream = futures::channel::mpsc::UnboundedReceiver<StreamEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// The provider streams natively; otherwise the stream is faked by slicing.
    pub supports_native_streaming: bool,
    pub has_system_prompt: bool,
    /// Token/cost accounting is available through [`Backend::usage`].
    pub tracks_usage: bool,
}

/// Approximate token and cost counters for one backend session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    /// Tokens currently held in session history.
    pub context_tokens: u64,
    pub context_limit: Option<u64>,
}

/// The capability set every model backend implements.
///
/// Session state (history, memory flag, accounting) lives inside the backend
/// behind interior mutability, so a backend can be shared between the
/// foreground loop and the background task running a turn.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Human readable name, e.g. "GPT 3.5".
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Get a complete response for one turn. The turn is recorded in session history.
    async fn get_response(&self, input: &str) -> Result<String, GpytError>;

    /// Start a streamed response for one turn.
    async fn get_response_stream(&self, input: &str) -> Result<ChunkStream, GpytError>;

    /// Ask the provider for a short summary of a conversation opener.
    /// Never touches session history.
    async fn summarize(&self, initial_message: &str) -> Result<String, GpytError>;

    /// Short summary of a conversation opener; falls back to a fixed placeholder.
    async fn get_conversation_summary(&self, initial_message: &str) -> String {
        match self.summarize(initial_message).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => crate::constants::defaults::SUMMARY_FALLBACK.to_string(),
            Err(e) => {
                tracing::warn!("{} summary failed: {e}", self.name());
                crate::constants::defaults::SUMMARY_FALLBACK.to_string()
            }
        }
    }

    /// Replace session history with prior user/assistant messages.
    /// Any leading system prompt is kept.
    fn set_history(&self, prior: &[Message]);

    /// Drop every user/assistant turn, keeping the leading system prompt.
    fn clear_history(&self);

    /// Provider-reported counts for the turn in flight. They replace the
    /// character-based estimate when the turn is logged.
    fn record_usage(&self, _usage: Usage) {}

    /// Record the finished assistant turn. No-op without memory or history.
    fn log_assistant_response(&self, final_text: &str);

    /// Messages that would lead the next request.
    fn history(&self) -> Vec<Message>;

    fn memory(&self) -> bool;

    fn set_memory(&self, enabled: bool);

    fn usage(&self) -> Option<UsageSnapshot> {
        None
    }

    /// Canned diagnostic shown when a turn cannot be started.
    fn fallback_message(&self) -> &str {
        prompts::API_ERROR_MESSAGE
    }
}
