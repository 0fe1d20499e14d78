use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpytError {
    /// Network, auth, rate-limit or timeout failure reported by a model provider.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Summary error: {0}")]
    Summary(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A response is still streaming; wait for it to finish before sending another message")]
    TurnInProgress,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GpytError {
    pub fn persistence(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{context}: {err}"))
    }

    /// True for failures that belong to the provider side of a turn.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, GpytError>;
