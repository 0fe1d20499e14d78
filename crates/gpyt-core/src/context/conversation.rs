use crate::constants::defaults;
use crate::llm::{Message, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh opaque identifier for conversations and messages.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// One entry of a conversation log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// A persisted, append-only sequence of messages with a short summary.
///
/// Serialized exactly as `{id, summary, log: [{id, role, content}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub summary: String,
    pub log: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(summary: impl AsRef<str>) -> Self {
        Self::with_id(new_id(), summary)
    }

    pub fn with_id(id: impl Into<String>, summary: impl AsRef<str>) -> Self {
        Self {
            id: id.into(),
            summary: normalize_summary(summary.as_ref()),
            log: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.log.push(message);
    }

    pub fn first_user_message(&self) -> Option<&ConversationMessage> {
        self.log.iter().find(|m| m.role == Role::User)
    }

    /// User/assistant pairs in log order. A trailing unanswered user message
    /// is dropped.
    pub fn exchanges(&self) -> Vec<(&ConversationMessage, &ConversationMessage)> {
        let users = self.log.iter().filter(|m| m.role == Role::User);
        let assistants = self.log.iter().filter(|m| m.role == Role::Assistant);
        users.zip(assistants).collect()
    }

    /// Replayable history for a backend: the paired exchanges, flattened.
    pub fn history_messages(&self) -> Vec<Message> {
        self.exchanges()
            .into_iter()
            .flat_map(|(q, a)| [q.to_message(), a.to_message()])
            .collect()
    }
}

/// Clean up a model-produced summary: trim, drop wrapping quotes and
/// trailing punctuation, keep at most six words.
pub fn normalize_summary(raw: &str) -> String {
    let cleaned = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim_end_matches(['.', '!'])
        .trim();

    let words: Vec<&str> = cleaned
        .split_whitespace()
        .take(defaults::SUMMARY_MAX_WORDS)
        .collect();

    if words.is_empty() {
        defaults::SUMMARY_FALLBACK.to_string()
    } else {
        words.join(" ")
    }
}
