use crate::context::conversation::{Conversation, ConversationMessage};
use crate::context::persistence::{ConversationArchive, LoadFailure};
use crate::error::GpytError;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Id of the placeholder listed when the archive directory cannot be read.
pub const LOAD_FAILURE_ID: &str = "-1";

/// What a call to [`ConversationStore::load_persisted_conversations`] did.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    /// Newly listed conversations (ids already known are skipped).
    pub added: usize,
    pub failures: Vec<LoadFailure>,
    /// The whole directory was unreadable; a placeholder entry was listed.
    pub placeholder: bool,
}

/// In-memory conversations plus the "past conversations" listing.
///
/// At most one conversation is active. Conversations are only ever mutated by
/// appending messages.
pub struct ConversationStore {
    archive: ConversationArchive,
    conversations: HashMap<String, Conversation>,
    active: Option<String>,
    /// Ids already listed as past conversations.
    known_ids: HashSet<String>,
    /// Listing order, oldest first.
    past: Vec<String>,
}

impl ConversationStore {
    pub fn new(archive: ConversationArchive) -> Self {
        Self {
            archive,
            conversations: HashMap::new(),
            active: None,
            known_ids: HashSet::new(),
            past: Vec::new(),
        }
    }

    pub fn archive(&self) -> &ConversationArchive {
        &self.archive
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.conversations.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Create a conversation with an empty log and make it active.
    pub fn setup_fresh_conversation(&mut self, summary: &str) -> &Conversation {
        let conversation = Conversation::new(summary);
        let id = conversation.id.clone();
        tracing::info!("Started conversation {id}: {}", conversation.summary);
        self.active = Some(id.clone());
        self.conversations.entry(id).or_insert(conversation)
    }

    /// Append to a conversation's log.
    pub fn append(&mut self, id: &str, message: ConversationMessage) -> Result<(), GpytError> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| GpytError::ConversationNotFound(id.to_string()))?;
        conversation.push(message);
        Ok(())
    }

    /// List a conversation as a past conversation, once.
    /// Returns false if it was already listed.
    pub fn register(&mut self, id: &str) -> bool {
        if !self.conversations.contains_key(id) || !self.known_ids.insert(id.to_string()) {
            return false;
        }
        self.past.push(id.to_string());
        true
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    /// Persist and deactivate the active conversation.
    ///
    /// Returns `None` when nothing was active. The conversation is deactivated
    /// even if saving fails; it stays available in memory.
    pub fn start_new_conversation(&mut self, register: bool) -> Option<Result<PathBuf, GpytError>> {
        let id = self.active.clone()?;
        let saved = match self.conversations.get(&id) {
            Some(conversation) => self.archive.save(conversation),
            None => Err(GpytError::ConversationNotFound(id.clone())),
        };
        if saved.is_ok() && register {
            self.register(&id);
        }
        self.active = None;
        Some(saved)
    }

    /// Make a known conversation active.
    pub fn set_active(&mut self, id: &str) -> Result<&Conversation, GpytError> {
        let conversation = self
            .conversations
            .get(id)
            .ok_or_else(|| GpytError::ConversationNotFound(id.to_string()))?;
        self.active = Some(id.to_string());
        Ok(conversation)
    }

    /// Read the archive and list every conversation not already known.
    ///
    /// An unreadable archive directory lists a single placeholder entry
    /// instead of failing.
    pub fn load_persisted_conversations(&mut self) -> LoadOutcome {
        let report = match self.archive.load_all() {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Could not load saved conversations: {e}");
                let placeholder = Conversation {
                    id: LOAD_FAILURE_ID.to_string(),
                    summary: format!(
                        "Failed to load conversations from {}",
                        self.archive.conversations_dir().display()
                    ),
                    log: Vec::new(),
                };
                self.conversations
                    .entry(placeholder.id.clone())
                    .or_insert(placeholder);
                let added = usize::from(self.register(LOAD_FAILURE_ID));
                return LoadOutcome {
                    added,
                    failures: Vec::new(),
                    placeholder: true,
                };
            }
        };

        let mut added = 0;
        for (conversation, _modified) in report.conversations {
            if self.known_ids.contains(&conversation.id) {
                continue;
            }
            let id = conversation.id.clone();
            self.conversations.entry(id.clone()).or_insert(conversation);
            if self.register(&id) {
                added += 1;
            }
        }

        LoadOutcome {
            added,
            failures: report.failures,
            placeholder: false,
        }
    }

    /// Listed past conversations, newest first.
    pub fn past_conversations(&self) -> Vec<&Conversation> {
        self.past
            .iter()
            .rev()
            .filter_map(|id| self.conversations.get(id))
            .collect()
    }
}
