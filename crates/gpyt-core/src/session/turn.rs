use crate::constants::defaults;
use crate::context::{Conversation, ConversationMessage, ConversationStore, LoadOutcome, LOAD_FAILURE_ID};
use crate::error::GpytError;
use crate::llm::{chunked_stream, Backend, BackendKind, ModelRouter, UsageSnapshot};
use crate::session::assembler::StreamAssembler;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Progress of one turn, sent from the background task to the foreground loop.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The user message is recorded and a response placeholder should appear.
    Started {
        conversation_id: String,
        summary: String,
        new_conversation: bool,
        user_message: ConversationMessage,
    },
    /// Throttled snapshot of the response so far.
    Update { content: String },
    /// The response is final and has been appended to the conversation.
    Finished {
        conversation_id: String,
        message: ConversationMessage,
        saved_to: Option<PathBuf>,
    },
    /// Non-fatal problem the user should see (e.g. the save failed).
    Diagnostic(String),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub response: String,
    pub used_fallback: bool,
    pub saved_to: Option<PathBuf>,
}

/// Claim on the session's single turn slot. Released on drop.
#[derive(Debug)]
pub struct TurnGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// Snapshot of the active backend for status displays.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub name: String,
    pub model: String,
    pub memory: bool,
    pub usage: Option<UsageSnapshot>,
}

/// Owns the router and conversation store and runs turns against them.
///
/// Cloning is cheap; clones share all state. Only one turn may be in flight
/// at a time.
#[derive(Clone)]
pub struct ChatSession {
    router: Arc<RwLock<ModelRouter>>,
    store: Arc<Mutex<ConversationStore>>,
    turn_slot: Arc<AtomicBool>,
    update_every: usize,
}

impl ChatSession {
    pub fn new(router: ModelRouter, store: ConversationStore) -> Self {
        Self {
            router: Arc::new(RwLock::new(router)),
            store: Arc::new(Mutex::new(store)),
            turn_slot: Arc::new(AtomicBool::new(false)),
            update_every: defaults::UPDATE_EVERY,
        }
    }

    pub fn with_update_every(mut self, update_every: usize) -> Self {
        self.update_every = update_every.max(1);
        self
    }

    fn store(&self) -> MutexGuard<'_, ConversationStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn router(&self) -> RwLockReadGuard<'_, ModelRouter> {
        self.router.read().unwrap_or_else(|e| e.into_inner())
    }

    fn router_mut(&self) -> RwLockWriteGuard<'_, ModelRouter> {
        self.router.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active_backend(&self) -> Arc<dyn Backend> {
        self.router().active_backend()
    }

    pub fn is_turn_active(&self) -> bool {
        self.turn_slot.load(Ordering::Acquire)
    }

    /// Claim the turn slot, or fail with [`GpytError::TurnInProgress`].
    pub fn try_begin_turn(&self) -> Result<TurnGuard, GpytError> {
        self.turn_slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GpytError::TurnInProgress)?;
        Ok(TurnGuard {
            slot: Arc::clone(&self.turn_slot),
        })
    }

    /// Claim the turn slot and run the turn on a background task.
    pub fn submit(
        &self,
        input: impl Into<String>,
        events: UnboundedSender<TurnEvent>,
    ) -> Result<JoinHandle<TurnOutcome>, GpytError> {
        let guard = self.try_begin_turn()?;
        let session = self.clone();
        let input = input.into();
        Ok(tokio::spawn(async move {
            session.run_turn(guard, &input, events).await
        }))
    }

    /// Run one user turn to completion. Never fails: provider problems become
    /// the fallback response and save problems become diagnostics.
    pub async fn run_turn(
        &self,
        guard: TurnGuard,
        input: &str,
        events: UnboundedSender<TurnEvent>,
    ) -> TurnOutcome {
        let backend = self.active_backend();

        let existing = self
            .store()
            .active_conversation()
            .map(|c| (c.id.clone(), c.summary.clone()));
        let (conversation_id, summary, new_conversation) = match existing {
            Some((id, summary)) => (id, summary, false),
            None => {
                let summary = backend.get_conversation_summary(input).await;
                let mut store = self.store();
                let conversation = store.setup_fresh_conversation(&summary);
                (conversation.id.clone(), conversation.summary.clone(), true)
            }
        };

        let user_message = ConversationMessage::user(input);
        if let Err(e) = self.store().append(&conversation_id, user_message.clone()) {
            tracing::warn!("Could not record user message: {e}");
        }
        let _ = events.send(TurnEvent::Started {
            conversation_id: conversation_id.clone(),
            summary,
            new_conversation,
            user_message,
        });

        let mut assembler =
            StreamAssembler::new(self.update_every).with_fallback(backend.fallback_message());
        assembler.start();

        let stream = match backend.get_response_stream(input).await {
            Ok(stream) => stream,
            Err(e) => {
                assembler.fail(&e.to_string());
                chunked_stream(
                    backend.fallback_message(),
                    defaults::FAKE_STREAM_CHUNK_CHARS,
                )
            }
        };

        let response = assembler
            .drain(stream, |content| {
                let _ = events.send(TurnEvent::Update {
                    content: content.to_string(),
                });
            })
            .await;

        if let Some(usage) = assembler.usage() {
            backend.record_usage(usage);
        }
        backend.log_assistant_response(&response);
        let message = ConversationMessage::assistant(response.clone());
        if let Err(e) = self.store().append(&conversation_id, message.clone()) {
            tracing::warn!("Could not record assistant message: {e}");
        }

        let saved_to = match self.save_conversation(&conversation_id).await {
            Ok(path) => {
                self.store().register(&conversation_id);
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Failed to save conversation {conversation_id}: {e}");
                let _ = events.send(TurnEvent::Diagnostic(format!(
                    "Conversation could not be saved: {e}"
                )));
                None
            }
        };

        assembler.complete();
        let _ = events.send(TurnEvent::Finished {
            conversation_id: conversation_id.clone(),
            message,
            saved_to: saved_to.clone(),
        });
        drop(guard);

        TurnOutcome {
            conversation_id,
            response,
            used_fallback: assembler.used_fallback(),
            saved_to,
        }
    }

    /// Persist a conversation on a blocking worker.
    async fn save_conversation(&self, id: &str) -> Result<PathBuf, GpytError> {
        let (snapshot, archive) = {
            let store = self.store();
            let snapshot = store
                .get(id)
                .cloned()
                .ok_or_else(|| GpytError::ConversationNotFound(id.to_string()))?;
            (snapshot, store.archive().clone())
        };
        tokio::task::spawn_blocking(move || archive.save(&snapshot))
            .await
            .map_err(|e| GpytError::Persistence(format!("Save task failed: {e}")))?
    }

    /// Save the active conversation now. `None` when nothing is active.
    pub async fn save_active(&self) -> Result<Option<PathBuf>, GpytError> {
        let Some(id) = self.store().active_id().map(str::to_string) else {
            return Ok(None);
        };
        let path = self.save_conversation(&id).await?;
        self.store().register(&id);
        Ok(Some(path))
    }

    /// Persist and close the active conversation, listing it as a past
    /// conversation, and clear backend history.
    pub async fn start_new_conversation(&self) -> Result<Option<PathBuf>, GpytError> {
        self.end_active_conversation(true).await
    }

    async fn end_active_conversation(&self, register: bool) -> Result<Option<PathBuf>, GpytError> {
        if self.is_turn_active() {
            return Err(GpytError::TurnInProgress);
        }
        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || {
            store
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .start_new_conversation(register)
        })
        .await
        .map_err(|e| GpytError::Persistence(format!("Save task failed: {e}")))?;

        self.router().clear_history_all();
        saved.transpose()
    }

    /// Close the current conversation and make a previously saved one active,
    /// replaying its exchanges into backend history.
    pub async fn select_previous_conversation(&self, id: &str) -> Result<Conversation, GpytError> {
        if id == LOAD_FAILURE_ID || self.store().get(id).is_none() {
            return Err(GpytError::ConversationNotFound(id.to_string()));
        }

        if let Err(e) = self.end_active_conversation(false).await {
            match e {
                GpytError::TurnInProgress => return Err(e),
                other => tracing::warn!("Could not save outgoing conversation: {other}"),
            }
        }

        let conversation = self.store().set_active(id)?.clone();
        self.router().set_history_all(&conversation.history_messages());
        tracing::info!(
            "Resumed conversation {} ({} messages)",
            conversation.id,
            conversation.log.len()
        );
        Ok(conversation)
    }

    /// Read saved conversations from disk and list the ones not yet known.
    pub async fn load_persisted_conversations(&self) -> Result<LoadOutcome, GpytError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .load_persisted_conversations()
        })
        .await
        .map_err(|e| GpytError::Persistence(format!("Load task failed: {e}")))
    }

    /// Listed past conversations, newest first.
    pub fn past_conversations(&self) -> Vec<Conversation> {
        self.store()
            .past_conversations()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.store().active_conversation().cloned()
    }

    /// Switch backends for subsequent turns. The new backend is seeded with
    /// the active conversation so context carries over.
    pub fn select_backend(&self, kind: BackendKind) -> Result<(), GpytError> {
        let backend = self.router_mut().select(kind)?;
        let history = self
            .store()
            .active_conversation()
            .map(|c| c.history_messages())
            .unwrap_or_default();
        backend.set_history(&history);
        Ok(())
    }

    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.router().available()
    }

    pub fn set_memory(&self, enabled: bool) {
        self.router().set_memory_all(enabled);
    }

    pub fn status(&self) -> BackendStatus {
        let router = self.router();
        let backend = router.active_backend();
        BackendStatus {
            kind: router.active_kind(),
            name: backend.name().to_string(),
            model: backend.model().to_string(),
            memory: backend.memory(),
            usage: backend.usage(),
        }
    }
}
