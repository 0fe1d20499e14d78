use crate::llm::accounting::{estimate_tokens, UsageTracker};
use crate::llm::{Message, Role, Usage, UsageSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Chat history for one backend session: an optional leading system prompt
/// followed by alternating user/assistant turns.
#[derive(Debug, Clone, Default)]
pub struct SessionHistory {
    messages: Vec<Message>,
    system_prompt: Option<String>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Replace all turns. System messages in `prior` are ignored; the
    /// configured system prompt stays in front.
    pub fn replace(&mut self, prior: &[Message]) {
        self.messages = prior
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
    }

    /// Get all messages including system prompt as a system message.
    pub fn get_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(ref system) = self.system_prompt {
            messages.push(Message::system(system));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }

    /// Get only conversation messages (no system prompt).
    pub fn get_conversation_messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimate_tokens(&self) -> usize {
        self.get_messages()
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }
}

/// History, memory flag and accounting shared by the chat-style backends.
///
/// Interior mutability lets a backend be driven through `&self` from the
/// foreground loop and from background turn tasks.
#[derive(Debug)]
pub struct ChatState {
    history: Mutex<SessionHistory>,
    memory: AtomicBool,
    usage: Mutex<UsageTracker>,
    pending_input_tokens: Mutex<Option<u64>>,
    reported: Mutex<Option<Usage>>,
}

impl ChatState {
    pub fn new(system_prompt: Option<String>, model: &str, memory: bool) -> Self {
        let history = match system_prompt {
            Some(prompt) => SessionHistory::new().with_system_prompt(prompt),
            None => SessionHistory::new(),
        };
        Self {
            history: Mutex::new(history),
            memory: AtomicBool::new(memory),
            usage: Mutex::new(UsageTracker::new(model)),
            pending_input_tokens: Mutex::new(None),
            reported: Mutex::new(None),
        }
    }

    fn history(&self) -> MutexGuard<'_, SessionHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tracker(&self) -> MutexGuard<'_, UsageTracker> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reported(&self) -> MutexGuard<'_, Option<Usage>> {
        self.reported.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the user's input and return the full request for this turn.
    ///
    /// Without memory the history is wiped first, so the request holds at most
    /// the system prompt and this input.
    pub fn begin_turn(&self, input: &str) -> Vec<Message> {
        let messages = {
            let mut history = self.history();
            if !self.memory() {
                history.clear();
            }
            history.add_user_message(input);
            history.get_messages()
        };
        let input_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        *self
            .pending_input_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(input_tokens as u64);
        *self.reported() = None;
        messages
    }

    /// Counts the provider reported for the current turn.
    pub fn report_usage(&self, usage: Usage) {
        *self.reported() = Some(usage);
    }

    /// Record the finished assistant turn and update accounting. Reported
    /// counts win over the estimate.
    pub fn finish_turn(&self, final_text: &str) {
        let pending = self
            .pending_input_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let reported = self.reported().take();
        match (reported, pending) {
            (Some(usage), _) => self
                .tracker()
                .track(usage.input_tokens.into(), usage.output_tokens.into()),
            (None, Some(input)) => self
                .tracker()
                .track(input, estimate_tokens(final_text) as u64),
            (None, None) => {}
        }
        if self.memory() {
            self.history().add_assistant_message(final_text);
        }
    }

    pub fn system_prompt(&self) -> Option<String> {
        self.history().system_prompt().map(str::to_string)
    }

    pub fn set_history(&self, prior: &[Message]) {
        self.history().replace(prior);
    }

    pub fn clear(&self) {
        self.history().clear();
        self.tracker().reset();
        *self.reported() = None;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.history().get_messages()
    }

    pub fn memory(&self) -> bool {
        self.memory.load(Ordering::Relaxed)
    }

    pub fn set_memory(&self, enabled: bool) {
        self.memory.store(enabled, Ordering::Relaxed);
    }

    pub fn usage(&self) -> UsageSnapshot {
        let mut snapshot = self.tracker().snapshot();
        snapshot.context_tokens = self.history().estimate_tokens() as u64;
        snapshot
    }
}
