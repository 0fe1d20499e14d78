use crate::constants::{defaults, endpoints, models, prompts};
use crate::error::GpytError;
use crate::llm::chunking::chunked_stream;
use crate::llm::history::SessionHistory;
use crate::llm::traits::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Keyless backend for a local Ollama server.
///
/// There is no system prompt. The backend records each question/answer pair
/// itself when a response arrives, so [`Backend::log_assistant_response`] does
/// nothing. Responses are fetched whole and streamed back in slices.
pub struct FreeBackend {
    client: reqwest::Client,
    model: String,
    base_url: String,
    chunk_chars: usize,
    history: Mutex<SessionHistory>,
    memory: AtomicBool,
}

impl Default for FreeBackend {
    fn default() -> Self {
        Self::new(models::FREE_MODEL)
    }
}

impl FreeBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: super::http_client(Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS)),
            model: model.into(),
            base_url: endpoints::OLLAMA_BASE_URL.to_string(),
            chunk_chars: defaults::FAKE_STREAM_CHUNK_CHARS,
            history: Mutex::new(SessionHistory::new()),
            memory: AtomicBool::new(true),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_memory(self, enabled: bool) -> Self {
        self.memory.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = super::http_client(timeout);
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    fn lock_history(&self) -> MutexGuard<'_, SessionHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn ask(&self, messages: &[Message]) -> Result<String, GpytError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            return Err(GpytError::Backend(format!(
                "Ollama error ({status}): {response_text}"
            )));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| GpytError::Backend(format!("Failed to parse response: {e}")))?;
        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl Backend for FreeBackend {
    fn name(&self) -> &str {
        "Free (local)"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_native_streaming: false,
            has_system_prompt: false,
            tracks_usage: false,
        }
    }

    async fn get_response(&self, input: &str) -> Result<String, GpytError> {
        let mut messages = {
            let mut history = self.lock_history();
            if !self.memory() {
                history.clear();
            }
            history.get_messages()
        };
        messages.push(Message::user(input));

        let answer = self.ask(&messages).await?;

        if self.memory() {
            let mut history = self.lock_history();
            history.add_user_message(input);
            history.add_assistant_message(answer.clone());
        }
        Ok(answer)
    }

    async fn get_response_stream(&self, input: &str) -> Result<ChunkStream, GpytError> {
        let answer = self.get_response(input).await?;
        Ok(chunked_stream(&answer, self.chunk_chars))
    }

    async fn summarize(&self, initial_message: &str) -> Result<String, GpytError> {
        let prompt = format!("{}{}", prompts::INLINE_SUMMARY_PREFIX, initial_message);
        self.ask(&[Message::user(prompt)])
            .await
            .map_err(|e| GpytError::Summary(e.to_string()))
    }

    fn set_history(&self, prior: &[Message]) {
        self.lock_history().replace(prior);
    }

    fn clear_history(&self) {
        self.lock_history().clear();
    }

    fn log_assistant_response(&self, _final_text: &str) {}

    fn history(&self) -> Vec<Message> {
        self.lock_history().get_messages()
    }

    fn memory(&self) -> bool {
        self.memory.load(Ordering::Relaxed)
    }

    fn set_memory(&self, enabled: bool) {
        self.memory.store(enabled, Ordering::Relaxed);
    }

    fn fallback_message(&self) -> &str {
        prompts::FREE_ERROR_MESSAGE
    }
}
