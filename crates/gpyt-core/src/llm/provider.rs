use crate::constants::{defaults, endpoints, models, prompts};
use crate::error::GpytError;
use crate::llm::chunking::chunked_stream;
use crate::llm::history::ChatState;
use crate::llm::traits::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Identifies a specific LLM provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Claude,
    OpenAI,
    Ollama,
    Groq,
    Together,
    OpenRouter,
    LmStudio,
    Custom(String),
}

impl ProviderId {
    pub fn name(&self) -> &str {
        match self {
            Self::Claude => "Claude (Anthropic)",
            Self::OpenAI => "OpenAI",
            Self::Ollama => "Ollama (Local)",
            Self::Groq => "Groq",
            Self::Together => "Together.ai",
            Self::OpenRouter => "OpenRouter",
            Self::LmStudio => "LM Studio (Local)",
            Self::Custom(name) => name,
        }
    }

    /// Parse the short name used in config files and on the command line.
    /// Unknown names become [`ProviderId::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Self::Claude,
            "openai" => Self::OpenAI,
            "ollama" => Self::Ollama,
            "groq" => Self::Groq,
            "together" => Self::Together,
            "openrouter" => Self::OpenRouter,
            "lmstudio" | "lm-studio" => Self::LmStudio,
            _ => Self::Custom(name.trim().to_string()),
        }
    }

    /// Best guess at the provider serving `model`.
    pub fn infer_from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("claude") {
            Self::Claude
        } else if lower.contains('/') {
            Self::OpenRouter
        } else if lower.starts_with("llama") || lower.starts_with("mixtral") {
            Self::Groq
        } else {
            Self::OpenAI
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama | Self::LmStudio)
    }

    pub fn needs_api_key(&self) -> bool {
        !self.is_local()
    }

    pub fn default_base_url(&self) -> &str {
        match self {
            Self::Claude => endpoints::CLAUDE_BASE_URL,
            Self::OpenAI => endpoints::OPENAI_BASE_URL,
            // Ollama's OpenAI-compatible surface lives under /v1 as well.
            Self::Ollama => endpoints::OLLAMA_BASE_URL,
            Self::Groq => endpoints::GROQ_BASE_URL,
            Self::Together => endpoints::TOGETHER_BASE_URL,
            Self::OpenRouter => endpoints::OPENROUTER_BASE_URL,
            Self::LmStudio => endpoints::LMSTUDIO_BASE_URL,
            Self::Custom(_) => "",
        }
    }

    pub fn default_api_key_env(&self) -> &str {
        match self {
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::OpenAI => "OPENAI_API_KEY",
            Self::Ollama => "",
            Self::Groq => "GROQ_API_KEY",
            Self::Together => "TOGETHER_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::LmStudio => "",
            Self::Custom(_) => "",
        }
    }

    pub fn default_model(&self) -> &str {
        match self {
            Self::Claude => models::DEFAULT_CLAUDE_MODEL,
            Self::OpenAI => models::DEFAULT_OPENAI_MODEL,
            Self::Ollama => models::FREE_MODEL,
            Self::Groq => models::DEFAULT_GROQ_MODEL,
            Self::Together => models::DEFAULT_TOGETHER_MODEL,
            Self::OpenRouter => models::DEFAULT_OPENROUTER_MODEL,
            Self::LmStudio => models::DEFAULT_LMSTUDIO_MODEL,
            Self::Custom(_) => "",
        }
    }

    pub fn all_builtin() -> Vec<ProviderId> {
        vec![
            Self::Claude,
            Self::OpenAI,
            Self::Ollama,
            Self::Groq,
            Self::Together,
            Self::OpenRouter,
            Self::LmStudio,
        ]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Configuration for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub enabled: bool,
    pub api_key_env: String,
    pub base_url: String,
    pub default_model: String,
}

impl ProviderConfig {
    pub fn builtin(id: ProviderId) -> Self {
        Self {
            api_key_env: id.default_api_key_env().to_string(),
            base_url: id.default_base_url().to_string(),
            default_model: id.default_model().to_string(),
            enabled: true,
            id,
        }
    }

    pub fn api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn is_available(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.id.needs_api_key() {
            self.api_key().is_some()
        } else {
            true
        }
    }
}

/// All configured providers, built-ins first, overridden by user entries.
pub struct ProviderRegistry {
    providers: HashMap<ProviderId, ProviderConfig>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let providers = ProviderId::all_builtin()
            .into_iter()
            .map(|id| (id.clone(), ProviderConfig::builtin(id)))
            .collect();
        Self { providers }
    }

    pub fn from_configs(configs: Vec<ProviderConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.providers.insert(config.id.clone(), config);
        }
        registry
    }

    pub fn get_config(&self, id: &ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    pub fn available_providers(&self) -> Vec<&ProviderConfig> {
        let mut available: Vec<_> = self
            .providers
            .values()
            .filter(|c| c.is_available())
            .collect();
        available.sort_by(|a, b| a.id.name().cmp(b.id.name()));
        available
    }

    /// Build a backend for `id`, using `model` or the provider's default model.
    pub fn build_backend(
        &self,
        id: &ProviderId,
        model: Option<&str>,
    ) -> Result<ProviderBackend, GpytError> {
        let config = self
            .get_config(id)
            .ok_or_else(|| GpytError::Config(format!("Provider {id} not configured")))?;
        if !config.enabled {
            return Err(GpytError::Config(format!(
                "Provider {id} is disabled in config.toml"
            )));
        }
        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or(&config.default_model);
        ProviderBackend::new(config, model)
    }
}

/// Config-driven delegate to a named provider. Responses are fetched whole
/// and streamed back in fixed-size slices.
pub struct ProviderBackend {
    client: reqwest::Client,
    provider: ProviderId,
    api_key: Option<String>,
    base_url: String,
    model: String,
    label: String,
    max_tokens: u32,
    chunk_chars: usize,
    state: ChatState,
}

impl ProviderBackend {
    pub fn new(config: &ProviderConfig, model: impl Into<String>) -> Result<Self, GpytError> {
        let api_key = config.api_key();
        if config.id.needs_api_key() && api_key.is_none() {
            return Err(GpytError::Config(format!(
                "Set {} environment variable for {}",
                config.api_key_env,
                config.id.name()
            )));
        }
        if config.base_url.is_empty() {
            return Err(GpytError::Config(format!(
                "Provider {} has no base_url",
                config.id
            )));
        }
        let model = model.into();
        Ok(Self {
            client: super::http_client(Duration::from_secs(defaults::REQUEST_TIMEOUT_SECS)),
            label: format!("{} ({})", model, config.id.name()),
            provider: config.id.clone(),
            api_key,
            base_url: config.base_url.clone(),
            max_tokens: defaults::MAX_TOKENS,
            chunk_chars: defaults::FAKE_STREAM_CHUNK_CHARS,
            state: ChatState::new(Some(prompts::SYSTEM_PROMPT.to_string()), &model, true),
            model,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.state = ChatState::new(Some(prompt.into()), &self.model, self.state.memory());
        self
    }

    pub fn with_memory(self, enabled: bool) -> Self {
        self.state.set_memory(enabled);
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

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    async fn call(&self, messages: &[Message]) -> Result<(String, Option<Usage>), GpytError> {
        match self.provider {
            ProviderId::Claude => {
                super::claude::complete_messages(
                    &self.client,
                    &self.base_url,
                    self.api_key.as_deref().unwrap_or_default(),
                    &self.model,
                    self.max_tokens,
                    messages,
                )
                .await
            }
            // All other providers use OpenAI-compatible API
            _ => {
                super::openai::complete_chat(
                    &self.client,
                    &self.base_url,
                    self.api_key.as_deref(),
                    &self.model,
                    messages,
                )
                .await
            }
        }
    }

    /// Run one turn's request, keeping any provider-reported counts for accounting.
    async fn call_turn(&self, messages: &[Message]) -> Result<String, GpytError> {
        let (text, usage) = self.call(messages).await?;
        if let Some(usage) = usage {
            self.state.report_usage(usage);
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl Backend for ProviderBackend {
    fn name(&self) -> &str {
        &self.label
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_native_streaming: false,
            has_system_prompt: true,
            tracks_usage: true,
        }
    }

    async fn get_response(&self, input: &str) -> Result<String, GpytError> {
        let messages = self.state.begin_turn(input);
        let text = self.call_turn(&messages).await?;
        self.state.finish_turn(&text);
        Ok(text)
    }

    async fn get_response_stream(&self, input: &str) -> Result<ChunkStream, GpytError> {
        let messages = self.state.begin_turn(input);
        let text = self.call_turn(&messages).await?;
        Ok(chunked_stream(&text, self.chunk_chars))
    }

    async fn summarize(&self, initial_message: &str) -> Result<String, GpytError> {
        let messages = [
            Message::system(prompts::SUMMARY_PROMPT),
            Message::user(initial_message.trim_end()),
        ];
        self.call(&messages)
            .await
            .map(|(summary, _)| summary)
            .map_err(|e| GpytError::Summary(e.to_string()))
    }

    fn set_history(&self, prior: &[Message]) {
        self.state.set_history(prior);
    }

    fn clear_history(&self) {
        self.state.clear();
    }

    fn record_usage(&self, usage: Usage) {
        self.state.report_usage(usage);
    }

    fn log_assistant_response(&self, final_text: &str) {
        self.state.finish_turn(final_text);
    }

    fn history(&self) -> Vec<Message> {
        self.state.messages()
    }

    fn memory(&self) -> bool {
        self.state.memory()
    }

    fn set_memory(&self, enabled: bool) {
        self.state.set_memory(enabled);
    }

    fn usage(&self) -> Option<UsageSnapshot> {
        Some(self.state.usage())
    }
}
