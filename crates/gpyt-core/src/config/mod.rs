use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{defaults, models, paths};
use crate::error::GpytError;
use crate::llm::model_router::{BackendKind, ModelRouter};
use crate::llm::provider::{ProviderConfig, ProviderId, ProviderRegistry};
use crate::llm::{Backend, FreeBackend, MeteredBackend};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub stream: StreamSettings,
    pub providers: Vec<ProviderEntry>,
    /// Overrides `~/.cache/gpyt`. The `GPT_CACHE_DIR` variable wins over this.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub selection: BackendKind,
    pub model: String,
    pub premium_model: String,
    pub free_model: String,
    /// Ollama server for the free backend.
    pub free_base_url: String,
    /// Provider name for the provider backend; inferred from the model when unset.
    pub provider: Option<String>,
    pub provider_model: Option<String>,
    pub memory: bool,
    pub system_prompt: Option<String>,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            selection: BackendKind::Default,
            model: models::DEFAULT_MODEL.to_string(),
            premium_model: models::PREMIUM_MODEL.to_string(),
            free_model: models::FREE_MODEL.to_string(),
            free_base_url: crate::constants::endpoints::OLLAMA_BASE_URL.to_string(),
            provider: None,
            provider_model: None,
            memory: true,
            system_prompt: None,
            api_key_env: defaults::API_KEY_ENV.to_string(),
            base_url: None,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Push a display update every Nth chunk.
    pub update_every: usize,
    /// Slice size for backends that fake streaming.
    pub chunk_chars: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            update_every: defaults::UPDATE_EVERY,
            chunk_chars: defaults::FAKE_STREAM_CHUNK_CHARS,
        }
    }
}

/// A configured provider entry in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub default_model: String,
}

fn enabled_by_default() -> bool {
    true
}

impl Settings {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(paths::CONFIG_DIR)
            .join(paths::CONFIG_FILE)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Read settings from `path`. A missing or unparsable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring unparsable {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), GpytError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), GpytError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| GpytError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Root for conversations and the log file.
    pub fn cache_root(&self) -> Result<PathBuf, GpytError> {
        self.resolve_cache_root(std::env::var(paths::CACHE_DIR_ENV).ok().as_deref())
    }

    /// Resolution order: the environment override, then `cache_dir`, then
    /// `<home>/.cache/gpyt`.
    pub fn resolve_cache_root(&self, env_override: Option<&str>) -> Result<PathBuf, GpytError> {
        if let Some(dir) = env_override.map(str::trim).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir().ok_or_else(|| {
            GpytError::Config(format!(
                "Could not determine home directory; set {}",
                paths::CACHE_DIR_ENV
            ))
        })?;
        Ok(home.join(".cache").join(paths::CONFIG_DIR))
    }

    /// Built-in providers overridden by `[[providers]]` entries.
    pub fn build_provider_registry(&self) -> ProviderRegistry {
        let configs = self
            .providers
            .iter()
            .map(|entry| {
                let id = ProviderId::from_name(&entry.name);
                let builtin = ProviderConfig::builtin(id.clone());
                ProviderConfig {
                    enabled: entry.enabled,
                    api_key_env: or_default(&entry.api_key_env, &builtin.api_key_env),
                    base_url: or_default(&entry.base_url, &builtin.base_url),
                    default_model: or_default(&entry.default_model, &builtin.default_model),
                    id,
                }
            })
            .collect();
        ProviderRegistry::from_configs(configs)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs.max(1))
    }

    fn metered(&self, model: &str) -> Result<MeteredBackend, GpytError> {
        let key = std::env::var(&self.backend.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                GpytError::Config(format!(
                    "No API key found. Export {} or start with --free for the keyless local backend",
                    self.backend.api_key_env
                ))
            })?;
        let mut backend = MeteredBackend::new(key)
            .with_model(model)
            .with_memory(self.backend.memory)
            .with_timeout(self.timeout());
        if let Some(url) = &self.backend.base_url {
            backend = backend.with_base_url(url);
        }
        if let Some(prompt) = &self.backend.system_prompt {
            backend = backend.with_system_prompt(prompt);
        }
        Ok(backend)
    }

    fn free(&self) -> FreeBackend {
        FreeBackend::new(&self.backend.free_model)
            .with_base_url(&self.backend.free_base_url)
            .with_memory(self.backend.memory)
            .with_timeout(self.timeout())
            .with_chunk_chars(self.stream.chunk_chars)
    }

    fn provider(&self) -> Result<Option<Arc<dyn Backend>>, GpytError> {
        let model = self.backend.provider_model.as_deref();
        let id = match (&self.backend.provider, model) {
            (Some(name), _) => ProviderId::from_name(name),
            (None, Some(model)) => ProviderId::infer_from_model(model),
            (None, None) => return Ok(None),
        };
        let mut backend = self
            .build_provider_registry()
            .build_backend(&id, model)?
            .with_memory(self.backend.memory)
            .with_timeout(self.timeout())
            .with_chunk_chars(self.stream.chunk_chars);
        if let Some(prompt) = &self.backend.system_prompt {
            backend = backend.with_system_prompt(prompt);
        }
        Ok(Some(Arc::new(backend)))
    }

    /// Build every backend that can be built and select the configured one.
    ///
    /// Fails only when the selected backend cannot be built, with a message
    /// saying how to fix it.
    pub fn build_router(&self) -> Result<ModelRouter, GpytError> {
        let selection = self.backend.selection;
        let mut built: Vec<(BackendKind, Arc<dyn Backend>)> = Vec::new();
        let mut selected_error = None;

        for kind in BackendKind::all() {
            let result: Result<Option<Arc<dyn Backend>>, GpytError> = match kind {
                BackendKind::Default => self
                    .metered(&self.backend.model)
                    .map(|b| Some(Arc::new(b) as Arc<dyn Backend>)),
                BackendKind::Premium => self
                    .metered(&self.backend.premium_model)
                    .map(|b| Some(Arc::new(b) as Arc<dyn Backend>)),
                BackendKind::Free => Ok(Some(Arc::new(self.free()) as Arc<dyn Backend>)),
                BackendKind::Provider => self.provider(),
            };
            match result {
                Ok(Some(backend)) => built.push((*kind, backend)),
                Ok(None) if *kind == selection => {
                    selected_error = Some(GpytError::Config(
                        "No provider configured. Pass --model <MODEL> or --provider <NAME>, or set backend.provider in config.toml".into(),
                    ));
                }
                Ok(None) => {}
                Err(e) if *kind == selection => selected_error = Some(e),
                Err(e) => tracing::debug!("{kind} backend unavailable: {e}"),
            }
        }

        if let Some(e) = selected_error {
            return Err(e);
        }

        let mut router: Option<ModelRouter> = None;
        for (kind, backend) in built {
            match router.as_mut() {
                Some(router) => router.register(kind, backend),
                None => router = Some(ModelRouter::new(kind, backend)),
            }
        }
        let mut router = router.ok_or_else(|| GpytError::Config("No backend available".into()))?;
        router.select(selection)?;
        Ok(router)
    }
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
