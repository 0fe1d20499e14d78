use crate::error::GpytError;
use crate::llm::traits::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which backend variant serves the next turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Metered backend on the default model.
    #[default]
    Default,
    /// Metered backend on the alternate premium model.
    Premium,
    /// Keyless local model.
    Free,
    /// Config-driven provider / explicit model.
    Provider,
}

impl BackendKind {
    pub fn all() -> &'static [BackendKind] {
        &[
            BackendKind::Default,
            BackendKind::Premium,
            BackendKind::Free,
            BackendKind::Provider,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Default => "default",
            BackendKind::Premium => "premium",
            BackendKind::Free => "free",
            BackendKind::Provider => "provider",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" | "gpt3" | "gpt-3.5" => Some(BackendKind::Default),
            "premium" | "gpt4" | "gpt-4" => Some(BackendKind::Premium),
            "free" | "local" => Some(BackendKind::Free),
            "provider" | "model" => Some(BackendKind::Provider),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Holds the configured backends and exactly one active selection.
///
/// Selection is a single [`BackendKind`]; picking one implicitly deselects the
/// rest. Callers capture [`ModelRouter::active_backend`] at the start of a turn,
/// so switching never affects a stream already in flight.
pub struct ModelRouter {
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
    active_kind: BackendKind,
    active: Arc<dyn Backend>,
}

impl ModelRouter {
    /// Build a router whose only (and active) backend is `backend`.
    pub fn new(kind: BackendKind, backend: Arc<dyn Backend>) -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(kind, Arc::clone(&backend));
        Self {
            backends,
            active_kind: kind,
            active: backend,
        }
    }

    /// Add or replace the backend for `kind` without changing the selection.
    pub fn register(&mut self, kind: BackendKind, backend: Arc<dyn Backend>) {
        tracing::info!("Backend route: {} -> {} / {}", kind, backend.name(), backend.model());
        if kind == self.active_kind {
            self.active = Arc::clone(&backend);
        }
        self.backends.insert(kind, backend);
    }

    /// Make `kind` the active backend for subsequent turns.
    pub fn select(&mut self, kind: BackendKind) -> Result<Arc<dyn Backend>, GpytError> {
        let backend = self.backends.get(&kind).cloned().ok_or_else(|| {
            GpytError::Config(format!("The {kind} backend is not configured"))
        })?;
        if self.active_kind != kind {
            tracing::info!("Switched backend {} -> {}", self.active_kind, kind);
        }
        self.active_kind = kind;
        self.active = Arc::clone(&backend);
        Ok(backend)
    }

    pub fn active_kind(&self) -> BackendKind {
        self.active_kind
    }

    pub fn active_backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.active)
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    /// Configured kinds, in declaration order.
    pub fn available(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }

    /// Apply the memory flag to every backend so switching keeps the setting.
    pub fn set_memory_all(&self, enabled: bool) {
        for backend in self.backends() {
            backend.set_memory(enabled);
        }
    }

    /// Seed every backend with the same prior turns.
    pub fn set_history_all(&self, prior: &[Message]) {
        for backend in self.backends() {
            backend.set_history(prior);
        }
    }

    pub fn clear_history_all(&self) {
        for backend in self.backends() {
            backend.clear_history();
        }
    }
}
