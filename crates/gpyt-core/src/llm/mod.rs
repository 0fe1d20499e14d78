mod traits;
pub mod accounting;
pub mod chunking;
mod claude;
pub mod history;
mod openai;
mod ollama;
pub mod provider;
pub mod model_router;

pub use traits::*;
pub use accounting::{estimate_tokens, pricing_for, ModelPricing, UsageTracker};
pub use chunking::{chunked_stream, split_chunks};
pub use history::{ChatState, SessionHistory};
pub use openai::MeteredBackend;
pub use ollama::FreeBackend;
pub use provider::{ProviderBackend, ProviderConfig, ProviderId, ProviderRegistry};
pub use model_router::{BackendKind, ModelRouter};

use std::time::Duration;

/// HTTP client whose connect and per-read waits are bounded by `timeout`.
///
/// The bound is an idle limit, not a total one: a stream may run for as long
/// as the provider keeps sending. Timeouts surface as ordinary request errors.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}
