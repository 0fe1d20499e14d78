pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod llm;
pub mod session;

// Re-export key types
pub use config::Settings;
pub use context::{Conversation, ConversationArchive, ConversationMessage, ConversationStore};
pub use error::GpytError;
pub use llm::{Backend, BackendKind, ChunkStream, Message, ModelRouter, Role, StreamEvent};
pub use session::{ChatSession, StreamAssembler, TurnEvent};
