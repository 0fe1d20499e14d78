pub mod conversation;
pub mod persistence;
pub mod store;

pub use conversation::{new_id, normalize_summary, Conversation, ConversationMessage};
pub use persistence::{ConversationArchive, LoadFailure, LoadReport};
pub use store::{ConversationStore, LoadOutcome, LOAD_FAILURE_ID};
