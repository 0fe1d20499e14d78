mod assembler;
mod turn;

pub use assembler::{AssemblyState, StreamAssembler};
pub use turn::{BackendStatus, ChatSession, TurnEvent, TurnGuard, TurnOutcome};
