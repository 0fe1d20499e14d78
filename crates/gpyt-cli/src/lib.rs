#[path = "commands.rs"]
pub mod commands;
#[path = "theme.rs"]
pub mod theme;

pub use commands::{ellipsize, handle_command, CommandResult, LoadTarget};
pub use theme::Theme;
