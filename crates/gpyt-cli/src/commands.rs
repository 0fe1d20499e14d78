use gpyt_core::BackendKind;

/// Summaries at or beyond this many characters are shortened in listings.
pub const ELLIPSIZE_CUTOFF: usize = 35;

/// How `/load` picks a past conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    /// 1-based position in the `/history` listing (newest first).
    Index(usize),
    /// Conversation id, or a unique prefix of one.
    Id(String),
}

/// Result of processing a line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Display a message to the user.
    Message(String),
    /// Quit the application.
    Quit,
    /// Save the current conversation and start a fresh one.
    NewConversation,
    /// List past conversations.
    ListConversations,
    /// Resume a past conversation.
    LoadConversation(LoadTarget),
    /// Route subsequent turns to another backend.
    SwitchBackend(BackendKind),
    /// Turn session history on or off for every backend.
    SetMemory(bool),
    /// Show token usage and estimated cost.
    ShowCost,
    /// Save the current conversation now.
    SaveConversation,
    /// Change the color theme.
    ThemeChanged(String),
    /// Not a command - send to the assistant.
    NotACommand,
}

pub fn handle_command(input: &str) -> CommandResult {
    let trimmed = input.trim();

    // Bare keywords start a new conversation instead of being sent.
    if matches!(trimmed.to_lowercase().as_str(), "new" | "clear") {
        return CommandResult::NewConversation;
    }
    if !trimmed.starts_with('/') {
        return CommandResult::NotACommand;
    }

    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let cmd = parts[0];
    let arg = parts.get(1).map(|s| s.trim()).unwrap_or("");

    match cmd {
        "/help" | "/h" => show_help(),
        "/exit" | "/quit" | "/q" => CommandResult::Quit,
        "/new" | "/clear" => CommandResult::NewConversation,
        "/history" | "/conversations" => CommandResult::ListConversations,
        "/save" => CommandResult::SaveConversation,
        "/cost" | "/status" => CommandResult::ShowCost,

        "/load" => {
            if arg.is_empty() {
                CommandResult::Message("Usage: /load <number|conversation-id>".into())
            } else {
                match arg.parse::<usize>() {
                    Ok(0) => CommandResult::Message("Conversation numbers start at 1.".into()),
                    Ok(n) => CommandResult::LoadConversation(LoadTarget::Index(n)),
                    Err(_) => CommandResult::LoadConversation(LoadTarget::Id(arg.to_string())),
                }
            }
        }

        "/backend" | "/model" => {
            let names = BackendKind::all()
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>()
                .join(", ");
            if arg.is_empty() {
                CommandResult::Message(format!("Available backends: {names}\nUsage: /backend <name>"))
            } else {
                match BackendKind::parse(arg) {
                    Some(kind) => CommandResult::SwitchBackend(kind),
                    None => CommandResult::Message(format!(
                        "Unknown backend '{arg}'. Options: {names}"
                    )),
                }
            }
        }

        "/memory" => match arg.to_lowercase().as_str() {
            "on" | "true" | "yes" => CommandResult::SetMemory(true),
            "off" | "false" | "no" => CommandResult::SetMemory(false),
            _ => CommandResult::Message("Usage: /memory <on|off>".into()),
        },

        "/theme" => {
            if arg.is_empty() {
                let themes = crate::theme::Theme::all_names().join(", ");
                CommandResult::Message(format!("Available themes: {themes}\nUsage: /theme <theme-name>"))
            } else {
                CommandResult::ThemeChanged(arg.to_string())
            }
        }

        "/version" => CommandResult::Message(format!("gpyt v{}", env!("CARGO_PKG_VERSION"))),

        _ => CommandResult::Message(format!("Unknown command: {cmd}. Type /help for commands.")),
    }
}

/// Shorten a conversation summary for list display.
pub fn ellipsize(summary: &str) -> String {
    if summary.chars().count() < ELLIPSIZE_CUTOFF {
        return summary.to_string();
    }
    let head: String = summary.chars().take(ELLIPSIZE_CUTOFF - 2).collect();
    format!("{head}...")
}

fn show_help() -> CommandResult {
    let help_text = "\
╭─ gpyt Commands ────────────────────────────────────────────────╮

  CONVERSATIONS
    new, clear                Start a fresh conversation
    /new, /clear              Same as above
    /history                  List past conversations
    /load <n|id>              Resume a past conversation
    /save                     Save the current conversation

  BACKEND
    /backend <name>           Switch backend (default, premium, free, provider)
    /memory <on|off>          Keep or drop session history between turns
    /cost                     Show token usage and estimated cost

  DISPLAY
    /theme <name>             Change color theme

  KEYS
    Ctrl+N                    Toggle past conversations panel
    Up / Down                 Scroll the conversation
    Esc                       Close the panel
    Ctrl+C                    Quit

  OTHER
    /help, /h                 Show this help message
    /version                  Show version information
    /exit, /quit, /q          Quit the application

╰────────────────────────────────────────────────────────────────╯";

    CommandResult::Message(help_text.into())
}
