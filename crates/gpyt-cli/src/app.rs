use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use gpyt_core::constants::prompts;
use gpyt_core::session::BackendStatus;
use gpyt_core::{ChatSession, Conversation, GpytError, Role, TurnEvent};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, Wrap},
    Terminal,
};
use std::io::{self, Write};
use tokio::sync::mpsc;

use crate::commands::{self, ellipsize, CommandResult, LoadTarget};
use crate::theme::Theme;

const START_NEW_ENTRY: &str = "<-- Start a new conversation -->";
const BUSY_NOTICE: &str = "Still answering the previous message. Wait for it to finish.";

// ── Single-prompt mode ──────────────────────────────────────────────────

pub async fn run_single_prompt(session: &ChatSession, prompt: &str) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TurnEvent>();
    let turn = session.submit(prompt, event_tx)?;

    let mut stdout = io::stdout();
    let mut printed = 0usize;
    while let Some(event) = event_rx.recv().await {
        match event {
            TurnEvent::Update { content } => {
                print_new_suffix(&mut stdout, &content, &mut printed)?;
            }
            TurnEvent::Finished { message, .. } => {
                print_new_suffix(&mut stdout, &message.content, &mut printed)?;
                writeln!(stdout)?;
            }
            TurnEvent::Diagnostic(msg) => eprintln!("\n{msg}"),
            TurnEvent::Started { .. } => {}
        }
    }

    let outcome = turn.await?;
    if outcome.used_fallback {
        tracing::warn!("Response for {} used the fallback text", outcome.conversation_id);
    }
    Ok(())
}

/// Snapshots only grow, so print whatever lies past what is already shown.
fn print_new_suffix(out: &mut impl Write, content: &str, printed: &mut usize) -> io::Result<()> {
    if let Some(rest) = content.get(*printed..) {
        write!(out, "{rest}")?;
        out.flush()?;
        *printed = content.len();
    }
    Ok(())
}

// ── Interactive TUI ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum LineRole {
    User,
    Assistant,
    Notice,
    Error,
}

#[derive(Clone, Debug)]
struct ChatLine {
    role: LineRole,
    content: String,
}

/// One row of the past conversations panel.
#[derive(Clone, Debug, PartialEq)]
enum PastEntry {
    StartNew,
    Conversation { id: String, summary: String },
}

/// Work that needs the session, produced by key handling.
#[derive(Debug, PartialEq)]
enum Action {
    Submit(String),
    Command(CommandResult),
    OpenPast,
    SelectPast(PastEntry),
}

struct AppState {
    // Input
    input: String,
    cursor_pos: usize,

    // Chat
    messages: Vec<ChatLine>,
    scroll_offset: usize,
    /// Cleared when the user scrolls while a response streams in.
    follow_stream: bool,
    streaming_index: Option<usize>,

    // Turn
    is_processing: bool,
    status_text: String,

    // Conversation
    conversation_summary: Option<String>,
    conversation_id: Option<String>,

    // Past conversations panel
    show_past: bool,
    past_loaded: bool,
    past_entries: Vec<PastEntry>,
    past_selected: usize,

    backend: BackendStatus,
    theme: Theme,
    should_quit: bool,
}

impl AppState {
    fn new(backend: BackendStatus, theme_name: &str) -> Self {
        Self {
            input: String::new(),
            cursor_pos: 0,

            messages: vec![ChatLine {
                role: LineRole::Notice,
                content: format!(
                    "{}\nEnter to send. Ctrl+N past conversations. Ctrl+C to quit. /help for commands.",
                    prompts::INTRO
                ),
            }],
            scroll_offset: 0,
            follow_stream: true,
            streaming_index: None,

            is_processing: false,
            status_text: "Ready".into(),

            conversation_summary: None,
            conversation_id: None,

            show_past: false,
            past_loaded: false,
            past_entries: vec![PastEntry::StartNew],
            past_selected: 0,

            backend,
            theme: Theme::by_name(theme_name),
            should_quit: false,
        }
    }

    fn add_line(&mut self, role: LineRole, content: impl Into<String>) {
        self.messages.push(ChatLine {
            role,
            content: content.into(),
        });
        self.scroll_to_bottom();
    }

    fn notice(&mut self, content: impl Into<String>) {
        self.add_line(LineRole::Notice, content);
    }

    fn scroll_to_bottom(&mut self) {
        // Resolved on next draw
        self.scroll_offset = usize::MAX;
    }

    fn scroll_up(&mut self, lines: usize) {
        if self.is_processing {
            self.follow_stream = false;
        }
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
    }

    fn scroll_down(&mut self, lines: usize) {
        if self.is_processing {
            self.follow_stream = false;
        }
        self.scroll_offset = self.scroll_offset.saturating_add(lines);
    }

    /// Drop the displayed conversation, keeping only the intro line.
    fn reset_chat(&mut self) {
        self.messages.truncate(1);
        self.streaming_index = None;
        self.conversation_summary = None;
        self.conversation_id = None;
        self.scroll_offset = 0;
    }

    fn show_conversation(&mut self, conversation: &Conversation) {
        self.reset_chat();
        for message in &conversation.log {
            let role = match message.role {
                Role::User => LineRole::User,
                Role::Assistant => LineRole::Assistant,
                Role::System => continue,
            };
            self.add_line(role, message.content.clone());
        }
        self.conversation_summary = Some(conversation.summary.clone());
        self.conversation_id = Some(conversation.id.clone());
    }

    fn set_past_conversations(&mut self, past: &[Conversation]) {
        self.past_entries = std::iter::once(PastEntry::StartNew)
            .chain(past.iter().map(|c| PastEntry::Conversation {
                id: c.id.clone(),
                summary: c.summary.clone(),
            }))
            .collect();
        if self.past_selected >= self.past_entries.len() {
            self.past_selected = self.past_entries.len() - 1;
        }
    }

    // Input editing works in chars; these map the cursor to a byte offset.
    fn byte_index(&self, char_pos: usize) -> usize {
        self.input
            .char_indices()
            .nth(char_pos)
            .map(|(i, _)| i)
            .unwrap_or(self.input.len())
    }

    fn input_chars(&self) -> usize {
        self.input.chars().count()
    }

    fn insert_char(&mut self, c: char) {
        let at = self.byte_index(self.cursor_pos);
        self.input.insert(at, c);
        self.cursor_pos += 1;
    }

    fn take_input(&mut self) -> String {
        self.cursor_pos = 0;
        std::mem::take(&mut self.input)
    }
}

pub async fn run_tui(session: ChatSession, theme_name: &str) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut state = AppState::new(session.status(), theme_name);
    let result = event_loop(&mut terminal, &mut state, &session).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    state: &mut AppState,
    session: &ChatSession,
) -> Result<()> {
    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<TurnEvent>();

    loop {
        terminal.draw(|f| draw_ui(f, state))?;

        // Process turn events (non-blocking)
        let mut turn_finished = false;
        while let Ok(turn_event) = turn_rx.try_recv() {
            turn_finished |= handle_turn_event(state, turn_event);
        }
        if turn_finished {
            state.backend = session.status();
            state.set_past_conversations(&session.past_conversations());
        }

        // Handle keyboard input with timeout
        if event::poll(std::time::Duration::from_millis(33))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(action) = handle_key(state, key) {
                        perform_action(state, session, action, &turn_tx).await;
                    }
                }
            }
        }

        if state.should_quit {
            break;
        }
    }

    Ok(())
}

/// Apply one turn event to the display. Returns true when the turn is over.
fn handle_turn_event(state: &mut AppState, event: TurnEvent) -> bool {
    match event {
        TurnEvent::Started {
            conversation_id,
            summary,
            ..
        } => {
            state.conversation_summary = Some(summary);
            state.conversation_id = Some(conversation_id);
            state.add_line(LineRole::Assistant, String::new());
            state.streaming_index = Some(state.messages.len() - 1);
            state.follow_stream = true;
            state.status_text = "Receiving...".into();
            false
        }
        TurnEvent::Update { content } => {
            if let Some(line) = state.streaming_index.and_then(|i| state.messages.get_mut(i)) {
                line.content = content;
            }
            if state.follow_stream {
                state.scroll_to_bottom();
            }
            false
        }
        TurnEvent::Finished {
            message, saved_to, ..
        } => {
            if let Some(line) = state.streaming_index.and_then(|i| state.messages.get_mut(i)) {
                line.content = message.content;
            }
            state.streaming_index = None;
            state.is_processing = false;
            state.status_text = if saved_to.is_some() {
                "Saved".into()
            } else {
                "Ready".into()
            };
            if state.follow_stream {
                state.scroll_to_bottom();
            }
            true
        }
        TurnEvent::Diagnostic(msg) => {
            state.add_line(LineRole::Error, msg);
            false
        }
    }
}

async fn perform_action(
    state: &mut AppState,
    session: &ChatSession,
    action: Action,
    turn_tx: &mpsc::UnboundedSender<TurnEvent>,
) {
    match action {
        Action::Submit(input) => submit(state, session, input, turn_tx),
        Action::Command(result) => handle_command_result(state, session, result).await,
        Action::OpenPast => {
            ensure_past_loaded(state, session).await;
            state.show_past = true;
        }
        Action::SelectPast(PastEntry::StartNew) => {
            state.show_past = false;
            start_new_conversation(state, session).await;
        }
        Action::SelectPast(PastEntry::Conversation { id, .. }) => {
            state.show_past = false;
            resume_conversation(state, session, &id).await;
        }
    }
}

fn submit(
    state: &mut AppState,
    session: &ChatSession,
    input: String,
    turn_tx: &mpsc::UnboundedSender<TurnEvent>,
) {
    match session.submit(input.clone(), turn_tx.clone()) {
        Ok(_) => {
            state.add_line(LineRole::User, input);
            state.is_processing = true;
            state.follow_stream = true;
            state.status_text = "Sending...".into();
        }
        Err(GpytError::TurnInProgress) => state.notice(BUSY_NOTICE),
        Err(e) => state.add_line(LineRole::Error, format!("Error: {e}")),
    }
}

async fn ensure_past_loaded(state: &mut AppState, session: &ChatSession) {
    if !state.past_loaded {
        match session.load_persisted_conversations().await {
            Ok(outcome) => {
                if !outcome.failures.is_empty() {
                    state.add_line(
                        LineRole::Error,
                        format!("Skipped {} unreadable conversation file(s).", outcome.failures.len()),
                    );
                }
                tracing::debug!("Listed {} saved conversations", outcome.added);
            }
            Err(e) => state.add_line(LineRole::Error, format!("Could not load conversations: {e}")),
        }
        state.past_loaded = true;
    }
    state.set_past_conversations(&session.past_conversations());
}

async fn start_new_conversation(state: &mut AppState, session: &ChatSession) {
    match session.start_new_conversation().await {
        Ok(saved) => {
            state.reset_chat();
            match saved {
                Some(path) => state.notice(format!(
                    "Previous conversation saved to {}. New conversation started.",
                    path.display()
                )),
                None => state.notice("New conversation started."),
            }
        }
        Err(GpytError::TurnInProgress) => state.notice(BUSY_NOTICE),
        Err(e) => {
            // The in-memory conversation was still closed out.
            state.reset_chat();
            state.add_line(LineRole::Error, format!("Could not save conversation: {e}"));
        }
    }
    state.backend = session.status();
    state.set_past_conversations(&session.past_conversations());
}

async fn resume_conversation(state: &mut AppState, session: &ChatSession, id: &str) {
    match session.select_previous_conversation(id).await {
        Ok(conversation) => {
            state.show_conversation(&conversation);
            state.notice(format!("Resumed: {}", conversation.summary));
        }
        Err(GpytError::TurnInProgress) => state.notice(BUSY_NOTICE),
        Err(GpytError::ConversationNotFound(_)) => {
            state.add_line(LineRole::Error, "That conversation is not available.")
        }
        Err(e) => state.add_line(LineRole::Error, format!("Could not resume: {e}")),
    }
    state.backend = session.status();
    state.set_past_conversations(&session.past_conversations());
}

/// Map a `/load` argument onto a listed conversation id.
fn resolve_load_target(past: &[Conversation], target: &LoadTarget) -> Result<String, String> {
    match target {
        LoadTarget::Index(n) => past
            .get(n - 1)
            .map(|c| c.id.clone())
            .ok_or_else(|| format!("No conversation #{n}. See /history.")),
        LoadTarget::Id(prefix) => {
            if let Some(exact) = past.iter().find(|c| &c.id == prefix) {
                return Ok(exact.id.clone());
            }
            let matches: Vec<&Conversation> =
                past.iter().filter(|c| c.id.starts_with(prefix.as_str())).collect();
            match matches.as_slice() {
                [one] => Ok(one.id.clone()),
                [] => Err(format!("No conversation matching '{prefix}'.")),
                _ => Err(format!("'{prefix}' matches {} conversations.", matches.len())),
            }
        }
    }
}

fn format_history(past: &[Conversation]) -> String {
    if past.is_empty() {
        return "No past conversations yet.".into();
    }
    let mut out = String::from("Past conversations (newest first):");
    for (i, convo) in past.iter().enumerate() {
        out.push_str(&format!("\n  {:>2}. {}  [{}]", i + 1, ellipsize(&convo.summary), convo.id));
    }
    out.push_str("\nUse /load <n|id> to resume.");
    out
}

fn format_cost(status: &BackendStatus) -> String {
    let mut out = format!("{} ({})", status.name, status.model);
    match &status.usage {
        Some(usage) => {
            out.push_str(&format!(
                "\n  tokens: {} in / {} out\n  estimated cost: ${:.4}",
                format_tokens(usage.input_tokens),
                format_tokens(usage.output_tokens),
                usage.estimated_cost
            ));
            match usage.context_limit {
                Some(limit) => out.push_str(&format!(
                    "\n  context: {} / {}",
                    format_tokens(usage.context_tokens),
                    format_tokens(limit)
                )),
                None => out.push_str(&format!("\n  context: {}", format_tokens(usage.context_tokens))),
            }
        }
        None => out.push_str("\n  This backend does not track usage."),
    }
    out
}

async fn handle_command_result(
    state: &mut AppState,
    session: &ChatSession,
    result: CommandResult,
) {
    match result {
        CommandResult::Message(msg) => state.notice(msg),
        CommandResult::Quit => state.should_quit = true,
        CommandResult::NewConversation => start_new_conversation(state, session).await,
        CommandResult::ListConversations => {
            ensure_past_loaded(state, session).await;
            state.notice(format_history(&session.past_conversations()));
        }
        CommandResult::LoadConversation(target) => {
            ensure_past_loaded(state, session).await;
            match resolve_load_target(&session.past_conversations(), &target) {
                Ok(id) => resume_conversation(state, session, &id).await,
                Err(msg) => state.notice(msg),
            }
        }
        CommandResult::SwitchBackend(kind) => match session.select_backend(kind) {
            Ok(()) => {
                state.backend = session.status();
                state.notice(format!(
                    "Now using {} ({}).",
                    state.backend.name, state.backend.model
                ));
            }
            Err(e) => state.add_line(LineRole::Error, format!("Cannot switch to {kind}: {e}")),
        },
        CommandResult::SetMemory(enabled) => {
            session.set_memory(enabled);
            state.backend = session.status();
            state.notice(if enabled {
                "Memory on: earlier turns are sent as context."
            } else {
                "Memory off: each message is sent on its own."
            });
        }
        CommandResult::ShowCost => {
            state.backend = session.status();
            state.notice(format_cost(&state.backend));
        }
        CommandResult::SaveConversation => match session.save_active().await {
            Ok(Some(path)) => {
                state.notice(format!("Saved to {}", path.display()));
                state.set_past_conversations(&session.past_conversations());
            }
            Ok(None) => state.notice("Nothing to save yet."),
            Err(e) => state.add_line(LineRole::Error, format!("Could not save: {e}")),
        },
        CommandResult::ThemeChanged(name) => match Theme::find(&name) {
            Some(theme) => {
                state.theme = theme;
                state.notice(format!("Theme changed to: {}", state.theme.name));
            }
            None => state.notice(format!(
                "Unknown theme '{name}'. Options: {}",
                Theme::all_names().join(", ")
            )),
        },
        CommandResult::NotACommand => {}
    }
}

// ── Key handling ────────────────────────────────────────────────────────

fn handle_key(state: &mut AppState, key: KeyEvent) -> Option<Action> {
    match (key.modifiers, key.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
            state.should_quit = true;
            return None;
        }
        (KeyModifiers::CONTROL, KeyCode::Char('n')) => {
            if state.show_past {
                state.show_past = false;
                return None;
            }
            return Some(Action::OpenPast);
        }
        _ => {}
    }

    if state.show_past {
        return handle_past_key(state, key);
    }

    match (key.modifiers, key.code) {
        // Submit input
        (_, KeyCode::Enter) => {
            if state.input.trim().is_empty() {
                state.take_input();
                return None;
            }
            let input = state.take_input();
            return match commands::handle_command(&input) {
                CommandResult::NotACommand => Some(Action::Submit(input)),
                other => Some(Action::Command(other)),
            };
        }

        // Input editing
        (_, KeyCode::Backspace) => {
            if state.cursor_pos > 0 {
                state.cursor_pos -= 1;
                let at = state.byte_index(state.cursor_pos);
                state.input.remove(at);
            }
        }
        (_, KeyCode::Delete) => {
            if state.cursor_pos < state.input_chars() {
                let at = state.byte_index(state.cursor_pos);
                state.input.remove(at);
            }
        }
        (_, KeyCode::Left) => {
            state.cursor_pos = state.cursor_pos.saturating_sub(1);
        }
        (_, KeyCode::Right) => {
            if state.cursor_pos < state.input_chars() {
                state.cursor_pos += 1;
            }
        }
        (KeyModifiers::CONTROL, KeyCode::Char('a')) | (_, KeyCode::Home) => {
            state.cursor_pos = 0;
        }
        (KeyModifiers::CONTROL, KeyCode::Char('e')) | (_, KeyCode::End) => {
            state.cursor_pos = state.input_chars();
        }
        (KeyModifiers::CONTROL, KeyCode::Char('u')) => {
            let at = state.byte_index(state.cursor_pos);
            state.input.drain(..at);
            state.cursor_pos = 0;
        }

        // Scroll
        (_, KeyCode::Up) => state.scroll_up(1),
        (_, KeyCode::Down) => state.scroll_down(1),
        (_, KeyCode::PageUp) => state.scroll_up(20),
        (_, KeyCode::PageDown) => state.scroll_down(20),

        // Regular character input
        (m, KeyCode::Char(c)) if !m.contains(KeyModifiers::CONTROL) => state.insert_char(c),

        _ => {}
    }
    None
}

fn handle_past_key(state: &mut AppState, key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Esc => state.show_past = false,
        KeyCode::Up | KeyCode::Char('k') => {
            state.past_selected = state.past_selected.saturating_sub(1);
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if state.past_selected + 1 < state.past_entries.len() {
                state.past_selected += 1;
            }
        }
        KeyCode::Enter => {
            return state
                .past_entries
                .get(state.past_selected)
                .cloned()
                .map(Action::SelectPast);
        }
        _ => {}
    }
    None
}

// ── Drawing ─────────────────────────────────────────────────────────────

fn draw_ui(f: &mut ratatui::Frame, state: &mut AppState) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(5),    // chat
            Constraint::Length(3), // input
            Constraint::Length(1), // status
        ])
        .split(f.area());

    let chat_area = if state.show_past {
        let h_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Length(40), Constraint::Min(40)])
            .split(main_chunks[0]);

        draw_past_panel(f, h_chunks[0], state);
        h_chunks[1]
    } else {
        main_chunks[0]
    };

    draw_chat(f, chat_area, state);
    draw_input(f, main_chunks[1], state);
    draw_status_bar(f, main_chunks[2], state);
}

fn draw_chat(f: &mut ratatui::Frame, area: Rect, state: &mut AppState) {
    let theme = &state.theme;
    let chat_lines = build_chat_lines(&state.messages, state.streaming_index, state.is_processing, theme);
    let total_lines = chat_lines.len();
    let visible_height = area.height.saturating_sub(2) as usize;

    let max_scroll = total_lines.saturating_sub(visible_height);
    if state.scroll_offset == usize::MAX || state.scroll_offset > max_scroll {
        state.scroll_offset = max_scroll;
    }

    let title = match (&state.conversation_summary, &state.conversation_id) {
        (Some(summary), Some(id)) => format!(" {summary} ({}) ", short_id(id)),
        _ => " gpyt ".to_string(),
    };

    let chat = Paragraph::new(Text::from(chat_lines))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(theme.border)),
        )
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset as u16, 0));
    f.render_widget(chat, area);

    if total_lines > visible_height {
        let mut scrollbar_state = ScrollbarState::new(max_scroll).position(state.scroll_offset);
        f.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight)
                .begin_symbol(Some("^"))
                .end_symbol(Some("v")),
            area,
            &mut scrollbar_state,
        );
    }
}

fn draw_past_panel(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let theme = &state.theme;
    let lines: Vec<Line> = state
        .past_entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let label = match entry {
                PastEntry::StartNew => START_NEW_ENTRY.to_string(),
                PastEntry::Conversation { summary, .. } => ellipsize(summary),
            };
            let mut style = match entry {
                PastEntry::StartNew => Style::default().fg(theme.accent),
                PastEntry::Conversation { .. } => Style::default().fg(theme.fg),
            };
            if i == state.past_selected {
                style = style.bg(theme.selection).add_modifier(Modifier::BOLD);
            }
            Line::from(Span::styled(format!(" {label}"), style))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Past Conversations ")
        .title_bottom(" Enter select  Esc close ")
        .border_style(Style::default().fg(theme.accent));

    // Keep the selection in view.
    let visible = area.height.saturating_sub(2) as usize;
    let offset = (state.past_selected + 1).saturating_sub(visible);

    f.render_widget(
        Paragraph::new(lines).block(block).scroll((offset as u16, 0)),
        area,
    );
}

fn render_message_lines<'a>(msg: &'a ChatLine, theme: &'a Theme) -> Vec<Line<'a>> {
    let mut lines: Vec<Line> = Vec::new();

    let (prefix, color) = match msg.role {
        LineRole::User => ("You > ", theme.user_color),
        LineRole::Assistant => ("AI > ", theme.assistant_color),
        LineRole::Notice => ("", theme.notice_color),
        LineRole::Error => ("! ", theme.error),
    };
    let indent = " ".repeat(prefix.len());
    let do_code_detection = msg.role == LineRole::Assistant;

    let mut in_code_block = false;
    for (i, raw_line) in msg.content.lines().enumerate() {
        let lead = if i == 0 {
            Span::styled(prefix, Style::default().fg(color).add_modifier(Modifier::BOLD))
        } else {
            Span::raw(indent.clone())
        };

        if do_code_detection && raw_line.starts_with("```") {
            in_code_block = !in_code_block;
            lines.push(Line::from(vec![
                lead,
                Span::styled(raw_line, Style::default().fg(theme.muted)),
            ]));
            continue;
        }

        let style = if in_code_block {
            Style::default().fg(theme.code_fg)
        } else {
            Style::default().fg(color)
        };
        lines.push(Line::from(vec![lead, Span::styled(raw_line, style)]));
    }

    if msg.content.is_empty() {
        lines.push(Line::from(Span::styled(
            prefix,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
    }

    lines
}

fn build_chat_lines<'a>(
    messages: &'a [ChatLine],
    streaming_index: Option<usize>,
    is_processing: bool,
    theme: &'a Theme,
) -> Vec<Line<'a>> {
    let mut chat_lines: Vec<Line> = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        if Some(i) == streaming_index && msg.content.is_empty() {
            continue;
        }
        chat_lines.extend(render_message_lines(msg, theme));
        chat_lines.push(Line::raw(""));
    }

    let waiting = match streaming_index {
        Some(i) => messages.get(i).is_some_and(|m| m.content.is_empty()),
        None => is_processing,
    };
    if waiting {
        chat_lines.push(Line::from(Span::styled(
            "  Thinking...",
            Style::default().fg(theme.accent).add_modifier(Modifier::DIM),
        )));
    }

    chat_lines
}

fn draw_input(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let theme = &state.theme;
    let title = if state.is_processing {
        " Input (receiving...) "
    } else if state.input.starts_with('/') {
        " Command "
    } else {
        " Input "
    };

    let input = Paragraph::new(state.input.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(if state.input.starts_with('/') {
                    theme.accent
                } else {
                    theme.border
                })),
        )
        .style(Style::default().fg(theme.fg));
    f.render_widget(input, area);

    if !state.show_past {
        let cursor_x = area.x + state.cursor_pos as u16 + 1;
        let max_x = area.x + area.width.saturating_sub(2);
        f.set_cursor_position((cursor_x.min(max_x), area.y + 1));
    }
}

fn draw_status_bar(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let theme = &state.theme;
    let backend = &state.backend;

    let usage_str = match &backend.usage {
        Some(u) if u.input_tokens > 0 || u.output_tokens > 0 => format!(
            "| {}in/{}out ${:.4} ",
            format_tokens(u.input_tokens),
            format_tokens(u.output_tokens),
            u.estimated_cost
        ),
        _ => String::new(),
    };

    let conversation_str = match (&state.conversation_summary, &state.conversation_id) {
        (Some(summary), Some(id)) => format!("| {} ({}) ", ellipsize(summary), short_id(id)),
        _ => String::new(),
    };

    let status_spans = vec![
        Span::styled(
            format!(" {} ", backend.name),
            Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!("| {} ", backend.model), Style::default().fg(theme.accent)),
        Span::styled(
            format!("| memory {} ", if backend.memory { "on" } else { "off" }),
            Style::default().fg(theme.muted),
        ),
        Span::styled(usage_str, Style::default().fg(theme.warning)),
        Span::styled(conversation_str, Style::default().fg(theme.muted)),
        Span::styled("| ", Style::default().fg(theme.muted)),
        Span::styled(state.status_text.as_str(), Style::default().fg(theme.muted)),
    ];
    f.render_widget(Paragraph::new(Line::from(status_spans)), area);
}

// ── Helper functions ────────────────────────────────────────────────────

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
