use anyhow::Result;
use clap::Parser;
use gpyt_core::constants::paths;
use gpyt_core::{BackendKind, ChatSession, ConversationArchive, ConversationStore, Settings};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod app;
mod commands;
mod theme;

#[derive(Parser, Debug)]
#[command(name = "gpyt")]
#[command(about = "gpyt - chat with language models from your terminal")]
#[command(version)]
struct Cli {
    /// Use the free local model server (no API key needed)
    #[arg(long, conflicts_with_all = ["premium", "model", "provider"])]
    free: bool,

    /// Use the premium model
    #[arg(long, conflicts_with_all = ["model", "provider"])]
    premium: bool,

    /// Use an explicit model through the provider backend
    #[arg(short, long)]
    model: Option<String>,

    /// Provider for the provider backend (claude, openai, groq, together, openrouter, ollama, lmstudio)
    #[arg(long)]
    provider: Option<String>,

    /// Do not keep session history between turns
    #[arg(long)]
    no_memory: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Send a single prompt, stream the answer to stdout and exit
    #[arg(short, long)]
    prompt: Option<String>,

    /// Color theme (dark, light, dracula)
    #[arg(long, default_value = "dark")]
    theme: String,
}

impl Cli {
    /// Fold command-line overrides into the loaded settings.
    fn apply_to(&self, settings: &mut Settings) {
        if self.free {
            settings.backend.selection = BackendKind::Free;
        } else if self.premium {
            settings.backend.selection = BackendKind::Premium;
        }
        if let Some(ref provider) = self.provider {
            settings.backend.selection = BackendKind::Provider;
            settings.backend.provider = Some(provider.clone());
        }
        if let Some(ref model) = self.model {
            settings.backend.selection = BackendKind::Provider;
            settings.backend.provider_model = Some(model.clone());
        }
        if self.no_memory {
            settings.backend.memory = false;
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
        }
    }
}

/// Full-screen mode owns the terminal, so logs go to a file under the cache
/// root. Falls back to stderr if the file cannot be opened.
fn init_tracing(cli: &Cli, cache_root: &Path, interactive: bool) {
    if interactive {
        let log_file = std::fs::create_dir_all(cache_root).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(cache_root.join(paths::LOG_FILE))
        });
        if let Ok(file) = log_file {
            tracing_subscriber::fmt()
                .with_env_filter(cli.env_filter())
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(cli.env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load();
    cli.apply_to(&mut settings);

    let cache_root = settings.cache_root()?;
    init_tracing(&cli, &cache_root, cli.prompt.is_none());

    let router = match settings.build_router() {
        Ok(router) => router,
        Err(e) => {
            eprintln!("gpyt: {e}");
            eprintln!("Config file: {}", Settings::config_path().display());
            std::process::exit(2);
        }
    };
    tracing::info!("Starting with {} backend", router.active_kind());

    let store = ConversationStore::new(ConversationArchive::new(cache_root.clone()));
    let session =
        ChatSession::new(router, store).with_update_every(settings.stream.update_every);

    if let Some(prompt) = cli.prompt {
        app::run_single_prompt(&session, &prompt).await?;
    } else {
        app::run_tui(session, &cli.theme).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gpyt").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_free_flag_selects_free_backend() {
        let mut settings = Settings::default();
        parse(&["--free"]).apply_to(&mut settings);
        assert_eq!(settings.backend.selection, BackendKind::Free);
    }

    #[test]
    fn test_model_flag_routes_through_provider_backend() {
        let mut settings = Settings::default();
        parse(&["--model", "claude-3-haiku-20240307"]).apply_to(&mut settings);
        assert_eq!(settings.backend.selection, BackendKind::Provider);
        assert_eq!(
            settings.backend.provider_model.as_deref(),
            Some("claude-3-haiku-20240307")
        );
    }

    #[test]
    fn test_provider_and_model_combine() {
        let mut settings = Settings::default();
        parse(&["--provider", "groq", "--model", "llama-3.3-70b-versatile"]).apply_to(&mut settings);
        assert_eq!(settings.backend.selection, BackendKind::Provider);
        assert_eq!(settings.backend.provider.as_deref(), Some("groq"));
    }

    #[test]
    fn test_no_memory_flag() {
        let mut settings = Settings::default();
        parse(&["--no-memory"]).apply_to(&mut settings);
        assert!(!settings.backend.memory);
        assert_eq!(settings.backend.selection, BackendKind::Default);
    }

    #[test]
    fn test_backend_flags_are_mutually_exclusive() {
        let args = ["gpyt", "--free", "--premium"];
        assert!(Cli::try_parse_from(args).is_err());
        let args = ["gpyt", "--premium", "--model", "gpt-4o"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
