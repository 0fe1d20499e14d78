/// gpyt: centralized constants.
/// Prompts, model names, endpoints and tuning knobs live here.

// ─── Models ───────────────────────────────────────────────────────────────────

pub mod models {
    /// Default metered model.
    pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
    /// Alternate premium model (API key must have been granted access).
    pub const PREMIUM_MODEL: &str = "gpt-4";
    /// Keyless local model served by Ollama.
    pub const FREE_MODEL: &str = "llama3";

    pub const DEFAULT_CLAUDE_MODEL: &str = "claude-3-haiku-20240307";
    pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
    pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
    pub const DEFAULT_TOGETHER_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct-Turbo";
    pub const DEFAULT_OPENROUTER_MODEL: &str = "openai/gpt-4o-mini";
    pub const DEFAULT_LMSTUDIO_MODEL: &str = "local-model";
}

// ─── API Endpoints ────────────────────────────────────────────────────────────

pub mod endpoints {
    pub const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
    pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
    pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai";
    pub const TOGETHER_BASE_URL: &str = "https://api.together.xyz";
    pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
    pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";
    pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234";
    pub const ANTHROPIC_VERSION: &str = "2023-06-01";
}

// ─── Default Settings ─────────────────────────────────────────────────────────

pub mod defaults {
    /// Push a display update every Nth chunk while a response streams.
    pub const UPDATE_EVERY: usize = 10;
    /// Slice size used when faking a stream from a complete response.
    pub const FAKE_STREAM_CHUNK_CHARS: usize = 8;
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const MAX_TOKENS: u32 = 4096;
    /// Longest summary kept for a conversation, in words.
    pub const SUMMARY_MAX_WORDS: usize = 6;
    pub const SUMMARY_FALLBACK: &str = "User Question";
    pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
}

// ─── Prompts ──────────────────────────────────────────────────────────────────

pub mod prompts {
    pub const INTRO: &str = "Ask me anything. I'll try to assist you!";

    pub const SYSTEM_PROMPT: &str = "\
You are a helpful assistant. Be accurate and concise with your responses.
You are being used as a command-line tool by the user and you may be asked
technical/programming type questions.

Use basic Markdown syntax.

Use # for big ideas or ## for smaller ideas.

Use lists with \"*\" or \"1), 2), ... n)\" when it makes sense to list things (like stages or parts)

For intermediate to complex topics (like science, or large processes) only you should
summarize the user's question into less than four words, and
place them in a markdown header as the first line of your response.";

    pub const SUMMARY_PROMPT: &str = "Summarize the user's input in 6 words or less. \
Try to capture the big idea. DO NOT USE more than 6 words and DO NOT answer their question. \
Simply echo back to them your summary.";

    /// Used by backends without a system prompt: prepended to the user's text.
    pub const INLINE_SUMMARY_PREFIX: &str = "Summarize the following question in 6 words or less. \
Be concise and fully grasp the main idea of the question. If what follows is not a question \
just summarize the idea of the statement itself.\n";

    pub const API_ERROR_MESSAGE: &str = "\
❗ There was an error with the model provider.

# Diagnostics

Make sure that:
1) You have a valid API key exported (for example `OPENAI_API_KEY`)

2) Billing is configured for your provider account

3) You aren't being rate limited

Try Again Later.";

    pub const FREE_ERROR_MESSAGE: &str = "\
❗ There was an error with the local model server.

# Diagnostics

Make sure that:
1) Ollama is running (`ollama serve`) and reachable

2) The configured model has been pulled (`ollama pull <model>`)

Try Again Later.";
}

// ─── Config Paths ─────────────────────────────────────────────────────────────

pub mod paths {
    pub const CONFIG_DIR: &str = "gpyt";
    pub const CONFIG_FILE: &str = "config.toml";
    pub const CACHE_DIR_ENV: &str = "GPT_CACHE_DIR";
    pub const CONVERSATIONS_DIR: &str = "conversations";
    pub const RECORD_PREFIX: &str = "convo-";
    pub const LOG_FILE: &str = "gpyt.log";
}
