//! Configuration types, read once from the environment at startup.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::channels::cli::{CLI_CHANNEL_ID, CLI_TRANSCRIPT_AUTHOR};
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::tutor::TutorConfig;

/// Default max output tokens per generation.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Default directory holding the four prompt files.
pub const DEFAULT_PROMPT_DIR: &str = "prompts";

/// Which messaging platform to connect to.
#[derive(Debug, Clone)]
pub enum ChannelConfig {
    Discord { bot_token: SecretString },
    /// Local stdin/stdout REPL.
    Cli,
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub tutor: TutorConfig,
    pub llm: LlmConfig,
    pub prompt_dir: PathBuf,
}

impl AppConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let channel = match get("DISCORD_BOT_TOKEN") {
            Some(token) => ChannelConfig::Discord {
                bot_token: SecretString::from(token),
            },
            None => ChannelConfig::Cli,
        };

        let watch_channel_id = match (&channel, get("WATCH_CHANNEL_ID")) {
            (_, Some(id)) => id,
            (ChannelConfig::Cli, None) => CLI_CHANNEL_ID.to_string(),
            (ChannelConfig::Discord { .. }, None) => {
                return Err(ConfigError::MissingEnvVar("WATCH_CHANNEL_ID".to_string()));
            }
        };

        // "0" means "same as the watched channel".
        let output_channel_id = get("OUTPUT_CHANNEL_ID")
            .filter(|id| id != "0")
            .unwrap_or_else(|| watch_channel_id.clone());

        // On the CLI only `@file` lines are transcripts.
        let transcript_source_id = match (&channel, get("TRANSCRIPT_BOT_ID")) {
            (_, Some(id)) => Some(id),
            (ChannelConfig::Cli, None) => Some(CLI_TRANSCRIPT_AUTHOR.to_string()),
            (ChannelConfig::Discord { .. }, None) => None,
        };

        let tutor = TutorConfig {
            watch_channel_id,
            output_channel_id,
            transcript_source_id,
        };

        let backend: LlmBackend = match get("LLM_BACKEND") {
            Some(s) => s.parse()?,
            None => LlmBackend::Anthropic,
        };

        let api_key = get(backend.api_key_var())
            .ok_or_else(|| ConfigError::MissingEnvVar(backend.api_key_var().to_string()))?;

        let model = get("CLAUDE_MODEL")
            .or_else(|| get("LLM_MODEL"))
            .unwrap_or_else(|| backend.default_model().to_string());

        let max_tokens = match get("MAX_TOKENS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "MAX_TOKENS".to_string(),
                    message: format!("expected a positive integer, got '{raw}'"),
                })?,
            None => DEFAULT_MAX_TOKENS,
        };

        let prompt_dir = get("PROMPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_DIR));

        Ok(Self {
            channel,
            tutor,
            llm: LlmConfig {
                backend,
                api_key: SecretString::from(api_key),
                model,
                max_tokens,
            },
            prompt_dir,
        })
    }
}
