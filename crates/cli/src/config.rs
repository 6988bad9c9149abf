//! Configuration loading from helmsman.toml.

use mcp::ServerConfig;
use runtime::SessionConfig;
use runtime::providers::AnthropicAuth;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// External tool servers to connect at registry load.
    #[serde(default, rename = "tool_server")]
    pub tool_servers: Vec<ServerConfig>,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    /// Provider name (currently only "anthropic" supported).
    #[serde(default = "default_provider")]
    #[allow(dead_code)]
    pub provider: String,

    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Max output tokens per model call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Reasoning-token budget; omit to disable extended thinking.
    pub thinking_budget: Option<u32>,

    /// Standard Anthropic API key (sk-ant-api01-...).
    /// Mutually exclusive with oauth_token.
    pub api_key: Option<String>,

    /// Claude Code OAuth token (sk-ant-oat-...).
    /// Mutually exclusive with api_key.
    pub oauth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            thinking_budget: None,
            api_key: None,
            oauth_token: None,
        }
    }
}

/// Turn and dispatch limits.
#[derive(Debug, Deserialize)]
pub struct Limits {
    /// Max tool-round iterations per turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Per-call tool timeout, in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Dispatch concurrency ceiling.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// History window (entries) sent with each model call.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            tool_timeout_secs: default_tool_timeout_secs(),
            concurrency: default_concurrency(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    runtime::DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_tool_rounds() -> u32 {
    8
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_concurrency() -> usize {
    4
}

fn default_max_history() -> usize {
    40
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the authentication from config, falling back to the
    /// ANTHROPIC_API_KEY environment variable.
    pub fn auth(&self) -> Result<AnthropicAuth, ConfigError> {
        match (&self.backend.api_key, &self.backend.oauth_token) {
            (Some(key), None) => Ok(AnthropicAuth::ApiKey(key.clone())),
            (None, Some(token)) => Ok(AnthropicAuth::ClaudeCodeOauth(token.clone())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAuth),
            (None, None) => match std::env::var("ANTHROPIC_API_KEY") {
                Ok(key) => Ok(AnthropicAuth::ApiKey(key)),
                Err(_) => Err(ConfigError::MissingAuth),
            },
        }
    }

    /// The session configuration this config describes.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.backend.model.clone(),
            max_tokens: self.backend.max_tokens,
            thinking_budget: self.backend.thinking_budget,
            max_tool_rounds: self.limits.max_tool_rounds,
            tool_timeout: Duration::from_secs(self.limits.tool_timeout_secs),
            concurrency: self.limits.concurrency,
            max_history: self.limits.max_history,
            memory_enabled: self.memory.enabled,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error(
        "authentication not configured: set backend.api_key, backend.oauth_token, or ANTHROPIC_API_KEY"
    )]
    MissingAuth,

    #[error(
        "ambiguous authentication: set either backend.api_key OR backend.oauth_token, not both"
    )]
    AmbiguousAuth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            r#"
            [backend]
            model = "claude-opus-4-20250514"
            api_key = "sk-ant-test"
            thinking_budget = 1024

            [limits]
            max_tool_rounds = 3
            tool_timeout_secs = 10
            concurrency = 2

            [memory]
            enabled = true

            [[tool_server]]
            name = "filesystem"
            command = "mcp-filesystem"
            args = ["--root", "."]
            "#,
        )
        .unwrap();

        let session = config.session_config();
        assert_eq!(session.model, "claude-opus-4-20250514");
        assert_eq!(session.thinking_budget, Some(1024));
        assert_eq!(session.max_tool_rounds, 3);
        assert_eq!(session.tool_timeout, Duration::from_secs(10));
        assert_eq!(session.concurrency, 2);
        assert!(session.memory_enabled);

        assert_eq!(config.tool_servers.len(), 1);
        assert_eq!(config.tool_servers[0].name, "filesystem");
        assert!(matches!(config.auth().unwrap(), AnthropicAuth::ApiKey(_)));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        let session = config.session_config();
        assert_eq!(session.model, runtime::DEFAULT_MODEL);
        assert_eq!(session.max_tool_rounds, 8);
        assert!(!session.memory_enabled);
        assert!(config.tool_servers.is_empty());
    }

    #[test]
    fn both_auth_modes_is_an_error() {
        let config = Config::parse(
            r#"
            [backend]
            api_key = "a"
            oauth_token = "b"
            "#,
        )
        .unwrap();
        assert!(matches!(config.auth(), Err(ConfigError::AmbiguousAuth)));
    }
}
