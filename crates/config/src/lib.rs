//! Configuration loading and validation for reagent.
//!
//! Loads configuration from `$REAGENT_CONFIG` or `~/.reagent/config.toml`
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default model when a command does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Concurrency limiter size (simultaneous invocations)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Overall deadline per invocation, covering every retry and tool call
    #[serde(default = "default_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// ReAct loop limits
    #[serde(default, rename = "loop")]
    pub react: LoopConfig,

    /// Context window sizing
    #[serde(default)]
    pub context: ContextConfig,

    /// Model-call retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retrieval-augmented context
    #[serde(default)]
    pub rag: RagConfig,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_concurrent() -> usize {
    16
}
fn default_timeout_secs() -> u64 {
    120
}

/// Longest accepted `execution_timeout_secs` (one day).
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Hard ceiling on tool calls per invocation
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
}

fn default_max_tool_calls() -> u32 {
    10
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,

    /// Reserved for the model's reply
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_max_context_tokens() -> u32 {
    128_000
}
fn default_max_output_tokens() -> u32 {
    4096
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter fraction applied to each delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_jitter() -> f64 {
    0.25
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Header that delimits retrieved text inside the system prompt
    #[serde(default = "default_rag_header")]
    pub header: String,
}

fn default_true() -> bool {
    true
}
fn default_rag_header() -> String {
    "## Retrieved Context".into()
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_rag_header(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default location, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("REAGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&path)?;

        if let Ok(model) = std::env::var("REAGENT_MODEL") {
            config.default_model = model;
        }
        if let Some(v) = env_parse::<u32>("REAGENT_MAX_TOOL_CALLS")? {
            config.react.max_tool_calls = v;
        }
        if let Some(v) = env_parse::<u64>("REAGENT_TIMEOUT_SECS")? {
            config.execution_timeout_secs = v;
        }
        if let Some(v) = env_parse::<usize>("REAGENT_MAX_CONCURRENT")? {
            config.max_concurrent_executions = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".reagent")
    }

    /// The invocation deadline, capped at [`MAX_EXECUTION_TIMEOUT_SECS`].
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs.min(MAX_EXECUTION_TIMEOUT_SECS))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_executions must be > 0".into(),
            ));
        }
        if self.execution_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "execution_timeout_secs must be > 0".into(),
            ));
        }
        if self.execution_timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError(format!(
                "execution_timeout_secs must be <= {MAX_EXECUTION_TIMEOUT_SECS}"
            )));
        }
        if self.context.max_output_tokens >= self.context.max_context_tokens {
            return Err(ConfigError::ValidationError(
                "context.max_output_tokens must be smaller than context.max_context_tokens".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be >= 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::ValidationError(
                "retry.jitter must be in [0.0, 1.0)".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_ms must be >= retry.initial_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            max_concurrent_executions: default_max_concurrent(),
            execution_timeout_secs: default_timeout_secs(),
            react: LoopConfig::default(),
            context: ContextConfig::default(),
            retry: RetryConfig::default(),
            rag: RagConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| {
                ConfigError::ValidationError(format!("{key} has an invalid value: {raw}"))
            }),
        Err(_) => Ok(None),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.react.max_tool_calls, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.execution_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn config_roundtrip_toml() {
        let toml_str = EngineConfig::default_toml();
        let parsed = EngineConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.default_model, "gpt-4o-mini");
        assert_eq!(parsed.context.max_context_tokens, 128_000);
    }

    #[test]
    fn partial_toml_uses_section_defaults() {
        let config = EngineConfig::from_toml(
            r#"
execution_timeout_secs = 30

[loop]
max_tool_calls = 2

[retry]
max_attempts = 5
"#,
        )
        .unwrap();
        assert_eq!(config.execution_timeout_secs, 30);
        assert_eq!(config.react.max_tool_calls, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.context.max_output_tokens, 4096);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = EngineConfig {
            default_temperature: 5.0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn output_reserve_must_fit_context() {
        let mut config = EngineConfig::default();
        config.context.max_context_tokens = 1000;
        config.context.max_output_tokens = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut config = EngineConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unbounded_timeout_rejected_and_capped() {
        let config = EngineConfig {
            execution_timeout_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            config.execution_timeout(),
            Duration::from_secs(MAX_EXECUTION_TIMEOUT_SECS)
        );
    }

    #[test]
    fn nan_jitter_rejected() {
        let mut config = EngineConfig::default();
        config.retry.jitter = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = EngineConfig::from_toml("max_concurrent_executions = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = EngineConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().max_concurrent_executions, 16);
    }
}
