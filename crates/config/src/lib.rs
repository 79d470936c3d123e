//! Configuration loading, validation, and management for MetricChat.
//!
//! Loads configuration from `~/.metricchat/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.metricchat/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Iteration budget and session-level limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consecutive parse/resolution failures tolerated before the session fails.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Overall wall-clock budget for a session. 0 disables it.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_session_timeout_secs() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_consecutive_failures: default_max_consecutive_failures(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// Retry/backoff policy shared by tool calls and provider streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the computed delay added as random jitter (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "{section}.multiplier must be >= 1.0"
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::ValidationError(format!(
                "{section}.jitter must be between 0.0 and 1.0"
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::ValidationError(format!(
                "{section}.max_backoff_ms must be >= initial_backoff_ms"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Hard wall-clock timeout per tool attempt.
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,

    /// Tool executions allowed in flight at once across all sessions
    /// sharing the loop. 0 means unbounded.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_max_concurrent() -> usize {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_tool_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider_name() -> String {
    "scripted".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            retry: RetryConfig::default(),
        }
    }
}

/// Working-context budget and ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_max_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_max_tokens: Option<usize>,

    /// Per-iteration decay applied to warm fragment relevance.
    #[serde(default = "default_recency_decay")]
    pub recency_decay: f64,

    /// Standing instructions injected as static facts.
    #[serde(default)]
    pub instructions: Vec<String>,
}

fn default_budget_tokens() -> usize {
    4096
}
fn default_recency_decay() -> f64 {
    0.85
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            static_max_tokens: None,
            warm_max_tokens: None,
            recency_decay: default_recency_decay(),
            instructions: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Capacity of the bounded progress-event channel.
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,
}

fn default_event_buffer() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    /// "memory" or "jsonl"
    #[serde(default = "default_snapshot_backend")]
    pub backend: String,

    /// Directory for JSONL session files. Defaults to `~/.metricchat/sessions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_snapshot_backend() -> String {
    "jsonl".into()
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            backend: default_snapshot_backend(),
            dir: None,
        }
    }
}

impl SnapshotsConfig {
    /// The JSONL directory, falling back to `~/.metricchat/sessions`.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

const SNAPSHOT_BACKENDS: &[&str] = &["memory", "jsonl"];

impl AppConfig {
    /// Load configuration from the default path (~/.metricchat/config.toml).
    ///
    /// Environment variables override file values:
    /// - `METRICCHAT_MAX_ITERATIONS`
    /// - `METRICCHAT_TOOL_TIMEOUT_MS`
    /// - `METRICCHAT_SNAPSHOT_DIR`
    /// - `METRICCHAT_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides and re-validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
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

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("METRICCHAT_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_override("METRICCHAT_MAX_ITERATIONS", &raw)?;
        }
        if let Some(raw) = lookup("METRICCHAT_TOOL_TIMEOUT_MS") {
            self.tools.timeout_ms = parse_override("METRICCHAT_TOOL_TIMEOUT_MS", &raw)?;
        }
        if let Some(dir) = lookup("METRICCHAT_SNAPSHOT_DIR") {
            self.snapshots.dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("METRICCHAT_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".metricchat")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.tools.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tools.timeout_ms must be greater than 0".into(),
            ));
        }
        self.tools.retry.validate("tools.retry")?;
        self.provider.retry.validate("provider.retry")?;

        if self.context.budget_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.budget_tokens must be greater than 0".into(),
            ));
        }
        if !(self.context.recency_decay > 0.0 && self.context.recency_decay <= 1.0) {
            return Err(ConfigError::ValidationError(
                "context.recency_decay must be in (0.0, 1.0]".into(),
            ));
        }
        if !SNAPSHOT_BACKENDS.contains(&self.snapshots.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "snapshots.backend must be one of {SNAPSHOT_BACKENDS:?}, got '{}'",
                self.snapshots.backend
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has an invalid value '{raw}'")))
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
