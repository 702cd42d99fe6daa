//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Every field has a serde default, so a partial file
//! (or no file at all) yields a complete, valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model identifier passed to the completion API
    #[serde(default = "default_model")]
    pub model: String,

    /// System prompt placed first in every context window
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,

    /// Priority request queue limits
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry, circuit breaker and recovery settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Context window and token budget settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Turn orchestration settings
    #[serde(default)]
    pub turn: TurnConfig,
}

fn default_model() -> String {
    "gpt-4o".into()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the user.".into()
}
fn default_temperature() -> f32 {
    0.7
}

// ── Queue ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Tasks allowed to execute at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Pending tasks allowed before `enqueue` fails with "queue full"
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Dispatches allowed per rate window
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_window: usize,

    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    /// Per-task execution timeout
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries granted when the caller does not specify
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,

    /// Backoff schedule indexed by retry attempt; the last entry repeats
    #[serde(default = "default_queue_retry_delays")]
    pub retry_delays_ms: Vec<u64>,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_queue_size() -> usize {
    100
}
fn default_rate_limit() -> usize {
    10
}
fn default_rate_window_ms() -> u64 {
    1_000
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}
fn default_queue_max_retries() -> u32 {
    3
}
fn default_queue_retry_delays() -> Vec<u64> {
    vec![1_000, 2_000, 4_000]
}

impl QueueConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before the given retry (0-based), clamped to the last entry.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        clamped_delay(&self.retry_delays_ms, attempt)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            rate_limit_per_window: default_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
            timeout_ms: default_queue_timeout_ms(),
            max_retries: default_queue_max_retries(),
            retry_delays_ms: default_queue_retry_delays(),
        }
    }
}

// ── Reliability ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Consecutive failures that open a circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit blocks before allowing a probe
    #[serde(default = "default_breaker_timeout_ms")]
    pub breaker_timeout_ms: u64,

    /// Backoff table for `retry`, indexed by attempt and clamped
    #[serde(default = "default_reliability_retry_delays")]
    pub retry_delays_ms: Vec<u64>,

    /// Storage slot holding the recovery snapshot
    #[serde(default = "default_recovery_key")]
    pub recovery_key: String,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_breaker_timeout_ms() -> u64 {
    60_000
}
fn default_reliability_retry_delays() -> Vec<u64> {
    vec![1_000, 2_000, 4_000, 8_000]
}
fn default_recovery_key() -> String {
    "parley.recovery".into()
}

impl ReliabilityConfig {
    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_timeout_ms)
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            breaker_timeout_ms: default_breaker_timeout_ms(),
            retry_delays_ms: default_reliability_retry_delays(),
            recovery_key: default_recovery_key(),
        }
    }
}

// ── Context ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Most recent messages kept verbatim in the context window
    #[serde(default = "default_recent_count")]
    pub recent_count: usize,

    /// Message count at which periodic summarization starts
    #[serde(default = "default_summarize_threshold")]
    pub summarize_threshold: usize,

    /// Hard ceiling for a request (messages + tool definitions)
    #[serde(default = "default_max_context_tokens")]
    pub max_tokens: usize,

    /// Headroom kept free for the completion when history must be dropped
    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: usize,

    /// Per-message cap for tool output on the first compression pass
    #[serde(default = "default_tool_output_cap")]
    pub tool_output_cap: usize,

    /// Per-message cap for tool output on the second pass
    #[serde(default = "default_aggressive_tool_output_cap")]
    pub aggressive_tool_output_cap: usize,
}

fn default_recent_count() -> usize {
    10
}
fn default_summarize_threshold() -> usize {
    20
}
fn default_max_context_tokens() -> usize {
    100_000
}
fn default_reserved_tokens() -> usize {
    4_096
}
fn default_tool_output_cap() -> usize {
    2_000
}
fn default_aggressive_tool_output_cap() -> usize {
    500
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recent_count: default_recent_count(),
            summarize_threshold: default_summarize_threshold(),
            max_tokens: default_max_context_tokens(),
            reserved_tokens: default_reserved_tokens(),
            tool_output_cap: default_tool_output_cap(),
            aggressive_tool_output_cap: default_aggressive_tool_output_cap(),
        }
    }
}

// ── Turn ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Queue priority for completion requests
    #[serde(default = "default_llm_priority")]
    pub llm_priority: i32,

    /// Queue priority for tool calls
    #[serde(default = "default_tool_priority")]
    pub tool_priority: i32,

    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,

    #[serde(default = "default_tool_max_retries")]
    pub tool_max_retries: u32,

    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// Characters revealed per chunk
    #[serde(default = "default_reveal_chunk_chars")]
    pub reveal_chunk_chars: usize,

    /// Delay between revealed chunks
    #[serde(default = "default_reveal_interval_ms")]
    pub reveal_interval_ms: u64,

    /// Longest accepted user input, in characters
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Tool-call rounds allowed before the turn is finalized
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

fn default_llm_priority() -> i32 {
    10
}
fn default_tool_priority() -> i32 {
    5
}
fn default_llm_max_retries() -> u32 {
    3
}
fn default_tool_max_retries() -> u32 {
    1
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_reveal_chunk_chars() -> usize {
    3
}
fn default_reveal_interval_ms() -> u64 {
    15
}
fn default_max_input_chars() -> usize {
    32_000
}
fn default_max_tool_rounds() -> u32 {
    25
}

impl TurnConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn reveal_interval(&self) -> Duration {
        Duration::from_millis(self.reveal_interval_ms)
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            llm_priority: default_llm_priority(),
            tool_priority: default_tool_priority(),
            llm_max_retries: default_llm_max_retries(),
            tool_max_retries: default_tool_max_retries(),
            llm_timeout_ms: default_llm_timeout_ms(),
            tool_timeout_ms: default_tool_timeout_ms(),
            reveal_chunk_chars: default_reveal_chunk_chars(),
            reveal_interval_ms: default_reveal_interval_ms(),
            max_input_chars: default_max_input_chars(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

/// Pick `delays[attempt]`, repeating the last entry past the end.
fn clamped_delay(delays_ms: &[u64], attempt: u32) -> Duration {
    let idx = (attempt as usize).min(delays_ms.len().saturating_sub(1));
    Duration::from_millis(delays_ms.get(idx).copied().unwrap_or(0))
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `PARLEY_MODEL`
    /// - `PARLEY_SYSTEM_PROMPT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(model) = std::env::var("PARLEY_MODEL") {
            config.model = model;
        }

        if let Ok(prompt) = std::env::var("PARLEY_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
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

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_concurrent must be at least 1".into(),
            ));
        }

        if self.queue.rate_limit_per_window == 0 || self.queue.rate_window_ms == 0 {
            return Err(ConfigError::ValidationError(
                "queue rate limit and window must be > 0".into(),
            ));
        }

        if self.queue.retry_delays_ms.is_empty() || self.reliability.retry_delays_ms.is_empty() {
            return Err(ConfigError::ValidationError(
                "retry_delays_ms must list at least one delay".into(),
            ));
        }

        if self.reliability.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "reliability.failure_threshold must be at least 1".into(),
            ));
        }

        if self.context.reserved_tokens >= self.context.max_tokens {
            return Err(ConfigError::ValidationError(
                "context.reserved_tokens must be smaller than context.max_tokens".into(),
            ));
        }

        if self.context.aggressive_tool_output_cap > self.context.tool_output_cap {
            return Err(ConfigError::ValidationError(
                "context.aggressive_tool_output_cap must not exceed context.tool_output_cap".into(),
            ));
        }

        if self.turn.reveal_chunk_chars == 0 {
            return Err(ConfigError::ValidationError(
                "turn.reveal_chunk_chars must be at least 1".into(),
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

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            max_completion_tokens: None,
            queue: QueueConfig::default(),
            reliability: ReliabilityConfig::default(),
            context: ContextConfig::default(),
            turn: TurnConfig::default(),
        }
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
