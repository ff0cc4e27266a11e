//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup; an invalid
//! configuration is a fatal initialization error.

use parley_core::{Importance, PermissionLevel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Primary chat backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Summarization settings (and optional cheaper backend)
    #[serde(default)]
    pub summarizer: SummarizerConfig,

    /// Sampling parameters for the primary backend
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Context window management
    #[serde(default)]
    pub context: ContextConfig,

    /// Session persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Tool execution
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Replaces the built-in system prompt when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

// --- Backend ---

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Type tag: openai | anthropic | local | mock | bedrock
    #[serde(default = "default_backend_kind")]
    pub kind: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Overrides the kind's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Per-call timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bounded retries for Network / RateLimited / ServiceUnavailable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_backend_kind() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            model: default_model(),
            api_key: None,
            api_url: None,
            region: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("region", &self.region)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish()
    }
}

// --- Summarizer ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Distinct summarizer backend; absent means the primary is reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendConfig>,

    #[serde(default = "default_max_input_messages")]
    pub max_input_messages: usize,

    /// Label each transcript line with importance and tags
    #[serde(default = "default_true")]
    pub include_metadata: bool,

    /// Ask the model to keep code blocks verbatim
    #[serde(default = "default_true")]
    pub preserve_code: bool,

    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,

    #[serde(default = "default_summary_max_tokens")]
    pub max_tokens: u32,

    /// Must contain `{{CONVERSATION}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    /// Run queued summaries on a background worker
    #[serde(default = "default_true")]
    pub async_mode: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

fn default_max_input_messages() -> usize {
    50
}
fn default_summary_temperature() -> f32 {
    0.3
}
fn default_summary_max_tokens() -> u32 {
    1024
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_max_queue_depth() -> usize {
    10
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            backend: None,
            max_input_messages: default_max_input_messages(),
            include_metadata: true,
            preserve_code: true,
            temperature: default_summary_temperature(),
            max_tokens: default_summary_max_tokens(),
            prompt_template: None,
            async_mode: true,
            poll_interval_ms: default_poll_interval_ms(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

// --- Sampling ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

// --- Context ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Token budget for one backend request
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// History length at which the oldest messages are trimmed
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Regexes that mark a message Critical
    #[serde(default = "default_critical_patterns")]
    pub critical_patterns: Vec<String>,

    /// Regexes that mark a message High
    #[serde(default = "default_important_patterns")]
    pub important_patterns: Vec<String>,

    /// Case-insensitive substrings that mark a message High
    #[serde(default = "default_high_priority_keywords")]
    pub high_priority_keywords: Vec<String>,

    /// Phrases in a user message that refer back to earlier sessions
    #[serde(default = "default_recall_phrases")]
    pub recall_phrases: Vec<String>,

    #[serde(default)]
    pub hierarchical: HierarchicalConfig,
}

fn default_max_context_tokens() -> usize {
    8000
}
fn default_max_messages() -> usize {
    200
}
fn default_critical_patterns() -> Vec<String> {
    vec![
        r"(?i)\b(urgent|critical|emergency|asap)\b".into(),
        r"(?i)\b(security (issue|hole|vulnerability)|data loss|production (is )?down)\b".into(),
        r"(?i)\bremember (this|that)\b".into(),
    ]
}
fn default_important_patterns() -> Vec<String> {
    vec![
        r"(?i)\b(must|shall|need to|needs to|have to|has to|required|requirement)\b".into(),
        r"(?i)\b(always|never|make sure|don't forget|do not)\b".into(),
    ]
}
fn default_high_priority_keywords() -> Vec<String> {
    ["important", "deadline", "error", "bug", "fix", "breaking"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_recall_phrases() -> Vec<String> {
    [
        "remember",
        "earlier",
        "previously",
        "last time",
        "we discussed",
        "you said",
        "our previous",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_context_tokens: default_max_context_tokens(),
            max_messages: default_max_messages(),
            allocation: AllocationConfig::default(),
            critical_patterns: default_critical_patterns(),
            important_patterns: default_important_patterns(),
            high_priority_keywords: default_high_priority_keywords(),
            recall_phrases: default_recall_phrases(),
            hierarchical: HierarchicalConfig::default(),
        }
    }
}

/// Percentages of the flat selection budget. Must sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub system: u32,
    pub recent: u32,
    pub summaries: u32,
    pub reserve: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            system: 10,
            recent: 60,
            summaries: 25,
            reserve: 5,
        }
    }
}

impl AllocationConfig {
    pub fn total(&self) -> u32 {
        self.system + self.recent + self.summaries + self.reserve
    }
}

/// One memory tier: a recency window, a share of the budget, and an
/// importance level that admits older messages regardless of age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub window_secs: u64,
    pub share: f32,
    pub threshold: Importance,
}

impl TierConfig {
    pub const fn new(window_secs: u64, share: f32, threshold: Importance) -> Self {
        Self {
            window_secs,
            share,
            threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_long_term")]
    pub long_term: TierConfig,

    #[serde(default = "default_medium_term")]
    pub medium_term: TierConfig,

    #[serde(default = "default_short_term")]
    pub short_term: TierConfig,

    #[serde(default = "default_immediate")]
    pub immediate: TierConfig,

    /// Recent non-system messages that trigger a summarization task
    #[serde(default = "default_auto_summarize_threshold")]
    pub auto_summarize_threshold: usize,
}

fn default_long_term() -> TierConfig {
    TierConfig::new(30 * 24 * 3600, 0.10, Importance::High)
}
fn default_medium_term() -> TierConfig {
    TierConfig::new(24 * 3600, 0.25, Importance::Medium)
}
fn default_short_term() -> TierConfig {
    TierConfig::new(3600, 0.30, Importance::Low)
}
fn default_immediate() -> TierConfig {
    TierConfig::new(300, 0.35, Importance::Low)
}
fn default_auto_summarize_threshold() -> usize {
    20
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            long_term: default_long_term(),
            medium_term: default_medium_term(),
            short_term: default_short_term(),
            immediate: default_immediate(),
            auto_summarize_threshold: default_auto_summarize_threshold(),
        }
    }
}

impl HierarchicalConfig {
    /// Tiers in selection order: long, medium, short, immediate.
    pub fn tiers(&self) -> [(&'static str, TierConfig); 4] {
        [
            ("long_term", self.long_term),
            ("medium_term", self.medium_term),
            ("short_term", self.short_term),
            ("immediate", self.immediate),
        ]
    }
}

// --- Persistence ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sessions_dir")]
    pub directory: PathBuf,

    /// zstd-compress session files
    #[serde(default = "default_true")]
    pub compress: bool,

    #[serde(default = "default_max_files")]
    pub max_files: usize,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,

    /// Load the most recently updated session on start
    #[serde(default = "default_true")]
    pub resume: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

fn default_sessions_dir() -> PathBuf {
    AppConfig::config_dir().join("sessions")
}
fn default_max_files() -> usize {
    50
}
fn default_max_age_days() -> u64 {
    30
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_sessions_dir(),
            compress: true,
            max_files: default_max_files(),
            max_age_days: default_max_age_days(),
            resume: true,
            session_name: None,
        }
    }
}

// --- Tools ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-turn ceiling on backend iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_enabled_categories")]
    pub enabled_categories: Vec<String>,

    /// Categories above this level cannot be enabled
    #[serde(default = "default_max_permission")]
    pub max_permission: PermissionLevel,

    /// Shell command timeout
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
}

fn default_max_iterations() -> usize {
    10
}
fn default_enabled_categories() -> Vec<String> {
    vec!["filesystem".into(), "search".into()]
}
fn default_max_permission() -> PermissionLevel {
    PermissionLevel::Execute
}
fn default_shell_timeout_secs() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_max_iterations(),
            enabled_categories: default_enabled_categories(),
            max_permission: default_max_permission(),
            shell_timeout_secs: default_shell_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Also checks environment variables:
    /// - `PARLEY_BACKEND`, `PARLEY_MODEL`
    /// - `PARLEY_API_KEY`, then `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`
    /// - `PARLEY_PERSISTENCE_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply process environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
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

    /// Apply environment overrides through `lookup`, so callers and tests
    /// can supply their own environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(kind) = lookup("PARLEY_BACKEND") {
            self.backend.kind = kind;
        }

        if let Some(model) = lookup("PARLEY_MODEL") {
            self.backend.model = model;
        }

        if self.backend.api_key.is_none() {
            let vendor = match self.backend.kind.as_str() {
                "anthropic" => "ANTHROPIC_API_KEY",
                _ => "OPENAI_API_KEY",
            };
            self.backend.api_key = lookup("PARLEY_API_KEY").or_else(|| lookup(vendor));
        }

        if let Some(dir) = lookup("PARLEY_PERSISTENCE_DIR") {
            self.persistence.directory = PathBuf::from(dir);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(ConfigError::ValidationError(
                "sampling.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !(self.sampling.top_p > 0.0 && self.sampling.top_p <= 1.0) {
            return Err(ConfigError::ValidationError(
                "sampling.top_p must be in (0.0, 1.0]".into(),
            ));
        }

        if !(0.0..=2.0).contains(&self.summarizer.temperature) {
            return Err(ConfigError::ValidationError(
                "summarizer.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.tools.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "tools.max_iterations must be at least 1".into(),
            ));
        }

        if self.context.max_context_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_context_tokens must be greater than 0".into(),
            ));
        }

        let total = self.context.allocation.total();
        if total != 100 {
            return Err(ConfigError::ValidationError(format!(
                "context.allocation percentages must sum to 100 (got {total})"
            )));
        }

        let shares: f32 = self
            .context
            .hierarchical
            .tiers()
            .iter()
            .map(|(_, tier)| tier.share)
            .sum();
        if shares > 1.0 + f32::EPSILON * 4.0 {
            return Err(ConfigError::ValidationError(format!(
                "context.hierarchical tier shares must sum to at most 1.0 (got {shares:.2})"
            )));
        }

        for (name, tier) in self.context.hierarchical.tiers() {
            if tier.share < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "context.hierarchical.{name}.share must not be negative"
                )));
            }
        }

        if self
            .context
            .recall_phrases
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "context.recall_phrases must not contain empty phrases".into(),
            ));
        }

        let template_ok = self
            .summarizer
            .prompt_template
            .as_deref()
            .is_none_or(|t| t.contains("{{CONVERSATION}}"));
        if !template_ok {
            return Err(ConfigError::ValidationError(
                "summarizer.prompt_template must contain {{CONVERSATION}}".into(),
            ));
        }

        if self.summarizer.max_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "summarizer.max_queue_depth must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `parley config`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            summarizer: SummarizerConfig::default(),
            sampling: SamplingConfig::default(),
            context: ContextConfig::default(),
            persistence: PersistenceConfig::default(),
            tools: ToolsConfig::default(),
            system_prompt: None,
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

impl ConfigError {
    pub fn kind(&self) -> parley_core::ErrorKind {
        parley_core::ErrorKind::InvalidConfiguration
    }
}
