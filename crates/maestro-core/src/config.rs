use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};

/// Top-level Maestro configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// API endpoint. For Azure this is the resource endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-attempt request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Azure deployment name. Falls back to `model_id`.
    #[serde(default)]
    pub azure_deployment: Option<String>,
    #[serde(default)]
    pub azure_api_version: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            retry: None,
            azure_deployment: None,
            azure_api_version: None,
        }
    }
}

impl ModelConfig {
    /// Same model with a different sampling temperature.
    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature,
            ..self.clone()
        }
    }
}

fn default_provider() -> String { "azure".to_string() }
fn default_model_id() -> String { "gpt-4o".to_string() }
fn default_max_tokens() -> u32 { 2000 }
fn default_temperature() -> f32 { 1.0 }
fn default_timeout_secs() -> u64 { 30 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Conversation history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_history_file")]
    pub file: PathBuf,
    /// Save to `file` after every request.
    #[serde(default = "default_true")]
    pub autosave: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            file: default_history_file(),
            autosave: true,
        }
    }
}

fn default_max_messages() -> usize { 20 }
fn default_history_file() -> PathBuf { PathBuf::from("data/conversation_history.json") }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

fn default_cache_ttl() -> u64 { 300 }
fn default_cache_max_size() -> usize { 100 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_calls: default_max_calls(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_max_calls() -> usize { 10 }
fn default_window_secs() -> u64 { 60 }

/// Interaction log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interactions_file")]
    pub interactions_file: PathBuf,
    /// Maximum related interactions attached to a request.
    #[serde(default = "default_max_related")]
    pub max_related: usize,
    /// How many of the most recent interactions are scanned for relevance.
    #[serde(default = "default_scan_window")]
    pub scan_window: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interactions_file: default_interactions_file(),
            max_related: default_max_related(),
            scan_window: default_scan_window(),
        }
    }
}

fn default_interactions_file() -> PathBuf { PathBuf::from("data/interactions.jsonl") }
fn default_max_related() -> usize { 5 }
fn default_scan_window() -> usize { 50 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_input_length: default_max_input_length(),
        }
    }
}

fn default_max_input_length() -> usize { 10_000 }

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Words that add an annotation step to the grading workflow.
    #[serde(default = "default_annotate_keywords")]
    pub annotate_keywords: Vec<String>,
    /// Capacity of the event channel handed to streaming callers.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            annotate_keywords: default_annotate_keywords(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_annotate_keywords() -> Vec<String> {
    vec!["notes".to_string(), "feedback".to_string(), "comments".to_string()]
}
fn default_stream_buffer() -> usize { 64 }

fn default_true() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.history.max_messages == 0 {
            return Err(MaestroError::Config("history.max_messages must be at least 1".into()));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(MaestroError::Config("rate_limit.window_secs must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(MaestroError::Config(format!(
                "model.temperature must be between 0 and 2, got {}",
                self.model.temperature
            )));
        }
        if self.workflow.stream_buffer == 0 {
            return Err(MaestroError::Config("workflow.stream_buffer must be positive".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => result.push_str(&val),
                    Err(_) => result.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
