use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// 0 leaves the limit to the provider.
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_temperature() -> f32 { 0.7 }

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: 0,
            temperature: default_temperature(),
            retry: None,
        }
    }
}

/// Retry configuration for generation requests.
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

/// What happens to a node whose dependency ended in error.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Run anyway, substituting an empty string for the failed dependency.
    #[default]
    Continue,
    /// Mark the dependent as failed without calling the generation service.
    Propagate,
}

/// Execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a single generation call, in seconds (0 = no limit).
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// Maximum simultaneous generation calls (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Use the streaming generation call and publish chunk events.
    #[serde(default)]
    pub streaming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout(),
            max_concurrency: 0,
            failure_policy: FailurePolicy::default(),
            streaming: false,
        }
    }
}

fn default_generation_timeout() -> u64 { 120 }

/// Where flows are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// Key the active flow document is stored under.
    #[serde(default = "default_flow_key")]
    pub flow_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            db_file: default_db_file(),
            flow_key: default_flow_key(),
        }
    }
}

fn default_workspace() -> String { "~/.weft".to_string() }
fn default_db_file() -> String { "flows.db".to_string() }
fn default_flow_key() -> String { "flow-data".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Minimal config for an OpenAI-compatible model, built from the environment.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            WeftError::Config("no config file found and OPENAI_API_KEY is not set".into())
        })?;
        let model_id = std::env::var("WEFT_MODEL").unwrap_or_else(|_| "gpt-4".to_string());

        let mut model = ModelConfig::new(model_id);
        model.api_key = Some(api_key);
        model.base_url = std::env::var("WEFT_BASE_URL").ok();

        Ok(Self {
            model,
            fallback_models: vec![],
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
        })
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.storage.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Full path of the SQLite flow database.
    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir().join(&self.storage.db_file)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_engine_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "gpt-4"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.temperature, 0.7);
        assert_eq!(config.engine.generation_timeout_secs, 120);
        assert_eq!(config.engine.max_concurrency, 0);
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
        assert!(!config.engine.streaming);
        assert_eq!(config.storage.flow_key, "flow-data");
    }

    #[test]
    fn test_failure_policy_parses_lowercase() {
        let toml_str = r#"
[model]
model_id = "gpt-4"

[engine]
failure_policy = "propagate"
max_concurrency = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.failure_policy, FailurePolicy::Propagate);
        assert_eq!(config.engine.max_concurrency, 4);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::parse("[model").unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn test_workspace_dir_absolute() {
        let mut config = AppConfig::parse("[model]\nmodel_id = \"m\"").unwrap();
        config.storage.workspace = "/tmp/weft-ws".into();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/weft-ws/flows.db"));
    }
}
