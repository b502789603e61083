use std::io::Write;

use weft_core::config::{AppConfig, FailurePolicy};
use weft_core::error::WeftError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[model]
provider = "groq"
model_id = "llama-3.1-70b"
api_key = "sk-test-key"
base_url = "http://localhost:9000/v1/chat/completions"
max_tokens = 4096
temperature = 0.2

[model.retry]
max_retries = 5
initial_backoff_ms = 200

[[fallback_models]]
provider = "ollama"
model_id = "llama3.2"

[engine]
generation_timeout_secs = 30
max_concurrency = 4
failure_policy = "propagate"
streaming = true

[storage]
workspace = "/tmp/weft-test"
db_file = "test.db"
flow_key = "demo"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "groq");
    assert_eq!(config.model.model_id, "llama-3.1-70b");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert!((config.model.temperature - 0.2).abs() < f32::EPSILON);

    let retry = config.model.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 200);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "ollama");

    assert_eq!(config.engine.generation_timeout_secs, 30);
    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.failure_policy, FailurePolicy::Propagate);
    assert!(config.engine.streaming);

    assert_eq!(config.storage.flow_key, "demo");
    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/weft-test/test.db")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${WEFT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("WEFT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "gpt-4"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.max_tokens, 0);
    assert!(config.model.retry.is_none());
    assert!(config.fallback_models.is_empty());

    assert_eq!(config.engine.generation_timeout_secs, 120);
    assert_eq!(config.engine.max_concurrency, 0);
    assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
    assert!(!config.engine.streaming);

    assert_eq!(config.storage.workspace, "~/.weft");
    assert_eq!(config.storage.db_file, "flows.db");
    assert_eq!(config.storage.flow_key, "flow-data");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_are_config_errors() {
    let toml_content = r#"
[model]
model_id = "gpt-4"

[engine]
failure_policy = "explode"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));

    // model_id is required
    assert!(matches!(
        AppConfig::parse("[model]\nprovider = \"openai\"\n").unwrap_err(),
        WeftError::Config(_)
    ));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let config = AppConfig::parse("[model]\nmodel_id = \"gpt-4\"\n").expect("parse");
    let text = toml::to_string_pretty(&config).expect("serialize");
    let again = AppConfig::parse(&text).expect("reparse");
    assert_eq!(again.model.model_id, "gpt-4");
    assert_eq!(again.storage.flow_key, config.storage.flow_key);
}
