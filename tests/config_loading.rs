use std::io::Write;
use std::path::PathBuf;

use maestro_core::config::AppConfig;
use maestro_core::MaestroError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5
timeout_secs = 15

[model.retry]
max_retries = 2

[history]
max_messages = 40
file = "/tmp/maestro-test/history.json"
autosave = false

[cache]
enabled = true
ttl_secs = 120
max_size = 8

[rate_limit]
max_calls = 3
window_secs = 30

[data]
enabled = false
interactions_file = "/tmp/maestro-test/interactions.jsonl"
max_related = 2

[input]
max_input_length = 500

[workflow]
annotate_keywords = ["remarks"]
stream_buffer = 8
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.model.timeout_secs, 15);
    let retry = config.model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 1000);

    assert_eq!(config.history.max_messages, 40);
    assert_eq!(config.history.file, PathBuf::from("/tmp/maestro-test/history.json"));
    assert!(!config.history.autosave);
    assert_eq!(config.cache.ttl_secs, 120);
    assert_eq!(config.cache.max_size, 8);
    assert_eq!(config.rate_limit.max_calls, 3);
    assert!(config.rate_limit.enabled);
    assert!(!config.data.enabled);
    assert_eq!(config.data.max_related, 2);
    assert_eq!(config.data.scan_window, 50);
    assert_eq!(config.input.max_input_length, 500);
    assert_eq!(config.workflow.annotate_keywords, vec!["remarks"]);
    assert_eq!(config.workflow.stream_buffer, 8);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("MAESTRO_TEST_API_KEY", "expanded-key-value");

    let tmp = write_config(
        r#"
[model]
api_key = "${MAESTRO_TEST_API_KEY}"
base_url = "${MAESTRO_TEST_UNSET_ENDPOINT}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));
    assert_eq!(
        config.model.base_url,
        Some("${MAESTRO_TEST_UNSET_ENDPOINT}".to_string())
    );

    std::env::remove_var("MAESTRO_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config("[model]\nmodel_id = \"gpt-4o\"\n");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "azure");
    assert!(config.model.retry.is_none());
    assert_eq!(config.history.max_messages, 20);
    assert!(config.history.autosave);
    assert!(config.cache.enabled);
    assert!(config.rate_limit.enabled);
    assert!(config.data.enabled);
    assert_eq!(config.workflow.stream_buffer, 64);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/maestro.toml")).unwrap_err();
    assert!(matches!(err, MaestroError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let tmp = write_config("[rate_limit]\nwindow_secs = 0\n");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, MaestroError::Config(_)));

    let tmp = write_config("[workflow]\nstream_buffer = 0\n");
    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let tmp = write_config("[model\nprovider = ");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, MaestroError::Config(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config).expect("serialize");
    let tmp = write_config(&rendered);
    let reloaded = AppConfig::load(tmp.path()).expect("reload");
    assert_eq!(reloaded.history.file, config.history.file);
    assert_eq!(reloaded.workflow.annotate_keywords, config.workflow.annotate_keywords);
}
