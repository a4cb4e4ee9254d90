use std::io::Write;

use sift_core::config::AppConfig;
use sift_core::error::SiftError;
use sift_core::types::{FailureClass, ResponseFormat, Tone};

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
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 5
initial_backoff_ms = 250

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o-mini"

[engine]
history_turns = 4
run_timeout_secs = 60
node_timeout_secs = 10
max_replans = 1

[engine.confirmation]
max_tokens = 20000
max_cost = 0.25
ttl_secs = 300

[decomposer]
max_tokens = 1024

[synthesis]
excerpt_chars = 800

[strategies]
semantic_batch_size = 5
semantic_concurrency = 2

[strategies.failure]
batch_thread_read = "fatal"
keyword_search = "recoverable"

[preferences]
tone = "formal"
format = "bullets"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.retry.as_ref().map(|r| r.max_retries), Some(5));
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o-mini");

    assert_eq!(config.engine.history_turns, 4);
    assert_eq!(config.engine.max_replans, 1);
    assert_eq!(config.engine.confirmation.max_tokens, 20_000);
    assert_eq!(config.engine.confirmation.ttl_secs, 300);
    // Unset keys in a present table keep their defaults.
    assert_eq!(config.engine.confirmation.max_time_ms, 90_000);

    assert_eq!(config.decomposer.max_tokens, 1024);
    assert_eq!(config.synthesis.excerpt_chars, 800);
    assert_eq!(config.synthesis.max_tokens, 600);
    assert_eq!(config.strategies.semantic_batch_size, 5);
    assert_eq!(
        config.strategies.failure.get("batch_thread_read"),
        Some(&FailureClass::Fatal)
    );
    assert_eq!(
        config.strategies.failure.get("keyword_search"),
        Some(&FailureClass::Recoverable)
    );
    assert_eq!(config.preferences.tone, Tone::Formal);
    assert_eq!(config.preferences.format, ResponseFormat::Bullets);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SIFT_TEST_API_KEY", "expanded-key-value");

    let tmp = write_config(
        r#"
[model]
model_id = "test-model"
api_key = "${SIFT_TEST_API_KEY}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("SIFT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert!(config.fallback_models.is_empty());
    assert_eq!(config.engine.run_timeout_secs, 120);
    assert_eq!(config.engine.node_timeout_secs, 30);
    assert_eq!(config.engine.max_replans, 0);
    assert_eq!(config.strategies.thread_batch_limit, 50);
    assert!(config.strategies.failure.is_empty());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, SiftError::ConfigNotFound(_)));
}

#[test]
fn test_zero_batch_size_is_rejected() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"

[strategies]
semantic_batch_size = 0
"#,
    );
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, SiftError::Config(_)));
}
