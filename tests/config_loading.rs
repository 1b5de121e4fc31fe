use std::io::Write;

use flowgraph_core::config::{AppConfig, BackoffStrategy};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[engine]
max_concurrency = 4
run_timeout_ms = 60000
node_timeout_ms = 5000
event_capacity = 256

[retry]
max_attempts = 3
initial_backoff_ms = 100
max_backoff_ms = 2000
strategy = "fixed"
jitter = false

[log]
log_dir = "/tmp/flowgraph-logs"
level = 3

[store]
path = "/tmp/flowgraph-test.db"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.run_timeout_ms, Some(60000));
    assert_eq!(config.engine.node_timeout_ms, Some(5000));
    assert_eq!(config.engine.event_capacity, 256);

    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.strategy, BackoffStrategy::Fixed);
    assert!(!config.retry.jitter);

    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(log.log_dir().to_str(), Some("/tmp/flowgraph-logs"));

    let store = config.store.expect("store present");
    assert_eq!(store.path().to_str(), Some("/tmp/flowgraph-test.db"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWGRAPH_TEST_DB", "/tmp/expanded.db");

    let tmp = write_config(
        r#"
[store]
path = "${FLOWGRAPH_TEST_DB}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.unwrap().path, "/tmp/expanded.db");

    std::env::remove_var("FLOWGRAPH_TEST_DB");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = write_config("");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 16);
    assert_eq!(config.engine.event_capacity, 1024);
    assert!(config.engine.run_timeout_ms.is_none());
    assert!(config.engine.node_timeout_ms.is_none());
    assert_eq!(config.retry.max_attempts, 1);
    assert_eq!(config.retry.strategy, BackoffStrategy::Exponential);
    assert!(config.log.is_none());
    assert!(config.store.is_none());
}

#[test]
fn test_log_section_defaults() {
    let tmp = write_config("[log]\n");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 2);
    assert_eq!(log.log_dir().to_str(), Some("logs"));
}

#[test]
fn test_rejects_zero_concurrency_and_attempts() {
    let tmp = write_config("[engine]\nmax_concurrency = 0\n");
    assert!(AppConfig::load(tmp.path()).is_err());

    let tmp = write_config("[retry]\nmax_attempts = 0\n");
    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(AppConfig::load(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_sections_parse_without_env_expansion() {
    let config: AppConfig = toml::from_str(
        r#"
[engine]
max_concurrency = 2

[store]
"#,
    )
    .expect("parse toml");
    assert_eq!(config.engine.max_concurrency, 2);
    assert_eq!(config.store.unwrap().path, "flowgraph.db");
}
