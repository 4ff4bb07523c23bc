use std::{env, fs, time::Duration};

use quoteflow_core::Priority;
use quoteflow_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("quoteflow.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081

[redis]
enabled = false

[cache]
max_entries = 500

[scheduler]
tick_interval_secs = 5
backoff_base_ms = 1000

[broadcaster]
max_connections = 10
rate_limit_messages = 20
push_interval_secs = 0

[logging]
level = "debug"

[[jobs]]
name = "prices"
url = "https://upstream.example/prices"
interval_secs = 30
priority = "high"
tags = ["market"]

[[jobs]]
name = "protocols"
url = "https://upstream.example/protocols"
interval_secs = 300
priority = "low"
max_retries = 1
ttl_secs = 900
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.cache.max_entries, 500);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.broadcaster.to_broadcaster_config().push_interval, None);
    assert_eq!(
        cfg.scheduler.to_scheduler_config().backoff_base,
        Duration::from_secs(1)
    );
    assert_eq!(cfg.jobs.len(), 2);
    assert_eq!(cfg.jobs[0].priority, Priority::High);
    assert_eq!(cfg.jobs[0].max_retries, 3);
    assert_eq!(cfg.jobs[0].tags, vec!["market".to_string()]);
    assert_eq!(cfg.jobs[1].priority, Priority::Low);
    assert_eq!(cfg.jobs[1].ttl_secs, Some(900));

    // 2) Env override should win over file
    unsafe {
        env::set_var("QUOTEFLOW__BROADCASTER__MAX_CONNECTIONS", "25");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.broadcaster.max_connections, 25);
    unsafe {
        env::remove_var("QUOTEFLOW__BROADCASTER__MAX_CONNECTIONS");
    }

    // 3) Invalid config should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[[jobs]]
name = "prices"
url = "ftp://upstream.example/prices"
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("url must be http(s)"));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");

    let cfg = load_config(path.to_str()).expect("defaults should validate");
    assert_eq!(cfg.server.port, 8080);
    assert!(!cfg.redis.enabled);
    assert!(cfg.jobs.is_empty());
}

#[test]
fn unknown_priority_is_rejected() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("quoteflow.toml");
    fs::write(
        &path,
        r#"
[[jobs]]
name = "prices"
url = "https://upstream.example/prices"
priority = "urgent"
"#,
    )
    .expect("write toml");

    let err = load_config(path.to_str()).expect_err("expected deserialize error");
    assert!(err.contains("config deserialize error"));
}
