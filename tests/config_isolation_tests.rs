//! Fast file-system isolation tests for [`AppConfig`] loading.
//!
//! These avoid mutating process environment variables (edition 2024 makes
//! `std::env::set_var` `unsafe`, and this crate forbids `unsafe_code`
//! outright) and instead drive every scenario through a tempdir-backed TOML
//! file.

use agentic_session_operator::config::{AppConfig, LogFormat};

#[test]
fn missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("does-not-exist.toml");

    let config = AppConfig::load_or_default(&path).expect("falls back cleanly");
    assert_eq!(config.bind_addr, AppConfig::default().bind_addr);
    assert_eq!(config.log_format, LogFormat::Compact);
}

#[test]
fn malformed_config_file_is_an_error_even_with_load_or_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "this is not valid = = toml").expect("write malformed file");

    let result = AppConfig::load_or_default(&path);
    assert!(result.is_err(), "a present-but-unparseable file must not fall back silently");
}

#[test]
fn partial_toml_overrides_only_the_fields_present() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        bind_addr = "0.0.0.0:9999"
        log_format = "json"
        "#,
    )
    .expect("write partial config");

    let config = AppConfig::load(&path).expect("partial config still parses");
    assert_eq!(config.bind_addr, "0.0.0.0:9999");
    assert_eq!(config.log_format, LogFormat::Json);
    // Everything else should still carry the built-in default.
    assert_eq!(config.worker_image, AppConfig::default().worker_image);
    assert_eq!(
        config.default_timeout_seconds,
        AppConfig::default().default_timeout_seconds
    );
}

#[test]
fn storage_class_round_trips_as_optional() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    let mut config = AppConfig::default();
    config.storage_class = Some("fast-ssd".to_owned());
    std::fs::write(&path, toml::to_string(&config).expect("serialize")).expect("write");

    let loaded = AppConfig::load(&path).expect("load");
    assert_eq!(loaded.storage_class, Some("fast-ssd".to_owned()));
}
