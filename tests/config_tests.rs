//! Tests for loading `FeedConfig` from TOML files.

use std::io::Write;
use std::time::Duration;

use feed_sync::{ContentType, FeedConfig, FeedError};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_from_file_full() {
    let file = write_config(
        r#"
image_feed_url = "http://127.0.0.1:7000/image/feed"
text_feed_url = "http://127.0.0.1:7000/text/feed"
image_base_url = "http://127.0.0.1:7000/image"
text_base_url = "http://127.0.0.1:7000/text"
referrer = "feed-sync-tests"
connect_timeout_ms = 250
generation_timeout_ms = 15000
reconnect_min_ms = 100
reconnect_max_ms = 2000
"#,
    );
    let cfg = FeedConfig::from_file(file.path()).expect("load");
    cfg.validate().expect("valid");
    assert_eq!(cfg.feed_url(ContentType::Text), "http://127.0.0.1:7000/text/feed");
    assert_eq!(cfg.referrer.as_deref(), Some("feed-sync-tests"));
    assert_eq!(cfg.connect_timeout(), Duration::from_millis(250));
    assert_eq!(cfg.generation_timeout(), Duration::from_secs(15));
    let policy = cfg.reconnect_policy();
    assert_eq!(policy.min, Duration::from_millis(100));
    assert_eq!(policy.max, Duration::from_secs(2));
}

#[test]
fn test_from_file_empty_is_default() {
    let file = write_config("");
    assert_eq!(FeedConfig::from_file(file.path()).expect("load"), FeedConfig::default());
}

#[test]
fn test_from_file_missing_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = FeedConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FeedError::Io(_)));
}

#[test]
fn test_from_file_invalid_toml_is_config_error() {
    let file = write_config("referrer = [unterminated");
    let err = FeedConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, FeedError::Config(_)));
}

#[test]
fn test_loaded_zero_timeout_fails_validation() {
    let file = write_config("generation_timeout_ms = 0");
    let cfg = FeedConfig::from_file(file.path()).expect("parses");
    assert!(cfg.validate().is_err());
}

#[test]
fn test_loaded_zero_connect_timeout_fails_validation() {
    let file = write_config("connect_timeout_ms = 0");
    let cfg = FeedConfig::from_file(file.path()).expect("parses");
    assert!(matches!(cfg.validate(), Err(FeedError::Config(_))));
}

#[test]
fn test_env_overrides_file_values() {
    let file = write_config("referrer = \"from-file\"\nreconnect_max_ms = 9000\n");
    let mut cfg = FeedConfig::from_file(file.path()).expect("load");
    cfg.apply_env(|key| match key {
        "FEED_SYNC_REFERRER" => Some("from-env".to_string()),
        _ => None,
    })
    .expect("env");
    assert_eq!(cfg.referrer.as_deref(), Some("from-env"));
    assert_eq!(cfg.reconnect_max_ms, 9000);
}
