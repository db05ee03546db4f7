// Tests for environment variable handling.
// Run with: cargo test --test environment_variables_test -- --test-threads=1
//
// IMPORTANT: Run with --test-threads=1 to avoid env var contamination
// between tests. Each test points ALWAYS_CODER_CONFIG_DIR at its own
// temporary directory so the real ~/.always-coder is never touched.

use always_coder::config::{self, Config};
use std::env;
use tempfile::TempDir;

/// Set environment variables for a test and clean them up after.
struct EnvGuard {
    keys: Vec<String>,
    _config_dir: TempDir,
}

impl EnvGuard {
    fn new() -> Self {
        env::remove_var("ALWAYS_CODER_SERVER");
        env::remove_var("ALWAYS_CODER_WEB_URL");
        env::remove_var("ALWAYS_CODER_DAEMON");

        let config_dir = TempDir::new().expect("temp config dir");
        env::set_var("ALWAYS_CODER_CONFIG_DIR", config_dir.path());

        Self {
            keys: Vec::new(),
            _config_dir: config_dir,
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        env::set_var(key, value);
        self.keys.push(key.to_string());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.keys {
            env::remove_var(key);
        }
        env::remove_var("ALWAYS_CODER_CONFIG_DIR");
        env::remove_var("ALWAYS_CODER_SERVER");
        env::remove_var("ALWAYS_CODER_WEB_URL");
        env::remove_var("ALWAYS_CODER_DAEMON");
    }
}

#[test]
fn test_server_override_applied() {
    let mut guard = EnvGuard::new();
    guard.set("ALWAYS_CODER_SERVER", "wss://override.example.com/ws");

    let config = Config::load().unwrap();
    assert_eq!(config.server, "wss://override.example.com/ws");
}

#[test]
fn test_server_override_rejects_non_wss() {
    let mut guard = EnvGuard::new();

    let mut base = Config::default();
    base.server = "wss://configured.example.com/ws".into();
    base.save().unwrap();

    guard.set("ALWAYS_CODER_SERVER", "https://not-a-ws-url.example.com");

    // Invalid override is ignored; the configured value survives.
    let config = Config::load().unwrap();
    assert_eq!(config.server, "wss://configured.example.com/ws");
}

#[test]
fn test_web_url_override_normalized() {
    let mut guard = EnvGuard::new();
    guard.set("ALWAYS_CODER_WEB_URL", "https://web.example.com/");

    let config = Config::load().unwrap();
    assert_eq!(config.web_url, "https://web.example.com");
}

#[test]
fn test_web_url_override_rejects_bad_scheme() {
    let mut guard = EnvGuard::new();

    let mut base = Config::default();
    base.web_url = "https://configured.example.com".into();
    base.save().unwrap();

    guard.set("ALWAYS_CODER_WEB_URL", "ftp://nope.example.com");

    let config = Config::load().unwrap();
    assert_eq!(config.web_url, "https://configured.example.com");
}

#[test]
fn test_env_overrides_user_config() {
    let mut guard = EnvGuard::new();

    let mut base = Config::default();
    base.server = "wss://from-file.example.com/ws".into();
    base.save().unwrap();

    guard.set("ALWAYS_CODER_SERVER", "wss://from-env.example.com/ws");

    let config = Config::load().unwrap();
    assert_eq!(config.server, "wss://from-env.example.com/ws");
}

#[test]
fn test_daemon_mode_flag() {
    let mut guard = EnvGuard::new();
    assert!(!config::daemon_mode());

    guard.set("ALWAYS_CODER_DAEMON", "true");
    assert!(config::daemon_mode());

    guard.set("ALWAYS_CODER_DAEMON", "1");
    assert!(!config::daemon_mode(), "only the literal \"true\" enables it");
}

#[test]
fn test_auth_fields_roundtrip_through_file() {
    let _guard = EnvGuard::new();

    let mut config = Config::default();
    config.server = "wss://relay.example.com/ws".into();
    config.auth_token = Some("bearer-token".into());
    config.refresh_token = Some("refresh".into());
    config.user_id = Some("user-1".into());
    config.save().unwrap();

    let loaded = Config::load().unwrap();
    assert!(loaded.has_token());
    assert_eq!(loaded.user_id.as_deref(), Some("user-1"));
    assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
}
