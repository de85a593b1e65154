use std::io::Write;
use std::time::Duration;

use fleet_core::config::AppConfig;
use fleet_core::types::Channel;
use fleet_core::FleetError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
database = "/tmp/fleet-test/fleet.db"
max_concurrent_steps = 8
default_step_timeout_ms = 15000
debounce_window_secs = 120
handoff_cooldown_secs = 600
max_handoff_depth = 4
default_channel = "email"

[dispatch]
base_url = "https://skills.internal"
auth_token = "skill-token"
callback_url = "http://fleet.local/api/runs/{run_id}/steps/{step}/complete"
request_timeout_ms = 2000

[dispatch.endpoints]
crm-write = "https://crm.internal/write"

[dispatch.retry]
max_retries = 5
initial_backoff_ms = 100
max_backoff_ms = 1000

[gateway]
bind = "0.0.0.0:9999"
token = "test-token"

[notifications.webhooks]
slack = "https://hooks.slack.test/T000"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_steps, 8);
    assert_eq!(config.engine.default_step_timeout(), Duration::from_millis(15000));
    assert_eq!(config.engine.debounce_window(), Duration::from_secs(120));
    assert_eq!(config.engine.handoff_cooldown(), Duration::from_secs(600));
    assert_eq!(config.engine.max_handoff_depth, 4);
    assert_eq!(config.engine.default_channel, Channel::Email);
    assert_eq!(
        config.database_path().to_str(),
        Some("/tmp/fleet-test/fleet.db")
    );

    assert_eq!(config.dispatch.auth_token.as_deref(), Some("skill-token"));
    assert_eq!(config.dispatch.retry.max_retries, 5);
    assert_eq!(
        config.dispatch.endpoint_for("summarize").as_deref(),
        Some("https://skills.internal/summarize")
    );
    assert_eq!(
        config.dispatch.endpoint_for("crm-write").as_deref(),
        Some("https://crm.internal/write")
    );

    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.bind, "0.0.0.0:9999");
    assert_eq!(gw.token.as_deref(), Some("test-token"));

    assert_eq!(
        config.notifications.webhook_for(Channel::Slack),
        Some("https://hooks.slack.test/T000")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLEET_TEST_GATEWAY_TOKEN", "expanded-token");

    let toml_content = r#"
[gateway]
token = "${FLEET_TEST_GATEWAY_TOKEN}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.token.as_deref(), Some("expanded-token"));
    assert_eq!(gw.bind, "127.0.0.1:18790");

    std::env::remove_var("FLEET_TEST_GATEWAY_TOKEN");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_steps, 4);
    assert_eq!(config.engine.max_handoff_depth, 8);
    assert_eq!(config.engine.handoff_cooldown(), config.engine.debounce_window());
    assert!(config.dispatch.base_url.is_none());
    assert!(config.gateway.is_none());
    assert!(config.notifications.webhooks.is_empty());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, FleetError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_concurrent_steps = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));
}
