use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::types::Channel;

/// Top-level Fleet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database holding the catalog, runs and debounce records.
    #[serde(default = "default_database")]
    pub database: String,
    /// Worker limit for steps of one wave.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// Timeout for steps that do not declare `timeout_ms`.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: u64,
    /// Handoff loop-prevention window. Defaults to the debounce window.
    #[serde(default)]
    pub handoff_cooldown_secs: Option<u64>,
    #[serde(default = "default_max_handoff_depth")]
    pub max_handoff_depth: u32,
    /// Channel used when no layer of the preference gate names one.
    #[serde(default)]
    pub default_channel: Channel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            max_concurrent_steps: default_max_concurrent_steps(),
            default_step_timeout_ms: default_step_timeout_ms(),
            debounce_window_secs: default_debounce_window_secs(),
            handoff_cooldown_secs: None,
            max_handoff_depth: default_max_handoff_depth(),
            default_channel: Channel::default(),
        }
    }
}

impl EngineConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_window_secs)
    }

    pub fn handoff_cooldown(&self) -> Duration {
        Duration::from_secs(
            self.handoff_cooldown_secs
                .unwrap_or(self.debounce_window_secs),
        )
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

fn default_database() -> String { "~/.fleet/fleet.db".to_string() }
fn default_max_concurrent_steps() -> usize { 4 }
fn default_step_timeout_ms() -> u64 { 30_000 }
fn default_debounce_window_secs() -> u64 { 300 }
fn default_max_handoff_depth() -> u32 { 8 }

/// Outbound skill dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Base URL; skills without an explicit endpoint are posted to `{base_url}/{skill}`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-skill endpoint overrides.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// URL the skill service posts results back to; `{run_id}` and `{step}` are substituted.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Per-attempt HTTP timeout; the step timeout caps it further.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            endpoints: HashMap::new(),
            auth_token: None,
            callback_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_request_timeout_ms() -> u64 { 10_000 }

impl DispatchConfig {
    /// Resolve the endpoint URL for a skill.
    pub fn endpoint_for(&self, skill: &str) -> Option<String> {
        if let Some(url) = self.endpoints.get(skill) {
            return Some(url.clone());
        }
        self.base_url
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), skill))
    }

    /// Callback URL for one step, if configured.
    pub fn callback_for(&self, run_id: &str, step: &str) -> Option<String> {
        self.callback_url
            .as_ref()
            .map(|url| url.replace("{run_id}", run_id).replace("{step}", step))
    }
}

/// Retry configuration for transport errors.
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
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every route except health. None = open.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// Webhook endpoints for approval notifications, keyed by channel name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhooks: HashMap<String, String>,
}

impl NotificationsConfig {
    pub fn webhook_for(&self, channel: Channel) -> Option<&str> {
        self.webhooks
            .iter()
            .find(|(name, _)| name.parse::<Channel>().ok() == Some(channel))
            .map(|(_, url)| url.as_str())
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FleetError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_steps == 0 {
            return Err(FleetError::Config(
                "engine.max_concurrent_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.engine.database)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
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
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLEET_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLEET_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLEET_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLEET_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLEET_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.engine.max_concurrent_steps, 4);
        assert_eq!(config.engine.default_step_timeout_ms, 30_000);
        assert_eq!(config.engine.debounce_window(), Duration::from_secs(300));
        assert_eq!(config.engine.handoff_cooldown(), Duration::from_secs(300));
        assert_eq!(config.engine.default_channel, Channel::Slack);
        assert_eq!(config.dispatch.retry.max_retries, 3);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_handoff_cooldown_override() {
        let config = AppConfig::parse(
            r#"
[engine]
debounce_window_secs = 60
handoff_cooldown_secs = 900
"#,
        )
        .unwrap();
        assert_eq!(config.engine.debounce_window(), Duration::from_secs(60));
        assert_eq!(config.engine.handoff_cooldown(), Duration::from_secs(900));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = AppConfig::parse("[engine]\nmax_concurrent_steps = 0\n").unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_endpoint_resolution() {
        let config = AppConfig::parse(
            r#"
[dispatch]
base_url = "https://skills.internal/run/"

[dispatch.endpoints]
crm-write = "https://crm.internal/hooks/write"
"#,
        )
        .unwrap();
        assert_eq!(
            config.dispatch.endpoint_for("crm-write").as_deref(),
            Some("https://crm.internal/hooks/write")
        );
        assert_eq!(
            config.dispatch.endpoint_for("detect-intents").as_deref(),
            Some("https://skills.internal/run/detect-intents")
        );
        assert!(DispatchConfig::default().endpoint_for("x").is_none());
        assert_eq!(config.dispatch.request_timeout_ms, 10_000);
    }

    #[test]
    fn test_callback_substitution() {
        let config = AppConfig::parse(
            r#"
[dispatch]
callback_url = "http://fleet.local/api/runs/{run_id}/steps/{step}/complete"
"#,
        )
        .unwrap();
        assert_eq!(
            config.dispatch.callback_for("r-1", "crm-write").as_deref(),
            Some("http://fleet.local/api/runs/r-1/steps/crm-write/complete")
        );
    }

    #[test]
    fn test_notification_webhooks_keyed_by_channel() {
        let config = AppConfig::parse(
            r#"
[notifications.webhooks]
slack = "https://hooks.slack.test/T000"
in_app = "https://app.internal/notify"
"#,
        )
        .unwrap();
        assert_eq!(config.notifications.webhooks.len(), 2);
        assert_eq!(
            config.notifications.webhook_for(Channel::InApp),
            Some("https://app.internal/notify")
        );
        assert!(config.notifications.webhook_for(Channel::Email).is_none());
    }
}
