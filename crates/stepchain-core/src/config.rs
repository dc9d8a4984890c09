use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepchainError};

/// Store path that selects the in-memory run store.
pub const IN_MEMORY_STORE: &str = ":memory:";

/// Top-level stepchain configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub chained: ChainedConfig,
    #[serde(default)]
    pub sequential: SequentialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL continuation requests are sent to. Default: `http://{bind}`.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

impl GatewayConfig {
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:3000".to_string() }

/// What `create_run` does when the id is already taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Hand back the existing run untouched.
    #[default]
    ReturnExisting,
    /// Fail with `DuplicateId`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file, or `:memory:` for the in-process store.
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            on_duplicate: DuplicatePolicy::default(),
        }
    }
}

fn default_store_path() -> String { "~/.stepchain/runs.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Number of steps every run is created with.
    #[serde(default = "default_total_steps")]
    pub total_steps: u32,
    #[serde(default = "default_list_limit")]
    pub list_default_limit: usize,
    #[serde(default = "default_list_max_limit")]
    pub list_max_limit: usize,
    #[serde(default = "default_kill_message")]
    pub kill_message: String,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            total_steps: default_total_steps(),
            list_default_limit: default_list_limit(),
            list_max_limit: default_list_max_limit(),
            kill_message: default_kill_message(),
        }
    }
}

fn default_total_steps() -> u32 { 4 }
fn default_list_limit() -> usize { 20 }
fn default_list_max_limit() -> usize { 100 }
fn default_kill_message() -> String { "Manually stopped via kill switch.".to_string() }

/// Cross-invocation chained scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedConfig {
    /// Per-step work duration; index 0 is step 1.
    #[serde(default = "default_chained_durations")]
    pub step_durations_ms: Vec<u64>,
    #[serde(default = "default_chained_duration")]
    pub default_step_duration_ms: u64,
    /// Steps at or above this number answer 202 and run their work after the response.
    #[serde(default = "default_deferred_from_step")]
    pub deferred_from_step: u32,
    /// Steps raced against `race_timeout_ms`.
    #[serde(default = "default_race_steps")]
    pub race_steps: Vec<u32>,
    #[serde(default = "default_race_timeout")]
    pub race_timeout_ms: u64,
    /// Budget the hosting platform enforces per invocation.
    #[serde(default = "default_execution_budget")]
    pub execution_budget_ms: u64,
    /// Fire a liveness ping alongside each continuation.
    #[serde(default = "default_notify_ping")]
    pub notify_ping: bool,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

impl Default for ChainedConfig {
    fn default() -> Self {
        Self {
            step_durations_ms: default_chained_durations(),
            default_step_duration_ms: default_chained_duration(),
            deferred_from_step: default_deferred_from_step(),
            race_steps: default_race_steps(),
            race_timeout_ms: default_race_timeout(),
            execution_budget_ms: default_execution_budget(),
            notify_ping: default_notify_ping(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl ChainedConfig {
    pub fn step_duration(&self, step: u32) -> Duration {
        let ms = step
            .checked_sub(1)
            .and_then(|idx| self.step_durations_ms.get(idx as usize))
            .copied()
            .unwrap_or(self.default_step_duration_ms);
        Duration::from_millis(ms)
    }

    pub fn is_race_step(&self, step: u32) -> bool {
        self.race_steps.contains(&step)
    }

    pub fn is_deferred_step(&self, step: u32) -> bool {
        step >= self.deferred_from_step
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }
}

fn default_chained_durations() -> Vec<u64> { vec![4000; 4] }
fn default_chained_duration() -> u64 { 4000 }
fn default_deferred_from_step() -> u32 { 2 }
fn default_race_steps() -> Vec<u32> { vec![4] }
fn default_race_timeout() -> u64 { 5000 }
fn default_execution_budget() -> u64 { 10_000 }
fn default_notify_ping() -> bool { true }
fn default_dispatch_timeout() -> u64 { 10 }

/// Single-invocation streaming scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialConfig {
    #[serde(default = "default_sequential_duration")]
    pub step_duration_ms: u64,
    /// Plain loop gives up with a `timeout` event once this elapses.
    #[serde(default = "default_execution_budget")]
    pub execution_budget_ms: u64,
    /// Race loop gives up with a `race_timeout` event once this elapses.
    #[serde(default = "default_race_timeout")]
    pub race_timeout_ms: u64,
    /// How often a running step re-reads the run to notice a kill.
    #[serde(default = "default_kill_poll")]
    pub kill_poll_ms: u64,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            step_duration_ms: default_sequential_duration(),
            execution_budget_ms: default_execution_budget(),
            race_timeout_ms: default_race_timeout(),
            kill_poll_ms: default_kill_poll(),
        }
    }
}

fn default_sequential_duration() -> u64 { 3000 }
fn default_kill_poll() -> u64 { 250 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepchainError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StepchainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let total = self.runs.total_steps;
        if total == 0 {
            return Err(StepchainError::Config("runs.total_steps must be at least 1".into()));
        }
        if self.chained.deferred_from_step == 0 {
            return Err(StepchainError::Config(
                "chained.deferred_from_step must be at least 1".into(),
            ));
        }
        if let Some(step) = self
            .chained
            .race_steps
            .iter()
            .find(|s| **s == 0 || **s > total)
        {
            return Err(StepchainError::Config(format!(
                "chained.race_steps contains {}, outside 1-{}",
                step, total
            )));
        }
        if self.chained.race_timeout_ms == 0
            || self.sequential.race_timeout_ms == 0
            || self.sequential.execution_budget_ms == 0
        {
            return Err(StepchainError::Config("timeouts must be non-zero".into()));
        }
        if self.sequential.kill_poll_ms == 0 {
            return Err(StepchainError::Config("sequential.kill_poll_ms must be non-zero".into()));
        }
        if self.runs.list_max_limit == 0 {
            return Err(StepchainError::Config("runs.list_max_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the store location (expand ~). `None` selects the in-memory store.
    pub fn store_path(&self) -> Option<PathBuf> {
        let path = &self.store.path;
        if path == IN_MEMORY_STORE {
            return None;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPCHAIN_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPCHAIN_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPCHAIN_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPCHAIN_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPCHAIN_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:3000");
        assert_eq!(config.gateway.public_url(), "http://127.0.0.1:3000");
        assert_eq!(config.runs.total_steps, 4);
        assert_eq!(config.runs.list_default_limit, 20);
        assert_eq!(config.runs.list_max_limit, 100);
        assert_eq!(config.store.on_duplicate, DuplicatePolicy::ReturnExisting);
        assert_eq!(config.chained.deferred_from_step, 2);
        assert!(config.chained.is_race_step(4));
        assert!(config.chained.notify_ping);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_step_duration_falls_back_to_default() {
        let chained = ChainedConfig {
            step_durations_ms: vec![10, 20],
            default_step_duration_ms: 99,
            ..ChainedConfig::default()
        };
        assert_eq!(chained.step_duration(1), Duration::from_millis(10));
        assert_eq!(chained.step_duration(2), Duration::from_millis(20));
        assert_eq!(chained.step_duration(3), Duration::from_millis(99));
        assert_eq!(chained.step_duration(0), Duration::from_millis(99));
    }

    #[test]
    fn test_public_url_strips_trailing_slash() {
        let gw = GatewayConfig {
            bind: "0.0.0.0:8080".into(),
            public_url: Some("https://chain.example.com/".into()),
        };
        assert_eq!(gw.public_url(), "https://chain.example.com");
    }

    #[test]
    fn test_validate_rejects_race_step_out_of_range() {
        let mut config = AppConfig::default();
        config.chained.race_steps = vec![5];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StepchainError::Config(msg) if msg.contains("race_steps")));
    }

    #[test]
    fn test_validate_rejects_zero_steps() {
        let mut config = AppConfig::default();
        config.runs.total_steps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_path_memory_and_home() {
        let mut config = AppConfig::default();
        config.store.path = IN_MEMORY_STORE.into();
        assert!(config.store_path().is_none());

        config.store.path = "/var/lib/stepchain/runs.db".into();
        assert_eq!(
            config.store_path(),
            Some(PathBuf::from("/var/lib/stepchain/runs.db"))
        );
    }

    #[test]
    fn test_duplicate_policy_parsing() {
        let toml_str = r#"
[store]
path = ":memory:"
on_duplicate = "reject"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.on_duplicate, DuplicatePolicy::Reject);
    }
}
