//! Configuration for the remote client, the gate, the pipeline and the
//! autosave scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::GitSignature;

/// Connection settings for the hosted API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the REST API.
    pub api_base: String,
    /// Bearer token.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// When the token stops being valid. `None` means it does not expire.
    pub token_expires_at: Option<DateTime<Utc>>,
    pub user_agent: String,
    /// Deadline for a single call.
    pub call_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: None,
            token_expires_at: None,
            user_agent: concat!("foliosync/", env!("CARGO_PKG_VERSION")).to_string(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RemoteConfig {
    pub fn api_base(mut self, value: impl Into<String>) -> Self {
        self.api_base = value.into();
        self
    }

    pub fn token(mut self, value: impl Into<String>) -> Self {
        self.token = Some(value.into());
        self
    }

    pub fn token_expires_at(mut self, value: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(value);
        self
    }

    pub fn call_timeout(mut self, value: Duration) -> Self {
        self.call_timeout = value;
        self
    }
}

/// Retry and rate-limit wait settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest total time one call may be held for the quota.
    pub max_rate_limit_wait: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(15 * 60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    pub fn base_delay(mut self, value: Duration) -> Self {
        self.base_delay = value;
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = value;
        self
    }

    pub fn jitter(mut self, value: bool) -> Self {
        self.jitter = value;
        self
    }
}

/// Commit pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest accepted file content, in bytes.
    pub max_file_bytes: u64,
    /// Create a backup branch at the current tip before each commit.
    pub create_backup: bool,
    pub backup_prefix: String,
    /// Author for new commits. `None` lets the remote use the token owner.
    pub author: Option<GitSignature>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 100 * 1024 * 1024,
            create_backup: false,
            backup_prefix: "backup/".to_string(),
            author: None,
        }
    }
}

impl PipelineConfig {
    pub fn max_file_bytes(mut self, value: u64) -> Self {
        self.max_file_bytes = value;
        self
    }

    pub fn create_backup(mut self, value: bool) -> Self {
        self.create_backup = value;
        self
    }

    pub fn author(mut self, value: GitSignature) -> Self {
        self.author = Some(value);
        self
    }
}

/// Autosave scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    pub debounce: Duration,
    /// Background conflict polling interval.
    pub poll_interval: Duration,
    /// Save cycles retried before landing in `Error`.
    pub max_retries: u32,
    /// Repository path the payload is written to.
    pub data_path: String,
    pub commit_message: String,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            poll_interval: Duration::from_secs(30),
            max_retries: 3,
            data_path: "data.json".to_string(),
            commit_message: "Update portfolio data".to_string(),
        }
    }
}

impl AutoSaveConfig {
    pub fn debounce(mut self, value: Duration) -> Self {
        self.debounce = value;
        self
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    pub fn data_path(mut self, value: impl Into<String>) -> Self {
        self.data_path = value.into();
        self
    }

    pub fn commit_message(mut self, value: impl Into<String>) -> Self {
        self.commit_message = value.into();
        self
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub remote: RemoteConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub autosave: AutoSaveConfig,
}

impl SyncConfig {
    /// Defaults overridden by `GITHUB_TOKEN` and `FOLIOSYNC_*` variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.trim().is_empty()) {
            config.remote.token = Some(token.trim().to_string());
        }
        if let Some(base) = lookup("FOLIOSYNC_API_BASE") {
            config.remote.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FOLIOSYNC_CALL_TIMEOUT_SECS")? {
            config.remote.call_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "FOLIOSYNC_MAX_RETRIES")? {
            config.retry.max_retries = n;
            config.autosave.max_retries = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FOLIOSYNC_DEBOUNCE_MS")? {
            config.autosave.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FOLIOSYNC_POLL_INTERVAL_SECS")? {
            config.autosave.poll_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, "FOLIOSYNC_MAX_FILE_BYTES")? {
            config.pipeline.max_file_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.pipeline.max_file_bytes == 0 {
            return Err(SyncError::InvalidConfig(
                "max_file_bytes must be greater than zero".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(SyncError::InvalidConfig(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.autosave.data_path.trim().is_empty() {
            return Err(SyncError::InvalidConfig("data_path cannot be empty".into()));
        }
        if self.remote.call_timeout.is_zero() {
            return Err(SyncError::InvalidConfig("call_timeout cannot be zero".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> SyncResult<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::InvalidConfig(format!("{} is not a valid number: {:?}", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.remote.call_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.pipeline.max_file_bytes, 100 * 1024 * 1024);
        assert_eq!(config.autosave.debounce, Duration::from_secs(2));
        assert_eq!(config.autosave.poll_interval, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("GITHUB_TOKEN", " ghp_abc \n"),
            ("FOLIOSYNC_API_BASE", "https://ghe.example.com/api/v3/"),
            ("FOLIOSYNC_MAX_RETRIES", "5"),
            ("FOLIOSYNC_DEBOUNCE_MS", "750"),
        ]))
        .unwrap();

        assert_eq!(config.remote.token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.remote.api_base, "https://ghe.example.com/api/v3");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.autosave.max_retries, 5);
        assert_eq!(config.autosave.debounce, Duration::from_millis(750));
    }

    #[test]
    fn test_from_env_rejects_bad_numbers() {
        let result = SyncConfig::from_lookup(lookup(&[("FOLIOSYNC_MAX_FILE_BYTES", "lots")]));
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));

        let result = SyncConfig::from_lookup(lookup(&[("FOLIOSYNC_MAX_FILE_BYTES", "0")]));
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_delay_order() {
        let mut config = SyncConfig::default();
        config.retry = config.retry.base_delay(Duration::from_secs(60));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let config = RemoteConfig::default().token("secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
