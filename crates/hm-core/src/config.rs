//! hm.toml configuration parser.
//!
//! Most periods are expressed in heartbeats so the whole control loop
//! scales with `heartbeat_period_secs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error returned by [`HmConfig::validate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid config: {field} must be greater than zero")]
pub struct ConfigError {
    pub field: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HmConfig {
    pub heartbeat_period_secs: u64,
    pub heartbeat_ttl_in_heartbeats: u64,
    pub actual_freshness_ttl_in_heartbeats: u64,
    pub grace_period_in_heartbeats: u64,
    pub desired_state_ttl_in_heartbeats: u64,
    pub desired_freshness_ttl_in_heartbeats: u64,
    pub start_keep_alive_in_heartbeats: u64,

    pub number_of_crashes_before_backoff_begins: u32,
    pub starting_backoff_delay_in_heartbeats: u64,
    pub maximum_backoff_delay_in_heartbeats: u64,

    pub sender_message_limit: usize,
    pub sender_polling_interval_in_heartbeats: u64,
    pub analyzer_polling_interval_in_heartbeats: u64,
    pub fetcher_polling_interval_in_heartbeats: u64,

    pub desired_state_batch_size: u32,
    pub fetcher_network_timeout_secs: u64,
    pub bulk_api_url: String,
    pub credentials_timeout_secs: u64,

    pub lock_ttl_secs: u64,

    pub store: StoreConfig,
    pub subjects: SubjectsConfig,
}

/// Which store backend to use and how hard to push it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// `"redb"` or `"memory"`.
    pub backend: String,
    pub path: PathBuf,
    pub max_concurrent_requests: usize,
    pub timeout_secs: u64,
}

/// Message bus subjects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubjectsConfig {
    pub heartbeat: String,
    pub start: String,
    pub stop: String,
    pub droplet_exited: String,
    pub bulk_credentials: String,
}

impl Default for HmConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_secs: 10,
            heartbeat_ttl_in_heartbeats: 3,
            actual_freshness_ttl_in_heartbeats: 3,
            grace_period_in_heartbeats: 3,
            desired_state_ttl_in_heartbeats: 60,
            desired_freshness_ttl_in_heartbeats: 12,
            start_keep_alive_in_heartbeats: 3,
            number_of_crashes_before_backoff_begins: 3,
            starting_backoff_delay_in_heartbeats: 3,
            maximum_backoff_delay_in_heartbeats: 96,
            sender_message_limit: 30,
            sender_polling_interval_in_heartbeats: 1,
            analyzer_polling_interval_in_heartbeats: 1,
            fetcher_polling_interval_in_heartbeats: 6,
            desired_state_batch_size: 500,
            fetcher_network_timeout_secs: 10,
            bulk_api_url: "http://127.0.0.1:8181".to_string(),
            credentials_timeout_secs: 5,
            lock_ttl_secs: 10,
            store: StoreConfig::default(),
            subjects: SubjectsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "redb".to_string(),
            path: PathBuf::from("/var/lib/hm/store.redb"),
            max_concurrent_requests: 30,
            timeout_secs: 10,
        }
    }
}

impl Default for SubjectsConfig {
    fn default() -> Self {
        Self {
            heartbeat: "hm.heartbeat".to_string(),
            start: "hm.start".to_string(),
            stop: "hm.stop".to_string(),
            droplet_exited: "hm.droplet.exited".to_string(),
            bulk_credentials: "hm.bulk.credentials".to_string(),
        }
    }
}

impl HmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: HmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would stall or spin the control loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 14] = [
            ("heartbeat_period_secs", self.heartbeat_period_secs > 0),
            ("heartbeat_ttl_in_heartbeats", self.heartbeat_ttl_in_heartbeats > 0),
            (
                "actual_freshness_ttl_in_heartbeats",
                self.actual_freshness_ttl_in_heartbeats > 0,
            ),
            (
                "desired_freshness_ttl_in_heartbeats",
                self.desired_freshness_ttl_in_heartbeats > 0,
            ),
            (
                "desired_state_ttl_in_heartbeats",
                self.desired_state_ttl_in_heartbeats > 0,
            ),
            ("desired_state_batch_size", self.desired_state_batch_size > 0),
            ("sender_message_limit", self.sender_message_limit > 0),
            (
                "sender_polling_interval_in_heartbeats",
                self.sender_polling_interval_in_heartbeats > 0,
            ),
            (
                "analyzer_polling_interval_in_heartbeats",
                self.analyzer_polling_interval_in_heartbeats > 0,
            ),
            (
                "fetcher_polling_interval_in_heartbeats",
                self.fetcher_polling_interval_in_heartbeats > 0,
            ),
            ("lock_ttl_secs", self.lock_ttl_secs > 0),
            (
                "store.max_concurrent_requests",
                self.store.max_concurrent_requests > 0,
            ),
            ("store.timeout_secs", self.store.timeout_secs > 0),
            (
                "maximum_backoff_delay_in_heartbeats",
                self.maximum_backoff_delay_in_heartbeats > 0,
            ),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(ConfigError { field: *field }),
            None => Ok(()),
        }
    }

    fn heartbeats(&self, n: u64) -> u64 {
        self.heartbeat_period_secs.saturating_mul(n)
    }

    /// TTL of an instance heartbeat record, in seconds.
    pub fn heartbeat_ttl(&self) -> u64 {
        self.heartbeats(self.heartbeat_ttl_in_heartbeats)
    }

    pub fn actual_freshness_ttl(&self) -> u64 {
        self.heartbeats(self.actual_freshness_ttl_in_heartbeats)
    }

    pub fn grace_period(&self) -> u64 {
        self.heartbeats(self.grace_period_in_heartbeats)
    }

    pub fn desired_state_ttl(&self) -> u64 {
        self.heartbeats(self.desired_state_ttl_in_heartbeats)
    }

    pub fn desired_freshness_ttl(&self) -> u64 {
        self.heartbeats(self.desired_freshness_ttl_in_heartbeats)
    }

    pub fn start_keep_alive(&self) -> u64 {
        self.heartbeats(self.start_keep_alive_in_heartbeats)
    }

    pub fn starting_backoff_delay(&self) -> u64 {
        self.heartbeats(self.starting_backoff_delay_in_heartbeats)
    }

    pub fn maximum_backoff_delay(&self) -> u64 {
        self.heartbeats(self.maximum_backoff_delay_in_heartbeats)
    }

    /// Crash records reset after this long without a new crash.
    pub fn crash_count_ttl(&self) -> u64 {
        self.maximum_backoff_delay().saturating_mul(2)
    }

    pub fn sender_polling_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeats(self.sender_polling_interval_in_heartbeats))
    }

    pub fn analyzer_polling_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeats(self.analyzer_polling_interval_in_heartbeats))
    }

    pub fn fetcher_polling_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeats(self.fetcher_polling_interval_in_heartbeats))
    }

    pub fn fetcher_network_timeout(&self) -> Duration {
        Duration::from_secs(self.fetcher_network_timeout_secs)
    }

    pub fn credentials_timeout(&self) -> Duration {
        Duration::from_secs(self.credentials_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scale_with_heartbeat_period() {
        let config = HmConfig::default();
        assert_eq!(config.heartbeat_ttl(), 30);
        assert_eq!(config.grace_period(), 30);
        assert_eq!(config.desired_state_ttl(), 600);
        assert_eq!(config.maximum_backoff_delay(), 960);
        assert_eq!(config.crash_count_ttl(), 1920);
        assert_eq!(config.sender_polling_interval(), Duration::from_secs(10));
    }

    #[test]
    fn parse_minimal_overrides_defaults() {
        let config = HmConfig::from_toml_str(
            r#"
heartbeat_period_secs = 5
sender_message_limit = 8

[store]
backend = "memory"
"#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_period_secs, 5);
        assert_eq!(config.grace_period(), 15);
        assert_eq!(config.sender_message_limit, 8);
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.max_concurrent_requests, 30);
        assert_eq!(config.subjects.heartbeat, "hm.heartbeat");
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = HmConfig::from_toml_str("").unwrap();
        assert_eq!(config, HmConfig::default());
    }

    #[test]
    fn zero_heartbeat_period_is_rejected() {
        let err = HmConfig::from_toml_str("heartbeat_period_secs = 0").unwrap_err();
        assert!(err.to_string().contains("heartbeat_period_secs"));
    }

    #[test]
    fn zero_lock_ttl_is_rejected() {
        let config = HmConfig {
            lock_ttl_secs: 0,
            ..HmConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError {
                field: "lock_ttl_secs"
            })
        );
    }

    #[test]
    fn zero_store_timeout_is_rejected() {
        let err = HmConfig::from_toml_str("[store]\ntimeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("store.timeout_secs"));
    }

    #[test]
    fn zero_polling_interval_is_rejected() {
        let err = HmConfig::from_toml_str("sender_polling_interval_in_heartbeats = 0").unwrap_err();
        assert!(err.to_string().contains("sender_polling_interval_in_heartbeats"));
    }

    #[test]
    fn toml_round_trip() {
        let config = HmConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(HmConfig::from_toml_str(&text).unwrap(), config);
    }
}
