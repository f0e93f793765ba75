//! Router configuration.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (JSON)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tracing_init::LogConfig;

/// Port the private replica-to-replica API listens on.
pub const DEFAULT_PRIVATE_API_PORT: u16 = 4444;

/// Configuration for one pipe router replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// KV namespace prefix for pipe records.
    pub prefix: String,
    /// `host:port` other replicas dial to reach this replica's private API.
    pub advertise: String,
    /// Port used when `advertise` is given as a bare host.
    pub private_api_port: u16,
    /// Upper bound on compare-and-swap attempts per operation.
    pub cas_attempts: u32,
    /// Pause between compare-and-swap attempts.
    pub cas_retry_delay_ms: u64,
    /// Wait bound sent to the store on each watch long-poll.
    pub long_poll_secs: u64,
    pub watch_backoff_initial_ms: u64,
    pub watch_backoff_max_ms: u64,
    /// Fixed delay between bridge reconnect attempts.
    pub bridge_retry_ms: u64,
    /// Reap tombstoned records older than this. `None` keeps them forever.
    pub tombstone_ttl_secs: Option<u64>,
    pub reap_interval_secs: u64,
    pub log: LogConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix: "pipes/".to_string(),
            advertise: format!("127.0.0.1:{DEFAULT_PRIVATE_API_PORT}"),
            private_api_port: DEFAULT_PRIVATE_API_PORT,
            cas_attempts: 10,
            cas_retry_delay_ms: 0,
            long_poll_secs: 10,
            watch_backoff_initial_ms: 1_000,
            watch_backoff_max_ms: 60_000,
            bridge_retry_ms: 1_000,
            tombstone_ttl_secs: None,
            reap_interval_secs: 30,
            log: LogConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Load a config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PIPEMESH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PIPEMESH_PREFIX") {
            self.prefix = val;
        }
        if let Ok(val) = std::env::var("PIPEMESH_ADVERTISE") {
            self.advertise = val;
        }
        if let Ok(val) = std::env::var("PIPEMESH_CAS_ATTEMPTS") {
            self.cas_attempts = val.parse().map_err(|e| {
                Error::Config(format!("Invalid PIPEMESH_CAS_ATTEMPTS {val:?}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.advertise.is_empty() {
            return Err(Error::Config("advertise address must not be empty".into()));
        }
        if self.cas_attempts == 0 {
            return Err(Error::Config("cas_attempts must be at least 1".into()));
        }
        if self.watch_backoff_initial_ms > self.watch_backoff_max_ms {
            return Err(Error::Config(
                "watch_backoff_initial_ms exceeds watch_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// The advertised `host:port`, appending the private API port to a bare host.
    pub fn advertise_addr(&self) -> String {
        let has_port = self
            .advertise
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if has_port {
            self.advertise.clone()
        } else {
            format!("{}:{}", self.advertise, self.private_api_port)
        }
    }

    pub const fn cas_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cas_retry_delay_ms)
    }

    pub const fn long_poll(&self) -> Duration {
        Duration::from_secs(self.long_poll_secs)
    }

    pub const fn bridge_retry(&self) -> Duration {
        Duration::from_millis(self.bridge_retry_ms)
    }

    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn tombstone_ttl(&self) -> Option<Duration> {
        self.tombstone_ttl_secs.map(Duration::from_secs)
    }

    pub const fn watch_backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(self.watch_backoff_initial_ms),
            max_delay: Duration::from_millis(self.watch_backoff_max_ms),
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each consecutive failure.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given consecutive failure (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(63) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_router_constants() {
        let config = RouterConfig::default();
        assert_eq!(config.cas_attempts, 10);
        assert_eq!(config.long_poll(), Duration::from_secs(10));
        assert_eq!(config.bridge_retry(), Duration::from_secs(1));
        assert!(config.tombstone_ttl().is_none());
        assert_eq!(config.advertise_addr(), "127.0.0.1:4444");
    }

    #[test]
    fn bare_host_gets_private_port() {
        let config = RouterConfig {
            advertise: "10.0.0.7".into(),
            ..Default::default()
        };
        assert_eq!(config.advertise_addr(), "10.0.0.7:4444");

        let config = RouterConfig {
            advertise: "10.0.0.7:5000".into(),
            ..Default::default()
        };
        assert_eq!(config.advertise_addr(), "10.0.0.7:5000");
    }

    #[test]
    fn watch_backoff_doubles_and_caps() {
        let backoff = RouterConfig::default().watch_backoff();

        // 1s, 2s, 4s, 8s, 16s, 32s, 60s (capped), 60s
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(backoff.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        std::fs::write(&path, r#"{"prefix": "scope/pipes/", "tombstone_ttl_secs": 600}"#)
            .unwrap();

        let config = RouterConfig::load(&path).unwrap();
        assert_eq!(config.prefix, "scope/pipes/");
        assert_eq!(config.log, LogConfig::default());
        assert_eq!(config.tombstone_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(config.cas_attempts, 10);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        std::fs::write(&path, "not json").unwrap();

        let err = RouterConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn log_settings_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        std::fs::write(&path, r#"{"log": {"filter": "pipemesh_kv=debug", "format": "json"}}"#)
            .unwrap();

        let config = RouterConfig::load(&path).unwrap();
        assert_eq!(config.log.filter, "pipemesh_kv=debug");
        assert_eq!(config.log.format, crate::tracing_init::LogFormat::Json);
    }

    #[test]
    fn zero_cas_attempts_rejected() {
        let config = RouterConfig {
            cas_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
