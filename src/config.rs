//! JSON configuration file
//!
//! Every section and field is optional. Durations are given in milliseconds
//! (`*_ms`) or seconds (`*_secs`) and resolved into the runtime option
//! structs of the individual components.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::trace;

use crate::actors::alert::AlertOptions;
use crate::actors::health::{HealthCheckOptions, ProbePolicy};
use crate::actors::pool::PoolOptions;
use crate::alerts::{AlertRule, NotificationChannel};
use crate::metrics::MetricsOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Probe settings shared by pool liveness checks and health checks
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ProbeConfig {
    pub fn resolve(&self) -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_millis(self.timeout_ms),
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// `host:port` of the backend
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Reported as the `database` label of pool metrics
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            database: default_database(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            probe: ProbeConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn resolve(&self) -> PoolOptions {
        PoolOptions {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            probe: self.probe.resolve(),
        }
    }
}

fn default_endpoint() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_min_size() -> usize {
    5
}

fn default_max_size() -> usize {
    20
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_maintenance_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(flatten)]
    pub probe: ProbeConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe: ProbeConfig::default(),
        }
    }
}

impl HealthConfig {
    pub fn resolve(&self) -> HealthCheckOptions {
        HealthCheckOptions {
            interval: Duration::from_millis(self.interval_ms),
            policy: self.probe.resolve(),
        }
    }
}

fn default_health_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_values_per_series")]
    pub max_values_per_series: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_values_per_series: default_max_values_per_series(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl MetricsConfig {
    pub fn resolve(&self) -> MetricsOptions {
        MetricsOptions {
            retention: Duration::from_secs(self.retention_secs),
            max_values_per_series: self.max_values_per_series,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_values_per_series() -> usize {
    1000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    #[serde(default)]
    pub channels: Vec<NotificationChannel>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            max_history: default_max_history(),
            rules: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl AlertsConfig {
    pub fn resolve(&self) -> AlertOptions {
        AlertOptions {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_history: self.max_history,
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_history() -> usize {
    1000
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{ChannelKind, Condition, Operator};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.pool.resolve().min_size, PoolOptions::default().min_size);
        assert_eq!(config.pool.resolve().probe, ProbePolicy::default());
        assert_eq!(config.health.resolve(), HealthCheckOptions::default());
        assert_eq!(
            config.metrics.resolve().retention,
            MetricsOptions::default().retention
        );
        assert_eq!(config.alerts.resolve().max_history, 1000);
        assert!(config.alerts.rules.is_empty());
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "pool": {{ "endpoint": "db:5432", "min_size": 1, "acquire_timeout_ms": 250 }},
                "health": {{ "interval_ms": 1000, "retry_count": 0 }},
                "alerts": {{
                    "rules": [{{
                        "id": "slow",
                        "name": "Slow pool",
                        "metric": "pool.health.response_time",
                        "condition": {{ "type": "threshold", "operator": ">", "threshold": 0.5 }},
                        "channels": ["ops"]
                    }}],
                    "channels": [{{
                        "id": "ops",
                        "name": "Ops",
                        "type": "discord",
                        "config": {{ "url": "http://localhost/hook" }}
                    }}]
                }}
            }}"#
        )
        .unwrap();

        let config = read_config_file(file.path()).unwrap();
        let pool = config.pool.resolve();
        assert_eq!(config.pool.endpoint, "db:5432");
        assert_eq!(pool.min_size, 1);
        assert_eq!(pool.max_size, 20);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(250));

        let health = config.health.resolve();
        assert_eq!(health.interval, Duration::from_secs(1));
        assert_eq!(health.policy.retry_count, 0);
        assert_eq!(health.policy.timeout, Duration::from_secs(5));

        assert_eq!(
            config.alerts.rules[0].condition,
            Condition::Threshold {
                operator: Operator::Gt,
                threshold: 0.5
            }
        );
        assert_eq!(config.alerts.channels[0].kind, ChannelKind::Chat);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "pool": {{ "min_size": "five" }} }}"#).unwrap();

        assert!(read_config_file(file.path()).is_err());
        assert!(read_config_file("/does/not/exist.json").is_err());
    }
}
