use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use tracing::{debug, trace};

use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./api-monitor.db")
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between two monitoring cycles
    pub cycle_interval_secs: u64,

    /// Upper bound for one cycle when no deadline is supplied
    pub cycle_timeout_secs: u64,

    /// Default timeout of the shared HTTP client; endpoints override it per request
    pub http_timeout_secs: u64,

    /// Base URL of the alert evaluation service, alerts are not forwarded when unset
    pub alert_evaluator_url: Option<String>,

    /// Timeout for one detached publish or alert notification
    pub notify_timeout_secs: u64,

    pub retry: RetryConfig,

    /// Template for the per-endpoint breakers; the name is used as prefix
    pub breaker: CircuitBreakerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            cycle_timeout_secs: 300,
            http_timeout_secs: 30,
            alert_evaluator_url: None,
            notify_timeout_secs: 5,
            retry: RetryConfig {
                max_delay: Duration::from_secs(2),
                ..RetryConfig::default()
            },
            breaker: CircuitBreakerConfig::named("endpoint"),
        }
    }
}

impl MonitorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    pub max_workers: usize,
    pub system_collector: bool,
    pub monitoring_collector: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_workers: 5,
            system_collector: true,
            monitoring_collector: true,
        }
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read configuration file {path}"))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided! ({e})"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Load `.env`, the optional config file and the environment overrides, in that order
pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    if let Ok(env_file) = dotenv::dotenv() {
        debug!("loaded environment from {}", env_file.display());
    }

    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => Config::default(),
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
}

impl Config {
    /// Apply overrides from `lookup`, usually the process environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("API_MONITOR_DATABASE") {
            self.storage = if path == "none" {
                StorageConfig::None
            } else {
                StorageConfig::Sqlite {
                    path: PathBuf::from(path),
                }
            };
        }

        if let Some(url) = lookup("ALERT_EVALUATOR_URL") {
            self.monitor.alert_evaluator_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(bind) = lookup("API_MONITOR_BIND") {
            self.api.bind = bind
                .parse()
                .with_context(|| format!("API_MONITOR_BIND is not a socket address: {bind}"))?;
        }

        if let Some(secs) = lookup("HTTP_CLIENT_TIMEOUT_SECS") {
            self.monitor.http_timeout_secs = secs
                .parse()
                .with_context(|| format!("HTTP_CLIENT_TIMEOUT_SECS is not a number: {secs}"))?;
        }

        if let Some(secs) = lookup("CYCLE_INTERVAL_SECS") {
            self.monitor.cycle_interval_secs = secs
                .parse()
                .with_context(|| format!("CYCLE_INTERVAL_SECS is not a number: {secs}"))?;
        }

        Ok(())
    }
}

pub(crate) fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

pub(crate) fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
