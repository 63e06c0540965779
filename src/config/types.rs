//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings (logging)
    #[serde(default)]
    pub global: GlobalConfig,

    /// Listener and health detection settings
    pub balancer: BalancerConfig,

    /// Upstream servers
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Connection pool limits
    pub pool: PoolConfig,

    /// Liveness/metrics endpoint
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Client listener and failure detection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// TCP port for client traffic
    pub port: u16,

    /// How often the detector probes each backend
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Phi threshold above which a backend counts as down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
}

/// A single upstream server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,

    /// Share of the hash ring, in virtual-node multiples
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    /// Canonical `host:port` key used by the ring, registry, and pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Per-destination cap on cached idle connections
    pub max_idle: usize,

    /// Global cap on checked-out connections
    pub max_active: usize,

    /// Age after which an idle connection is stale
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

/// Admin endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Whether the liveness/metrics endpoint is served
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the admin server
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_admin_address(),
        }
    }
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_failure_threshold() -> f64 {
    8.0
}

fn default_weight() -> u32 {
    1
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
