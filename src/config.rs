// src/config.rs

//! Manages pooler configuration: loading, validation, and reload semantics.
//!
//! The file is TOML with flat scalars for pooler-wide settings, an indexed
//! `[[backend]]` array for backend nodes, and nested groups for TLS, the
//! watchdog and the admin surface. A reload that fails validation keeps the
//! previously active configuration.

use crate::core::status::BackendRole;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// One configured backend node. Identity is the index in the `[[backend]]`
/// array; nodes are never created or destroyed at runtime, only their status
/// transitions.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_backend_weight")]
    pub weight: f64,
    /// Role hint; when unset, roles are discovered from replication state.
    #[serde(default)]
    pub role: Option<BackendRole>,
    #[serde(default)]
    pub data_directory: String,
    #[serde(default)]
    pub application_name: String,
}

fn default_backend_port() -> u16 {
    5432
}
fn default_backend_weight() -> f64 {
    1.0
}

/// Configuration for TLS on the frontend listener.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "pgrelay.crt".to_string()
}
fn default_key_path() -> String {
    "pgrelay.key".to_string()
}

/// One watchdog peer instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatchdogPeer {
    pub host: String,
    pub wd_port: u16,
    /// The peer's frontend-facing pooler port, reported over the admin surface.
    pub pgrelay_port: u16,
}

/// Configuration for the JSON admin surface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    /// HS256 signing secret for bearer tokens.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_admin_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_admin_port(),
            jwt_secret: String::new(),
            username: default_admin_user(),
            password: String::new(),
            token_ttl: default_token_ttl(),
        }
    }
}

fn default_admin_port() -> u16 {
    8080
}
fn default_admin_user() -> String {
    "admin".to_string()
}
fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

/// The complete, validated pooler configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub socket_dir: String,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_max_pool")]
    pub max_pool: usize,
    #[serde(default = "default_child_life_time", with = "humantime_serde")]
    pub child_life_time: Duration,
    #[serde(default = "default_child_max_connections")]
    pub child_max_connections: usize,

    #[serde(default = "default_true")]
    pub load_balance_mode: bool,
    #[serde(default)]
    pub statement_level_load_balance: bool,
    #[serde(default = "default_true")]
    pub ignore_leading_white_space: bool,
    /// Maximum replication lag, in bytes, for a standby to stay eligible
    /// for read balancing. `0` disables the check.
    #[serde(default)]
    pub delay_threshold: u64,

    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,

    #[serde(default = "default_health_check_period", with = "humantime_serde")]
    pub health_check_period: Duration,
    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,
    #[serde(default = "default_health_check_user")]
    pub health_check_user: String,
    #[serde(default = "default_health_check_database")]
    pub health_check_database: String,
    #[serde(default = "default_health_check_max_retries")]
    pub health_check_max_retries: u32,
    #[serde(default = "default_health_check_retry_delay", with = "humantime_serde")]
    pub health_check_retry_delay: Duration,

    #[serde(default)]
    pub failover_command: String,
    #[serde(default)]
    pub failback_command: String,
    #[serde(default)]
    pub follow_primary_command: String,

    #[serde(default)]
    pub use_watchdog: bool,
    #[serde(default = "default_wd_priority")]
    pub wd_priority: u32,
    #[serde(default = "default_wd_port")]
    pub wd_port: u16,
    #[serde(default, rename = "watchdog_peer")]
    pub watchdog_peers: Vec<WatchdogPeer>,
    #[serde(default = "default_wd_heartbeat_interval", with = "humantime_serde")]
    pub wd_heartbeat_interval: Duration,
    #[serde(default = "default_wd_heartbeat_deadtime", with = "humantime_serde")]
    pub wd_heartbeat_deadtime: Duration,

    #[serde(default)]
    pub enable_pool_hba: bool,
    #[serde(default)]
    pub pool_passwd: String,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default = "default_log_destination")]
    pub log_destination: String,
    #[serde(default)]
    pub log_line_prefix: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_pid_file_name")]
    pub pid_file_name: String,
    #[serde(default = "default_status_file_name")]
    pub status_file_name: String,
}

fn default_listen_addresses() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9999
}
fn default_num_workers() -> usize {
    32
}
fn default_max_pool() -> usize {
    4
}
fn default_child_life_time() -> Duration {
    Duration::from_secs(300)
}
fn default_child_max_connections() -> usize {
    0 // unlimited
}
fn default_true() -> bool {
    true
}
fn default_health_check_period() -> Duration {
    Duration::from_secs(10)
}
fn default_health_check_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_health_check_user() -> String {
    "postgres".to_string()
}
fn default_health_check_database() -> String {
    "postgres".to_string()
}
fn default_health_check_max_retries() -> u32 {
    3
}
fn default_health_check_retry_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_wd_priority() -> u32 {
    1
}
fn default_wd_port() -> u16 {
    9000
}
fn default_wd_heartbeat_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_wd_heartbeat_deadtime() -> Duration {
    Duration::from_secs(30)
}
fn default_log_destination() -> String {
    "stderr".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_pid_file_name() -> String {
    "pgrelay.pid".to_string()
}
fn default_status_file_name() -> String {
    "pgrelay_status".to_string()
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes from defaults")
    }
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.listen_addresses.trim().is_empty() {
            return Err(anyhow!("listen_addresses cannot be empty"));
        }
        if self.num_workers == 0 {
            return Err(anyhow!("num_workers cannot be 0"));
        }
        if self.max_pool == 0 {
            return Err(anyhow!("max_pool cannot be 0"));
        }
        if self.backends.is_empty() {
            return Err(anyhow!("at least one [[backend]] must be configured"));
        }

        for (i, backend) in self.backends.iter().enumerate() {
            if backend.host.trim().is_empty() {
                return Err(anyhow!("backend #{i}: host cannot be empty"));
            }
            if backend.port == 0 {
                return Err(anyhow!("backend #{i}: port cannot be 0"));
            }
            if backend.weight < 0.0 || !backend.weight.is_finite() {
                return Err(anyhow!("backend #{i}: weight must be a non-negative number"));
            }
        }
        if self.backends.iter().map(|b| b.weight).sum::<f64>() <= 0.0 {
            return Err(anyhow!("backend weights must not all be zero"));
        }

        let primaries = self
            .backends
            .iter()
            .filter(|b| matches!(b.role, Some(BackendRole::Primary) | Some(BackendRole::Main)))
            .count();
        if primaries > 1 {
            return Err(anyhow!("at most one backend may be configured as primary"));
        }

        if self.health_check_period.is_zero() {
            return Err(anyhow!("health_check_period cannot be 0"));
        }
        if self.health_check_timeout.is_zero() {
            return Err(anyhow!("health_check_timeout cannot be 0"));
        }

        if self.use_watchdog {
            if self.watchdog_peers.is_empty() {
                return Err(anyhow!(
                    "use_watchdog is on but no [[watchdog_peer]] is configured"
                ));
            }
            if self.wd_heartbeat_interval.is_zero() {
                return Err(anyhow!("wd_heartbeat_interval cannot be 0"));
            }
            if self.wd_heartbeat_deadtime < self.wd_heartbeat_interval {
                return Err(anyhow!(
                    "wd_heartbeat_deadtime must be at least wd_heartbeat_interval"
                ));
            }
            if self.watchdog_peers.len() == 1 {
                warn!(
                    "WARNING: only one watchdog peer is configured. A two-node cluster cannot form quorum after a partition."
                );
            }
        }

        if self.enable_pool_hba && self.pool_passwd.trim().is_empty() {
            return Err(anyhow!("enable_pool_hba requires pool_passwd to be set"));
        }

        if self.ssl.enabled {
            if self.ssl.cert_path.trim().is_empty() {
                return Err(anyhow!("ssl.cert_path cannot be empty when ssl is enabled"));
            }
            if self.ssl.key_path.trim().is_empty() {
                return Err(anyhow!("ssl.key_path cannot be empty when ssl is enabled"));
            }
        }

        if self.admin.enabled {
            if self.admin.port == 0 {
                return Err(anyhow!("admin.port cannot be 0"));
            }
            if self.admin.port == self.port {
                return Err(anyhow!("admin.port cannot be the same as the pooler port"));
            }
            if self.admin.jwt_secret.trim().is_empty() && self.admin.password.trim().is_empty() {
                return Err(anyhow!(
                    "admin surface requires admin.jwt_secret or admin.password"
                ));
            }
        }

        Ok(())
    }

    /// The strict-majority quorum size of the watchdog cluster, this node
    /// included.
    pub fn watchdog_quorum(&self) -> usize {
        (self.watchdog_peers.len() + 1) / 2 + 1
    }
}
