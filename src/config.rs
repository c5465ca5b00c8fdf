// src/config.rs

//! Manages pool configuration: loading, validation and runtime reload.

use crate::core::state::{BackendDesc, MAX_BACKENDS};
use anyhow::{Context, Result, anyhow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

/// A shared, reloadable handle to the resolved configuration. Reload swaps
/// the whole value; readers clone what they need.
pub type SharedConfig = Arc<RwLock<Config>>;

pub fn into_shared(config: Config) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// Listener settings for the client-facing endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for the Unix-domain socket; `None` disables it.
    #[serde(default)]
    pub socket_dir: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_dir: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9999
}

/// How aggressively the supervisor trims or grows the spare session workers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpareStrategy {
    /// Keep exactly `num_init_children` workers; no dynamic sizing.
    #[default]
    Static,
    Aggressive,
    Lazy,
    Gentle,
}

impl SpareStrategy {
    /// Returns `(cycles_before_scale_down, kills_per_pass)`.
    pub fn tuning(self) -> (u32, usize) {
        match self {
            SpareStrategy::Static => (u32::MAX, 0),
            SpareStrategy::Aggressive => (25, 8),
            SpareStrategy::Lazy => (150, 3),
            SpareStrategy::Gentle => (60, 3),
        }
    }
}

/// Session worker sizing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_num_init_children")]
    pub num_init_children: usize,
    #[serde(default = "default_min_spare_children")]
    pub min_spare_children: usize,
    #[serde(default = "default_max_spare_children")]
    pub max_spare_children: usize,
    #[serde(default)]
    pub process_management: SpareStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_init_children: default_num_init_children(),
            min_spare_children: default_min_spare_children(),
            max_spare_children: default_max_spare_children(),
            process_management: SpareStrategy::default(),
        }
    }
}

fn default_num_init_children() -> usize {
    32
}
fn default_min_spare_children() -> usize {
    5
}
fn default_max_spare_children() -> usize {
    10
}

/// Health checker tuning. A period of zero disables checks for all nodes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_period", with = "humantime_serde")]
    pub period: Duration,
    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_check_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_check_database")]
    pub database: String,
    /// Test-suite control point: a file whose lines name nodes to treat as
    /// down between attempts. Off by default.
    #[serde(default)]
    pub fault_injection_file: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            period: default_health_check_period(),
            timeout: default_health_check_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            user: default_check_user(),
            password: None,
            database: default_check_database(),
            fault_injection_file: None,
        }
    }
}

fn default_health_check_period() -> Duration {
    Duration::from_secs(30)
}
fn default_health_check_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_max_retries() -> u32 {
    0
}
fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_check_user() -> String {
    "postgres".to_string()
}
fn default_check_database() -> String {
    "postgres".to_string()
}

/// Streaming-replication verifier tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SrCheckConfig {
    #[serde(default = "default_sr_check_period", with = "humantime_serde")]
    pub period: Duration,
    #[serde(default = "default_check_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_check_database")]
    pub database: String,
    /// Detach backends that claim to be primary but own no standby.
    #[serde(default)]
    pub detach_false_primary: bool,
    /// Replication delay above which a standby is reported lagging.
    #[serde(default)]
    pub delay_threshold: u64,
    /// Measure lag in microseconds of replay delay instead of WAL bytes.
    #[serde(default)]
    pub delay_by_time: bool,
}

impl Default for SrCheckConfig {
    fn default() -> Self {
        Self {
            period: default_sr_check_period(),
            user: default_check_user(),
            password: None,
            database: default_check_database(),
            detach_false_primary: false,
            delay_threshold: 0,
            delay_by_time: false,
        }
    }
}

fn default_sr_check_period() -> Duration {
    Duration::from_secs(10)
}

/// Operator-supplied external commands and primary re-election tuning.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FailoverConfig {
    /// Run for each newly detached node; `%`-substitution applies.
    #[serde(default)]
    pub failover_command: String,
    /// Run when a node is brought back into service.
    #[serde(default)]
    pub failback_command: String,
    /// Run for each standby after the primary changed.
    #[serde(default)]
    pub follow_primary_command: String,
    /// External recovery script driven by the control protocol.
    #[serde(default)]
    pub recovery_command: String,
    /// How long to keep looking for a primary after failover; zero means
    /// forever.
    #[serde(
        default = "default_search_primary_timeout",
        with = "humantime_serde"
    )]
    pub search_primary_node_timeout: Duration,
}

fn default_search_primary_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Control protocol endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PcpConfig {
    #[serde(default = "default_pcp_host")]
    pub host: String,
    #[serde(default = "default_pcp_port")]
    pub port: u16,
    #[serde(default)]
    pub socket_dir: Option<String>,
    /// The PCP user file: `user:md5hex` lines.
    #[serde(default = "default_pcp_user_file")]
    pub user_file: String,
}

impl Default for PcpConfig {
    fn default() -> Self {
        Self {
            host: default_pcp_host(),
            port: default_pcp_port(),
            socket_dir: None,
            user_file: default_pcp_user_file(),
        }
    }
}

fn default_pcp_host() -> String {
    "127.0.0.1".to_string()
}
fn default_pcp_port() -> u16 {
    9898
}
fn default_pcp_user_file() -> String {
    "pcp.conf".to_string()
}

/// Client authentication inputs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_hba_file")]
    pub hba_file: String,
    #[serde(default = "default_passwd_file")]
    pub passwd_file: String,
    /// Overrides the key-file search (`PGFLOCKKEYFILE`, then `~/.pgflockkey`).
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default = "default_auth_timeout", with = "humantime_serde")]
    pub authentication_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hba_file: default_hba_file(),
            passwd_file: default_passwd_file(),
            key_file: None,
            authentication_timeout: default_auth_timeout(),
        }
    }
}

fn default_hba_file() -> String {
    "pool_hba.conf".to_string()
}
fn default_passwd_file() -> String {
    "pool_passwd".to_string()
}
fn default_auth_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for TLS on the client listener.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// CA bundle for client certificates; required for the `cert`
    /// authentication method.
    #[serde(default)]
    pub ca_path: Option<String>,
}

fn default_cert_path() -> String {
    "pgflock.crt".to_string()
}
fn default_key_path() -> String {
    "pgflock.key".to_string()
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_streaming_mode")]
    streaming_replication: bool,
    backends: Vec<BackendDesc>,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    health_check: HealthCheckConfig,
    #[serde(default)]
    sr_check: SrCheckConfig,
    #[serde(default)]
    failover: FailoverConfig,
    #[serde(default)]
    pcp: PcpConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default = "default_status_file")]
    status_file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_streaming_mode() -> bool {
    true
}
fn default_status_file() -> String {
    "pgflock_status".to_string()
}

/// Represents the final, validated pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub log_level: String,
    /// Streaming-replication topology; disables the replication verifier
    /// and primary election when false ("raw mode").
    pub streaming_replication: bool,
    pub backends: Vec<BackendDesc>,
    pub pool: PoolConfig,
    pub health_check: HealthCheckConfig,
    pub sr_check: SrCheckConfig,
    pub failover: FailoverConfig,
    pub pcp: PcpConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub status_file: String,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            listen: raw.listen,
            log_level: raw.log_level,
            streaming_replication: raw.streaming_replication,
            backends: raw.backends,
            pool: raw.pool,
            health_check: raw.health_check,
            sr_check: raw.sr_check,
            failover: raw.failover,
            pcp: raw.pcp,
            auth: raw.auth,
            tls: raw.tls,
            status_file: raw.status_file,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            return Err(anyhow!("listen.port cannot be 0"));
        }
        if self.backends.is_empty() {
            return Err(anyhow!("at least one backend must be configured"));
        }
        if self.backends.len() > MAX_BACKENDS {
            return Err(anyhow!(
                "{} backends configured, maximum is {}",
                self.backends.len(),
                MAX_BACKENDS
            ));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.hostname.trim().is_empty() {
                return Err(anyhow!("backend #{i}: hostname cannot be empty"));
            }
            if backend.port == 0 && !backend.is_unix() {
                return Err(anyhow!("backend #{i}: port cannot be 0"));
            }
            if backend.weight < 0.0 {
                return Err(anyhow!("backend #{i}: weight cannot be negative"));
            }
        }
        if self.pool.num_init_children == 0 {
            return Err(anyhow!("pool.num_init_children cannot be 0"));
        }
        if self.pool.min_spare_children > self.pool.max_spare_children {
            return Err(anyhow!(
                "pool.min_spare_children cannot exceed pool.max_spare_children"
            ));
        }
        if self.health_check.user.trim().is_empty() {
            return Err(anyhow!("health_check.user cannot be empty"));
        }
        if self.pcp.port == 0 {
            return Err(anyhow!("pcp.port cannot be 0"));
        }
        if self.pcp.port == self.listen.port {
            return Err(anyhow!(
                "pcp.port cannot be the same as the client listener port"
            ));
        }
        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }
        if self.sr_check.detach_false_primary && !self.streaming_replication {
            return Err(anyhow!(
                "sr_check.detach_false_primary requires streaming_replication"
            ));
        }
        Ok(())
    }

    /// The set of parameters the control protocol may change at runtime.
    pub fn set_runtime_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "log_level" => self.log_level = value.to_string(),
            "health_check_period" => {
                self.health_check.period = humantime::parse_duration(value)
                    .with_context(|| format!("invalid duration '{value}'"))?;
            }
            "sr_check_period" => {
                self.sr_check.period = humantime::parse_duration(value)
                    .with_context(|| format!("invalid duration '{value}'"))?;
            }
            "delay_threshold" => {
                self.sr_check.delay_threshold = value
                    .parse()
                    .with_context(|| format!("invalid integer '{value}'"))?;
            }
            other => return Err(anyhow!("parameter \"{other}\" cannot be set at runtime")),
        }
        Ok(())
    }
}

// humantime re-exported through humantime-serde for runtime parsing.
use humantime_serde::re::humantime;
