//! Typed configuration tree, loaded from `config.toml` layered under
//! `RELAY__`-prefixed environment variables, with an explicit
//! validation pass producing field-named error messages.
//!
//! Grounded on the teacher's `config.rs`: the `config` crate layering,
//! `#[serde(default = "fn_name")]` idiom, and hand-written
//! `validate_config()` style are kept; the shape is reworked around the
//! relay's own knobs (§6) instead of the teacher's provider-instance
//! sprawl (the Provider entity itself now lives in `provider.rs` /
//! `provider_store.rs`, not in this config tree).

use anyhow::{bail, Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub availability: AvailabilityMonitorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub http_proxy: HttpProxyConfig,
    #[serde(default)]
    pub data_dir: DataDirConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The dispatcher-mode toggle and blacklist tuning (§4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// `true` => retry-until-blacklisted mode; `false` => failover mode.
    #[serde(default)]
    pub fixed_mode: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub retry_wait_seconds: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            fixed_mode: false,
            failure_threshold: default_failure_threshold(),
            duration_minutes: default_duration_minutes(),
            retry_wait_seconds: 0,
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_duration_minutes() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityMonitorConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_operational_threshold_ms")]
    pub operational_threshold_ms: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl Default for AvailabilityMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            operational_threshold_ms: default_operational_threshold_ms(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

fn default_poll_interval_seconds() -> u64 {
    60
}

fn default_operational_threshold_ms() -> u64 {
    6000
}

fn default_probe_timeout_seconds() -> u64 {
    15
}

fn default_max_concurrent_probes() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub days_to_keep: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days_to_keep: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_proxy_scheme")]
    pub scheme: ProxyScheme,
}

fn default_proxy_scheme() -> ProxyScheme {
    ProxyScheme::Http
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl Default for ProxyScheme {
    fn default() -> Self {
        ProxyScheme::Http
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDirConfig {
    #[serde(default = "default_data_dir")]
    pub root: PathBuf,
}

impl Default for DataDirConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".code-switch")
}

impl DataDirConfig {
    pub fn providers_dir(&self) -> PathBuf {
        self.root.join("providers")
    }

    pub fn proxy_state_dir(&self) -> PathBuf {
        self.root.join("proxy-state")
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("app.db")
    }
}

/// Load configuration from `config.toml` (if present) layered under
/// `RELAY__`-prefixed environment variables (e.g.
/// `RELAY__SERVER__PORT=18101`), then validate it.
pub fn load_config(path: &str) -> Result<Config> {
    let loader = ConfigLoader::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::with_prefix("RELAY").separator("__"))
        .build()
        .context("failed to build configuration")?;

    let config: Config = loader
        .try_deserialize()
        .context("failed to deserialize configuration")?;

    validate_config(&config)?;
    Ok(config)
}

/// Field-named validation of every invariant named in §3/§4/§8.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        bail!("server.port must be nonzero");
    }

    if !(1..=10).contains(&config.blacklist.failure_threshold) {
        bail!(
            "blacklist.failure_threshold must be in [1, 10], got {}",
            config.blacklist.failure_threshold
        );
    }

    if ![15, 30, 60].contains(&config.blacklist.duration_minutes) {
        bail!(
            "blacklist.duration_minutes must be one of 15, 30, 60, got {}",
            config.blacklist.duration_minutes
        );
    }

    if config.availability.poll_interval_seconds == 0 {
        bail!("availability.poll_interval_seconds must be nonzero");
    }

    if config.availability.max_concurrent_probes == 0 {
        bail!("availability.max_concurrent_probes must be nonzero");
    }

    if config.http_proxy.enabled && config.http_proxy.address.trim().is_empty() {
        bail!("http_proxy.address is required when http_proxy.enabled = true");
    }

    Ok(())
}
