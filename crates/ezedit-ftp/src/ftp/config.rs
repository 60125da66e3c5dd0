//! Pool configuration: defaults, server presets, environment overrides.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{
    FtpConnectionConfig, RetryOptions, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DATA_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_CONNECTION_TIMEOUT: &str = "FTP_CONNECTION_TIMEOUT";
pub const ENV_KEEPALIVE_INTERVAL: &str = "FTP_KEEPALIVE_INTERVAL";
pub const ENV_MAX_CONNECTIONS: &str = "FTP_MAX_CONNECTIONS";
pub const ENV_IDLE_TIMEOUT: &str = "FTP_IDLE_TIMEOUT";
pub const ENV_MAX_RETRIES: &str = "FTP_MAX_RETRIES";
pub const ENV_RETRY_INITIAL_DELAY: &str = "FTP_RETRY_INITIAL_DELAY";
pub const ENV_RETRY_BACKOFF_FACTOR: &str = "FTP_RETRY_BACKOFF_FACTOR";
pub const ENV_RETRY_MAX_DELAY: &str = "FTP_RETRY_MAX_DELAY";

/// Tunables for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Initial TCP connect + login.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Data channel reads and writes.
    #[serde(default = "default_data_timeout")]
    pub data_timeout_ms: u64,
    /// Upper bound for one queued command, including its liveness check.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// NOOP / PWD liveness probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// 0 means unlimited.
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: u32,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default)]
    pub retry: RetryOptions,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_data_timeout() -> u64 {
    DEFAULT_DATA_TIMEOUT_MS
}
fn default_command_timeout() -> u64 {
    30_000
}
fn default_probe_timeout() -> u64 {
    5_000
}
fn default_keepalive_interval() -> u64 {
    30_000
}
fn default_idle_timeout() -> u64 {
    240_000
}
fn default_max_connections_per_host() -> u32 {
    3
}
fn default_max_queue_depth() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            data_timeout_ms: default_data_timeout(),
            command_timeout_ms: default_command_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            keepalive_interval_ms: default_keepalive_interval(),
            idle_timeout_ms: default_idle_timeout(),
            max_connections_per_host: default_max_connections_per_host(),
            max_queue_depth: default_max_queue_depth(),
            retry: RetryOptions::default(),
        }
    }
}

/// Known server families with tuned defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpPreset {
    /// Very old ProFTPD / vsftpd builds.
    Legacy,
    /// Windows IIS FTP.
    Iis,
    /// cPanel / Plesk shared hosting.
    Shared,
    Modern,
}

impl FromStr for FtpPreset {
    type Err = FtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "iis" => Ok(Self::Iis),
            "shared" => Ok(Self::Shared),
            "modern" => Ok(Self::Modern),
            other => Err(FtpError::invalid_config(format!(
                "Unknown FTP preset '{}'",
                other
            ))),
        }
    }
}

impl PoolConfig {
    pub fn preset(preset: FtpPreset) -> Self {
        let base = Self::default();
        match preset {
            FtpPreset::Legacy => Self {
                keepalive_interval_ms: 20_000,
                connect_timeout_ms: 15_000,
                max_connections_per_host: 2,
                ..base
            },
            FtpPreset::Iis => Self {
                keepalive_interval_ms: 45_000,
                data_timeout_ms: 60_000,
                probe_timeout_ms: 10_000,
                ..base
            },
            FtpPreset::Shared => Self {
                max_connections_per_host: 2,
                connect_timeout_ms: 20_000,
                keepalive_interval_ms: 25_000,
                ..base
            },
            FtpPreset::Modern => Self {
                keepalive_interval_ms: 60_000,
                max_connections_per_host: 5,
                data_timeout_ms: 60_000,
                ..base
            },
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> FtpResult<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Overlay any `FTP_*` environment variables onto this config.
    pub fn apply_env(&mut self) -> FtpResult<()> {
        if let Some(v) = env_value(ENV_CONNECTION_TIMEOUT)? {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = env_value(ENV_KEEPALIVE_INTERVAL)? {
            self.keepalive_interval_ms = v;
        }
        if let Some(v) = env_value(ENV_MAX_CONNECTIONS)? {
            self.max_connections_per_host = v;
        }
        if let Some(v) = env_value(ENV_IDLE_TIMEOUT)? {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = env_value(ENV_MAX_RETRIES)? {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_value(ENV_RETRY_INITIAL_DELAY)? {
            self.retry.initial_delay_ms = v;
        }
        if let Some(v) = env_value(ENV_RETRY_BACKOFF_FACTOR)? {
            self.retry.backoff_factor = v;
        }
        if let Some(v) = env_value(ENV_RETRY_MAX_DELAY)? {
            self.retry.max_delay_ms = v;
        }
        self.validate()
    }

    pub fn from_json_str(json: &str) -> FtpResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| FtpError::invalid_config(format!("Invalid pool config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.max_queue_depth == 0 {
            return Err(FtpError::invalid_config("maxQueueDepth must be at least 1"));
        }
        if self.command_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(FtpError::invalid_config(
                "commandTimeoutMs and probeTimeoutMs must be non-zero",
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(FtpError::invalid_config(format!(
                "backoffFactor must be >= 1, got {}",
                self.retry.backoff_factor
            )));
        }
        Ok(())
    }

    /// Fill the timeouts `conn` leaves unset with the pool-wide values.
    pub fn apply_to(&self, conn: &mut FtpConnectionConfig) {
        if conn.connect_timeout_ms.is_none() {
            conn.connect_timeout_ms = Some(self.connect_timeout_ms);
        }
        if conn.data_timeout_ms.is_none() {
            conn.data_timeout_ms = Some(self.data_timeout_ms);
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl FtpConnectionConfig {
    pub fn validate(&self) -> FtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        if self.username.is_empty() {
            return Err(FtpError::invalid_config("Username must not be empty"));
        }
        if self.port == 0 {
            return Err(FtpError::invalid_config("Port must not be 0"));
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(name: &str) -> FtpResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FtpError::invalid_config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
