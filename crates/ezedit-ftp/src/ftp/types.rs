//! Shared types for the FTP crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ─── Connection identity ─────────────────────────────────────────────

/// Identity of a pooled session: one live handle per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.username)
    }
}

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain, then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

impl FtpSecurityMode {
    pub fn is_secure(self) -> bool {
        self != Self::None
    }
}

// ─── Connection config ───────────────────────────────────────────────

/// Everything needed to (re)establish one session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security: FtpSecurityMode,
    /// Unset means the pool's `connectTimeoutMs`.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Read/write timeout on the control and data channels. Unset means the
    /// pool's `dataTimeoutMs`.
    #[serde(default)]
    pub data_timeout_ms: Option<u64>,
    /// Accept self-signed / mismatched certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_port() -> u16 {
    21
}
/// Used when neither the connection nor a pool supplies a timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DATA_TIMEOUT_MS: u64 = 30_000;

impl Default for FtpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: "anonymous".into(),
            password: "anonymous@".into(),
            security: FtpSecurityMode::None,
            connect_timeout_ms: None,
            data_timeout_ms: None,
            accept_invalid_certs: false,
            label: None,
        }
    }
}

impl FtpConnectionConfig {
    /// Config for `host:port` with the given credentials. `secure` selects
    /// explicit FTPS.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        secure: bool,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            security: if secure {
                FtpSecurityMode::Explicit
            } else {
                FtpSecurityMode::None
            },
            ..Self::default()
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.host.clone(), self.port, self.username.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms.unwrap_or(DEFAULT_DATA_TIMEOUT_MS))
    }
}

impl fmt::Debug for FtpConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("security", &self.security)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("data_timeout_ms", &self.data_timeout_ms)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("label", &self.label)
            .finish()
    }
}

// ─── Connection lifecycle ────────────────────────────────────────────

/// Lifecycle of a pooled connection.
///
/// `Disconnected → Connecting → Active`, and from `Active` either back to
/// `Active` (probe ok) or `Reconnecting`, which ends in `Active` or
/// `Disconnected`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Reconnecting,
}

/// Password-free snapshot of a pooled connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub security: FtpSecurityMode,
    pub label: Option<String>,
    pub state: ConnectionState,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub operations: u64,
    pub failures: u64,
    pub reconnects: u32,
    pub pending_operations: usize,
}

/// Statistics about the connection pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: u32,
    pub active: u32,
    pub reconnecting: u32,
    pub disconnected: u32,
    pub pending_operations: u32,
    pub max_connections_per_host: u32,
}

// ─── Retry ───────────────────────────────────────────────────────────

/// Retry policy for pool operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Add up to 10% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
            jitter: false,
        }
    }
}

impl RetryOptions {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_factor: f64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_factor,
            max_delay_ms,
            jitter: false,
        }
    }

    /// No retries at all: a single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ─── Directory listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry parsed from LIST output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub link_target: Option<String>,
}

impl FtpEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FtpEntryKind::Directory
    }
}

// ─── FTP Response ────────────────────────────────────────────────────

/// A single FTP response (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Positive-completion reply (2xx).
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Positive-intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_host_port_user() {
        let key = ConnectionKey::new("ftp.example.com", 21, "deploy");
        assert_eq!(key.to_string(), "ftp.example.com:21:deploy");
    }

    #[test]
    fn secure_flag_selects_explicit_tls() {
        let cfg = FtpConnectionConfig::new("h", 21, "u", "p", true);
        assert_eq!(cfg.security, FtpSecurityMode::Explicit);
        assert!(cfg.security.is_secure());
        let plain = FtpConnectionConfig::new("h", 21, "u", "p", false);
        assert!(!plain.security.is_secure());
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = FtpConnectionConfig::new("h", 21, "u", "hunter2", false);
        let dbg = format!("{:?}", cfg);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn retry_options_defaults() {
        let opts = RetryOptions::default();
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.initial_delay_ms, 1000);
        assert_eq!(opts.backoff_factor, 2.0);
        assert_eq!(opts.max_delay_ms, 30_000);
        assert!(!opts.jitter);
    }

    #[test]
    fn retry_options_deserialize_camel_case() {
        let opts: RetryOptions =
            serde_json::from_str(r#"{"maxRetries":1,"initialDelayMs":500,"backoffFactor":1.5}"#)
                .unwrap();
        assert_eq!(opts.max_retries, 1);
        assert_eq!(opts.initial_delay_ms, 500);
        assert_eq!(opts.backoff_factor, 1.5);
        assert_eq!(opts.max_delay_ms, 30_000);
    }
}
