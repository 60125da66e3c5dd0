//! FTP-specific error type.
//!
//! The kind is assigned where the lower-level failure is first caught (a
//! reply code, an I/O error, a connect attempt). Retry decisions downstream
//! look only at the kind.

use crate::ftp::retry::{Cancelled, Retryable, RetryFailure, StopReason};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Connection key (`host:port:user`) the error belongs to.
    pub connection: Option<String>,
    /// Attempts made before this error was surfaced.
    pub attempts: Option<u32>,
    /// Last underlying error, for `RetriesExhausted`.
    pub cause: Option<Box<FtpError>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// DNS resolution or TCP connect failure.
    HostUnreachable,
    /// Peer reset or aborted the connection mid-command.
    ConnectionReset,
    /// TLS handshake failure.
    TlsFailed,
    /// Wrong username/password (530).
    AuthFailed,
    /// Server rejected the command syntax (500–504).
    CommandRejected,
    /// Data channel could not be established (425, PASV/EPSV failed).
    DataChannelFailed,
    /// Transfer aborted or incomplete (426, 451).
    TransferFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// Local I/O error.
    IoError,
    /// Operation timed out.
    Timeout,
    /// Control connection closed ("client is closed", 421).
    Disconnected,
    /// Liveness could not be restored for a pooled connection.
    ConnectionInactive,
    /// No pooled connection for the given key.
    ConnectionNotFound,
    /// Permission denied on the server.
    PermissionDenied,
    /// File/directory not found on the server.
    NotFound,
    /// Disk quota / storage exceeded.
    QuotaExceeded,
    /// The connection's operation queue is full.
    QueueFull,
    /// Per-host connection limit reached.
    PoolExhausted,
    /// Operation cancelled by the caller.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Retry budget spent on transient failures.
    RetriesExhausted,
    /// Catch-all.
    Unknown,
}

impl FtpErrorKind {
    /// Transient failures worth another attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FtpErrorKind::HostUnreachable
                | FtpErrorKind::ConnectionReset
                | FtpErrorKind::DataChannelFailed
                | FtpErrorKind::TransferFailed
                | FtpErrorKind::Timeout
                | FtpErrorKind::Disconnected
                | FtpErrorKind::ConnectionInactive
        )
    }

    /// Failures after which the session handle can no longer be trusted.
    pub fn breaks_session(self) -> bool {
        matches!(
            self,
            FtpErrorKind::ConnectionReset
                | FtpErrorKind::Timeout
                | FtpErrorKind::Disconnected
                | FtpErrorKind::ProtocolError
        )
    }
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            connection: None,
            attempts: None,
            cause: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_connection(mut self, key: impl fmt::Display) -> Self {
        self.connection = Some(key.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }

    /// The underlying error for `RetriesExhausted`, otherwise `self`.
    pub fn root_cause(&self) -> &FtpError {
        match self.cause.as_deref() {
            Some(inner) => inner.root_cause(),
            None => self,
        }
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn host_unreachable(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::HostUnreachable, msg)
    }

    pub fn connection_reset(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionReset, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn connection_inactive(key: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::new(
            FtpErrorKind::ConnectionInactive,
            format!("Connection {} is inactive: {}", key, reason),
        )
        .with_connection(key)
    }

    pub fn connection_not_found(key: impl fmt::Display) -> Self {
        Self::new(
            FtpErrorKind::ConnectionNotFound,
            format!("No pooled connection for {}", key),
        )
        .with_connection(key)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::PermissionDenied, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn queue_full(key: impl fmt::Display, depth: usize) -> Self {
        Self::new(
            FtpErrorKind::QueueFull,
            format!("Operation queue for {} is full ({} pending)", key, depth),
        )
    }

    pub fn pool_exhausted(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::PoolExhausted, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Wrap the last transient error after the retry budget ran out.
    pub fn retries_exhausted(last: FtpError, attempts: u32) -> Self {
        Self {
            kind: FtpErrorKind::RetriesExhausted,
            message: format!("Retries exhausted: {}", last.message),
            code: last.code,
            connection: last.connection.clone(),
            attempts: Some(attempts),
            cause: Some(Box::new(last)),
        }
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let lower = text.to_lowercase();
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 => FtpErrorKind::DataChannelFailed,
            426 | 451 => FtpErrorKind::TransferFailed,
            430 | 530 | 532 => FtpErrorKind::AuthFailed,
            450 | 550 | 553 => {
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else {
                    FtpErrorKind::NotFound
                }
            }
            452 | 552 => FtpErrorKind::QuotaExceeded,
            534 => FtpErrorKind::TlsFailed,
            500..=504 => FtpErrorKind::CommandRejected,
            _ if code >= 400 => FtpErrorKind::CommandRejected,
            _ => FtpErrorKind::ProtocolError,
        };
        Self::new(kind, text).with_code(code)
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?,
            None => write!(f, "[FTP {:?}] {}", self.kind, self.message)?,
        }
        if let Some(attempts) = self.attempts {
            write!(f, " (after {} attempts)", attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::connection_reset(e.to_string()),
            ErrorKind::UnexpectedEof | ErrorKind::NotConnected => {
                Self::disconnected(e.to_string())
            }
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable => {
                Self::host_unreachable(e.to_string())
            }
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

impl From<Cancelled> for FtpError {
    fn from(_: Cancelled) -> Self {
        Self::cancelled("Operation cancelled")
    }
}

impl Retryable for FtpError {
    fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<RetryFailure<FtpError>> for FtpError {
    fn from(failure: RetryFailure<FtpError>) -> Self {
        match failure.reason {
            StopReason::Exhausted => FtpError::retries_exhausted(failure.error, failure.attempts),
            StopReason::Terminal | StopReason::Cancelled => {
                failure.error.with_attempts(failure.attempts)
            }
        }
    }
}
