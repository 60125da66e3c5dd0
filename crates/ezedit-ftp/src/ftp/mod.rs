//! # ezedit-ftp: pooled FTP/FTPS sessions
//!
//! The layer between request handlers and remote FTP servers. Every remote
//! command goes through a pooled connection whose session handle is owned by
//! a single worker, so commands on one server never interleave.
//!
//! Architecture:
//! - `types`: connection identity, configs, snapshots, listing entries
//! - `error`: categorised FTP error with retry classification
//! - `config`: pool defaults, server presets, env/JSON loading
//! - `backoff`: delay schedule for retries
//! - `retry`: retry-wrapped execution (plain and cancellable)
//! - `queue`: per-connection FIFO lane with a single consumer
//! - `session`: the `FtpSession` / `FtpConnector` seams
//! - `protocol`: control-channel command/reply codec
//! - `tls`: rustls connector for explicit and implicit FTPS
//! - `transfer`: PASV/EPSV data channels
//! - `parser`: Unix/Windows LIST parsing
//! - `client`: concrete `FtpClient` session + `TcpConnector`
//! - `registry`: connection table, liveness probe, reconnect
//! - `activity`: bounded log of executed pool operations
//! - `pool`: high-level executor composing all of the above

pub mod types;
pub mod error;
pub mod config;
pub mod backoff;
pub mod retry;
pub mod queue;
pub mod session;
pub mod protocol;
pub mod tls;
pub mod transfer;
pub mod parser;
pub mod client;
pub mod registry;
pub mod activity;
pub mod pool;

pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use config::{FtpPreset, PoolConfig};
pub use backoff::{Backoff, BackoffStep};
pub use retry::{with_retry, with_retry_cancellable, Cancelled, RetryFailure, Retryable, StopReason};
pub use queue::OperationLane;
pub use session::{FtpConnector, FtpSession};
pub use client::{FtpClient, TcpConnector};
pub use registry::{ConnectionRegistry, PooledConnection};
pub use activity::{ActivityEntry, ActivityLog, ActivityStatus};
pub use pool::FtpPool;
