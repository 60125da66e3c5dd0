//! Seams between the pool and a concrete FTP client.

use crate::ftp::error::FtpResult;
use crate::ftp::types::{FtpConnectionConfig, FtpEntry};
use async_trait::async_trait;

/// One authenticated FTP session.
///
/// The pool never shares a session between tasks: it lives inside its
/// connection's lane and is only touched by that lane's worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FtpSession: Send + Sync {
    /// Liveness probe.
    async fn noop(&mut self) -> FtpResult<()>;

    async fn pwd(&mut self) -> FtpResult<String>;

    async fn list(&mut self, path: &str) -> FtpResult<Vec<FtpEntry>>;

    async fn download(&mut self, path: &str) -> FtpResult<Vec<u8>>;

    /// Returns the number of bytes stored.
    async fn upload(&mut self, path: &str, data: &[u8]) -> FtpResult<u64>;

    async fn mkdir(&mut self, path: &str) -> FtpResult<()>;

    async fn delete(&mut self, path: &str) -> FtpResult<()>;

    /// Polite close. Errors are informational only.
    async fn quit(&mut self) -> FtpResult<()>;
}

/// Opens new sessions; the pool calls this on first use and on reconnect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FtpConnector: Send + Sync {
    async fn connect(&self, config: &FtpConnectionConfig) -> FtpResult<Box<dyn FtpSession>>;
}

/// The resource owned by a connection's lane.
#[derive(Default)]
pub struct SessionSlot {
    pub session: Option<Box<dyn FtpSession>>,
    /// Set while a command runs. Still set at the next turn means the last
    /// command was aborted mid-flight and the session may be out of sync.
    pub dirty: bool,
}

impl SessionSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Drop the handle, sending QUIT first if there is one.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.quit().await {
                log::debug!("QUIT failed while closing session: {}", e);
            }
        }
        self.dirty = false;
    }
}
