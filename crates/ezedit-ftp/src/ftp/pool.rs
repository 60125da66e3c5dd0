//! Connection pool: retry-wrapped execution of FTP commands over pooled,
//! per-connection serialized sessions, plus idle reaping and keepalive.

use crate::ftp::activity::ActivityLog;
use crate::ftp::client::TcpConnector;
use crate::ftp::config::PoolConfig;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::registry::{discard, revive, ConnectionRegistry, PooledConnection};
use crate::ftp::retry::{with_retry, with_retry_cancellable};
use crate::ftp::session::{FtpConnector, FtpSession, SessionSlot};
use crate::ftp::types::*;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PoolInner {
    registry: ConnectionRegistry,
    activity: ActivityLog,
    config: PoolConfig,
    maintenance: CancellationToken,
}

/// Shared handle to the pool. Cloning is cheap; all clones see the same
/// connections.
#[derive(Clone)]
pub struct FtpPool {
    inner: Arc<PoolInner>,
}

impl FtpPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn FtpConnector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                registry: ConnectionRegistry::new(connector, config.clone()),
                activity: ActivityLog::default(),
                config,
                maintenance: CancellationToken::new(),
            }),
        }
    }

    /// Pool backed by real TCP sessions.
    pub fn with_tcp(config: PoolConfig) -> Self {
        Self::new(config, Arc::new(TcpConnector))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.inner.activity
    }

    /// Connection config carrying this pool's timeouts.
    pub fn connection_config(
        &self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        secure: bool,
    ) -> FtpConnectionConfig {
        let mut config = FtpConnectionConfig::new(host, port, username, password, secure);
        self.inner.config.apply_to(&mut config);
        config
    }

    // ─── Connections ─────────────────────────────────────────────

    pub async fn get_or_create_connection(
        &self,
        config: &FtpConnectionConfig,
    ) -> FtpResult<Arc<PooledConnection>> {
        self.inner.registry.get_or_create(config).await
    }

    /// Run `command` on `conn`'s lane after making sure the session is live.
    ///
    /// Liveness check and command form one lane turn, so nothing else runs on
    /// the session in between.
    pub async fn run_queued<T, F>(&self, conn: &Arc<PooledConnection>, command: F) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + 'static,
    {
        self.run_turn(conn, command, false).await
    }

    /// One lane turn. `just_connected` skips the liveness probe for a session
    /// opened moments ago, as long as it is still open and clean.
    async fn run_turn<T, F>(
        &self,
        conn: &Arc<PooledConnection>,
        command: F,
        just_connected: bool,
    ) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + 'static,
    {
        let target = conn.clone();
        let connector = self.inner.registry.connector();
        let probe_timeout = self.inner.config.probe_timeout();

        let result = conn
            .lane()
            .enqueue(move |slot: &mut SessionSlot| {
                async move {
                    let verified = just_connected && slot.is_open() && !slot.dirty;
                    let alive = if verified {
                        Ok(())
                    } else {
                        revive(slot, &target, connector.as_ref(), probe_timeout).await
                    };
                    if let Err(e) = alive {
                        return Err(if e.is_retryable() {
                            FtpError::connection_inactive(target.key(), &e)
                        } else {
                            e
                        });
                    }
                    let session = match slot.session.as_mut() {
                        Some(session) => session,
                        None => {
                            return Err(FtpError::connection_inactive(target.key(), "no session"))
                        }
                    };

                    slot.dirty = true;
                    let out = command(session.as_mut()).await;
                    slot.dirty = false;

                    let broken = match &out {
                        Err(e) if e.kind.breaks_session() => {
                            log::debug!("{}: dropping session after {}", target.key(), e);
                            true
                        }
                        _ => false,
                    };
                    if broken {
                        discard(slot, probe_timeout).await;
                        target.set_state(ConnectionState::Disconnected);
                    }
                    out
                }
                .boxed()
            })
            .await;

        match &result {
            Ok(_) => conn.touch(),
            Err(e) => {
                conn.record_failure();
                log::debug!("{}: queued command failed: {}", conn.key(), e);
            }
        }
        result.map_err(|e| match e.connection {
            Some(_) => e,
            None => e.with_connection(conn.key()),
        })
    }

    /// Keyed form of [`run_queued`](Self::run_queued) for an existing
    /// connection.
    pub async fn enqueue<T, F>(&self, key: &ConnectionKey, command: F) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + 'static,
    {
        let conn = self
            .inner
            .registry
            .get(key)
            .await
            .ok_or_else(|| FtpError::connection_not_found(key))?;
        self.run_queued(&conn, command).await
    }

    // ─── Retry-wrapped execution ─────────────────────────────────

    /// Get-or-create the connection, verify it, and run `command`, retrying
    /// transient failures with backoff. Every attempt goes through the
    /// connection's lane again.
    pub async fn execute<T, F>(&self, config: &FtpConnectionConfig, label: &str, command: F) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + Sync + 'static,
    {
        let command = Arc::new(command);
        let started = Instant::now();
        let mut attempts = 0u32;

        let result = with_retry(&self.inner.config.retry, || {
            attempts += 1;
            self.attempt(config, command.clone())
        })
        .await
        .map_err(FtpError::from);

        self.record(label, config, started, attempts, &result);
        result
    }

    /// [`execute`](Self::execute) that gives up as soon as `token` fires.
    pub async fn execute_with_cancel<T, F>(
        &self,
        config: &FtpConnectionConfig,
        label: &str,
        token: &CancellationToken,
        command: F,
    ) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + Sync + 'static,
    {
        let command = Arc::new(command);
        let started = Instant::now();
        let mut attempts = 0u32;

        let result = with_retry_cancellable(&self.inner.config.retry, token, || {
            attempts += 1;
            self.attempt(config, command.clone())
        })
        .await
        .map_err(FtpError::from);

        self.record(label, config, started, attempts, &result);
        result
    }

    async fn attempt<T, F>(&self, config: &FtpConnectionConfig, command: Arc<F>) -> FtpResult<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a mut dyn FtpSession) -> BoxFuture<'a, FtpResult<T>> + Send + Sync + 'static,
    {
        let (conn, created) = self.inner.registry.get_or_create_tracked(config).await?;
        self.run_turn(&conn, move |session| (*command)(session), created)
            .await
    }

    fn record<T>(
        &self,
        label: &str,
        config: &FtpConnectionConfig,
        started: Instant,
        attempts: u32,
        result: &FtpResult<T>,
    ) {
        let error = result.as_ref().err().map(|e| e.to_string());
        self.inner.activity.record(
            label,
            &config.key().to_string(),
            started.elapsed(),
            attempts,
            error,
        );
    }

    // ─── Convenience operations ──────────────────────────────────

    pub async fn list(&self, config: &FtpConnectionConfig, path: &str) -> FtpResult<Vec<FtpEntry>> {
        let path = path.to_string();
        self.execute(config, "list", move |session| {
            let path = path.clone();
            async move { session.list(&path).await }.boxed()
        })
        .await
    }

    pub async fn download(&self, config: &FtpConnectionConfig, path: &str) -> FtpResult<Vec<u8>> {
        let path = path.to_string();
        self.execute(config, "download", move |session| {
            let path = path.clone();
            async move { session.download(&path).await }.boxed()
        })
        .await
    }

    /// Store `data` at `path`; returns the bytes written.
    pub async fn upload(&self, config: &FtpConnectionConfig, path: &str, data: Vec<u8>) -> FtpResult<u64> {
        let path = path.to_string();
        let data = Arc::new(data);
        self.execute(config, "upload", move |session| {
            let path = path.clone();
            let data = data.clone();
            async move { session.upload(&path, &data).await }.boxed()
        })
        .await
    }

    pub async fn mkdir(&self, config: &FtpConnectionConfig, path: &str) -> FtpResult<()> {
        let path = path.to_string();
        self.execute(config, "mkdir", move |session| {
            let path = path.clone();
            async move { session.mkdir(&path).await }.boxed()
        })
        .await
    }

    pub async fn delete(&self, config: &FtpConnectionConfig, path: &str) -> FtpResult<()> {
        let path = path.to_string();
        self.execute(config, "delete", move |session| {
            let path = path.clone();
            async move { session.delete(&path).await }.boxed()
        })
        .await
    }

    pub async fn pwd(&self, config: &FtpConnectionConfig) -> FtpResult<String> {
        self.execute(config, "pwd", |session| session.pwd()).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Close and forget the connection for `key`. Queued operations finish
    /// first.
    pub async fn disconnect(&self, key: &ConnectionKey) -> bool {
        let removed = self.inner.registry.remove(key).await;
        if removed {
            log::info!("{}: disconnected", key);
        }
        removed
    }

    /// Stop maintenance and close every connection.
    pub async fn shutdown(&self) {
        self.inner.maintenance.cancel();
        let conns = self.inner.registry.drain().await;
        let count = conns.len();
        join_all(conns.iter().map(|c| c.close())).await;
        log::info!("FTP pool shut down ({} connections closed)", count);
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .registry
            .all()
            .await
            .iter()
            .map(|c| c.info())
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let conns = self.inner.registry.all().await;
        let mut stats = PoolStats {
            total: conns.len() as u32,
            max_connections_per_host: self.inner.config.max_connections_per_host,
            ..PoolStats::default()
        };
        for conn in &conns {
            match conn.state() {
                ConnectionState::Active => stats.active += 1,
                ConnectionState::Reconnecting | ConnectionState::Connecting => {
                    stats.reconnecting += 1
                }
                ConnectionState::Disconnected => stats.disconnected += 1,
            }
            stats.pending_operations += conn.pending() as u32;
        }
        stats
    }

    // ─── Maintenance ─────────────────────────────────────────────

    /// Close connections idle past `idleTimeoutMs` with nothing queued.
    /// Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let idle = chrono::Duration::milliseconds(self.inner.config.idle_timeout_ms as i64);
        let cutoff = Utc::now() - idle;
        let mut reaped = 0;

        for conn in self.inner.registry.all().await {
            if conn.pending() > 0 || conn.last_activity() >= cutoff {
                continue;
            }
            if self.inner.registry.remove_if_current(&conn).await {
                conn.close().await;
                reaped += 1;
            }
        }

        if reaped > 0 {
            log::info!("FTP pool: reaped {} idle connections", reaped);
        }
        reaped
    }

    /// NOOP every idle connection through its lane. A connection that fails
    /// the probe and its one reconnection is removed. Returns how many were
    /// removed.
    pub async fn keepalive_all(&self) -> usize {
        let mut removed = 0;
        for conn in self.inner.registry.all().await {
            if conn.pending() > 0 {
                continue;
            }
            if !self.inner.registry.ensure_active(&conn).await
                && self.inner.registry.remove_if_current(&conn).await
            {
                log::warn!("{}: keepalive failed, removing connection", conn.key());
                conn.close().await;
                removed += 1;
            }
        }
        removed
    }

    /// Spawn a background task running [`reap_idle`](Self::reap_idle) and
    /// [`keepalive_all`](Self::keepalive_all) every `keepaliveIntervalMs`.
    /// The task ends on [`shutdown`](Self::shutdown) or when the last pool
    /// handle is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let stop = self.inner.maintenance.clone();
        let period = self.inner.config.keepalive_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let pool = FtpPool { inner };
                pool.reap_idle().await;
                pool.keepalive_all().await;
            }
            log::debug!("FTP pool maintenance stopped");
        })
    }
}
