//! Connection registry: one pooled connection per `host:port:user`.
//!
//! The table itself is guarded by an async mutex held only while the map is
//! read or mutated. Session handles never leave their connection's lane, so
//! liveness checks and reconnects run as ordinary lane entries.

use crate::ftp::config::PoolConfig;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::queue::OperationLane;
use crate::ftp::session::{FtpConnector, FtpSession, SessionSlot};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct ConnectionMeta {
    state: ConnectionState,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    operations: u64,
    failures: u64,
    reconnects: u32,
    ever_connected: bool,
}

/// A registry entry: stored credentials, bookkeeping, and the lane that owns
/// the session handle.
pub struct PooledConnection {
    key: ConnectionKey,
    config: FtpConnectionConfig,
    meta: StdMutex<ConnectionMeta>,
    lane: OperationLane<SessionSlot>,
}

impl PooledConnection {
    /// Create an entry with an empty session slot. Must run inside a tokio
    /// runtime (spawns the lane worker).
    pub fn new(config: FtpConnectionConfig, queue_depth: usize, command_timeout: Duration) -> Self {
        let key = config.key();
        let now = Utc::now();
        Self {
            lane: OperationLane::spawn(key.to_string(), SessionSlot::empty(), queue_depth, command_timeout),
            key,
            config,
            meta: StdMutex::new(ConnectionMeta {
                state: ConnectionState::Disconnected,
                created_at: now,
                last_activity: now,
                operations: 0,
                failures: 0,
                reconnects: 0,
                ever_connected: false,
            }),
        }
    }

    fn meta(&self) -> MutexGuard<'_, ConnectionMeta> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    pub fn lane(&self) -> &OperationLane<SessionSlot> {
        &self.lane
    }

    pub fn state(&self) -> ConnectionState {
        self.meta().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut meta = self.meta();
        if meta.state != state {
            log::debug!("{}: {:?} -> {:?}", self.key, meta.state, state);
            meta.state = state;
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.meta().last_activity
    }

    /// Record a successful use.
    pub(crate) fn touch(&self) {
        let mut meta = self.meta();
        meta.last_activity = Utc::now();
        meta.operations += 1;
    }

    pub(crate) fn record_failure(&self) {
        self.meta().failures += 1;
    }

    pub fn reconnects(&self) -> u32 {
        self.meta().reconnects
    }

    pub fn pending(&self) -> usize {
        self.lane.pending()
    }

    pub fn info(&self) -> ConnectionInfo {
        let meta = self.meta().clone();
        ConnectionInfo {
            key: self.key.clone(),
            security: self.config.security,
            label: self.config.label.clone(),
            state: meta.state,
            connected: meta.state == ConnectionState::Active,
            created_at: meta.created_at,
            last_activity: meta.last_activity,
            operations: meta.operations,
            failures: meta.failures,
            reconnects: meta.reconnects,
            pending_operations: self.lane.pending(),
        }
    }

    /// Stop the lane after its queued entries finish, then QUIT the session.
    pub async fn close(&self) {
        if let Some(mut slot) = self.lane.shutdown().await {
            slot.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Probe the session in `slot` and, if that fails, replace it with exactly
/// one fresh connection. Runs on the connection's lane.
pub(crate) async fn revive(
    slot: &mut SessionSlot,
    conn: &PooledConnection,
    connector: &dyn FtpConnector,
    probe_timeout: Duration,
) -> FtpResult<()> {
    if slot.dirty {
        log::warn!("{}: previous command was interrupted, dropping session", conn.key);
        discard(slot, probe_timeout).await;
    }

    if let Some(session) = slot.session.as_mut() {
        match probe(session.as_mut(), probe_timeout).await {
            Ok(()) => {
                conn.set_state(ConnectionState::Active);
                return Ok(());
            }
            Err(e) => {
                log::warn!("{}: liveness probe failed: {}", conn.key, e);
                discard(slot, probe_timeout).await;
            }
        }
    }

    let reconnecting = conn.meta().ever_connected;
    conn.set_state(if reconnecting {
        ConnectionState::Reconnecting
    } else {
        ConnectionState::Connecting
    });

    match connector.connect(&conn.config).await {
        Ok(session) => {
            slot.session = Some(session);
            slot.dirty = false;
            {
                let mut meta = conn.meta();
                if meta.ever_connected {
                    meta.reconnects += 1;
                }
                meta.ever_connected = true;
                meta.last_activity = Utc::now();
            }
            conn.set_state(ConnectionState::Active);
            if reconnecting {
                log::info!("{}: reconnected", conn.key);
            } else {
                log::info!("{}: connected", conn.key);
            }
            Ok(())
        }
        Err(e) => {
            conn.set_state(ConnectionState::Disconnected);
            if reconnecting {
                log::error!("{}: reconnection failed: {}", conn.key, e);
            } else {
                log::warn!("{}: connection failed: {}", conn.key, e);
            }
            Err(e.with_connection(&conn.key))
        }
    }
}

/// NOOP, falling back to PWD for servers that reject NOOP.
async fn probe(session: &mut dyn FtpSession, limit: Duration) -> FtpResult<()> {
    match bounded(limit, "NOOP probe", session.noop()).await {
        Err(e) if e.kind == FtpErrorKind::CommandRejected => {
            log::debug!("NOOP rejected, probing with PWD");
            bounded(limit, "PWD probe", session.pwd()).await.map(|_| ())
        }
        other => other,
    }
}

async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = FtpResult<T>>,
) -> FtpResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(FtpError::timeout(format!("{} timed out", what))))
}

/// Drop the session, giving QUIT a bounded chance.
pub(crate) async fn discard(slot: &mut SessionSlot, limit: Duration) {
    if let Some(mut session) = slot.session.take() {
        let _ = bounded(limit, "QUIT", session.quit()).await;
    }
    slot.dirty = false;
}

/// Table of pooled connections.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionKey, Arc<PooledConnection>>>,
    connector: Arc<dyn FtpConnector>,
    config: PoolConfig,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn FtpConnector>, config: PoolConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connector,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> Arc<dyn FtpConnector> {
        self.connector.clone()
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<Arc<PooledConnection>> {
        self.connections.lock().await.get(key).cloned()
    }

    /// Insert `conn`, closing any entry it replaces.
    pub async fn put(&self, conn: Arc<PooledConnection>) {
        let replaced = self
            .connections
            .lock()
            .await
            .insert(conn.key().clone(), conn.clone());
        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, &conn) {
                old.close().await;
            }
        }
    }

    /// Remove the entry for `key` without closing it.
    pub async fn take(&self, key: &ConnectionKey) -> Option<Arc<PooledConnection>> {
        self.connections.lock().await.remove(key)
    }

    /// Remove and close the entry for `key`.
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        match self.take(key).await {
            Some(conn) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }

    /// Remove `conn` only if it is still the registered entry for its key.
    pub(crate) async fn remove_if_current(&self, conn: &Arc<PooledConnection>) -> bool {
        let mut map = self.connections.lock().await;
        match map.get(conn.key()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                map.remove(conn.key());
                true
            }
            _ => false,
        }
    }

    pub async fn all(&self) -> Vec<Arc<PooledConnection>> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Remove every entry and hand them back for closing.
    pub(crate) async fn drain(&self) -> Vec<Arc<PooledConnection>> {
        self.connections.lock().await.drain().map(|(_, c)| c).collect()
    }

    /// Verify the session behind `conn` answers, reconnecting once if not.
    ///
    /// Returns `false` when the single reconnection attempt fails.
    pub async fn ensure_active(&self, conn: &Arc<PooledConnection>) -> bool {
        match self.revive_on_lane(conn).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: could not restore connection: {}", conn.key(), e);
                false
            }
        }
    }

    async fn revive_on_lane(&self, conn: &Arc<PooledConnection>) -> FtpResult<()> {
        let target = conn.clone();
        let connector = self.connector.clone();
        let probe_timeout = self.config.probe_timeout();
        conn.lane()
            .enqueue(move |slot| {
                async move { revive(slot, &target, connector.as_ref(), probe_timeout).await }.boxed()
            })
            .await
    }

    /// The live entry for `config`'s key, connecting a new one if needed.
    /// Timeouts `config` leaves unset come from the pool.
    ///
    /// A failed first connection leaves no entry behind.
    pub async fn get_or_create(&self, config: &FtpConnectionConfig) -> FtpResult<Arc<PooledConnection>> {
        self.get_or_create_tracked(config).await.map(|(conn, _)| conn)
    }

    /// [`get_or_create`](Self::get_or_create), also reporting whether the
    /// entry was connected by this call.
    pub(crate) async fn get_or_create_tracked(
        &self,
        config: &FtpConnectionConfig,
    ) -> FtpResult<(Arc<PooledConnection>, bool)> {
        config.validate()?;
        let key = config.key();

        let conn = {
            let mut map = self.connections.lock().await;
            if let Some(existing) = map.get(&key) {
                if !existing.lane().is_closed() {
                    return Ok((existing.clone(), false));
                }
                map.remove(&key);
            }

            let limit = self.config.max_connections_per_host as usize;
            if limit > 0 {
                let same_host = map.keys().filter(|k| k.host == key.host).count();
                if same_host >= limit {
                    return Err(FtpError::pool_exhausted(format!(
                        "Connection limit reached for {} ({} of {})",
                        key.host, same_host, limit
                    ))
                    .with_connection(&key));
                }
            }

            let mut resolved = config.clone();
            self.config.apply_to(&mut resolved);
            let conn = Arc::new(PooledConnection::new(
                resolved,
                self.config.max_queue_depth,
                self.config.command_timeout(),
            ));
            conn.set_state(ConnectionState::Connecting);
            map.insert(key.clone(), conn.clone());
            conn
        };

        log::debug!("{}: opening new pooled connection", key);
        match self.revive_on_lane(&conn).await {
            Ok(()) => Ok((conn, true)),
            Err(e) => {
                if self.remove_if_current(&conn).await {
                    conn.close().await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::session::{MockFtpConnector, MockFtpSession};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn healthy_session() -> Box<dyn FtpSession> {
        let mut session = MockFtpSession::new();
        session.expect_noop().returning(|| Ok(()));
        session.expect_quit().returning(|| Ok(()));
        Box::new(session)
    }

    fn dead_session() -> Box<dyn FtpSession> {
        let mut session = MockFtpSession::new();
        session
            .expect_noop()
            .returning(|| Err(FtpError::disconnected("client is closed")));
        session.expect_quit().returning(|| Ok(()));
        Box::new(session)
    }

    fn cfg() -> FtpConnectionConfig {
        FtpConnectionConfig::new("ftp.example.com", 21, "deploy", "secret", false)
    }

    fn registry(connector: MockFtpConnector) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(connector), PoolConfig::default())
    }

    #[tokio::test]
    async fn passing_probe_does_not_reconnect() {
        let mut connector = MockFtpConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Ok(healthy_session()));
        let reg = registry(connector);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert!(reg.ensure_active(&conn).await);
        assert_eq!(conn.reconnects(), 0);
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn failed_probe_reconnects_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut connector = MockFtpConnector::new();
        connector.expect_connect().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(dead_session()),
                _ => Ok(healthy_session()),
            }
        });
        let reg = registry(connector);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert!(reg.ensure_active(&conn).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(conn.reconnects(), 1);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn failed_reconnect_reports_false_without_looping() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut connector = MockFtpConnector::new();
        connector.expect_connect().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(dead_session()),
                _ => Err(FtpError::host_unreachable("connection refused")),
            }
        });
        let reg = registry(connector);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert!(!reg.ensure_active(&conn).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_noop_falls_back_to_pwd() {
        let mut connector = MockFtpConnector::new();
        connector.expect_connect().times(1).returning(|_| {
            let mut session = MockFtpSession::new();
            session
                .expect_noop()
                .returning(|| Err(FtpError::from_reply(502, "502 NOOP not implemented")));
            session
                .expect_pwd()
                .times(1)
                .returning(|| Ok("/".to_string()));
            session.expect_quit().returning(|| Ok(()));
            Ok(Box::new(session))
        });
        let reg = registry(connector);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert!(reg.ensure_active(&conn).await);
        assert_eq!(conn.reconnects(), 0);
    }

    #[tokio::test]
    async fn auth_failure_leaves_no_entry() {
        let mut connector = MockFtpConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(FtpError::from_reply(530, "530 Login incorrect.")));
        let reg = registry(connector);

        let err = reg.get_or_create(&cfg()).await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::AuthFailed);
        assert!(reg.get(&cfg().key()).await.is_none());
    }

    #[tokio::test]
    async fn same_key_shares_one_connection() {
        let mut connector = MockFtpConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Ok(healthy_session()));
        let reg = registry(connector);

        let a = reg.get_or_create(&cfg()).await.unwrap();
        let b = reg.get_or_create(&cfg()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn per_host_limit_is_enforced() {
        let mut connector = MockFtpConnector::new();
        connector.expect_connect().returning(|_| Ok(healthy_session()));
        let config = PoolConfig {
            max_connections_per_host: 1,
            ..PoolConfig::default()
        };
        let reg = ConnectionRegistry::new(Arc::new(connector), config);

        reg.get_or_create(&cfg()).await.unwrap();
        let other_user = FtpConnectionConfig::new("ftp.example.com", 21, "backup", "x", false);
        let err = reg.get_or_create(&other_user).await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::PoolExhausted);

        let other_host = FtpConnectionConfig::new("files.example.org", 21, "deploy", "x", false);
        assert!(reg.get_or_create(&other_host).await.is_ok());
    }

    #[tokio::test]
    async fn remove_closes_session() {
        let mut connector = MockFtpConnector::new();
        connector.expect_connect().times(1).returning(|_| {
            let mut session = MockFtpSession::new();
            session.expect_quit().times(1).returning(|| Ok(()));
            Ok(Box::new(session))
        });
        let reg = registry(connector);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert!(reg.remove(conn.key()).await);
        assert!(reg.is_empty().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!reg.remove(conn.key()).await);
    }

    #[tokio::test]
    async fn new_connection_inherits_pool_timeouts() {
        let mut connector = MockFtpConnector::new();
        connector
            .expect_connect()
            .withf(|c| c.connect_timeout_ms == Some(15_000) && c.data_timeout_ms == Some(60_000))
            .times(1)
            .returning(|_| Ok(healthy_session()));
        let pool_config = PoolConfig {
            connect_timeout_ms: 15_000,
            ..PoolConfig::preset(crate::ftp::config::FtpPreset::Iis)
        };
        let reg = ConnectionRegistry::new(Arc::new(connector), pool_config);

        let conn = reg.get_or_create(&cfg()).await.unwrap();
        assert_eq!(conn.config().data_timeout(), Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn explicit_connection_timeouts_win() {
        let mut connector = MockFtpConnector::new();
        connector
            .expect_connect()
            .withf(|c| c.connect_timeout_ms == Some(2_000) && c.data_timeout_ms == Some(60_000))
            .times(1)
            .returning(|_| Ok(healthy_session()));
        let reg = ConnectionRegistry::new(
            Arc::new(connector),
            PoolConfig::preset(crate::ftp::config::FtpPreset::Modern),
        );

        let mut config = cfg();
        config.connect_timeout_ms = Some(2_000);
        reg.get_or_create(&config).await.unwrap();
    }
}
