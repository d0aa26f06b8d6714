//! Per-address connection pool.
//!
//! One [`ConnectionPool`] owns every live connection to a single server
//! address. A counting semaphore bounds connections in use; the permit rides
//! on the handed-out [`PooledConnection`], so the in-use count can never
//! exceed `max_size` by construction. Idle connections wait in a queue and
//! are revalidated (age, idle time, server state) before reuse.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::bolt::{BoltIo, BoltVersion, Connector, ServerState};

use super::config::ServerAddress;
use super::error::{DriverError, DriverResult};

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (idle + in use).
    pub max_size: usize,
    /// Maximum connection lifetime.
    pub max_lifetime: Duration,
    /// Idle age after which a connection is discarded.
    pub idle_timeout: Duration,
    /// Deadline for opening and handshaking one connection.
    pub connection_timeout: Duration,
    /// Default deadline for acquiring a pool slot.
    pub acquisition_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(30),
            acquisition_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Start building a pool configuration.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Maximum live connections.
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    /// Maximum connection lifetime.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lifetime = lifetime;
        self
    }

    /// Idle discard threshold.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Connect/handshake deadline.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Default acquisition deadline.
    pub fn acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquisition_timeout = timeout;
        self
    }

    /// Finish building.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}

// ============================================================================
// PooledConnection
// ============================================================================

/// One live server connection, owned by the pool while idle and by exactly
/// one caller between `acquire` and `release`.
pub struct PooledConnection {
    id: u64,
    address: ServerAddress,
    io: Option<Box<dyn BoltIo>>,
    created_at: Instant,
    last_used: Instant,
    /// Slot reservation; present exactly while the connection is in use.
    permit: Option<OwnedSemaphorePermit>,
    /// Owning pool, for release; cleared before any terminal path so the
    /// drop guard only fires for abandoned handles.
    pool: Option<Arc<ConnectionPool>>,
}

impl PooledConnection {
    fn new(id: u64, address: ServerAddress, io: Box<dyn BoltIo>) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            io: Some(io),
            created_at: now,
            last_used: now,
            permit: None,
            pool: None,
        }
    }

    /// Connection id, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server address this connection is bound to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> Option<BoltVersion> {
        self.io.as_ref().map(|io| io.version())
    }

    /// Last server-reported state; a connection whose transport is gone is
    /// defunct.
    pub fn server_state(&self) -> ServerState {
        self.io
            .as_ref()
            .map(|io| io.server_state())
            .unwrap_or(ServerState::Defunct)
    }

    /// Whether this handle is currently checked out.
    pub fn is_in_use(&self) -> bool {
        self.permit.is_some()
    }

    /// Mutable transport access for the transaction layer.
    pub(crate) fn io_mut(&mut self) -> DriverResult<&mut dyn BoltIo> {
        self.io
            .as_deref_mut()
            .map(|io| io as &mut dyn BoltIo)
            .ok_or_else(|| DriverError::connection("connection has been closed"))
    }

    /// Issue a protocol `RESET`, restoring the server to `READY`.
    pub(crate) async fn reset(&mut self) -> DriverResult<()> {
        let io = self.io_mut()?;
        io.reset().await.map_err(DriverError::from_transport)
    }

    fn attach(&mut self, permit: OwnedSemaphorePermit, pool: Option<Arc<ConnectionPool>>) {
        self.permit = Some(permit);
        self.pool = pool;
        self.last_used = Instant::now();
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_lifetime
            || (!self.is_in_use() && self.last_used.elapsed() > config.idle_timeout)
    }

    /// Return this connection to its pool.
    pub async fn release(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(self).await;
        }
    }

    async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.close().await {
                tracing::debug!(connection = self.id, error = %e, "connection teardown failed");
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.server_state())
            .field("in_use", &self.is_in_use())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // An async close is impossible here; the transport tears down with
        // the socket. The pool still needs its books balanced.
        if let Some(pool) = self.pool.take() {
            pool.note_abandoned();
            tracing::warn!(
                connection = self.id,
                address = %self.address,
                "connection dropped without release; discarding"
            );
        }
    }
}

// ============================================================================
// PoolMetrics
// ============================================================================

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Live connections (idle + in use)
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
    /// Total successful acquisitions
    pub total_acquisitions: u64,
    /// Total connections opened
    pub total_created: u64,
    /// Total connections closed
    pub total_closed: u64,
    /// Total acquisition timeouts
    pub total_timeouts: u64,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Bounded pool of connections to one server address.
pub struct ConnectionPool {
    address: ServerAddress,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    idle: Mutex<VecDeque<PooledConnection>>,
    semaphore: Arc<Semaphore>,
    self_ref: Weak<ConnectionPool>,
    open: RwLock<bool>,
    size: AtomicUsize,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    total_acquisitions: AtomicU64,
    total_created: AtomicU64,
    total_closed: AtomicU64,
    total_timeouts: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool for `address`.
    pub fn new(
        address: ServerAddress,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            address,
            config,
            connector,
            idle: Mutex::new(VecDeque::new()),
            self_ref: self_ref.clone(),
            open: RwLock::new(true),
            size: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            total_acquisitions: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_closed: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        })
    }

    /// Acquire a connection within the configured acquisition timeout.
    pub async fn acquire(&self) -> DriverResult<PooledConnection> {
        self.acquire_with_timeout(self.config.acquisition_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `timeout` for a free slot.
    ///
    /// Prefers a validated idle connection; otherwise opens a new one under
    /// the slot reservation. A timed-out or failed acquisition releases the
    /// slot and leaks nothing.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> DriverResult<PooledConnection> {
        if !*self.open.read() {
            return Err(DriverError::PoolClosed);
        }

        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
        {
            Err(_) => {
                self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(DriverError::AcquisitionTimeout { timeout });
            }
            Ok(Err(_)) => return Err(DriverError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        let mut conn = match self.checkout_idle().await {
            Some(conn) => conn,
            None => match self.open_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    // The permit drops here, freeing the slot.
                    drop(permit);
                    return Err(e);
                }
            },
        };

        conn.attach(permit, self.self_ref.upgrade());
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = conn.id(), address = %self.address, "connection acquired");
        Ok(conn)
    }

    /// Pop the first still-valid idle connection, discarding stale ones.
    async fn checkout_idle(&self) -> Option<PooledConnection> {
        let (conn, stale) = {
            let mut idle = self.idle.lock();
            let mut stale = Vec::new();
            let mut found = None;
            while let Some(conn) = idle.pop_front() {
                if conn.is_expired(&self.config) || !conn.server_state().is_recoverable() {
                    stale.push(conn);
                } else {
                    found = Some(conn);
                    break;
                }
            }
            (found, stale)
        };

        for mut conn in stale {
            conn.close().await;
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.total_closed.fetch_add(1, Ordering::Relaxed);
        }

        conn
    }

    async fn open_connection(&self) -> DriverResult<PooledConnection> {
        let socket = self.address.to_socket_addr();
        let deadline = self.config.connection_timeout;

        let io = match tokio::time::timeout(deadline, self.connector.open(&socket, deadline)).await
        {
            Err(_) => {
                return Err(DriverError::connection(format!(
                    "opening connection to {socket} timed out after {deadline:?}"
                )))
            }
            Ok(Err(e)) => return Err(DriverError::from_transport(e)),
            Ok(Ok(io)) => io,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.total_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection = id, address = %self.address, "connection opened");
        Ok(PooledConnection::new(id, self.address.clone(), io))
    }

    /// Return a connection to the pool.
    ///
    /// Unrecoverable connections are closed. Connections whose server state
    /// is not clean get a protocol `RESET` first; if that fails they are
    /// closed too. Healthy connections rejoin the idle queue.
    pub async fn release(&self, mut conn: PooledConnection) {
        conn.pool = None;
        self.in_use.fetch_sub(1, Ordering::Relaxed);

        if !*self.open.read() {
            self.discard(conn).await;
            return;
        }

        let state = conn.server_state();
        if !state.is_recoverable() {
            tracing::debug!(connection = conn.id(), "discarding defunct connection");
            self.discard(conn).await;
            return;
        }

        if state.needs_reset() {
            let reset = conn.reset().await;
            if let Err(e) = reset {
                tracing::warn!(connection = conn.id(), error = %e, "reset on release failed");
                self.discard(conn).await;
                return;
            }
        }

        if conn.is_expired(&self.config) {
            self.discard(conn).await;
            return;
        }

        // Detach the permit before parking the connection: idle connections
        // hold no slot.
        let permit = conn.permit.take();
        conn.last_used = Instant::now();
        self.idle.lock().push_back(conn);
        drop(permit);
    }

    async fn discard(&self, mut conn: PooledConnection) {
        conn.close().await;
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.total_closed.fetch_add(1, Ordering::Relaxed);
        // conn (and its permit, if any) drops here
    }

    /// Balance the books for a handle dropped without release.
    fn note_abandoned(&self) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.total_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the pool: drain and close idle connections, fail waiting and
    /// future acquisitions with [`DriverError::PoolClosed`]. In-flight
    /// connections are closed as they are released.
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }

        self.semaphore.close();

        let drained: Vec<PooledConnection> = self.idle.lock().drain(..).collect();
        for mut conn in drained {
            conn.close().await;
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.total_closed.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(address = %self.address, "pool closed");
        Ok(())
    }

    /// Round-trip a `RESET` over one pooled connection.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        let mut conn = self.acquire().await?;
        let result = conn.reset().await;
        conn.release().await;
        result
    }

    /// Server address this pool serves.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Live connection count.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Idle connection count.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Checked-out connection count.
    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Point-in-time statistics.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            size: self.size(),
            idle: self.idle_count(),
            in_use: self.in_use_count(),
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address)
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .field("in_use", &self.in_use_count())
            .field("open", &*self.open.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
