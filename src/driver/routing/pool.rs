//! Cluster-aware connection pooling.
//!
//! [`RoutingConnectionPool`] composes one [`ConnectionPool`] per cluster
//! member behind per-database routing tables. Acquires resolve a target
//! address by requested role, refreshing the table when it is expired or
//! exhausted. Refreshes are single-flight per database; waiters share the
//! result. Writes are only ever routed to writers — a missing writer forces
//! a refresh, never a downgrade to a reader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::bolt::Connector;

use super::super::config::{AddressResolver, DriverConfig, ServerAddress};
use super::super::error::{DriverError, DriverResult};
use super::super::pool::{ConnectionPool, PoolConfig, PooledConnection};
use super::super::session::{AccessMode, ConnectionProvider};
use super::policy::ServerSelector;
use super::table::{RoutingTable, ServerRole};

// ============================================================================
// RoutingConnectionPool
// ============================================================================

/// Aggregated statistics across all per-address pools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPoolMetrics {
    /// Number of per-address pools
    pub pool_count: usize,
    /// Live connections across all pools
    pub total_size: usize,
    /// Idle connections across all pools
    pub total_idle: usize,
    /// In-use connections across all pools
    pub total_in_use: usize,
    /// Cached routing tables
    pub table_count: usize,
}

/// Connection pooling across a routed cluster.
pub struct RoutingConnectionPool {
    seed_routers: Vec<ServerAddress>,
    resolver: Arc<dyn AddressResolver>,
    connector: Arc<dyn Connector>,
    config: Arc<DriverConfig>,
    tables: RwLock<HashMap<String, RoutingTable>>,
    pools: RwLock<HashMap<ServerAddress, Arc<ConnectionPool>>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    selector: ServerSelector,
    open: RwLock<bool>,
}

impl RoutingConnectionPool {
    /// Create a routing pool seeded with `seed_routers`.
    pub fn new(
        seed_routers: Vec<ServerAddress>,
        config: Arc<DriverConfig>,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn AddressResolver>,
    ) -> DriverResult<Self> {
        if seed_routers.is_empty() {
            return Err(DriverError::configuration(
                "at least one router address is required",
            ));
        }

        Ok(Self {
            seed_routers,
            resolver,
            connector,
            config,
            tables: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            selector: ServerSelector::default(),
            open: RwLock::new(true),
        })
    }

    /// Acquire a connection for `mode` against `database`.
    ///
    /// An unreachable address is removed from the table and selection
    /// retries among the remaining addresses of the role; when the role
    /// runs empty, one forced refresh is attempted before giving up with a
    /// routing failure.
    pub async fn acquire(
        &self,
        mode: AccessMode,
        database: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<PooledConnection> {
        self.ensure_open()?;

        let role = ServerRole::for_mode(mode);
        let key = db_key(database);
        self.ensure_routing_table(database, role).await?;

        let mut forced_refresh = false;
        let mut last_error: Option<DriverError> = None;

        loop {
            let candidate = {
                let tables = self.tables.read();
                tables.get(&key).and_then(|table| {
                    self.selector
                        .select(table.servers(role), |addr| self.pool_load(addr))
                        .cloned()
                })
            };

            let address = match candidate {
                Some(address) => address,
                None => {
                    if forced_refresh {
                        return Err(match last_error {
                            Some(cause) => DriverError::routing_caused_by(
                                format!("no reachable {role:?} for database {key:?}"),
                                cause,
                            ),
                            None => DriverError::routing(format!(
                                "no {role:?} available for database {key:?}"
                            )),
                        });
                    }
                    forced_refresh = true;
                    self.refresh_routing_table(database, role).await?;
                    continue;
                }
            };

            let pool = self.get_or_create_pool(&address);
            match pool.acquire_with_timeout(timeout).await {
                Ok(conn) => return Ok(conn),
                Err(e @ DriverError::Connection(_)) => {
                    tracing::warn!(
                        address = %address,
                        error = %e,
                        "removing unreachable server from routing table"
                    );
                    self.forget_server(&key, &address);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh when the cached table cannot serve `role`.
    async fn ensure_routing_table(
        &self,
        database: Option<&str>,
        role: ServerRole,
    ) -> DriverResult<()> {
        let usable = self
            .tables
            .read()
            .get(&db_key(database))
            .map(|table| table.is_usable_for(role))
            .unwrap_or(false);

        if usable {
            return Ok(());
        }
        self.refresh_routing_table(database, role).await
    }

    /// Fetch a fresh routing table, single-flight per database.
    ///
    /// Waiters that arrive while a refresh is in progress block on the
    /// per-database lock and then reuse the freshly installed table.
    async fn refresh_routing_table(
        &self,
        database: Option<&str>,
        role: ServerRole,
    ) -> DriverResult<()> {
        let key = db_key(database);
        let lock = self.refresh_lock(&key);
        let _guard = lock.lock().await;

        // Someone else may have refreshed while we waited.
        if let Some(table) = self.tables.read().get(&key) {
            if table.is_usable_for(role) {
                return Ok(());
            }
        }

        let candidates = self.router_candidates(&key);
        if candidates.is_empty() {
            return Err(DriverError::routing("no routers known"));
        }

        let mut last_error: Option<DriverError> = None;
        for router in candidates {
            match self.fetch_table_from(&router, database, &key).await {
                Ok(table) => {
                    tracing::debug!(
                        router = %router,
                        database = %key,
                        writers = table.writers.len(),
                        readers = table.readers.len(),
                        "routing table refreshed"
                    );
                    self.tables.write().insert(key, table);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(router = %router, error = %e, "routing query failed");
                    last_error = Some(e);
                }
            }
        }

        Err(DriverError::routing_caused_by(
            "unable to fetch a routing table from any router",
            last_error.unwrap_or_else(|| DriverError::routing("no routers known")),
        ))
    }

    /// Known routers for `key`: current table's routers first, then the
    /// resolved seed routers, deduplicated in order.
    fn router_candidates(&self, key: &str) -> Vec<ServerAddress> {
        let mut candidates: Vec<ServerAddress> = self
            .tables
            .read()
            .get(key)
            .map(|t| t.routers.clone())
            .unwrap_or_default();

        for seed in &self.seed_routers {
            for resolved in self.resolver.resolve(seed) {
                if !candidates.contains(&resolved) {
                    candidates.push(resolved);
                }
            }
        }

        candidates
    }

    async fn fetch_table_from(
        &self,
        router: &ServerAddress,
        database: Option<&str>,
        key: &str,
    ) -> DriverResult<RoutingTable> {
        let pool = self.get_or_create_pool(router);
        let mut conn = pool
            .acquire_with_timeout(self.config.connection_timeout)
            .await?;

        let deadline = self.config.connection_timeout;
        let io = conn.io_mut()?;
        let result = tokio::time::timeout(deadline, io.route(database, Vec::new())).await;

        match result {
            Err(_) => {
                // Mid-flight response; the connection cannot be reused.
                drop(conn);
                Err(DriverError::connection(format!(
                    "routing query to {router} timed out after {deadline:?}"
                )))
            }
            Ok(Err(e)) => {
                conn.release().await;
                Err(DriverError::from_transport(e))
            }
            Ok(Ok(info)) => {
                conn.release().await;
                RoutingTable::from_info(&info, key)
            }
        }
    }

    fn refresh_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn forget_server(&self, key: &str, address: &ServerAddress) {
        if let Some(table) = self.tables.write().get_mut(key) {
            table.remove_server(address);
        }
    }

    fn get_or_create_pool(&self, address: &ServerAddress) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(address) {
            return pool.clone();
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(address) {
            return pool.clone();
        }

        let config = PoolConfig {
            max_size: self.config.max_connection_pool_size,
            max_lifetime: self.config.max_connection_lifetime,
            idle_timeout: self.config.idle_timeout,
            connection_timeout: self.config.connection_timeout,
            acquisition_timeout: self.config.connection_acquisition_timeout,
        };
        let pool = ConnectionPool::new(address.clone(), config, self.connector.clone());
        pools.insert(address.clone(), pool.clone());
        pool
    }

    fn pool_load(&self, address: &ServerAddress) -> usize {
        self.pools
            .read()
            .get(address)
            .map(|p| p.in_use_count())
            .unwrap_or(0)
    }

    /// Current routing table for `database`, if one is cached.
    pub fn routing_table(&self, database: Option<&str>) -> Option<RoutingTable> {
        self.tables.read().get(&db_key(database)).cloned()
    }

    /// Close every per-address pool; subsequent acquires fail.
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }

        let pools: Vec<Arc<ConnectionPool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close().await?;
        }
        Ok(())
    }

    /// Try each seed router until one answers a `RESET` round-trip.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        self.ensure_open()?;

        let mut last_error: Option<DriverError> = None;
        for seed in &self.seed_routers {
            for address in self.resolver.resolve(seed) {
                let pool = self.get_or_create_pool(&address);
                match pool.verify_connectivity().await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = Some(e),
                }
            }
        }

        Err(DriverError::routing_caused_by(
            "unable to connect to any router",
            last_error.unwrap_or_else(|| DriverError::routing("no routers known")),
        ))
    }

    /// Aggregated statistics.
    pub fn metrics(&self) -> RoutingPoolMetrics {
        let pools = self.pools.read();
        let mut metrics = RoutingPoolMetrics {
            pool_count: pools.len(),
            table_count: self.tables.read().len(),
            ..Default::default()
        };
        for pool in pools.values() {
            let m = pool.metrics();
            metrics.total_size += m.size;
            metrics.total_idle += m.idle;
            metrics.total_in_use += m.in_use;
        }
        metrics
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::PoolClosed)
        }
    }
}

#[async_trait]
impl ConnectionProvider for RoutingConnectionPool {
    async fn acquire_connection(
        &self,
        mode: AccessMode,
        database: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<PooledConnection> {
        self.acquire(mode, database, timeout).await
    }
}

impl std::fmt::Debug for RoutingConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingConnectionPool")
            .field("seed_routers", &self.seed_routers)
            .field("pools", &self.pools.read().len())
            .field("tables", &self.tables.read().len())
            .field("open", &*self.open.read())
            .finish()
    }
}

fn db_key(database: Option<&str>) -> String {
    database.unwrap_or("").to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::RoutingInfo;
    use crate::driver::config::DirectResolver;
    use crate::driver::testing::{StubBehavior, StubConnector};

    fn routing_pool(
        behavior: Arc<StubBehavior>,
        seeds: &[&str],
    ) -> RoutingConnectionPool {
        let seeds = seeds
            .iter()
            .map(|s| ServerAddress::parse(s).unwrap())
            .collect();
        RoutingConnectionPool::new(
            seeds,
            Arc::new(DriverConfig::default()),
            Arc::new(StubConnector::new(behavior)),
            Arc::new(DirectResolver),
        )
        .unwrap()
    }

    fn info(
        ttl: u64,
        routers: &[&str],
        writers: &[&str],
        readers: &[&str],
    ) -> RoutingInfo {
        let list = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        RoutingInfo {
            ttl_seconds: ttl,
            routers: list(routers),
            writers: list(writers),
            readers: list(readers),
            database: None,
        }
    }

    #[test]
    fn test_requires_a_seed_router() {
        let behavior = StubBehavior::shared();
        let result = RoutingConnectionPool::new(
            vec![],
            Arc::new(DriverConfig::default()),
            Arc::new(StubConnector::new(behavior)),
            Arc::new(DirectResolver),
        );
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_write_routed_to_writer_read_to_reader() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &["writer"], &["reader"]));
        let pool = routing_pool(behavior.clone(), &["router"]);

        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.address().host, "writer");
        conn.release().await;

        let conn = pool
            .acquire(AccessMode::Read, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.address().host, "reader");
        conn.release().await;

        // One refresh served both acquisitions.
        assert_eq!(behavior.routes(), 1);
    }

    #[tokio::test]
    async fn test_writer_failover_forces_refresh() {
        // Writer list ["a"]; "a" is unreachable. The pool must remove "a",
        // find the writer role empty, force a refresh that returns ["b"],
        // and route the request to "b".
        let behavior = StubBehavior::shared();
        behavior.refuse_address("a:7687");
        behavior.push_routing(info(300, &["router"], &["a"], &["reader"]));
        behavior.push_routing(info(300, &["router"], &["b"], &["reader"]));
        let pool = routing_pool(behavior.clone(), &["router"]);

        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.address().host, "b");
        conn.release().await;

        assert_eq!(behavior.routes(), 2);
        let table = pool.routing_table(None).unwrap();
        assert_eq!(table.writers, vec![ServerAddress::new("b", 7687)]);
    }

    #[tokio::test]
    async fn test_no_writer_anywhere_is_a_routing_failure() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &[], &["reader"]));
        behavior.push_routing(info(300, &["router"], &[], &["reader"]));
        let pool = routing_pool(behavior, &["router"]);

        let err = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Routing { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_across_readers() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &["writer"], &["r1", "r2"]));
        let pool = routing_pool(behavior, &["router"]);

        let first = pool
            .acquire(AccessMode::Read, None, Duration::from_secs(1))
            .await
            .unwrap();
        let second = pool
            .acquire(AccessMode::Read, None, Duration::from_secs(1))
            .await
            .unwrap();

        assert_ne!(first.address().host, second.address().host);
        first.release().await;
        second.release().await;
    }

    #[tokio::test]
    async fn test_expired_table_triggers_refresh() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(0, &["router"], &["writer"], &["reader"]));
        behavior.push_routing(info(300, &["router"], &["writer"], &["reader"]));
        let pool = routing_pool(behavior.clone(), &["router"]);

        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();
        conn.release().await;
        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();
        conn.release().await;

        // The zero-TTL table could not be reused.
        assert_eq!(behavior.routes(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &["writer"], &["reader"]));
        let pool = Arc::new(routing_pool(behavior.clone(), &["router"]));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool
                    .acquire(AccessMode::Write, None, Duration::from_secs(1))
                    .await
                    .unwrap();
                conn.release().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(behavior.routes(), 1);
    }

    #[tokio::test]
    async fn test_all_routers_unreachable_is_a_routing_failure() {
        let behavior = StubBehavior::shared();
        behavior.refuse_address("router:7687");
        let pool = routing_pool(behavior, &["router"]);

        let err = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            DriverError::Routing { source, .. } => {
                assert!(source.is_some());
            }
            other => panic!("expected routing failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &["writer"], &["reader"]));
        let pool = routing_pool(behavior, &["router"]);

        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();
        conn.release().await;

        pool.close().await.unwrap();
        let err = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::PoolClosed));
    }

    #[tokio::test]
    async fn test_metrics_aggregation() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(info(300, &["router"], &["writer"], &["reader"]));
        let pool = routing_pool(behavior, &["router"]);

        let conn = pool
            .acquire(AccessMode::Write, None, Duration::from_secs(1))
            .await
            .unwrap();

        let metrics = pool.metrics();
        assert!(metrics.pool_count >= 2); // router pool + writer pool
        assert_eq!(metrics.total_in_use, 1);
        assert_eq!(metrics.table_count, 1);

        conn.release().await;
        assert_eq!(pool.metrics().total_in_use, 0);
    }
}
