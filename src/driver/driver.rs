//! Driver facades.
//!
//! A [`Driver`] owns the pools for one deployment and hands out sessions.
//! [`RoutingDriver`] is the cluster-aware variant behind `bolt+routing://`
//! URIs. Both own their pool state outright; there is no process-global
//! registry, so independent driver instances never share connections.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bolt::Connector;

use super::config::{
    is_routing_uri, parse_routing_uri, AddressResolver, AuthToken, DirectResolver, DriverConfig,
    ServerAddress,
};
use super::error::{DriverError, DriverResult};
use super::pool::{ConnectionPool, PoolConfig, PoolMetrics};
use super::routing::{RoutingConnectionPool, RoutingPoolMetrics, RoutingTable};
use super::session::{Session, SessionConfig};

fn pool_config(config: &DriverConfig) -> PoolConfig {
    PoolConfig {
        max_size: config.max_connection_pool_size,
        max_lifetime: config.max_connection_lifetime,
        idle_timeout: config.idle_timeout,
        connection_timeout: config.connection_timeout,
        acquisition_timeout: config.connection_acquisition_timeout,
    }
}

// ============================================================================
// Driver - single server
// ============================================================================

/// Driver for a single server (`bolt://` URIs).
pub struct Driver {
    config: Arc<DriverConfig>,
    pool: Arc<ConnectionPool>,
    open: RwLock<bool>,
}

impl Driver {
    /// Driver for `uri` using `connector` as the wire transport.
    pub fn new(uri: &str, auth: AuthToken, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        if is_routing_uri(uri) {
            return Err(DriverError::configuration(
                "routing URI passed to the single-server driver; use RoutingDriver",
            ));
        }
        Self::with_config(DriverConfig::new(uri, auth)?, connector)
    }

    /// Driver from an explicit configuration.
    pub fn with_config(config: DriverConfig, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        let config = Arc::new(config);
        let pool = ConnectionPool::new(config.address.clone(), pool_config(&config), connector);
        Ok(Self {
            config,
            pool,
            open: RwLock::new(true),
        })
    }

    /// Open a session.
    pub fn session(&self, config: SessionConfig) -> DriverResult<Session> {
        self.ensure_open()?;
        Ok(Session::new(
            self.pool.clone(),
            self.config.clone(),
            config,
        ))
    }

    /// Open a session with default configuration.
    pub fn default_session(&self) -> DriverResult<Session> {
        self.session(SessionConfig::default())
    }

    /// Driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Round-trip a `RESET` to check the server is reachable.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        self.ensure_open()?;
        self.pool.verify_connectivity().await
    }

    /// Pool statistics.
    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Close the driver and its pool.
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }
        self.pool.close().await
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::session("driver is closed"))
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("address", &self.config.address)
            .field("open", &*self.open.read())
            .finish()
    }
}

// ============================================================================
// RoutingDriver - cluster
// ============================================================================

/// Cluster driver (`bolt+routing://` URIs): routes reads and writes by role
/// through cached routing tables.
pub struct RoutingDriver {
    config: Arc<DriverConfig>,
    pool: Arc<RoutingConnectionPool>,
    open: RwLock<bool>,
}

impl RoutingDriver {
    /// Routing driver for a `bolt+routing://host[:port][,host[:port]...]`
    /// URI.
    pub fn new(uri: &str, auth: AuthToken, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        let seeds = parse_routing_uri(uri)?;
        let config = DriverConfig {
            address: seeds[0].clone(),
            auth,
            ..DriverConfig::default()
        };
        Self::with_seed_routers(seeds, config, connector, Arc::new(DirectResolver))
    }

    /// Routing driver from an explicit configuration; the configured address
    /// is the only seed router.
    pub fn with_config(config: DriverConfig, connector: Arc<dyn Connector>) -> DriverResult<Self> {
        let seeds = vec![config.address.clone()];
        Self::with_seed_routers(seeds, config, connector, Arc::new(DirectResolver))
    }

    /// Routing driver with explicit seed routers and a custom address
    /// resolver.
    pub fn with_seed_routers(
        seeds: Vec<ServerAddress>,
        config: DriverConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn AddressResolver>,
    ) -> DriverResult<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(RoutingConnectionPool::new(
            seeds,
            config.clone(),
            connector,
            resolver,
        )?);
        Ok(Self {
            config,
            pool,
            open: RwLock::new(true),
        })
    }

    /// Open a session.
    pub fn session(&self, config: SessionConfig) -> DriverResult<Session> {
        self.ensure_open()?;
        Ok(Session::new(
            self.pool.clone(),
            self.config.clone(),
            config,
        ))
    }

    /// Open a session with default configuration.
    pub fn default_session(&self) -> DriverResult<Session> {
        self.session(SessionConfig::default())
    }

    /// Driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Cached routing table for `database`, if any.
    pub fn routing_table(&self, database: Option<&str>) -> Option<RoutingTable> {
        self.pool.routing_table(database)
    }

    /// Check that at least one seed router is reachable.
    pub async fn verify_connectivity(&self) -> DriverResult<()> {
        self.ensure_open()?;
        self.pool.verify_connectivity().await
    }

    /// Aggregated pool statistics.
    pub fn metrics(&self) -> RoutingPoolMetrics {
        self.pool.metrics()
    }

    /// Close the driver and every per-address pool.
    pub async fn close(&self) -> DriverResult<()> {
        {
            let mut open = self.open.write();
            if !*open {
                return Ok(());
            }
            *open = false;
        }
        self.pool.close().await
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::session("driver is closed"))
        }
    }
}

impl fmt::Debug for RoutingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDriver")
            .field("address", &self.config.address)
            .field("open", &*self.open.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::{RoutingInfo, Value};
    use crate::driver::testing::{StubBehavior, StubConnector};

    fn connector(behavior: Arc<StubBehavior>) -> Arc<dyn Connector> {
        Arc::new(StubConnector::new(behavior))
    }

    #[test]
    fn test_driver_rejects_routing_uri() {
        let behavior = StubBehavior::shared();
        let result = Driver::new(
            "bolt+routing://localhost:7687",
            AuthToken::none(),
            connector(behavior),
        );
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_driver_session_runs_statements() {
        let behavior = StubBehavior::shared();
        behavior.set_result(&["x"], vec![vec![Value::Integer(1)]]);
        let driver = Driver::new(
            "bolt://localhost:7687",
            AuthToken::basic("user", "password"),
            connector(behavior),
        )
        .unwrap();

        let session = driver.default_session().unwrap();
        let result = session.run("RETURN 1 AS x", None).await.unwrap();
        assert_eq!(result.len(), 1);

        assert_eq!(driver.metrics().total_created, 1);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_verify_connectivity() {
        let behavior = StubBehavior::shared();
        let driver = Driver::new(
            "bolt://localhost:7687",
            AuthToken::none(),
            connector(behavior.clone()),
        )
        .unwrap();

        driver.verify_connectivity().await.unwrap();
        assert_eq!(behavior.resets(), 1);
    }

    #[tokio::test]
    async fn test_closed_driver_rejects_sessions() {
        let behavior = StubBehavior::shared();
        let driver =
            Driver::new("bolt://localhost:7687", AuthToken::none(), connector(behavior)).unwrap();

        driver.close().await.unwrap();
        assert!(driver.default_session().is_err());
        // Closing twice is a no-op.
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_routing_driver_end_to_end() {
        let behavior = StubBehavior::shared();
        behavior.push_routing(RoutingInfo {
            ttl_seconds: 300,
            routers: vec!["router:7687".into()],
            writers: vec!["writer:7687".into()],
            readers: vec!["reader:7687".into()],
            database: None,
        });
        let driver = RoutingDriver::new(
            "bolt+routing://router:7687",
            AuthToken::none(),
            connector(behavior.clone()),
        )
        .unwrap();

        let session = driver.default_session().unwrap();
        session.run("CREATE (:Node)", None).await.unwrap();

        let table = driver.routing_table(None).unwrap();
        assert_eq!(table.writers[0].host, "writer");

        driver.close().await.unwrap();
        assert!(matches!(
            driver.default_session().unwrap_err(),
            DriverError::Session(_)
        ));
    }

    #[test]
    fn test_routing_driver_parses_multiple_seeds() {
        let behavior = StubBehavior::shared();
        let driver = RoutingDriver::new(
            "bolt+routing://a:7687,b:7688",
            AuthToken::none(),
            connector(behavior),
        )
        .unwrap();

        assert_eq!(driver.config().address, ServerAddress::new("a", 7687));
    }
}
