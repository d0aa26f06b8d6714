//! # GraphBolt Driver
//!
//! The connection-management core of a driver for Bolt-speaking graph
//! databases: connection pooling, cluster routing, sessions with
//! causal-consistency bookmarks, an explicit transaction state machine, and
//! transparent retry of transient failures.
//!
//! ## Features
//!
//! - **Connection pooling** - bounded per-address pools with idle reuse,
//!   revalidation, and acquisition timeouts
//! - **Cluster routing** - role-aware routing tables with automatic refresh
//!   and writer failover
//! - **Transactions** - explicit `begin`/`run`/`commit`/`rollback` with a
//!   strict state machine
//! - **Causal consistency** - opaque bookmarks merged across transactions
//! - **Automatic retry** - managed transactions retry transient server and
//!   cluster failures with jittered exponential backoff
//! - **Async/Await** - built on Tokio
//!
//! The byte-level Bolt protocol (framing, PackStream serialization, TLS)
//! lives behind the [`bolt`] transport traits and is provided by a wire
//! implementation crate; this crate contains everything above it.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use graphbolt_driver::{AuthToken, Driver, SessionConfig};
//!
//! // `connector` is a wire-level bolt::Connector implementation.
//! let driver = Driver::new(
//!     "bolt://localhost:7687",
//!     AuthToken::basic("user", "password"),
//!     connector,
//! )?;
//!
//! let session = driver.session(SessionConfig::default())?;
//! let result = session.run("MATCH (n) RETURN n LIMIT 10", None).await?;
//! for record in result {
//!     println!("{:?}", record.get("n"));
//! }
//!
//! session.close().await?;
//! driver.close().await?;
//! ```
//!
//! ## Explicit Transactions
//!
//! ```ignore
//! let mut tx = session.begin_transaction(None).await?;
//! tx.run("CREATE (n:Node {id: 1})").await?;
//! tx.run("CREATE (n:Node {id: 2})").await?;
//! tx.commit().await?;
//! ```
//!
//! ## Managed Transactions
//!
//! Managed transactions re-run the work function on transient failures
//! (deadlocks, leader switches, connection loss), so it must be idempotent
//! outside the transaction and must leave commit and rollback to the
//! driver:
//!
//! ```ignore
//! let count = session.write_transaction(|tx| Box::pin(async move {
//!     let cursor = tx.run("CREATE (n:Person {name: $name}) RETURN n").await?;
//!     Ok(cursor.collect().await?.len())
//! }), None).await?;
//! ```
//!
//! ## Clusters
//!
//! ```ignore
//! use graphbolt_driver::{AuthToken, RoutingDriver, SessionConfig};
//!
//! let driver = RoutingDriver::new(
//!     "bolt+routing://core1:7687,core2:7687,core3:7687",
//!     AuthToken::basic("user", "password"),
//!     connector,
//! )?;
//!
//! // Reads go to readers, writes to the writer; the routing table refreshes
//! // itself on expiry and on member failure.
//! let session = driver.session(SessionConfig::builder().with_read_access().build())?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bolt;
pub mod driver;

// Re-exports for convenience
pub use driver::{
    AccessMode, AddressResolver, AuthToken, Bookmark, BookmarkHolder, Bookmarks, Classification,
    ConnectionPool, ConnectionProvider, DirectResolver, Driver, DriverConfig, DriverConfigBuilder,
    DriverError, DriverResult, Neo4jError, PoolConfig, PoolConfigBuilder, PoolMetrics,
    PooledConnection, QueryResult, Record, RecordCursor, RetryConfig, RoutingDriver, ServerAddress,
    Session, SessionConfig, SessionConfigBuilder, Statement, Transaction, TransactionConfig,
    TransactionState, TxWork,
};

pub use bolt::{
    BoltIo, BoltVersion, Connector, MessageError, ServerState, TransportError, Value,
};
