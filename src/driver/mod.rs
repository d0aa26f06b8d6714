//! Driver core.
//!
//! Everything between the caller and the wire: connection pooling, cluster
//! routing, sessions with causal-consistency bookmarks, the transaction
//! state machine, and transparent retry of transient failures.
//!
//! # Example
//!
//! ```ignore
//! use graphbolt_driver::{AuthToken, Driver, SessionConfig};
//!
//! let driver = Driver::new("bolt://localhost:7687", AuthToken::basic("user", "password"), connector)?;
//! let session = driver.session(SessionConfig::default())?;
//!
//! // Auto-commit statement
//! let result = session.run("MATCH (n) RETURN n LIMIT 10", None).await?;
//!
//! // Managed transaction with automatic retry
//! let created = session.write_transaction(|tx| Box::pin(async move {
//!     let cursor = tx.run("CREATE (n:Person {name: $name}) RETURN n").await?;
//!     Ok(cursor.collect().await?.len())
//! }), None).await?;
//!
//! session.close().await?;
//! driver.close().await?;
//! ```

mod config;
mod driver;
mod error;
mod pool;
mod record;
mod retry;
mod session;
mod transaction;

pub mod routing;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    is_routing_uri, parse_routing_uri, AddressResolver, AuthToken, DirectResolver, DriverConfig,
    DriverConfigBuilder, ServerAddress, DEFAULT_BOLT_PORT,
};
pub use driver::{Driver, RoutingDriver};
pub use error::{Classification, DriverError, DriverResult, Neo4jError};
pub use pool::{ConnectionPool, PoolConfig, PoolConfigBuilder, PoolMetrics, PooledConnection};
pub use record::{QueryResult, Record};
pub use retry::RetryConfig;
pub use session::{
    AccessMode, Bookmark, BookmarkHolder, Bookmarks, ConnectionProvider, Session, SessionConfig,
    SessionConfigBuilder, Statement, TxWork,
};
pub use transaction::{RecordCursor, Transaction, TransactionConfig, TransactionState};

/// Build a statement parameter map.
///
/// ```
/// use std::collections::HashMap;
/// use graphbolt_driver::{params, Value};
///
/// let params: HashMap<String, Value> = params! { "name" => "Alice", "age" => 30i64 };
/// assert_eq!(params.len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        std::collections::HashMap::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = std::collections::HashMap::new();
        $(
            map.insert($key.into(), $crate::bolt::Value::from($value));
        )+
        map
    }};
}
