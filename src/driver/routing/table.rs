//! Routing table: cluster members partitioned by role, with an expiry.

use std::time::{Duration, Instant};

use crate::bolt::RoutingInfo;
use crate::driver::config::ServerAddress;
use crate::driver::error::DriverResult;
use crate::driver::session::AccessMode;

// ============================================================================
// ServerRole
// ============================================================================

/// Role a cluster member plays for one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    /// Serves routing-table queries
    Router,
    /// Accepts write transactions (the leader)
    Writer,
    /// Accepts read transactions
    Reader,
}

impl ServerRole {
    /// The role that serves a given access mode.
    ///
    /// Writes map to the writer role only; there is no fallback to readers,
    /// whatever the table looks like.
    pub fn for_mode(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Write => Self::Writer,
            AccessMode::Read => Self::Reader,
        }
    }
}

// ============================================================================
// RoutingTable
// ============================================================================

/// Cached routing table for one database.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Router addresses
    pub routers: Vec<ServerAddress>,
    /// Writer addresses
    pub writers: Vec<ServerAddress>,
    /// Reader addresses
    pub readers: Vec<ServerAddress>,
    /// Database the table applies to (empty string = server default)
    pub database: String,
    ttl: Duration,
    updated_at: Instant,
}

impl RoutingTable {
    /// Empty table for `database`; born expired, so first use refreshes.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            routers: Vec::new(),
            writers: Vec::new(),
            readers: Vec::new(),
            database: database.into(),
            ttl: Duration::ZERO,
            updated_at: Instant::now(),
        }
    }

    /// Build a table from a `ROUTE` response.
    pub(crate) fn from_info(info: &RoutingInfo, database: &str) -> DriverResult<Self> {
        let parse_all = |addresses: &[String]| -> DriverResult<Vec<ServerAddress>> {
            addresses.iter().map(|a| ServerAddress::parse(a)).collect()
        };

        Ok(Self {
            routers: parse_all(&info.routers)?,
            writers: parse_all(&info.writers)?,
            readers: parse_all(&info.readers)?,
            database: database.to_string(),
            ttl: Duration::from_secs(info.ttl_seconds),
            updated_at: Instant::now(),
        })
    }

    /// Addresses playing `role`.
    pub fn servers(&self, role: ServerRole) -> &[ServerAddress] {
        match role {
            ServerRole::Router => &self.routers,
            ServerRole::Writer => &self.writers,
            ServerRole::Reader => &self.readers,
        }
    }

    /// Whether the table is past its time-to-live.
    pub fn is_expired(&self) -> bool {
        self.updated_at.elapsed() >= self.ttl
    }

    /// Whether the table can serve `role` right now.
    pub fn is_usable_for(&self, role: ServerRole) -> bool {
        !self.is_expired() && !self.servers(role).is_empty()
    }

    /// Drop `address` from every role list, typically because it proved
    /// unreachable.
    pub fn remove_server(&mut self, address: &ServerAddress) {
        self.routers.retain(|a| a != address);
        self.writers.retain(|a| a != address);
        self.readers.retain(|a| a != address);
    }
}

// ============================================================================
// Tests
// ============================================================================
