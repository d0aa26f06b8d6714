//! Driver configuration: authentication, addressing, timeouts.

use std::fmt;
use std::time::Duration;

use super::error::{DriverError, DriverResult};
use super::retry::RetryConfig;

// ============================================================================
// AuthToken
// ============================================================================

/// Authentication token passed to the transport during handshake.
#[derive(Debug, Clone, Default)]
pub enum AuthToken {
    /// No authentication
    #[default]
    None,
    /// Username/password authentication
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
        /// Optional authentication realm
        realm: Option<String>,
    },
    /// Bearer token authentication
    Bearer {
        /// The token
        token: String,
    },
    /// Custom authentication scheme
    Custom {
        /// Principal
        principal: String,
        /// Credentials
        credentials: String,
        /// Realm
        realm: String,
        /// Scheme name
        scheme: String,
    },
}

impl AuthToken {
    /// Basic authentication token.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: None,
        }
    }

    /// Basic authentication token with a realm.
    pub fn basic_with_realm(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
    ) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
            realm: Some(realm.into()),
        }
    }

    /// Bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// No authentication.
    pub fn none() -> Self {
        Self::None
    }

    /// Scheme name as sent to the server.
    pub fn scheme(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
            Self::Custom { scheme, .. } => scheme,
        }
    }
}

// ============================================================================
// ServerAddress
// ============================================================================

/// Default Bolt port.
pub const DEFAULT_BOLT_PORT: u16 = 7687;

/// A server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    /// Host name or IP
    pub host: String,
    /// Port
    pub port: u16,
}

impl ServerAddress {
    /// Create a new server address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a bare `host[:port]` string.
    pub fn parse(s: &str) -> DriverResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DriverError::configuration("empty server address"));
        }

        match s.split_once(':') {
            None => Ok(Self::new(s, DEFAULT_BOLT_PORT)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(DriverError::configuration(format!(
                        "invalid server address {s:?}"
                    )));
                }
                let port = port.parse().map_err(|_| {
                    DriverError::configuration(format!("invalid port in address {s:?}"))
                })?;
                Ok(Self::new(host, port))
            }
        }
    }

    /// Parse from a `bolt://host[:port]` style URI.
    pub fn from_uri(uri: &str) -> DriverResult<Self> {
        let rest = strip_scheme(uri)?;
        Self::parse(rest)
    }

    /// `host:port` socket address string for the transport.
    pub fn to_socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_BOLT_PORT)
    }
}

const URI_SCHEMES: [&str; 6] = [
    "bolt://",
    "bolt+s://",
    "bolt+ssc://",
    "bolt+routing://",
    "bolt+routing+s://",
    "bolt+routing+ssc://",
];

fn strip_scheme(uri: &str) -> DriverResult<&str> {
    for scheme in URI_SCHEMES {
        if let Some(rest) = uri.strip_prefix(scheme) {
            return Ok(rest);
        }
    }
    Err(DriverError::configuration(format!(
        "unsupported URI scheme in {uri:?}"
    )))
}

/// Whether a URI selects the cluster-routing driver.
pub fn is_routing_uri(uri: &str) -> bool {
    uri.starts_with("bolt+routing://")
        || uri.starts_with("bolt+routing+s://")
        || uri.starts_with("bolt+routing+ssc://")
}

/// Parse the comma-separated address list of a routing URI.
pub fn parse_routing_uri(uri: &str) -> DriverResult<Vec<ServerAddress>> {
    let rest = strip_scheme(uri)?;

    let mut routers = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        routers.push(ServerAddress::parse(part)?);
    }

    if routers.is_empty() {
        return Err(DriverError::configuration("no router addresses in URI"));
    }

    Ok(routers)
}

// ============================================================================
// AddressResolver
// ============================================================================

/// Resolves an initial address into the concrete addresses to contact.
///
/// The default resolution is the identity; custom implementations can expand
/// a DNS alias or a load-balancer name into the individual cluster members.
pub trait AddressResolver: Send + Sync {
    /// Resolve `address` into one or more concrete addresses.
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress>;
}

/// Identity resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

impl AddressResolver for DirectResolver {
    fn resolve(&self, address: &ServerAddress) -> Vec<ServerAddress> {
        vec![address.clone()]
    }
}

// ============================================================================
// DriverConfig
// ============================================================================

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Initial server (or seed router) address.
    pub address: ServerAddress,
    /// Authentication token.
    pub auth: AuthToken,
    /// Maximum live connections per server address.
    pub max_connection_pool_size: usize,
    /// How long an acquire may wait for a pool slot.
    pub connection_acquisition_timeout: Duration,
    /// Deadline for opening and handshaking one connection.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a pooled connection.
    pub max_connection_lifetime: Duration,
    /// How long a connection may sit idle before being discarded.
    pub idle_timeout: Duration,
    /// Lower bound applied to caller-requested transaction timeouts.
    ///
    /// The server manages transaction timeouts; very small client values
    /// would expire client-side first and mask the server's own error.
    pub transaction_timeout_floor: Duration,
    /// Client-side margin added beyond the server-enforced timeout, so the
    /// server's timeout error is observed before the client gives up.
    pub transaction_timeout_grace: Duration,
    /// Records fetched per `PULL`.
    pub fetch_size: i64,
    /// Managed-transaction retry policy.
    pub retry: RetryConfig,
    /// User agent reported to the server.
    pub user_agent: String,
}

impl DriverConfig {
    /// Configuration for `uri` with the given auth token.
    pub fn new(uri: &str, auth: AuthToken) -> DriverResult<Self> {
        let address = ServerAddress::from_uri(uri)?;
        Ok(Self {
            address,
            auth,
            ..Self::default()
        })
    }

    /// Start building a configuration.
    pub fn builder(uri: &str, auth: AuthToken) -> DriverResult<DriverConfigBuilder> {
        Ok(DriverConfigBuilder {
            config: Self::new(uri, auth)?,
        })
    }

    /// Apply the configured floor to a caller-requested transaction timeout.
    pub(crate) fn effective_tx_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.map(|t| t.max(self.transaction_timeout_floor))
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            address: ServerAddress::default(),
            auth: AuthToken::default(),
            max_connection_pool_size: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            max_connection_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            transaction_timeout_floor: Duration::from_secs(30),
            transaction_timeout_grace: Duration::from_secs(2),
            fetch_size: 1000,
            retry: RetryConfig::default(),
            user_agent: concat!("graphbolt-driver/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ============================================================================
// DriverConfigBuilder
// ============================================================================

/// Builder for [`DriverConfig`].
#[derive(Debug, Clone)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// Maximum live connections per server address.
    pub fn with_max_connection_pool_size(mut self, size: usize) -> Self {
        self.config.max_connection_pool_size = size;
        self
    }

    /// Acquisition deadline.
    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_acquisition_timeout = timeout;
        self
    }

    /// Connect/handshake deadline.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Maximum pooled connection lifetime.
    pub fn with_max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_connection_lifetime = lifetime;
        self
    }

    /// Idle discard threshold.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Transaction timeout floor.
    pub fn with_transaction_timeout_floor(mut self, floor: Duration) -> Self {
        self.config.transaction_timeout_floor = floor;
        self
    }

    /// Client-side grace margin beyond the server timeout.
    pub fn with_transaction_timeout_grace(mut self, grace: Duration) -> Self {
        self.config.transaction_timeout_grace = grace;
        self
    }

    /// Records per `PULL`.
    pub fn with_fetch_size(mut self, size: i64) -> Self {
        self.config.fetch_size = size;
        self
    }

    /// Managed-transaction retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// User agent string.
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// ============================================================================
// Tests
// ============================================================================
