//! Bolt transport contract.
//!
//! The driver core never touches sockets or wire bytes itself. Everything
//! protocol-level happens behind two traits: a [`Connector`] that opens,
//! handshakes and authenticates a connection to one server address, and
//! [`BoltIo`], the message-level surface of an established connection
//! (`BEGIN`/`RUN`/`PULL`/`COMMIT`/`ROLLBACK`/`RESET`/`ROUTE`).
//!
//! A wire-level implementation lives in a companion crate; the pool, the
//! routing layer and the transaction state machine in [`crate::driver`] are
//! written purely against this contract.
//!
//! ```text
//! Driver / RoutingDriver
//!   └── ConnectionPool
//!         ├── Connector (open + handshake)
//!         └── BoltIo    (message-level operations)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// BoltVersion - negotiated protocol version
// ============================================================================

/// Negotiated Bolt protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoltVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl BoltVersion {
    /// Bolt 4.4
    pub const V4_4: Self = Self { major: 4, minor: 4 };
    /// Bolt 5.0
    pub const V5_0: Self = Self { major: 5, minor: 0 };

    /// Create a version from major/minor parts.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for BoltVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ============================================================================
// Value - opaque wire value
// ============================================================================

/// A wire value as produced and consumed by the transport.
///
/// The driver core forwards these opaquely; mapping them onto rich graph
/// types (nodes, relationships, paths, temporal types) is the value-layer
/// collaborator's job, not ours.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Null,
    /// Boolean
    Boolean(bool),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Byte array
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<Value>),
    /// String-keyed map
    Map(HashMap<String, Value>),
}

impl Value {
    /// Integer accessor.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean accessor.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// ServerState - server-reported connection state
// ============================================================================

/// Last server-reported state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Ready for the next request
    Ready,
    /// A result stream is open
    Streaming,
    /// The last request failed; a `RESET` is required
    Failed,
    /// An interrupt was signalled; a `RESET` is required
    Interrupted,
    /// The connection is unusable and must be discarded
    Defunct,
}

impl ServerState {
    /// Whether the connection can be returned to service at all.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Defunct)
    }

    /// Whether a protocol `RESET` is required before reuse.
    pub fn needs_reset(&self) -> bool {
        matches!(self, Self::Failed | Self::Interrupted | Self::Streaming)
    }
}

// ============================================================================
// MessageError - structured protocol failure
// ============================================================================

/// A protocol-level failure carrying the server's status code and message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct MessageError {
    /// Dotted status code, e.g. `Neo.TransientError.General.TemporarilyUnavailable`
    pub code: String,
    /// Human-readable message text
    pub message: String,
}

impl MessageError {
    /// Create a new message error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Any failure the transport can raise.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport-level failure: refused, reset, or dropped connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Structured failure reported by the server.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// I/O failure on the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport result type.
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// Request / response shapes
// ============================================================================

/// Everything a `BEGIN` message carries.
#[derive(Debug, Clone, Default)]
pub struct BeginRequest {
    /// Target database, or the server default.
    pub database: Option<String>,
    /// Causal-consistency bookmarks to wait for.
    pub bookmarks: Vec<String>,
    /// Server-side transaction timeout.
    pub timeout: Option<Duration>,
    /// Opaque transaction metadata.
    pub metadata: HashMap<String, Value>,
    /// Hint that the transaction will not write.
    pub read_only: bool,
}

/// Server response to `RUN`: column keys and the query id for `PULL`.
#[derive(Debug, Clone)]
pub struct RunResponse {
    /// Column names
    pub keys: Vec<String>,
    /// Query id to pull from
    pub qid: i64,
}

/// One batch of records from `PULL`.
#[derive(Debug, Clone, Default)]
pub struct PullBatch {
    /// Raw record rows
    pub records: Vec<Vec<Value>>,
    /// Whether more records remain on the server
    pub has_more: bool,
    /// Bookmark, present once the stream is exhausted on auto-commit results
    pub bookmark: Option<String>,
}

/// Routing table as reported by a `ROUTE` response.
///
/// Addresses are `host:port` strings; the routing layer parses them.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo {
    /// Table time-to-live in seconds
    pub ttl_seconds: u64,
    /// Router addresses
    pub routers: Vec<String>,
    /// Writer addresses
    pub writers: Vec<String>,
    /// Reader addresses
    pub readers: Vec<String>,
    /// Database the table applies to
    pub database: Option<String>,
}

// ============================================================================
// BoltIo / Connector - the transport traits
// ============================================================================

/// Message-level operations on one established, authenticated connection.
///
/// Implementations own the socket, framing and serialization. Every method
/// that talks to the server reports structured failures as
/// [`TransportError::Message`] and transport breakage as
/// [`TransportError::Connection`].
#[async_trait]
pub trait BoltIo: Send {
    /// Negotiated protocol version.
    fn version(&self) -> BoltVersion;

    /// Last server-reported state.
    fn server_state(&self) -> ServerState;

    /// Open an explicit transaction.
    async fn begin(&mut self, request: BeginRequest) -> TransportResult<()>;

    /// Submit a statement for execution within the open transaction.
    async fn run(
        &mut self,
        text: &str,
        parameters: HashMap<String, Value>,
    ) -> TransportResult<RunResponse>;

    /// Pull up to `n` records from the stream identified by `qid`.
    async fn pull(&mut self, qid: i64, n: i64) -> TransportResult<PullBatch>;

    /// Commit the open transaction, returning the server's new bookmark.
    async fn commit(&mut self) -> TransportResult<Option<String>>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> TransportResult<()>;

    /// Reset the connection to a clean `READY` state.
    async fn reset(&mut self) -> TransportResult<()>;

    /// Fetch the routing table for `database`.
    async fn route(
        &mut self,
        database: Option<&str>,
        bookmarks: Vec<String>,
    ) -> TransportResult<RoutingInfo>;

    /// Tear the connection down.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Opens connections to a server address.
///
/// `open` covers the whole establishment sequence: TCP connect, version
/// handshake and authentication. The returned connection is `READY`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `address` (a `host:port` socket address),
    /// bounded by `timeout`.
    async fn open(&self, address: &str, timeout: Duration) -> TransportResult<Box<dyn BoltIo>>;
}

// ============================================================================
// Tests
// ============================================================================
