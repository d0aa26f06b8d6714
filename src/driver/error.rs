//! Driver error types and server error classification.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::bolt::TransportError;

use super::transaction::TransactionState;

// ============================================================================
// Classification - top-level server error category
// ============================================================================

/// Top-level classification of a server status code.
///
/// The classification alone decides most of retry eligibility: transient
/// errors are safe to retry, client and database errors generally are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// The client sent something the server will never accept.
    ClientError,
    /// The server failed internally.
    DatabaseError,
    /// A temporary condition; retrying the work may succeed.
    TransientError,
}

impl Classification {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ClientError" => Some(Self::ClientError),
            "DatabaseError" => Some(Self::DatabaseError),
            "TransientError" => Some(Self::TransientError),
            _ => None,
        }
    }

    /// Canonical string form, as it appears in the status code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientError => "ClientError",
            Self::DatabaseError => "DatabaseError",
            Self::TransientError => "TransientError",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Neo4jError - classified server error
// ============================================================================

/// Caller-initiated terminations arrive with a transient classification but
/// must not be retried blindly.
const NON_RETRYABLE_TRANSIENT: [&str; 2] = [
    "Neo.TransientError.Transaction.Terminated",
    "Neo.TransientError.Transaction.LockClientStopped",
];

/// Client error codes that are still worth retrying: the session has expired
/// or the cluster leader moved, and a fresh routed transaction may land on a
/// usable server.
const RETRYABLE_CLIENT: [&str; 4] = [
    "Neo.ClientError.Cluster.NotALeader",
    "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase",
    "Neo.ClientError.Transaction.Terminated",
    "Neo.ClientError.Transaction.LockClientStopped",
];

/// A structured server error, parsed from a dotted four-part status code
/// `Neo.<classification>.<category>.<title>` plus message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct Neo4jError {
    /// Full status code
    code: String,
    /// Message text
    message: String,
    /// Parsed classification segment
    classification: Classification,
    /// Parsed category segment
    category: String,
    /// Parsed title segment
    title: String,
}

impl Neo4jError {
    /// Parse a status code and message into a classified error.
    ///
    /// Codes with fewer than four dot segments, a prefix other than `Neo`,
    /// or an unknown classification are rejected with
    /// [`DriverError::MalformedErrorCode`].
    pub fn parse(code: &str, message: &str) -> Result<Self, DriverError> {
        let malformed = || DriverError::MalformedErrorCode {
            code: code.to_string(),
        };

        let mut parts = code.splitn(4, '.');
        let prefix = parts.next().ok_or_else(malformed)?;
        let classification = parts.next().ok_or_else(malformed)?;
        let category = parts.next().ok_or_else(malformed)?;
        let title = parts.next().ok_or_else(malformed)?;

        if prefix != "Neo" || title.is_empty() {
            return Err(malformed());
        }

        let classification = Classification::parse(classification).ok_or_else(malformed)?;

        Ok(Self {
            code: code.to_string(),
            message: message.to_string(),
            classification,
            category: category.to_string(),
            title: title.to_string(),
        })
    }

    /// Full status code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Message text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classification segment.
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Category segment.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Title segment.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether a fresh transaction attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.classification {
            Classification::TransientError => {
                !NON_RETRYABLE_TRANSIENT.contains(&self.code.as_str())
            }
            Classification::ClientError => RETRYABLE_CLIENT.contains(&self.code.as_str()),
            Classification::DatabaseError => false,
        }
    }
}

// ============================================================================
// DriverError
// ============================================================================

/// Driver error.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The pool could not hand out a connection within the deadline.
    #[error("connection acquisition timed out after {timeout:?}")]
    AcquisitionTimeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Transport-level failure: refused, dropped or failed handshake.
    #[error("connection error: {0}")]
    Connection(String),

    /// No viable server address for the requested role.
    #[error("routing failure: {message}")]
    Routing {
        /// What went wrong
        message: String,
        /// The underlying cause, when one exists
        #[source]
        source: Option<Box<DriverError>>,
    },

    /// An operation was attempted on a transaction outside the state that
    /// permits it. Always a caller bug; never retried.
    #[error("cannot {operation} a transaction in state {state:?}")]
    InvalidTransactionState {
        /// State the transaction was in
        state: TransactionState,
        /// The operation attempted
        operation: &'static str,
    },

    /// A classified server error.
    #[error(transparent)]
    Server(#[from] Neo4jError),

    /// The server produced a status code this driver cannot parse.
    #[error("malformed server error code: {code:?}")]
    MalformedErrorCode {
        /// The offending code
        code: String,
    },

    /// The server rejected the transaction begin.
    #[error("failed to begin transaction")]
    BeginFailed(#[source] Box<DriverError>),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// All retry attempts were exhausted; `last` is the final failure.
    #[error("transaction retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// How many times the work function ran
        attempts: usize,
        /// The last classified failure
        #[source]
        last: Box<DriverError>,
    },

    /// Session misuse (closed session, missing connection).
    #[error("session error: {0}")]
    Session(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Connection error from a message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Session error from a message.
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Configuration error from a message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Routing failure without an underlying cause.
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing {
            message: msg.into(),
            source: None,
        }
    }

    /// Routing failure caused by another error.
    pub fn routing_caused_by(msg: impl Into<String>, cause: DriverError) -> Self {
        Self::Routing {
            message: msg.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Translate a transport failure into a driver error, classifying
    /// server-coded failures on the way through.
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Connection(msg) => Self::Connection(msg),
            TransportError::Io(e) => Self::Connection(e.to_string()),
            TransportError::Message(m) => match Neo4jError::parse(&m.code, &m.message) {
                Ok(classified) => Self::Server(classified),
                Err(malformed) => malformed,
            },
        }
    }

    /// Whether the managed-transaction retry loop may try again.
    ///
    /// Unmanaged callers receive these errors raw and decide for themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server(e) => e.is_retryable(),
            Self::Connection(_) => true,
            Self::AcquisitionTimeout { .. } => true,
            Self::Routing { source, .. } => {
                source.as_ref().map(|e| e.is_retryable()).unwrap_or(false)
            }
            Self::BeginFailed(source) => source.is_retryable(),
            _ => false,
        }
    }
}

/// Driver result type.
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::MessageError;

    #[test]
    fn test_parse_well_formed_code() {
        let err = Neo4jError::parse(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        )
        .unwrap();

        assert_eq!(err.classification(), Classification::TransientError);
        assert_eq!(err.category(), "Transaction");
        assert_eq!(err.title(), "DeadlockDetected");
        assert_eq!(err.code(), "Neo.TransientError.Transaction.DeadlockDetected");
        assert_eq!(err.message(), "deadlock");
    }

    #[test]
    fn test_parse_title_with_dots_kept_whole() {
        // Only the first three dots split; the remainder is the title.
        let err = Neo4jError::parse("Neo.ClientError.Statement.Some.Nested.Title", "m").unwrap();
        assert_eq!(err.title(), "Some.Nested.Title");
    }

    #[test]
    fn test_parse_rejects_short_codes() {
        for code in ["", "Neo", "Neo.ClientError", "Neo.ClientError.Statement"] {
            let result = Neo4jError::parse(code, "m");
            assert!(
                matches!(result, Err(DriverError::MalformedErrorCode { .. })),
                "expected malformed for {code:?}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_unknown_prefix_and_classification() {
        assert!(matches!(
            Neo4jError::parse("Foo.ClientError.Statement.SyntaxError", "m"),
            Err(DriverError::MalformedErrorCode { .. })
        ));
        assert!(matches!(
            Neo4jError::parse("Neo.WeirdError.Statement.SyntaxError", "m"),
            Err(DriverError::MalformedErrorCode { .. })
        ));
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = Neo4jError::parse(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "deadlock",
        )
        .unwrap();
        assert!(err.is_retryable());

        let err =
            Neo4jError::parse("Neo.TransientError.General.TemporarilyUnavailable", "busy").unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_terminated_transients_are_not_retryable() {
        let err = Neo4jError::parse("Neo.TransientError.Transaction.Terminated", "m").unwrap();
        assert!(!err.is_retryable());

        let err =
            Neo4jError::parse("Neo.TransientError.Transaction.LockClientStopped", "m").unwrap();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_client_errors() {
        for code in RETRYABLE_CLIENT {
            let err = Neo4jError::parse(code, "m").unwrap();
            assert!(err.is_retryable(), "expected retryable for {code}");
        }
    }

    #[test]
    fn test_syntax_error_is_not_retryable() {
        let err = Neo4jError::parse("Neo.ClientError.Statement.SyntaxError", "bad").unwrap();
        assert!(!err.is_retryable());

        let err = Neo4jError::parse("Neo.DatabaseError.General.UnknownError", "boom").unwrap();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_driver_error_retryability() {
        assert!(DriverError::connection("refused").is_retryable());
        assert!(DriverError::AcquisitionTimeout {
            timeout: Duration::from_secs(5)
        }
        .is_retryable());

        assert!(!DriverError::routing("no writers").is_retryable());
        assert!(
            DriverError::routing_caused_by("no writers", DriverError::connection("refused"))
                .is_retryable()
        );

        assert!(!DriverError::MalformedErrorCode { code: "x".into() }.is_retryable());
        assert!(!DriverError::PoolClosed.is_retryable());
        assert!(!DriverError::session("closed").is_retryable());
    }

    #[test]
    fn test_begin_failed_inherits_retryability() {
        let transient =
            Neo4jError::parse("Neo.TransientError.General.TemporarilyUnavailable", "busy").unwrap();
        assert!(DriverError::BeginFailed(Box::new(DriverError::Server(transient))).is_retryable());

        let fatal = Neo4jError::parse("Neo.ClientError.Statement.SyntaxError", "bad").unwrap();
        assert!(!DriverError::BeginFailed(Box::new(DriverError::Server(fatal))).is_retryable());
    }

    #[test]
    fn test_from_transport_classifies_messages() {
        let err = DriverError::from_transport(TransportError::Message(MessageError::new(
            "Neo.ClientError.Statement.SyntaxError",
            "bad",
        )));
        assert!(matches!(err, DriverError::Server(_)));

        let err =
            DriverError::from_transport(TransportError::Message(MessageError::new("garbage", "m")));
        assert!(matches!(err, DriverError::MalformedErrorCode { .. }));

        let err = DriverError::from_transport(TransportError::Connection("refused".into()));
        assert!(matches!(err, DriverError::Connection(_)));
    }

    #[test]
    fn test_display() {
        let err = Neo4jError::parse("Neo.ClientError.Statement.SyntaxError", "bad syntax").unwrap();
        assert_eq!(
            err.to_string(),
            "Neo.ClientError.Statement.SyntaxError: bad syntax"
        );

        let err = DriverError::PoolClosed;
        assert_eq!(err.to_string(), "connection pool is closed");
    }
}
