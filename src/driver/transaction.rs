//! Explicit transactions.
//!
//! A [`Transaction`] drives one unit of work over exactly one pooled
//! connection: `Pending → Active → {Committed, RolledBack, Failed}`. Once it
//! leaves `Active` it accepts no further statements; every misuse fails with
//! [`DriverError::InvalidTransactionState`] instead of silently executing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::bolt::{BeginRequest, ServerState, Value};

use super::error::{DriverError, DriverResult};
use super::pool::PooledConnection;
use super::record::Record;
use super::session::{Bookmark, BookmarkHolder, Statement};

// ============================================================================
// TransactionConfig
// ============================================================================

/// Per-transaction configuration.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// Server-side transaction timeout. Values below the driver's
    /// configured floor are raised to it.
    pub timeout: Option<Duration>,
    /// Opaque metadata attached to the transaction.
    pub metadata: HashMap<String, Value>,
}

impl TransactionConfig {
    /// New empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// TransactionState
// ============================================================================

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, `BEGIN` not yet acknowledged
    Pending,
    /// Open and accepting statements
    Active,
    /// Committed successfully
    Committed,
    /// Rolled back
    RolledBack,
    /// A statement or commit failed; only rollback is permitted
    Failed,
}

impl TransactionState {
    /// Whether the transaction has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

// ============================================================================
// TxParameters - everything begin() needs, assembled by the session
// ============================================================================

#[derive(Debug, Clone, Default)]
pub(crate) struct TxParameters {
    pub database: Option<String>,
    pub bookmarks: Vec<String>,
    /// Server-side timeout, already raised to the configured floor.
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, Value>,
    pub read_only: bool,
    pub fetch_size: i64,
    /// Client-side network deadline for each transaction operation; exceeds
    /// the server timeout by the configured grace so the server's own
    /// timeout error wins the race.
    pub op_deadline: Duration,
    /// Session bookmark cell, updated on successful commit only.
    pub bookmark_holder: Option<Arc<BookmarkHolder>>,
}

// ============================================================================
// Transaction
// ============================================================================

/// An explicit transaction over one pooled connection.
///
/// Dropping an undecided transaction discards its connection; the server
/// side is left to its own timeout. Prefer an explicit [`commit`] or
/// [`rollback`].
///
/// [`commit`]: Transaction::commit
/// [`rollback`]: Transaction::rollback
pub struct Transaction {
    connection: Option<PooledConnection>,
    state: TransactionState,
    database: Option<String>,
    fetch_size: i64,
    op_deadline: Duration,
    bookmark_holder: Option<Arc<BookmarkHolder>>,
}

impl Transaction {
    /// Open a transaction on `connection`.
    ///
    /// On server rejection the connection is reset (when the server reports
    /// `FAILED`), returned to its pool, and the classified error is wrapped
    /// in [`DriverError::BeginFailed`].
    pub(crate) async fn begin(
        connection: PooledConnection,
        params: TxParameters,
    ) -> DriverResult<Self> {
        let mut tx = Self {
            connection: Some(connection),
            state: TransactionState::Pending,
            database: params.database.clone(),
            fetch_size: params.fetch_size,
            op_deadline: params.op_deadline,
            bookmark_holder: params.bookmark_holder,
        };

        let request = BeginRequest {
            database: params.database,
            bookmarks: params.bookmarks,
            timeout: params.timeout,
            metadata: params.metadata,
            read_only: params.read_only,
        };

        let deadline = tx.op_deadline;
        let io = tx.connection_mut()?.io_mut()?;
        let result = tokio::time::timeout(deadline, io.begin(request)).await;
        match result {
            Err(_) => {
                tx.abandon_connection();
                Err(DriverError::connection(format!(
                    "begin timed out after {deadline:?}"
                )))
            }
            Ok(Err(e)) => {
                if io.server_state() == ServerState::Failed {
                    if let Err(reset_err) = io.reset().await {
                        tracing::warn!(error = %reset_err, "reset after failed begin failed");
                    }
                }
                let err = DriverError::from_transport(e);
                tx.release_connection().await;
                Err(DriverError::BeginFailed(Box::new(err)))
            }
            Ok(Ok(())) => {
                tx.state = TransactionState::Active;
                Ok(tx)
            }
        }
    }

    /// Execute a statement, returning a single-pass cursor over its records.
    pub async fn run(&mut self, statement: impl Into<Statement>) -> DriverResult<RecordCursor<'_>> {
        self.ensure_active("run a statement in")?;

        let statement = statement.into();
        let deadline = self.op_deadline;
        let io = self.connection_mut()?.io_mut()?;
        let result =
            tokio::time::timeout(deadline, io.run(&statement.text, statement.parameters)).await;
        let response = match result {
            Err(_) => {
                self.state = TransactionState::Failed;
                self.abandon_connection();
                return Err(DriverError::connection(format!(
                    "statement timed out after {deadline:?}"
                )));
            }
            Ok(Err(e)) => {
                self.state = TransactionState::Failed;
                return Err(DriverError::from_transport(e));
            }
            Ok(Ok(response)) => response,
        };

        let keys = Arc::new(response.keys);
        let key_index = Record::index_keys(&keys);
        Ok(RecordCursor {
            qid: response.qid,
            keys,
            key_index,
            buffer: VecDeque::new(),
            finished: false,
            tx: self,
        })
    }

    /// Commit the transaction, returning the server's new bookmark.
    ///
    /// On rejection the transaction transitions to `Failed` and the
    /// classified server error is re-raised.
    pub async fn commit(&mut self) -> DriverResult<Option<Bookmark>> {
        self.ensure_active("commit")?;

        let deadline = self.op_deadline;
        let io = self.connection_mut()?.io_mut()?;
        let result = tokio::time::timeout(deadline, io.commit()).await;
        match result {
            Err(_) => {
                self.state = TransactionState::Failed;
                self.abandon_connection();
                Err(DriverError::connection(format!(
                    "commit timed out after {deadline:?}"
                )))
            }
            Ok(Err(e)) => {
                self.state = TransactionState::Failed;
                let err = DriverError::from_transport(e);
                self.release_connection().await;
                Err(err)
            }
            Ok(Ok(bookmark)) => {
                self.state = TransactionState::Committed;
                self.release_connection().await;
                let bookmark = bookmark.map(Bookmark::new);
                if let (Some(holder), Some(bm)) = (&self.bookmark_holder, &bookmark) {
                    holder.update(bm.clone());
                }
                Ok(bookmark)
            }
        }
    }

    /// Roll the transaction back. Valid in `Active` or `Failed`.
    ///
    /// Rollback failures are logged and suppressed: the transaction is being
    /// discarded regardless, and the pool revalidates the connection.
    pub async fn rollback(&mut self) -> DriverResult<()> {
        match self.state {
            TransactionState::Active | TransactionState::Failed => {}
            state => {
                return Err(DriverError::InvalidTransactionState {
                    state,
                    operation: "roll back",
                })
            }
        }

        let deadline = self.op_deadline;
        let mut timed_out = false;
        if let Some(conn) = self.connection.as_mut() {
            if let Ok(io) = conn.io_mut() {
                let result = tokio::time::timeout(deadline, io.rollback()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "rollback failed; discarding transaction")
                    }
                    Err(_) => {
                        tracing::warn!("rollback timed out; discarding connection");
                        timed_out = true;
                    }
                }
            }
        }

        self.state = TransactionState::RolledBack;
        if timed_out {
            self.abandon_connection();
        } else {
            self.release_connection().await;
        }
        Ok(())
    }

    /// Settle an undecided transaction: rolls back when `Active` or
    /// `Failed`, does nothing otherwise.
    pub async fn close(&mut self) -> DriverResult<()> {
        match self.state {
            TransactionState::Active | TransactionState::Failed => self.rollback().await,
            _ => {
                self.release_connection().await;
                Ok(())
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Target database.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn ensure_active(&self, operation: &'static str) -> DriverResult<()> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(DriverError::InvalidTransactionState {
                state: self.state,
                operation,
            })
        }
    }

    fn connection_mut(&mut self) -> DriverResult<&mut PooledConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DriverError::session("transaction has no connection"))
    }

    async fn release_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.release().await;
        }
    }

    /// Discard the connection without returning it: its stream is in an
    /// unknown position and cannot be safely reused.
    fn abandon_connection(&mut self) {
        drop(self.connection.take());
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("database", &self.database)
            .finish()
    }
}

// ============================================================================
// RecordCursor
// ============================================================================

/// Single-pass cursor over one statement's records.
///
/// The cursor borrows its transaction, so it cannot outlive it; if the
/// transaction leaves `Active` underneath an open stream, the next fetch
/// fails with [`DriverError::InvalidTransactionState`].
pub struct RecordCursor<'tx> {
    tx: &'tx mut Transaction,
    keys: Arc<Vec<String>>,
    key_index: Arc<HashMap<String, usize>>,
    qid: i64,
    buffer: VecDeque<Record>,
    finished: bool,
}

impl RecordCursor<'_> {
    /// Column keys of the result.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Fetch the next record, pulling a new batch from the server when the
    /// buffer runs dry.
    pub async fn next(&mut self) -> DriverResult<Option<Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            if self.finished {
                return Ok(None);
            }

            self.tx.ensure_active("fetch results in")?;

            let deadline = self.tx.op_deadline;
            let fetch_size = self.tx.fetch_size;
            let qid = self.qid;
            let io = self.tx.connection_mut()?.io_mut()?;
            let result = tokio::time::timeout(deadline, io.pull(qid, fetch_size)).await;
            let batch = match result {
                Err(_) => {
                    self.tx.state = TransactionState::Failed;
                    self.tx.abandon_connection();
                    return Err(DriverError::connection(format!(
                        "result fetch timed out after {deadline:?}"
                    )));
                }
                Ok(Err(e)) => {
                    self.tx.state = TransactionState::Failed;
                    return Err(DriverError::from_transport(e));
                }
                Ok(Ok(batch)) => batch,
            };

            self.finished = !batch.has_more;
            for row in batch.records {
                self.buffer
                    .push_back(Record::new(self.keys.clone(), self.key_index.clone(), row));
            }
        }
    }

    /// Drain the cursor into a vector.
    pub async fn collect(mut self) -> DriverResult<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for RecordCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCursor")
            .field("keys", &self.keys)
            .field("buffered", &self.buffer.len())
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
