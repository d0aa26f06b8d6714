//! Sessions, bookmarks and statements.
//!
//! A [`Session`] is a single-owner façade over the driver's pools: it opens
//! transactions, runs auto-commit statements, and carries the causal-
//! consistency bookmark chain. Sessions are cheap; create one per unit of
//! caller work rather than sharing one across tasks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::bolt::Value;

use super::config::DriverConfig;
use super::error::{DriverError, DriverResult};
use super::pool::{ConnectionPool, PooledConnection};
use super::record::QueryResult;
use super::retry::Retry;
use super::transaction::{Transaction, TransactionConfig, TxParameters};

// ============================================================================
// AccessMode
// ============================================================================

/// Requested access mode; decides which cluster role serves the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Route to a reader
    Read,
    /// Route to the writer
    #[default]
    Write,
}

// ============================================================================
// Bookmark / Bookmarks
// ============================================================================

/// An opaque causal-consistency token.
///
/// Bookmarks mark points in the database's transaction log. The driver
/// never decodes them; it only carries, compares and merges them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bookmark(String);

impl Bookmark {
    /// Wrap a raw bookmark token.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Bookmark {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Bookmark {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A merged set of bookmarks, union-combined across transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks(BTreeSet<Bookmark>);

impl Bookmarks {
    /// Empty bookmark set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one bookmark to the set.
    pub fn merge(&mut self, bookmark: Bookmark) {
        self.0.insert(bookmark);
    }

    /// Union another set into this one.
    pub fn merge_all(&mut self, other: &Bookmarks) {
        for bookmark in &other.0 {
            self.0.insert(bookmark.clone());
        }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of bookmarks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether `bookmark` is in the set.
    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.0.contains(bookmark)
    }

    /// Iterate over the bookmarks.
    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.0.iter()
    }

    /// Raw tokens for the wire.
    pub(crate) fn to_wire(&self) -> Vec<String> {
        self.0.iter().map(|b| b.0.clone()).collect()
    }
}

impl FromIterator<Bookmark> for Bookmarks {
    fn from_iter<I: IntoIterator<Item = Bookmark>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Mutable bookmark cell shared between a session and its transactions.
///
/// Only a *successful commit* ever updates it; rollbacks and failures leave
/// it untouched.
#[derive(Debug, Default)]
pub struct BookmarkHolder {
    current: RwLock<Bookmarks>,
}

impl BookmarkHolder {
    /// Holder seeded with `bookmarks`.
    pub fn new(bookmarks: Bookmarks) -> Self {
        Self {
            current: RwLock::new(bookmarks),
        }
    }

    /// Snapshot of the current set.
    pub fn get(&self) -> Bookmarks {
        self.current.read().clone()
    }

    /// Union a freshly committed bookmark into the set.
    pub fn update(&self, bookmark: Bookmark) {
        self.current.write().merge(bookmark);
    }
}

// ============================================================================
// Statement
// ============================================================================

/// A query text plus its parameter map.
#[derive(Debug, Clone)]
pub struct Statement {
    /// Query text
    pub text: String,
    /// Named parameters
    pub parameters: HashMap<String, Value>,
}

impl Statement {
    /// Statement without parameters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: HashMap::new(),
        }
    }

    /// Add one parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add many parameters.
    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.parameters.extend(params);
        self
    }
}

impl From<&str> for Statement {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target database, or the server default.
    pub database: Option<String>,
    /// Records fetched per `PULL`; overrides the driver default when set.
    pub fetch_size: Option<i64>,
    /// Access mode used when none is implied by the call.
    pub default_access_mode: AccessMode,
    /// Bookmarks the session's first transaction must wait for.
    pub bookmarks: Bookmarks,
}

impl SessionConfig {
    /// New default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a configuration.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database: None,
            fetch_size: None,
            default_access_mode: AccessMode::Write,
            bookmarks: Bookmarks::new(),
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Target database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Records per `PULL`.
    pub fn with_fetch_size(mut self, size: i64) -> Self {
        self.config.fetch_size = Some(size);
        self
    }

    /// Default to read access.
    pub fn with_read_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Read;
        self
    }

    /// Default to write access.
    pub fn with_write_access(mut self) -> Self {
        self.config.default_access_mode = AccessMode::Write;
        self
    }

    /// Seed the bookmark set.
    pub fn with_bookmarks(mut self, bookmarks: Bookmarks) -> Self {
        self.config.bookmarks = bookmarks;
        self
    }

    /// Add one seed bookmark.
    pub fn with_bookmark(mut self, bookmark: Bookmark) -> Self {
        self.config.bookmarks.merge(bookmark);
        self
    }

    /// Finish building.
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

// ============================================================================
// ConnectionProvider
// ============================================================================

/// Source of pooled connections; implemented by the direct per-address pool
/// and by the cluster routing pool.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a connection suitable for `mode` against `database`, waiting
    /// at most `timeout` for a pool slot.
    async fn acquire_connection(
        &self,
        mode: AccessMode,
        database: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<PooledConnection>;
}

#[async_trait]
impl ConnectionProvider for ConnectionPool {
    async fn acquire_connection(
        &self,
        _mode: AccessMode,
        _database: Option<&str>,
        timeout: Duration,
    ) -> DriverResult<PooledConnection> {
        // A single-server pool serves every role and database.
        self.acquire_with_timeout(timeout).await
    }
}

/// Unit of work run by the managed-transaction machinery.
///
/// The closure receives a mutable borrow of the open transaction and must
/// report failure as an error value; the retry loop owns commit and
/// rollback, so the work itself must do neither.
pub type TxWork<'a, T> = BoxFuture<'a, DriverResult<T>>;

// ============================================================================
// Session
// ============================================================================

/// A single-owner session over the driver's connection pools.
pub struct Session {
    provider: Arc<dyn ConnectionProvider>,
    driver_config: Arc<DriverConfig>,
    config: SessionConfig,
    bookmarks: Arc<BookmarkHolder>,
    open: RwLock<bool>,
}

impl Session {
    pub(crate) fn new(
        provider: Arc<dyn ConnectionProvider>,
        driver_config: Arc<DriverConfig>,
        config: SessionConfig,
    ) -> Self {
        let bookmarks = Arc::new(BookmarkHolder::new(config.bookmarks.clone()));
        Self {
            provider,
            driver_config,
            config,
            bookmarks,
            open: RwLock::new(true),
        }
    }

    /// Run one auto-commit statement and collect its records.
    pub async fn run(
        &self,
        statement: impl Into<Statement>,
        config: Option<TransactionConfig>,
    ) -> DriverResult<QueryResult> {
        self.ensure_open()?;
        let statement = statement.into();

        let mut tx = self
            .begin_with_mode(self.config.default_access_mode, config.unwrap_or_default())
            .await?;

        let cursor = match tx.run(statement).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let _ = tx.close().await;
                return Err(e);
            }
        };
        let keys = cursor.keys().to_vec();
        let records = match cursor.collect().await {
            Ok(records) => records,
            Err(e) => {
                let _ = tx.close().await;
                return Err(e);
            }
        };

        tx.commit().await?;
        Ok(QueryResult { keys, records })
    }

    /// Open an unmanaged transaction. The caller drives commit and rollback
    /// and handles retries itself.
    pub async fn begin_transaction(
        &self,
        config: Option<TransactionConfig>,
    ) -> DriverResult<Transaction> {
        self.ensure_open()?;
        self.begin_with_mode(self.config.default_access_mode, config.unwrap_or_default())
            .await
    }

    /// Run `work` in a managed read transaction, retrying transient
    /// failures.
    pub async fn read_transaction<T, F>(
        &self,
        work: F,
        config: Option<TransactionConfig>,
    ) -> DriverResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> TxWork<'a, T>,
    {
        self.managed(AccessMode::Read, work, config).await
    }

    /// Run `work` in a managed write transaction, retrying transient
    /// failures.
    pub async fn write_transaction<T, F>(
        &self,
        work: F,
        config: Option<TransactionConfig>,
    ) -> DriverResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> TxWork<'a, T>,
    {
        self.managed(AccessMode::Write, work, config).await
    }

    async fn managed<T, F>(
        &self,
        mode: AccessMode,
        work: F,
        config: Option<TransactionConfig>,
    ) -> DriverResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> TxWork<'a, T>,
    {
        self.ensure_open()?;
        Retry::new(self.driver_config.retry.clone())
            .execute(self, mode, config.unwrap_or_default(), work)
            .await
    }

    /// Open a transaction for `mode`, threading bookmarks and timeouts.
    pub(crate) async fn begin_with_mode(
        &self,
        mode: AccessMode,
        config: TransactionConfig,
    ) -> DriverResult<Transaction> {
        let params = self.tx_parameters(mode, &config);
        let connection = self
            .provider
            .acquire_connection(
                mode,
                self.config.database.as_deref(),
                self.driver_config.connection_acquisition_timeout,
            )
            .await?;
        Transaction::begin(connection, params).await
    }

    fn tx_parameters(&self, mode: AccessMode, config: &TransactionConfig) -> TxParameters {
        let timeout = self.driver_config.effective_tx_timeout(config.timeout);
        let op_deadline = timeout
            .map(|t| t + self.driver_config.transaction_timeout_grace)
            .unwrap_or(self.driver_config.connection_acquisition_timeout);

        TxParameters {
            database: self.config.database.clone(),
            bookmarks: self.bookmarks.get().to_wire(),
            timeout,
            metadata: config.metadata.clone(),
            read_only: mode == AccessMode::Read,
            fetch_size: self
                .config
                .fetch_size
                .unwrap_or(self.driver_config.fetch_size),
            op_deadline,
            bookmark_holder: Some(self.bookmarks.clone()),
        }
    }

    /// The bookmarks of every transaction this session has committed,
    /// merged with the seed bookmarks.
    pub fn last_bookmarks(&self) -> Bookmarks {
        self.bookmarks.get()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Close the session. Subsequent operations fail.
    pub async fn close(&self) -> DriverResult<()> {
        *self.open.write() = false;
        Ok(())
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if *self.open.read() {
            Ok(())
        } else {
            Err(DriverError::session("session is closed"))
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("database", &self.config.database)
            .field("mode", &self.config.default_access_mode)
            .field("open", &*self.open.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
