//! Managed-transaction retry.
//!
//! [`Retry::execute`] drives a caller-supplied unit of work: a fresh
//! transaction per attempt, commit on success, classification on failure.
//! Transient failures back off exponentially with jitter and try again,
//! bounded by an attempt count and an elapsed-time budget; everything else
//! is rolled back and re-raised immediately.
//!
//! The work function may therefore run more than once and must be
//! idempotent with respect to side effects outside the transaction. At most
//! one committed outcome is ever returned.

use std::time::{Duration, Instant};

use rand::Rng;

use super::error::{DriverError, DriverResult};
use super::session::{AccessMode, Session, TxWork};
use super::transaction::{Transaction, TransactionConfig};

// ============================================================================
// RetryConfig
// ============================================================================

/// Retry policy for managed transactions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of work invocations.
    pub max_attempts: usize,
    /// Elapsed-time budget across all attempts.
    pub max_retry_time: Duration,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Backoff growth factor per attempt.
    pub multiplier: f64,
    /// Jitter fraction applied to each delay (`0.2` = ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            max_retry_time: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Maximum number of work invocations.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Elapsed-time budget across all attempts.
    pub fn with_max_retry_time(mut self, time: Duration) -> Self {
        self.max_retry_time = time;
        self
    }

    /// First backoff delay.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Backoff ceiling.
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Executes units of work with transparent retry of transient failures.
pub(crate) struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub(crate) fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `work` until it commits, a non-retryable failure occurs, or the
    /// attempt/time budget runs out.
    pub(crate) async fn execute<T, F>(
        &self,
        session: &Session,
        mode: AccessMode,
        tx_config: TransactionConfig,
        mut work: F,
    ) -> DriverResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> TxWork<'a, T>,
    {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let error = match self.attempt(session, mode, &tx_config, &mut work).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            if attempt >= self.config.max_attempts
                || started.elapsed() >= self.config.max_retry_time
            {
                return Err(DriverError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff_delay(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient transaction failure, backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt: begin, work, commit. Failures roll the transaction back
    /// before propagating.
    async fn attempt<T, F>(
        &self,
        session: &Session,
        mode: AccessMode,
        tx_config: &TransactionConfig,
        work: &mut F,
    ) -> DriverResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> TxWork<'a, T>,
    {
        let mut tx = session.begin_with_mode(mode, tx_config.clone()).await?;

        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(close_error) = tx.close().await {
                    tracing::debug!(error = %close_error, "failed to settle transaction after work error");
                }
                Err(error)
            }
        }
    }

    /// Exponential backoff with jitter: `initial * multiplier^(n-1)`,
    /// capped, then scattered by ±`jitter`.
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = (attempt.saturating_sub(1)).min(32) as i32;
        let base = self.config.initial_backoff.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_backoff.as_secs_f64());
        let spread = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::driver::config::{DriverConfig, ServerAddress};
    use crate::driver::pool::{ConnectionPool, PoolConfig};
    use crate::driver::session::{Bookmark, SessionConfig};
    use crate::driver::testing::{StubBehavior, StubConnector};

    fn fast_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
    }

    fn test_session(behavior: Arc<StubBehavior>, retry: RetryConfig) -> Session {
        let pool = ConnectionPool::new(
            ServerAddress::new("localhost", 7687),
            PoolConfig::default(),
            Arc::new(StubConnector::new(behavior)),
        );
        let config = DriverConfig {
            retry,
            ..DriverConfig::default()
        };
        Session::new(pool, Arc::new(config), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_successful_work_commits_once() {
        let behavior = StubBehavior::shared();
        let session = test_session(behavior.clone(), fast_retry(3));

        let result = session
            .write_transaction(
                |tx| {
                    Box::pin(async move {
                        let cursor = tx.run("CREATE (n:Node) RETURN n").await?;
                        cursor.collect().await?;
                        Ok(42)
                    })
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(behavior.commits(), 1);
        assert_eq!(behavior.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_terminates() {
        let behavior = StubBehavior::shared();
        behavior.fail_commits(10, "Neo.TransientError.Transaction.DeadlockDetected", "deadlock");
        let session = test_session(behavior.clone(), fast_retry(3));

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let err = session
            .write_transaction(
                move |_tx| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        match err {
            DriverError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DriverError::Server(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_invokes_work_exactly_once() {
        let behavior = StubBehavior::shared();
        behavior.fail_next_run("Neo.ClientError.Statement.SyntaxError", "bad syntax");
        let session = test_session(behavior.clone(), fast_retry(3));

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let err = session
            .write_transaction(
                move |tx| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tx.run("NOT CYPHER").await?;
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(matches!(err, DriverError::Server(_)));
        assert_eq!(behavior.runs(), 1);
        assert_eq!(behavior.commits(), 0);
        // The failed transaction was rolled back, not left dangling.
        assert_eq!(behavior.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let behavior = StubBehavior::shared();
        behavior.fail_commits(2, "Neo.TransientError.General.TemporarilyUnavailable", "busy");
        let session = test_session(behavior.clone(), fast_retry(5));

        let result = session
            .write_transaction(|_tx| Box::pin(async move { Ok("done") }), None)
            .await
            .unwrap();

        assert_eq!(result, "done");
        // Two rejected commits plus the successful one.
        assert_eq!(behavior.commits(), 3);
        // Only the successful commit produced a bookmark.
        assert!(session.last_bookmarks().contains(&Bookmark::new("bm-1")));
        assert_eq!(session.last_bookmarks().len(), 1);
    }

    #[tokio::test]
    async fn test_work_error_values_propagate_without_retry() {
        let behavior = StubBehavior::shared();
        let session = test_session(behavior.clone(), fast_retry(3));

        let err = session
            .write_transaction::<(), _>(
                |_tx| {
                    Box::pin(async move {
                        Err(DriverError::session("caller gave up"))
                    })
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Session(_)));
        assert_eq!(behavior.commits(), 0);
    }

    #[tokio::test]
    async fn test_read_transaction_uses_read_mode() {
        let behavior = StubBehavior::shared();
        let session = test_session(behavior.clone(), fast_retry(3));

        session
            .read_transaction(
                |tx| {
                    Box::pin(async move {
                        tx.run("MATCH (n) RETURN n").await?;
                        Ok(())
                    })
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(behavior.commits(), 1);
    }

    #[tokio::test]
    async fn test_elapsed_budget_bounds_retries() {
        let behavior = StubBehavior::shared();
        behavior.fail_commits(100, "Neo.TransientError.General.TemporarilyUnavailable", "busy");
        let retry = RetryConfig::default()
            .with_max_attempts(100)
            .with_max_retry_time(Duration::from_millis(40))
            .with_initial_backoff(Duration::from_millis(30))
            .with_max_backoff(Duration::from_millis(30));
        let session = test_session(behavior, retry);

        let err = session
            .write_transaction(|_tx| Box::pin(async move { Ok(()) }), None)
            .await
            .unwrap_err();

        match err {
            DriverError::RetriesExhausted { attempts, .. } => assert!(attempts < 100),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let retry = Retry::new(RetryConfig::default());

        for _ in 0..50 {
            let first = retry.backoff_delay(1);
            assert!(first >= Duration::from_millis(800), "{first:?}");
            assert!(first <= Duration::from_millis(1200), "{first:?}");

            // Deep attempts are capped at max_backoff plus jitter.
            let deep = retry.backoff_delay(10);
            assert!(deep <= Duration::from_millis(6000), "{deep:?}");
            assert!(deep >= Duration::from_millis(4000), "{deep:?}");
        }
    }
}
