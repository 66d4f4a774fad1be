//! Short exclusive-lock acquisition with bounded retries.
//!
//! DDL that needs an exclusive lock must never queue behind long-running
//! queries: a waiting `ALTER TABLE` blocks every statement that arrives
//! after it. The executor instead runs the locked block under an aggressive
//! `lock_timeout`, and on timeout rolls the transaction back, sleeps, and
//! tries again with a gradually more patient timing configuration. Either
//! the whole block commits or nothing does.

use log::{info, warn};
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use tokio::time::{sleep, Duration};

/// The future type returned by a locked block.
pub type TxFuture<'t, T> =
    Pin<Box<dyn Future<Output = Result<T, sqlx::Error>> + Send + 't>>;

/// One retry step: how long to wait for the lock, then how long to sleep
/// before the next attempt if it times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttempt {
    /// Value applied as `SET LOCAL lock_timeout` for this attempt.
    pub lock_timeout: Duration,
    /// Pause before the next attempt after a timeout.
    pub sleep_time: Duration,
}

impl LockAttempt {
    /// Creates an attempt from millisecond values.
    pub const fn from_millis(lock_timeout_ms: u64, sleep_ms: u64) -> Self {
        Self {
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            sleep_time: Duration::from_millis(sleep_ms),
        }
    }
}

/// Timing configuration for [`LockRetryExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryConfig {
    /// The escalating attempt schedule.
    pub attempts: Vec<LockAttempt>,
    /// Whether to make one last attempt with no `lock_timeout` at all once
    /// the schedule is exhausted. Off by default: queuing indefinitely
    /// behind foreground traffic is exactly what the executor exists to
    /// avoid, but operators running during a quiet window may prefer it.
    pub final_attempt_without_timeout: bool,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        // Start impatient and cheap, back off towards longer sleeps so a
        // busy table gets breathing room between our attempts.
        Self {
            attempts: vec![
                LockAttempt::from_millis(100, 100),
                LockAttempt::from_millis(100, 200),
                LockAttempt::from_millis(200, 300),
                LockAttempt::from_millis(300, 500),
                LockAttempt::from_millis(500, 1_000),
                LockAttempt::from_millis(500, 5_000),
                LockAttempt::from_millis(1_000, 10_000),
                LockAttempt::from_millis(1_000, 60_000),
            ],
            final_attempt_without_timeout: false,
        }
    }
}

/// Errors from a lock-retried block.
#[derive(Debug, thiserror::Error)]
pub enum LockRetryError {
    /// A database error other than a lock timeout.
    #[error("database error inside locked block: {0}")]
    Database(#[from] sqlx::Error),

    /// Every attempt in the schedule hit the lock timeout. No change was
    /// made.
    #[error("could not acquire lock after {attempts} attempts")]
    AttemptsExhausted {
        /// Number of attempts made.
        attempts: usize,
    },
}

/// Runs a block of DDL inside a transaction under a bounded `lock_timeout`,
/// retrying on timeout according to a [`LockRetryConfig`].
#[derive(Debug, Clone)]
pub struct LockRetryExecutor {
    pool: PgPool,
    config: LockRetryConfig,
}

impl LockRetryExecutor {
    /// Creates an executor with the default timing configuration.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, LockRetryConfig::default())
    }

    /// Creates an executor with a custom timing configuration.
    pub fn with_config(pool: PgPool, config: LockRetryConfig) -> Self {
        Self { pool, config }
    }

    /// Executes `op` inside a transaction with `SET LOCAL lock_timeout`.
    ///
    /// On success the transaction commits and the block's value is
    /// returned. A lock timeout rolls everything back and schedules a
    /// retry; any other error aborts immediately. When the schedule is
    /// exhausted (and the optional no-timeout attempt is disabled or also
    /// fails with a timeout) the run ends with
    /// [`LockRetryError::AttemptsExhausted`] and the database is untouched.
    pub async fn run<T, F>(&self, op: F) -> Result<T, LockRetryError>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T>,
    {
        let total = self.config.attempts.len();

        for (attempt, timing) in self.config.attempts.iter().enumerate() {
            match self
                .try_once(&op, Some(timing.lock_timeout))
                .await
            {
                Ok(value) => {
                    if attempt > 0 {
                        info!("lock acquired after {} retries", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if is_lock_timeout(&e) => {
                    let pause = jittered(timing.sleep_time);
                    warn!(
                        "lock timeout on attempt {}/{} (lock_timeout {:?}); retrying in {:?}",
                        attempt + 1,
                        total,
                        timing.lock_timeout,
                        pause
                    );
                    sleep(pause).await;
                }
                Err(e) => return Err(LockRetryError::Database(e)),
            }
        }

        if self.config.final_attempt_without_timeout {
            warn!("lock retry schedule exhausted; final attempt without lock_timeout");
            return self.try_once(&op, None).await.map_err(Into::into);
        }

        Err(LockRetryError::AttemptsExhausted { attempts: total })
    }

    async fn try_once<T, F>(
        &self,
        op: &F,
        lock_timeout: Option<Duration>,
    ) -> Result<T, sqlx::Error>
    where
        F: for<'t> Fn(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T>,
    {
        let mut tx = self.pool.begin().await?;

        if let Some(timeout) = lock_timeout {
            // SET LOCAL does not accept bind parameters; the value is a
            // number formatted by us, not user input.
            sqlx::query(&format!(
                "SET LOCAL lock_timeout = '{}ms'",
                timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await?;
        }

        match op(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                // Rollback failure is secondary to the original error.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// Whether an error is PostgreSQL's `lock_not_available` (55P03).
pub fn is_lock_timeout(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "55P03")
}

/// Whether an error represents transient contention worth retrying:
/// lock timeout (55P03), deadlock (40P01), or serialization failure (40001).
pub fn is_transient(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "55P03" || code == "40P01" || code == "40001")
}

/// Applies ±10% jitter so concurrent migrations do not retry in lockstep.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let range = (base_ms as f64 * 0.1) as u64;
    if range == 0 {
        return base;
    }

    let mut rng = rand::thread_rng();
    let offset: i64 = rng.gen_range(-(range as i64)..=(range as i64));
    Duration::from_millis((base_ms as i64 + offset).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_escalates_sleeps() {
        let config = LockRetryConfig::default();

        assert!(!config.attempts.is_empty());
        let sleeps: Vec<Duration> = config.attempts.iter().map(|a| a.sleep_time).collect();
        let mut sorted = sleeps.clone();
        sorted.sort();
        assert_eq!(sleeps, sorted, "sleep times should be non-decreasing");
    }

    #[test]
    fn default_does_not_queue_indefinitely() {
        assert!(!LockRetryConfig::default().final_attempt_without_timeout);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(9) && d <= Duration::from_secs(11));
        }
    }

    #[test]
    fn jitter_of_tiny_sleep_is_identity() {
        assert_eq!(jittered(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn lock_attempt_from_millis() {
        let attempt = LockAttempt::from_millis(100, 200);
        assert_eq!(attempt.lock_timeout, Duration::from_millis(100));
        assert_eq!(attempt.sleep_time, Duration::from_millis(200));
    }
}
