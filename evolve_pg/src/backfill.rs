//! Batch scheduling and backfill execution.
//!
//! The runner is a stateless client of the tracking tables: it loads the
//! record, derives the next window from the persisted cursor, executes the
//! registered strategy over that window, and only then advances the cursor.
//! Re-running after a crash repeats at most one window, which the
//! strategy's idempotence contract makes harmless. Under-counting is the
//! dangerous direction and never happens: the cursor moves only after the
//! mutation committed.

use crate::store::{MigrationStore, StoreError};
use evolve_core::migration::MigrationStatus;
use evolve_core::strategy::{BatchStrategy, StrategyError};
use evolve_core::window::BatchWindow;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Retry and throttling configuration for the backfill runner.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Maximum attempts per window before the job is abandoned and the
    /// parent migration flips to `failed`.
    pub max_attempts: u32,
    /// Delay before the first in-process retry of a transient failure.
    pub initial_retry_delay: Duration,
    /// Cap on the exponential backoff between retries.
    pub max_retry_delay: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Errors from the backfill runner.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No strategy is registered for the record's `job_class_name`.
    #[error("no strategy registered for job class {0:?}")]
    UnknownStrategy(String),
}

/// Outcome of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A window was processed and the cursor advanced.
    Processed(BatchWindow),
    /// `job_interval` throttling is in effect; retry after the duration.
    Throttled(Duration),
    /// The migration is not schedulable (`paused` or `failed`).
    Halted(MigrationStatus),
    /// The cursor has passed `max_value`; the record is `finished`.
    Completed,
}

/// Drives batched migrations window by window.
pub struct BackfillRunner {
    store: MigrationStore,
    strategies: HashMap<String, Arc<dyn BatchStrategy>>,
    config: BackfillConfig,
}

impl BackfillRunner {
    /// Creates a runner with the default configuration.
    pub fn new(store: MigrationStore) -> Self {
        Self::with_config(store, BackfillConfig::default())
    }

    /// Creates a runner with a custom configuration.
    pub fn with_config(store: MigrationStore, config: BackfillConfig) -> Self {
        Self {
            store,
            strategies: HashMap::new(),
            config,
        }
    }

    /// Registers the strategy serving a `job_class_name`.
    pub fn register(&mut self, strategy: Arc<dyn BatchStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    /// The underlying store.
    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    /// Executes the next unprocessed window of a migration, if any.
    ///
    /// Safe to call from any worker at any time; all coordination happens
    /// through the database.
    pub async fn run_next_batch(&self, migration_id: i64) -> Result<BatchOutcome, BackfillError> {
        self.run_batch(migration_id, true).await
    }

    /// Synchronously drains every remaining window of a migration.
    ///
    /// Used by the completion gate: `job_interval` throttling is skipped,
    /// because a migration being finalized has an operator waiting on it.
    /// Returns the terminal status reached.
    pub async fn run_to_completion(
        &self,
        migration_id: i64,
    ) -> Result<MigrationStatus, BackfillError> {
        loop {
            match self.run_batch(migration_id, false).await? {
                BatchOutcome::Processed(window) => {
                    debug!("migration {}: window {} drained", migration_id, window);
                }
                BatchOutcome::Throttled(pause) => sleep(pause).await,
                BatchOutcome::Halted(status) => return Ok(status),
                BatchOutcome::Completed => return Ok(MigrationStatus::Finished),
            }
        }
    }

    async fn run_batch(
        &self,
        migration_id: i64,
        honor_interval: bool,
    ) -> Result<BatchOutcome, BackfillError> {
        let record = self.store.find(migration_id).await?;

        match record.status {
            MigrationStatus::Finished => return Ok(BatchOutcome::Completed),
            MigrationStatus::Paused | MigrationStatus::Failed => {
                return Ok(BatchOutcome::Halted(record.status));
            }
            MigrationStatus::Active => {}
        }

        if record.is_complete() {
            self.store
                .set_status(migration_id, MigrationStatus::Finished)
                .await?;
            info!("migration {} finished (cursor {})", migration_id, record.cursor);
            return Ok(BatchOutcome::Completed);
        }

        if honor_interval {
            if let Some(pause) = self.throttle_remaining(&record).await? {
                return Ok(BatchOutcome::Throttled(pause));
            }
        }

        let strategy = self
            .strategies
            .get(&record.job_class_name)
            .ok_or_else(|| BackfillError::UnknownStrategy(record.job_class_name.clone()))?;

        // The window derives from the persisted cursor, so two workers
        // racing here produce the same window; idempotence and the guarded
        // cursor advance make the duplicate harmless.
        let window = match record.next_window() {
            Some(window) => window,
            None => return Ok(BatchOutcome::Completed),
        };

        let job = self.store.begin_job(migration_id, window).await?;
        if job.attempts > self.config.max_attempts {
            let message = format!(
                "window {} abandoned after {} attempts: {}",
                window,
                job.attempts - 1,
                job.last_error.as_deref().unwrap_or("unknown error"),
            );
            error!("migration {}: {}", migration_id, message);
            self.store.fail_job(job.id, &message).await?;
            self.store.record_failure(migration_id, &message).await?;
            return Ok(BatchOutcome::Halted(MigrationStatus::Failed));
        }

        match self.execute_window(strategy.as_ref(), &record, window).await {
            Ok(rows) => {
                self.store.complete_job(job.id).await?;
                self.store.advance_cursor(migration_id, window.high).await?;
                debug!(
                    "migration {}: window {} committed ({} rows)",
                    migration_id, window, rows
                );

                let record = self.store.find(migration_id).await?;
                if record.is_complete() {
                    self.store
                        .set_status(migration_id, MigrationStatus::Finished)
                        .await?;
                    info!("migration {} finished (cursor {})", migration_id, record.cursor);
                    return Ok(BatchOutcome::Completed);
                }
                Ok(BatchOutcome::Processed(window))
            }
            Err(e) if e.is_transient() => {
                // Leave the job pending; the next scheduling pass retries
                // the same window with an incremented attempt count. The
                // error is persisted so abandonment reports the real cause.
                warn!(
                    "migration {}: transient failure on window {} (attempt {}/{}): {}",
                    migration_id, window, job.attempts, self.config.max_attempts, e
                );
                self.store.record_job_error(job.id, &e.to_string()).await?;
                Ok(BatchOutcome::Throttled(retry_delay(
                    &self.config,
                    job.attempts.saturating_sub(1),
                    true,
                )))
            }
            Err(e) => {
                // Data-integrity failures are never retried blindly: the
                // operator must repair the rows or explicitly skip them.
                let message = e.to_string();
                error!(
                    "migration {}: data-integrity failure on window {}: {}",
                    migration_id, window, message
                );
                self.store.fail_job(job.id, &message).await?;
                self.store.record_failure(migration_id, &message).await?;
                Ok(BatchOutcome::Halted(MigrationStatus::Failed))
            }
        }
    }

    /// Runs the strategy over the window, sub-batch by sub-batch, retrying
    /// transient errors in process with exponential backoff.
    async fn execute_window(
        &self,
        strategy: &dyn BatchStrategy,
        record: &evolve_core::migration::BatchedMigration,
        window: BatchWindow,
    ) -> Result<u64, StrategyError> {
        let mut total_rows = 0;

        for sub_window in window.split(record.sub_batch_size) {
            let mut attempt = 0;
            loop {
                match strategy.perform(sub_window, &record.job_arguments).await {
                    Ok(rows) => {
                        total_rows += rows;
                        break;
                    }
                    Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                        let pause = retry_delay(&self.config, attempt, true);
                        warn!(
                            "sub-window {} contention (attempt {}/{}): {}; retrying in {:?}",
                            sub_window,
                            attempt + 1,
                            self.config.max_attempts,
                            e,
                            pause
                        );
                        attempt += 1;
                        sleep(pause).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(total_rows)
    }

    /// Remaining `job_interval` wait, if the last batch ran too recently.
    async fn throttle_remaining(
        &self,
        record: &evolve_core::migration::BatchedMigration,
    ) -> Result<Option<Duration>, StoreError> {
        if record.job_interval.is_zero() {
            return Ok(None);
        }

        let Some(last_activity) = self.store.last_job_activity(record.id).await? else {
            return Ok(None);
        };

        let elapsed = (chrono::Utc::now() - last_activity)
            .to_std()
            .unwrap_or_default();
        if elapsed < record.job_interval {
            Ok(Some(record.job_interval - elapsed))
        } else {
            Ok(None)
        }
    }
}

/// Exponential backoff with optional ±10% jitter, capped at
/// `max_retry_delay`. The attempt number is 0-indexed.
fn retry_delay(config: &BackfillConfig, attempt: u32, apply_jitter: bool) -> Duration {
    let initial_ms = config.initial_retry_delay.as_millis() as u64;
    let max_ms = config.max_retry_delay.as_millis() as u64;

    // Cap the exponent so 2^attempt cannot overflow.
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_ms = initial_ms.saturating_mul(multiplier).min(max_ms);

    if !apply_jitter || base_ms == 0 {
        return Duration::from_millis(base_ms);
    }

    let jitter_range = (base_ms as f64 * 0.1) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(base_ms);
    }

    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    Duration::from_millis(((base_ms as i64 + jitter).max(1) as u64).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let config = BackfillConfig::default();

        assert_eq!(retry_delay(&config, 0, false), Duration::from_secs(1));
        assert_eq!(retry_delay(&config, 1, false), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 2, false), Duration::from_secs(4));
    }

    #[test]
    fn retry_delay_is_capped() {
        let config = BackfillConfig::default();
        assert_eq!(retry_delay(&config, 100, false), Duration::from_secs(60));
    }

    #[test]
    fn retry_delay_jitter_stays_within_bounds() {
        let config = BackfillConfig {
            initial_retry_delay: Duration::from_secs(10),
            ..Default::default()
        };

        for _ in 0..100 {
            let d = retry_delay(&config, 0, true);
            assert!(
                d >= Duration::from_secs(9) && d <= Duration::from_secs(11),
                "delay {:?} out of range",
                d
            );
        }
    }

    #[test]
    fn config_defaults_are_sensible() {
        let config = BackfillConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_retry_delay, Duration::from_secs(1));
        assert_eq!(config.max_retry_delay, Duration::from_secs(60));
    }
}
