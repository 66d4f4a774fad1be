//! Persistence for migration and per-window job records.
//!
//! The tracking tables (`evolve_batched_migrations`, `evolve_batched_jobs`)
//! are the engine's only durable state: after a process crash the scheduler
//! re-derives everything from them. Every mutation here is a single guarded
//! statement so concurrent workers and restarts cannot corrupt a record.

use chrono::{DateTime, Utc};
use evolve_core::ident::{quote_ident, IdentError};
use evolve_core::migration::{
    BatchedJob, BatchedMigration, JobStatus, MigrationStatus, TransitionError,
};
use evolve_core::strategy::JobArguments;
use evolve_core::window::BatchWindow;
use log::{info, warn};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Errors from the migration store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An invalid state transition was requested.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A table or column name failed validation.
    #[error(transparent)]
    Ident(#[from] IdentError),

    /// Job arguments could not be (de)serialized.
    #[error("job argument serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No record with the given id exists.
    #[error("batched migration {0} not found")]
    NotFound(i64),

    /// No job with the given id exists.
    #[error("batched job {0} not found")]
    JobNotFound(i64),
}

/// Parameters for registering a new batched migration.
#[derive(Debug, Clone)]
pub struct CreateMigrationParams {
    /// Names the strategy that performs each batch.
    pub job_class_name: String,
    /// The physical table being evolved.
    pub table_name: String,
    /// The column being evolved.
    pub column_name: String,
    /// Opaque parameters forwarded to the strategy.
    pub job_arguments: JobArguments,
    /// Rows per outer window.
    pub batch_size: u64,
    /// Rows per inner sub-transaction.
    pub sub_batch_size: u64,
    /// Minimum delay between batch executions.
    pub job_interval: Duration,
    /// The monotonic key column used to partition the table.
    pub batch_column: String,
}

impl CreateMigrationParams {
    /// Conventional parameters: partition by `id`, 1 000-row batches with
    /// 100-row sub-batches, two minutes between batches.
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: JobArguments,
    ) -> Self {
        Self {
            job_class_name: job_class_name.into(),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
            batch_size: 1_000,
            sub_batch_size: 100,
            job_interval: Duration::from_secs(120),
            batch_column: "id".to_string(),
        }
    }
}

/// Progress surface for dashboards and the completion gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationProgress {
    /// Current lifecycle status.
    pub status: MigrationStatus,
    /// Upper bound of the last committed window.
    pub cursor: i64,
    /// Estimated row count (reporting only).
    pub total_tuple_count: i64,
    /// Fraction of the key domain behind the cursor, in `[0, 1]`.
    pub fraction: f64,
}

/// CRUD over the engine's tracking tables.
#[derive(Debug, Clone)]
pub struct MigrationStore {
    pool: PgPool,
}

impl MigrationStore {
    /// Creates a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Registers a new batched migration.
    ///
    /// The key domain bounds and the tuple-count estimate are computed once
    /// here. An empty table produces a record that is `finished` from the
    /// start, with zero batches ever scheduled.
    pub async fn create(
        &self,
        params: CreateMigrationParams,
    ) -> Result<BatchedMigration, StoreError> {
        let bounds_sql = format!(
            "SELECT MIN({col}), MAX({col}) FROM {table}",
            col = quote_ident(&params.batch_column)?,
            table = quote_ident(&params.table_name)?,
        );
        quote_ident(&params.column_name)?;

        let row = sqlx::query(&bounds_sql).fetch_one(&self.pool).await?;
        let min_value: Option<i64> = row.try_get(0)?;
        let max_value: Option<i64> = row.try_get(1)?;

        // NULL bounds mean the table is empty; encode that as an empty
        // domain so the record finishes immediately.
        let (min_value, max_value) = match (min_value, max_value) {
            (Some(min), Some(max)) => (min, max),
            _ => (1, 0),
        };

        let tuple_estimate: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(c.reltuples::BIGINT, 0)
            FROM pg_class c
            JOIN pg_namespace n ON c.relnamespace = n.oid
            WHERE c.relname = $1 AND n.nspname = current_schema()
            "#,
        )
        .bind(&params.table_name)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let status = if min_value > max_value {
            MigrationStatus::Finished
        } else {
            MigrationStatus::Active
        };

        let row = sqlx::query(
            r#"
            INSERT INTO evolve_batched_migrations
                (job_class_name, table_name, column_name, job_arguments,
                 batch_size, sub_batch_size, min_value, max_value,
                 batch_cursor, status, total_tuple_count, job_interval_ms,
                 finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    CASE WHEN $10 = 'finished' THEN NOW() END)
            RETURNING id, created_at
            "#,
        )
        .bind(&params.job_class_name)
        .bind(&params.table_name)
        .bind(&params.column_name)
        .bind(serde_json::to_value(&params.job_arguments)?)
        .bind(params.batch_size as i64)
        .bind(params.sub_batch_size as i64)
        .bind(min_value)
        .bind(max_value)
        .bind(BatchedMigration::initial_cursor(min_value))
        .bind(status.as_str())
        .bind(tuple_estimate)
        .bind(params.job_interval.as_millis() as i64)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        info!(
            "registered batched migration {} ({} on {}.{}, domain [{}, {}], status {})",
            id, params.job_class_name, params.table_name, params.column_name, min_value, max_value,
            status
        );

        Ok(BatchedMigration {
            id,
            job_class_name: params.job_class_name,
            table_name: params.table_name,
            column_name: params.column_name,
            job_arguments: params.job_arguments,
            batch_size: params.batch_size,
            sub_batch_size: params.sub_batch_size,
            min_value,
            max_value,
            cursor: BatchedMigration::initial_cursor(min_value),
            status,
            total_tuple_count: tuple_estimate,
            job_interval: params.job_interval,
            created_at,
            finished_at: None,
            last_error: None,
        })
    }

    /// Loads a migration by id.
    pub async fn find(&self, id: i64) -> Result<BatchedMigration, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM evolve_batched_migrations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        map_migration(&row)
    }

    /// Looks up a migration by its logical identity.
    pub async fn find_by_identity(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: &JobArguments,
    ) -> Result<Option<BatchedMigration>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM evolve_batched_migrations
            WHERE job_class_name = $1
              AND table_name = $2
              AND column_name = $3
              AND job_arguments = $4
            "#,
        )
        .bind(job_class_name)
        .bind(table_name)
        .bind(column_name)
        .bind(serde_json::to_value(job_arguments)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_migration).transpose()
    }

    /// Advances the cursor after a window's mutation has committed.
    ///
    /// The guard in the statement makes regression impossible even if two
    /// workers race: the update only applies while the persisted cursor is
    /// not already past the new value.
    pub async fn advance_cursor(&self, id: i64, new_cursor: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE evolve_batched_migrations
            SET batch_cursor = $2
            WHERE id = $1 AND batch_cursor <= $2
            "#,
        )
        .bind(id)
        .bind(new_cursor)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.find(id).await?;
            return Err(TransitionError::CursorRegression {
                current: current.cursor,
                proposed: new_cursor,
            }
            .into());
        }

        Ok(())
    }

    /// Transitions a migration's status, enforcing terminal protection.
    pub async fn set_status(&self, id: i64, status: MigrationStatus) -> Result<(), StoreError> {
        let mut record = self.find(id).await?;
        let previous = record.status;
        record.transition_to(status)?;

        let result = sqlx::query(
            r#"
            UPDATE evolve_batched_migrations
            SET status = $2,
                finished_at = CASE WHEN $2 IN ('finished', 'failed')
                                   THEN COALESCE(finished_at, NOW())
                                   ELSE finished_at END
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(previous.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race with another worker; reload and re-validate so a
            // terminal record still rejects the transition.
            let current = self.find(id).await?;
            let mut check = current.clone();
            check.transition_to(status)?;
            warn!(
                "status transition for migration {} raced (now {}); retrying",
                id, current.status
            );
            return Box::pin(self.set_status(id, status)).await;
        }

        info!("migration {} status: {} -> {}", id, previous, status);
        Ok(())
    }

    /// Marks a migration failed and captures the error for the operator.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<(), StoreError> {
        self.set_status(id, MigrationStatus::Failed).await?;
        sqlx::query("UPDATE evolve_batched_migrations SET last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Creates or retries the job row for a window, incrementing `attempts`.
    pub async fn begin_job(
        &self,
        migration_id: i64,
        window: BatchWindow,
    ) -> Result<BatchedJob, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO evolve_batched_jobs
                (migration_id, min_value, max_value, attempts, status)
            VALUES ($1, $2, $3, 1, 'pending')
            ON CONFLICT (migration_id, min_value, max_value) DO UPDATE SET
                attempts = evolve_batched_jobs.attempts + 1,
                status = 'pending',
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(migration_id)
        .bind(window.low)
        .bind(window.high)
        .fetch_one(&self.pool)
        .await?;

        map_job(&row)
    }

    /// Marks a job's window as committed.
    pub async fn complete_job(&self, job_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE evolve_batched_jobs
            SET status = 'succeeded', updated_at = NOW(), last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Captures a transient error on a job that stays pending.
    ///
    /// If the window is eventually abandoned, this is the text the
    /// operator sees; without it the abandonment message could only say
    /// that attempts ran out, not why.
    pub async fn record_job_error(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE evolve_batched_jobs
            SET last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Marks a job abandoned, capturing the final error.
    pub async fn fail_job(&self, job_id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE evolve_batched_jobs
            SET status = 'failed', updated_at = NOW(), last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Deletes succeeded job rows for a migration, returning how many were
    /// archived away. Succeeded jobs carry no information the cursor does
    /// not.
    pub async fn prune_succeeded_jobs(&self, migration_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM evolve_batched_jobs WHERE migration_id = $1 AND status = 'succeeded'",
        )
        .bind(migration_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// When the most recent job activity happened, used for throttling.
    pub async fn last_job_activity(
        &self,
        migration_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let updated: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(updated_at) FROM evolve_batched_jobs WHERE migration_id = $1",
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    /// The progress surface for one migration.
    pub async fn progress(&self, id: i64) -> Result<MigrationProgress, StoreError> {
        let record = self.find(id).await?;
        Ok(MigrationProgress {
            status: record.status,
            cursor: record.cursor,
            total_tuple_count: record.total_tuple_count,
            fraction: record.progress(),
        })
    }
}

fn map_migration(row: &PgRow) -> Result<BatchedMigration, StoreError> {
    let status = MigrationStatus::parse(row.try_get::<&str, _>("status")?)?;
    let job_arguments: JobArguments =
        serde_json::from_value(row.try_get::<serde_json::Value, _>("job_arguments")?)?;

    Ok(BatchedMigration {
        id: row.try_get("id")?,
        job_class_name: row.try_get("job_class_name")?,
        table_name: row.try_get("table_name")?,
        column_name: row.try_get("column_name")?,
        job_arguments,
        batch_size: row.try_get::<i64, _>("batch_size")? as u64,
        sub_batch_size: row.try_get::<i64, _>("sub_batch_size")? as u64,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        cursor: row.try_get("batch_cursor")?,
        status,
        total_tuple_count: row.try_get("total_tuple_count")?,
        job_interval: Duration::from_millis(row.try_get::<i64, _>("job_interval_ms")?.max(0) as u64),
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn map_job(row: &PgRow) -> Result<BatchedJob, StoreError> {
    let status = JobStatus::parse(row.try_get::<&str, _>("status")?)?;

    Ok(BatchedJob {
        id: row.try_get("id")?,
        migration_id: row.try_get("migration_id")?,
        min_value: row.try_get("min_value")?,
        max_value: row.try_get("max_value")?,
        attempts: row.try_get::<i32, _>("attempts")?.max(0) as u32,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_error: row.try_get("last_error")?,
    })
}
