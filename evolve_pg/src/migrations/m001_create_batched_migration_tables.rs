//! Migration 001: Create the batched migration tracking tables.
//!
//! `evolve_batched_migrations` is the durable record of every backfill:
//! identity, batching geometry, cursor, and lifecycle status.
//! `evolve_batched_jobs` records individual window executions so attempt
//! counts and failure messages survive worker restarts.

use super::{Migration, MigrationError};
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

/// Creates `evolve_batched_migrations` and `evolve_batched_jobs`.
pub struct CreateBatchedMigrationTables;

#[async_trait]
impl Migration for CreateBatchedMigrationTables {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_batched_migration_tables"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evolve_batched_migrations (
                id BIGSERIAL PRIMARY KEY,
                job_class_name VARCHAR(255) NOT NULL,
                table_name VARCHAR(63) NOT NULL,
                column_name VARCHAR(63) NOT NULL,
                job_arguments JSONB NOT NULL DEFAULT '[]',
                batch_size BIGINT NOT NULL,
                sub_batch_size BIGINT NOT NULL,
                min_value BIGINT NOT NULL,
                max_value BIGINT NOT NULL,
                batch_cursor BIGINT NOT NULL,
                status VARCHAR(32) NOT NULL DEFAULT 'active',
                total_tuple_count BIGINT NOT NULL DEFAULT 0,
                job_interval_ms BIGINT NOT NULL DEFAULT 120000,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finished_at TIMESTAMPTZ,
                last_error TEXT
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // One migration per logical identity; re-enqueueing an identical
        // backfill must find the existing record instead of forking it.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS evolve_batched_migrations_identity
            ON evolve_batched_migrations
            (job_class_name, table_name, column_name, job_arguments)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evolve_batched_jobs (
                id BIGSERIAL PRIMARY KEY,
                migration_id BIGINT NOT NULL
                    REFERENCES evolve_batched_migrations (id) ON DELETE CASCADE,
                min_value BIGINT NOT NULL,
                max_value BIGINT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status VARCHAR(32) NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error TEXT,
                CONSTRAINT evolve_unique_job_window
                    UNIQUE (migration_id, min_value, max_value)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS evolve_batched_jobs_migration_status
            ON evolve_batched_jobs (migration_id, status)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
