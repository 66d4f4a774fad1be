//! The completion gate: the synchronization point between background
//! backfills and the schema changes that depend on them.
//!
//! A swap must never run over a partially backfilled column. Before any
//! dependent migration proceeds, the gate checks the tracking record and,
//! if windows remain, drains them inline on the calling worker rather than
//! waiting for the background scheduler to get around to them.

use crate::backfill::{BackfillError, BackfillRunner};
use crate::store::StoreError;
use evolve_core::migration::MigrationStatus;
use evolve_core::strategy::JobArguments;
use log::{info, warn};
use std::sync::Arc;

/// Errors from the completion gate.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Running remaining batches failed.
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    /// No tracking record matches the requested identity. The dependent
    /// migration was deployed without its backfill being enqueued first.
    #[error(
        "no batched migration found for {job_class_name:?} on {table_name}.{column_name}"
    )]
    NotEnqueued {
        /// The strategy's job class name.
        job_class_name: String,
        /// The table being backfilled.
        table_name: String,
        /// The batching column.
        column_name: String,
    },

    /// The migration reached `failed`; the gate must not silently run a
    /// broken backfill to completion.
    #[error("batched migration {id} is failed: {last_error}")]
    MigrationFailed {
        /// The tracking record id.
        id: i64,
        /// The recorded failure message.
        last_error: String,
    },
}

/// Blocks dependent migrations until a backfill is `finished`.
#[derive(Clone)]
pub struct CompletionGate {
    runner: Arc<BackfillRunner>,
}

impl CompletionGate {
    /// Creates a gate draining through the given runner. The runner must
    /// have the relevant strategies registered.
    pub fn new(runner: Arc<BackfillRunner>) -> Self {
        Self { runner }
    }

    /// Ensures the migration identified by
    /// `(job_class_name, table, column, arguments)` is `finished`,
    /// draining any remaining windows inline.
    ///
    /// A missing record is fatal rather than skippable: silently
    /// proceeding would let a swap run over unconverted rows.
    pub async fn ensure_finished(
        &self,
        job_class_name: &str,
        table_name: &str,
        column_name: &str,
        job_arguments: &JobArguments,
    ) -> Result<(), GateError> {
        let record = self
            .runner
            .store()
            .find_by_identity(job_class_name, table_name, column_name, job_arguments)
            .await?
            .ok_or_else(|| GateError::NotEnqueued {
                job_class_name: job_class_name.to_string(),
                table_name: table_name.to_string(),
                column_name: column_name.to_string(),
            })?;

        self.ensure_finished_by_id(record.id).await
    }

    /// Ensures the migration with the given tracking id is `finished`.
    pub async fn ensure_finished_by_id(&self, migration_id: i64) -> Result<(), GateError> {
        let record = self.runner.store().find(migration_id).await?;

        match record.status {
            MigrationStatus::Finished => return Ok(()),
            MigrationStatus::Failed => {
                return Err(GateError::MigrationFailed {
                    id: record.id,
                    last_error: record
                        .last_error
                        .unwrap_or_else(|| "no error recorded".to_string()),
                });
            }
            MigrationStatus::Paused => {
                // A paused backfill would otherwise block forever; the
                // gate takes it over.
                warn!(
                    "migration {} is paused at the gate; resuming inline",
                    record.id
                );
                self.runner
                    .store()
                    .set_status(record.id, MigrationStatus::Active)
                    .await?;
            }
            MigrationStatus::Active => {}
        }

        info!(
            "gate: draining migration {} inline ({:.1}% done)",
            record.id,
            record.progress() * 100.0
        );

        match self.runner.run_to_completion(migration_id).await? {
            MigrationStatus::Finished => Ok(()),
            status => {
                let record = self.runner.store().find(migration_id).await?;
                Err(GateError::MigrationFailed {
                    id: migration_id,
                    last_error: record
                        .last_error
                        .unwrap_or_else(|| format!("halted in status {}", status)),
                })
            }
        }
    }
}
