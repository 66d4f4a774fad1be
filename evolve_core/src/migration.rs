//! The persisted state model for batched background migrations.
//!
//! The database owns these records as ordinary table rows; the migration
//! process is a stateless client that loads, mutates, and writes them back.
//! All transition rules live here as pure functions so both the Postgres
//! backend and unit tests exercise the same invariants: the cursor is
//! monotonically non-decreasing, a migration finishes exactly once, and
//! `Failed`/`Finished` are terminal.

use crate::strategy::JobArguments;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`BatchedMigration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Eligible for batch scheduling.
    Active,
    /// Halted by an operator; no new batches are dequeued.
    Paused,
    /// All windows processed. Terminal.
    Finished,
    /// A job exhausted its retries or hit a data-integrity error. Terminal,
    /// requires operator intervention.
    Failed,
}

impl MigrationStatus {
    /// Whether the scheduler may dequeue further batches.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, MigrationStatus::Active)
    }

    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Finished | MigrationStatus::Failed)
    }

    /// The status name as persisted in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Active => "active",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Finished => "finished",
            MigrationStatus::Failed => "failed",
        }
    }

    /// Parses a persisted status name.
    pub fn parse(s: &str) -> Result<Self, TransitionError> {
        match s {
            "active" => Ok(MigrationStatus::Active),
            "paused" => Ok(MigrationStatus::Paused),
            "finished" => Ok(MigrationStatus::Finished),
            "failed" => Ok(MigrationStatus::Failed),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by invalid state transitions.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The cursor was asked to move backwards.
    #[error("cursor may not move backwards: {current} -> {proposed}")]
    CursorRegression {
        /// The cursor currently persisted.
        current: i64,
        /// The rejected new value.
        proposed: i64,
    },

    /// A transition was attempted out of a terminal status.
    #[error("migration is {status} (terminal); cannot transition to {proposed}")]
    Terminal {
        /// The terminal status the record is in.
        status: MigrationStatus,
        /// The rejected target status.
        proposed: MigrationStatus,
    },

    /// A status string from the database was not recognised.
    #[error("unknown migration status: {0}")]
    UnknownStatus(String),
}

/// One logical background migration over a table's primary-key domain.
///
/// Mirrors a row of `evolve_batched_migrations`.
#[derive(Debug, Clone)]
pub struct BatchedMigration {
    /// Unique identifier (BIGSERIAL).
    pub id: i64,
    /// Names the [`crate::strategy::BatchStrategy`] that performs each batch.
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
    /// Inclusive lower bound of the key domain, computed once at creation.
    pub min_value: i64,
    /// Inclusive upper bound of the key domain, computed once at creation.
    pub max_value: i64,
    /// Upper bound of the last committed window; starts at `min_value - 1`.
    pub cursor: i64,
    /// Lifecycle status.
    pub status: MigrationStatus,
    /// Estimated row count. Progress reporting only, never correctness.
    pub total_tuple_count: i64,
    /// Minimum delay between batch executions.
    pub job_interval: std::time::Duration,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record reached a terminal status, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error captured when the record failed.
    pub last_error: Option<String>,
}

impl BatchedMigration {
    /// The initial cursor for a fresh record.
    pub fn initial_cursor(min_value: i64) -> i64 {
        min_value - 1
    }

    /// Whether every window in the domain has been processed.
    ///
    /// An empty domain (`min_value > max_value`) is complete from the start.
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.max_value
    }

    /// Validates and applies a cursor advance.
    ///
    /// The caller must only invoke this after the window's mutation has
    /// committed. Equal values are accepted so a replayed window is a no-op.
    pub fn advance_cursor(&mut self, new_cursor: i64) -> Result<(), TransitionError> {
        if new_cursor < self.cursor {
            return Err(TransitionError::CursorRegression {
                current: self.cursor,
                proposed: new_cursor,
            });
        }
        self.cursor = new_cursor;
        Ok(())
    }

    /// Validates and applies a status transition.
    ///
    /// Terminal statuses reject every transition, including `Failed ->
    /// Finished`: a failed migration must never silently complete.
    pub fn transition_to(&mut self, status: MigrationStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() && status != self.status {
            return Err(TransitionError::Terminal {
                status: self.status,
                proposed: status,
            });
        }
        self.status = status;
        Ok(())
    }

    /// The next unprocessed window, or `None` when the domain is exhausted.
    pub fn next_window(&self) -> Option<crate::window::BatchWindow> {
        crate::window::BatchWindowIterator::resume(self.cursor, self.max_value, self.batch_size)
            .next()
    }

    /// Fraction of the estimated tuple count behind the cursor, in `[0, 1]`.
    ///
    /// Derived from `total_tuple_count`, which is a planner estimate; the
    /// value is clamped and only suitable for dashboards.
    pub fn progress(&self) -> f64 {
        if self.is_complete() {
            return 1.0;
        }
        if self.total_tuple_count <= 0 || self.max_value < self.min_value {
            return 0.0;
        }
        let done = (self.cursor - self.min_value + 1).max(0) as f64;
        let domain = (self.max_value - self.min_value + 1) as f64;
        (done / domain).clamp(0.0, 1.0)
    }
}

/// Per-window execution record, mirroring a row of `evolve_batched_jobs`.
#[derive(Debug, Clone)]
pub struct BatchedJob {
    /// Unique identifier (BIGSERIAL).
    pub id: i64,
    /// Owning [`BatchedMigration`].
    pub migration_id: i64,
    /// Inclusive lower bound of the window.
    pub min_value: i64,
    /// Inclusive upper bound of the window.
    pub max_value: i64,
    /// Number of times this window has been attempted.
    pub attempts: u32,
    /// Execution status.
    pub status: JobStatus,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
    /// When the job last changed status.
    pub updated_at: DateTime<Utc>,
    /// Error captured from the most recent failed attempt.
    pub last_error: Option<String>,
}

/// Lifecycle status of a [`BatchedJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created for the next unprocessed window, not yet succeeded.
    Pending,
    /// The window's mutation committed.
    Succeeded,
    /// Abandoned after exhausting retries or on a data-integrity error.
    Failed,
}

impl JobStatus {
    /// The status name as persisted in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Parses a persisted status name.
    pub fn parse(s: &str) -> Result<Self, TransitionError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(TransitionError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::BatchWindow;

    fn migration(min: i64, max: i64, batch_size: u64) -> BatchedMigration {
        BatchedMigration {
            id: 1,
            job_class_name: "CopyColumn".to_string(),
            table_name: "events".to_string(),
            column_name: "id".to_string(),
            job_arguments: JobArguments::default(),
            batch_size,
            sub_batch_size: batch_size / 10,
            min_value: min,
            max_value: max,
            cursor: BatchedMigration::initial_cursor(min),
            status: MigrationStatus::Active,
            total_tuple_count: max - min + 1,
            job_interval: std::time::Duration::from_secs(120),
            created_at: Utc::now(),
            finished_at: None,
            last_error: None,
        }
    }

    #[test]
    fn fresh_migration_starts_below_min_value() {
        let m = migration(1, 250, 100);
        assert_eq!(m.cursor, 0);
        assert!(!m.is_complete());
    }

    #[test]
    fn next_window_walks_the_domain_in_order() {
        let mut m = migration(1, 250, 100);

        assert_eq!(m.next_window(), Some(BatchWindow::new(1, 100)));
        m.advance_cursor(100).unwrap();
        assert_eq!(m.next_window(), Some(BatchWindow::new(101, 200)));
        m.advance_cursor(200).unwrap();
        assert_eq!(m.next_window(), Some(BatchWindow::new(201, 250)));
        m.advance_cursor(250).unwrap();
        assert_eq!(m.next_window(), None);
        assert!(m.is_complete());
    }

    #[test]
    fn crash_before_commit_resumes_same_window() {
        let mut m = migration(1, 250, 100);
        m.advance_cursor(100).unwrap();

        // Process crashed before window 2 committed: cursor stays at 100 and
        // the same window is produced again on resume.
        assert_eq!(m.next_window(), Some(BatchWindow::new(101, 200)));
        assert_eq!(m.next_window(), Some(BatchWindow::new(101, 200)));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut m = migration(1, 250, 100);
        m.advance_cursor(200).unwrap();

        let err = m.advance_cursor(100).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::CursorRegression {
                current: 200,
                proposed: 100
            }
        ));
        assert_eq!(m.cursor, 200);
    }

    #[test]
    fn cursor_advance_to_same_value_is_a_noop() {
        let mut m = migration(1, 250, 100);
        m.advance_cursor(100).unwrap();
        m.advance_cursor(100).unwrap();
        assert_eq!(m.cursor, 100);
    }

    #[test]
    fn empty_domain_is_immediately_complete() {
        let m = migration(1, 0, 100);
        assert!(m.is_complete());
        assert_eq!(m.next_window(), None);
    }

    #[test]
    fn finished_is_terminal() {
        let mut m = migration(1, 250, 100);
        m.transition_to(MigrationStatus::Finished).unwrap();

        assert!(m.transition_to(MigrationStatus::Active).is_err());
        assert_eq!(m.status, MigrationStatus::Finished);
    }

    #[test]
    fn failed_never_becomes_finished() {
        let mut m = migration(1, 250, 100);
        m.transition_to(MigrationStatus::Failed).unwrap();

        let err = m.transition_to(MigrationStatus::Finished).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Terminal {
                status: MigrationStatus::Failed,
                proposed: MigrationStatus::Finished
            }
        ));
    }

    #[test]
    fn terminal_self_transition_is_accepted() {
        let mut m = migration(1, 250, 100);
        m.transition_to(MigrationStatus::Finished).unwrap();
        m.transition_to(MigrationStatus::Finished).unwrap();
    }

    #[test]
    fn pausing_halts_scheduling() {
        let mut m = migration(1, 250, 100);
        assert!(m.status.is_schedulable());

        m.transition_to(MigrationStatus::Paused).unwrap();
        assert!(!m.status.is_schedulable());

        // Paused is not terminal; it can go back to active.
        m.transition_to(MigrationStatus::Active).unwrap();
        assert!(m.status.is_schedulable());
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut m = migration(1, 1000, 100);
        assert_eq!(m.progress(), 0.0);

        m.advance_cursor(500).unwrap();
        let halfway = m.progress();
        assert!(halfway > 0.4 && halfway < 0.6);

        m.advance_cursor(1000).unwrap();
        assert_eq!(m.progress(), 1.0);
    }

    #[test]
    fn progress_of_empty_domain_is_complete() {
        let m = migration(1, 0, 100);
        assert_eq!(m.progress(), 1.0);
    }

    #[test]
    fn status_round_trips_through_persisted_names() {
        for status in [
            MigrationStatus::Active,
            MigrationStatus::Paused,
            MigrationStatus::Finished,
            MigrationStatus::Failed,
        ] {
            assert_eq!(MigrationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MigrationStatus::parse("cancelled").is_err());
    }

    #[test]
    fn job_status_round_trips_through_persisted_names() {
        for status in [JobStatus::Pending, JobStatus::Succeeded, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("running").is_err());
    }
}
