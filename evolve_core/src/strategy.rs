//! The per-batch transformation seam.
//!
//! The engine never knows what a batch *does*: renaming a path, widening
//! an integer, deduplicating rows. Concrete migrations supply a
//! [`BatchStrategy`] keyed by `job_class_name`; the scheduler hands it one
//! window at a time together with the record's opaque `job_arguments`.

use crate::window::BatchWindow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Ordered, opaque parameters passed through to a [`BatchStrategy`].
///
/// Persisted as a JSONB array alongside the migration record. The engine
/// only compares these for identity lookups; their meaning belongs to the
/// strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArguments(Vec<serde_json::Value>);

impl JobArguments {
    /// Creates arguments from raw JSON values.
    pub fn new(values: Vec<serde_json::Value>) -> Self {
        Self(values)
    }

    /// The number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The argument at `index` as a string, if present and a string.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|v| v.as_str())
    }

    /// The argument at `index` as an integer, if present and integral.
    pub fn get_i64(&self, index: usize) -> Option<i64> {
        self.0.get(index).and_then(|v| v.as_i64())
    }

    /// The raw JSON values.
    pub fn as_slice(&self) -> &[serde_json::Value] {
        &self.0
    }
}

impl From<Vec<serde_json::Value>> for JobArguments {
    fn from(values: Vec<serde_json::Value>) -> Self {
        Self(values)
    }
}

/// Errors a strategy can surface from one batch.
///
/// The variant drives scheduling: transient contention is retried with
/// backoff, a data-integrity failure abandons the job and requires an
/// operator decision.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// Lock timeout, deadlock, serialization failure. Retried.
    #[error("transient database contention: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A real data problem (unexpected null, constraint violation). Not
    /// retried blindly.
    #[error("data integrity failure: {0}")]
    DataIntegrity(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StrategyError {
    /// Whether the scheduler should retry the same window.
    pub fn is_transient(&self) -> bool {
        matches!(self, StrategyError::Transient(_))
    }
}

/// A transformation applied to every row of one window.
///
/// Implementations must be idempotent: re-invoking `perform` on an
/// already-processed window must leave the rows unchanged (typically the
/// statement itself filters with a "not yet migrated" predicate such as
/// `WHERE new_column IS NULL`). They must not assume exclusive access to
/// the table; a dual-write trigger covers rows written concurrently.
#[async_trait]
pub trait BatchStrategy: Send + Sync {
    /// The `job_class_name` this strategy serves.
    fn name(&self) -> &str;

    /// Transforms rows whose primary key falls in `window`, returning the
    /// number of rows affected.
    async fn perform(&self, window: BatchWindow, args: &JobArguments)
        -> Result<u64, StrategyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingStrategy {
        calls: AtomicU64,
    }

    #[async_trait]
    impl BatchStrategy for RecordingStrategy {
        fn name(&self) -> &str {
            "RecordingStrategy"
        }

        async fn perform(
            &self,
            window: BatchWindow,
            _args: &JobArguments,
        ) -> Result<u64, StrategyError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(window.len())
        }
    }

    #[tokio::test]
    async fn strategy_receives_window_and_reports_rows() {
        let strategy = RecordingStrategy {
            calls: AtomicU64::new(0),
        };
        let affected = strategy
            .perform(BatchWindow::new(1, 100), &JobArguments::default())
            .await
            .unwrap();

        assert_eq!(affected, 100);
        assert_eq!(strategy.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn job_arguments_round_trip_as_json_array() {
        let args = JobArguments::new(vec![
            serde_json::json!("source_column"),
            serde_json::json!("target_column"),
            serde_json::json!(42),
        ]);

        let encoded = serde_json::to_string(&args).unwrap();
        assert_eq!(encoded, r#"["source_column","target_column",42]"#);

        let decoded: JobArguments = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn job_arguments_typed_accessors() {
        let args = JobArguments::new(vec![serde_json::json!("id"), serde_json::json!(7)]);

        assert_eq!(args.get_str(0), Some("id"));
        assert_eq!(args.get_i64(1), Some(7));
        assert_eq!(args.get_str(1), None);
        assert_eq!(args.get_i64(5), None);
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn transient_errors_are_retryable() {
        let transient = StrategyError::Transient("deadlock detected".into());
        let integrity = StrategyError::DataIntegrity("null value in column".into());

        assert!(transient.is_transient());
        assert!(!integrity.is_transient());
    }
}
