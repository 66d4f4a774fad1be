//! # Evolve postgres engine
//!
//! PostgreSQL implementation of the online schema evolution engine:
//! persistent batched-migration tracking, a dual-write trigger manager,
//! bounded lock-retry DDL execution, concurrent index and constraint
//! construction, the atomic column swap protocol, and the completion gate
//! that ties background backfills to the schema changes depending on them.

#![deny(missing_docs)]

/// Batch scheduling and backfill execution over the tracking tables
pub mod backfill;

/// The completion gate blocking dependent migrations on unfinished backfills
pub mod gate;

/// Non-blocking index and constraint construction
pub mod index_builder;

/// Exclusive-lock acquisition with bounded, escalating retries
pub mod lock_retry;

/// Bootstrap migrations for the engine's own tracking schema
pub mod migrations;

/// Persistence of batched migration records and their jobs
pub mod store;

/// The atomic column promotion (swap) protocol
pub mod swap;

/// Dual-write trigger management
pub mod trigger;

pub use backfill::{BackfillConfig, BackfillError, BackfillRunner, BatchOutcome};
pub use gate::{CompletionGate, GateError};
pub use index_builder::{
    ConcurrentIndexBuilder, ForeignKeySpec, IndexBuildError, IndexSpec, OnDelete,
};
pub use lock_retry::{LockAttempt, LockRetryConfig, LockRetryError, LockRetryExecutor};
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use store::{CreateMigrationParams, MigrationProgress, MigrationStore, StoreError};
pub use swap::{ConstraintSwap, PrimaryKeySwap, SwapCoordinator, SwapError, SwapPhase, SwapPlan};
pub use trigger::{DualWriteTrigger, TriggerError};
