//! # Evolve core
//!
//! Backend-agnostic building blocks for online schema evolution: batch
//! windowing, the persisted migration state model, the per-batch strategy
//! seam, and identifier safety helpers. Database-specific execution lives
//! in backend crates such as `evolve_pg`.

#![deny(missing_docs)]

/// Backend capability flags used to select evolution tactics at startup.
pub mod capabilities;

/// Identifier validation, quoting, and deterministic derived names.
pub mod ident;

/// The persisted migration and per-window job state model.
pub mod migration;

/// The per-batch transformation seam supplied by concrete migrations.
pub mod strategy;

/// Primary-key domain partitioning into bounded windows.
pub mod window;

pub mod prelude {
    //! The prelude module for the `evolve_core` crate.
    pub use super::capabilities::BackendCapabilities;
    pub use super::migration::{
        BatchedJob, BatchedMigration, JobStatus, MigrationStatus, TransitionError,
    };
    pub use super::strategy::{BatchStrategy, JobArguments, StrategyError};
    pub use super::window::{BatchWindow, BatchWindowIterator};
}

pub use capabilities::BackendCapabilities;
pub use ident::{
    check_constraint_name, concurrent_foreign_key_name, is_safe_identifier, quote_ident,
    rename_trigger_name, IdentError,
};
pub use migration::{BatchedJob, BatchedMigration, JobStatus, MigrationStatus, TransitionError};
pub use strategy::{BatchStrategy, JobArguments, StrategyError};
pub use window::{BatchWindow, BatchWindowIterator};
