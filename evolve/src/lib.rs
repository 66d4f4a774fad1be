//! # Evolve
//!
//! Online schema evolution for large PostgreSQL tables: batched background
//! backfills driven by a persisted cursor, dual-write triggers keeping a
//! shadow column in sync, concurrently built replacement indexes and
//! constraints, and an atomic rename-based swap that promotes the shadow
//! column without rewriting a single row.

#![deny(missing_docs)]

pub use evolve_core::*;

#[cfg(feature = "postgres")]
/// The PostgreSQL engine for the `evolve` crate.
pub mod postgres {
    //! Contains the PostgreSQL engine for the `evolve` crate.
    pub use evolve_pg::*;
}

pub mod prelude {
    //! The prelude module for the `evolve` crate.
    pub use evolve_core::prelude::*;

    #[cfg(feature = "postgres")]
    pub use super::postgres::{
        BackfillRunner, CompletionGate, ConcurrentIndexBuilder, DualWriteTrigger,
        LockRetryExecutor, MigrationStore, Migrator, SwapCoordinator, SwapPlan,
    };
}
