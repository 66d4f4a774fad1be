//! The atomic column promotion (swap) protocol.
//!
//! Once a backfill has brought a shadow column fully up to date, the swap
//! promotes it to be the column of record under the original name. The
//! expensive work (replacement indexes, unvalidated foreign keys) happens
//! before any exclusive lock; the locked section is pure metadata - column
//! renames, default reassignment, constraint attach/detach - and is bounded
//! by the lock-retry executor, so it either commits whole or leaves the
//! schema untouched.
//!
//! The protocol is an involution: running the same swap again restores
//! every original identifier, which is why concrete migrations implement
//! rollback by calling the identical procedure.

use crate::index_builder::{ConcurrentIndexBuilder, ForeignKeySpec, IndexBuildError, IndexSpec};
use crate::lock_retry::{LockRetryError, LockRetryExecutor};
use crate::trigger;
use evolve_core::ident::{quote_ident, rename_trigger_name, IdentError, MAX_IDENTIFIER_LENGTH};
use log::info;
use sqlx::{PgPool, Row};

/// Errors from the swap coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// A name in the plan failed validation.
    #[error(transparent)]
    Ident(#[from] IdentError),

    /// A database error outside the locked section.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The locked section could not run; no change was made.
    #[error(transparent)]
    LockRetry(#[from] LockRetryError),

    /// Building a replacement index or foreign key failed.
    #[error(transparent)]
    IndexBuild(#[from] IndexBuildError),

    /// The plan is internally inconsistent.
    #[error("invalid swap plan: {0}")]
    InvalidPlan(String),
}

/// Progress through the swap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    /// Building replacement indexes and foreign keys.
    Preparing,
    /// Replacement objects exist; ready to lock.
    IndexesReady,
    /// Exclusive locks held; renames in flight.
    Locked,
    /// Column identities exchanged.
    ColumnsSwapped,
    /// Defaults, sequence ownership, primary key, and constraint names
    /// exchanged.
    ConstraintsSwapped,
    /// The locked transaction committed.
    Done,
}

/// A pair of same-table constraint names to exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintSwap {
    /// The table carrying both constraints.
    pub table: String,
    /// One constraint name.
    pub a: String,
    /// The other constraint name.
    pub b: String,
}

/// Primary-key promotion: drop the old constraint and rebuild it from a
/// concurrently-built unique replacement index, keeping the original name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeySwap {
    /// The primary-key constraint name (stable across the swap).
    pub constraint: String,
    /// The unique index on the promoted column, built during `Preparing`.
    pub replacement_index: String,
}

/// Everything the coordinator needs to promote `new_column` in place of
/// `old_column` on `table`.
#[derive(Debug, Clone, Default)]
pub struct SwapPlan {
    /// The table being evolved.
    pub table: String,
    /// The current column of record.
    pub old_column: String,
    /// The fully backfilled shadow column.
    pub new_column: String,
    /// Referenced (parent) tables that must be locked before `table`.
    pub parent_tables: Vec<String>,
    /// Indexes to build concurrently before locking.
    pub replacement_indexes: Vec<IndexSpec>,
    /// Foreign keys to attach `NOT VALID` before locking. These must
    /// already point at the new column so referential integrity never
    /// lapses when the old primary key is dropped.
    pub replacement_foreign_keys: Vec<ForeignKeySpec>,
    /// Same-table index name pairs to exchange inside the lock.
    pub index_name_swaps: Vec<(String, String)>,
    /// Constraint name pairs (e.g. old and replacement foreign keys on
    /// referencing tables) to exchange inside the lock.
    pub constraint_name_swaps: Vec<ConstraintSwap>,
    /// Primary-key promotion, when the swapped column is the key.
    pub primary_key: Option<PrimaryKeySwap>,
    /// Sequence to re-own to the promoted column (stable name).
    pub owned_sequence: Option<String>,
    /// Whether a dual-write trigger exists whose cached plan must be
    /// discarded after the rename dance.
    pub reset_trigger: bool,
}

impl SwapPlan {
    /// Minimal plan for a plain column swap.
    pub fn new(
        table: impl Into<String>,
        old_column: impl Into<String>,
        new_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            old_column: old_column.into(),
            new_column: new_column.into(),
            reset_trigger: true,
            ..Default::default()
        }
    }

    /// The fixed lock acquisition order: parents first (ascending by name),
    /// then the swapped table. Deadlock freedom across concurrent swaps
    /// depends on every coordinator using this order.
    pub fn lock_order(&self) -> Vec<String> {
        let mut parents: Vec<String> = self
            .parent_tables
            .iter()
            .filter(|t| **t != self.table)
            .cloned()
            .collect();
        parents.sort();
        parents.dedup();
        parents.push(self.table.clone());
        parents
    }

    fn temp_name(base: &str) -> Result<String, SwapError> {
        let name = format!("{}_swap_tmp", base);
        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(SwapError::InvalidPlan(format!(
                "temporary name {:?} exceeds the identifier limit",
                name
            )));
        }
        Ok(name)
    }

    fn validate(&self) -> Result<(), SwapError> {
        if self.old_column == self.new_column {
            return Err(SwapError::InvalidPlan(
                "old_column and new_column are the same".to_string(),
            ));
        }
        quote_ident(&self.table)?;
        quote_ident(&self.old_column)?;
        quote_ident(&self.new_column)?;
        Self::temp_name(&self.old_column)?;
        Ok(())
    }

    /// The statements executed inside the locked transaction, in order.
    ///
    /// `old_default`/`new_default` are the column default expressions read
    /// from the catalog before locking; defaults follow the *name* across
    /// the swap, so they are explicitly reassigned after the rename dance
    /// (a rename alone would carry each default along with its physical
    /// column).
    fn locked_statements(
        &self,
        old_default: Option<&str>,
        new_default: Option<&str>,
    ) -> Result<Vec<String>, SwapError> {
        self.validate()?;

        let table = quote_ident(&self.table)?;
        let old = quote_ident(&self.old_column)?;
        let new = quote_ident(&self.new_column)?;
        let temp = quote_ident(&Self::temp_name(&self.old_column)?)?;

        let mut statements = Vec::new();

        for t in self.lock_order() {
            statements.push(format!(
                "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
                quote_ident(&t)?
            ));
        }

        // The rename dance: exchange column identities without copying a
        // single row.
        statements.push(format!("ALTER TABLE {table} RENAME COLUMN {old} TO {temp}"));
        statements.push(format!("ALTER TABLE {table} RENAME COLUMN {new} TO {old}"));
        statements.push(format!("ALTER TABLE {table} RENAME COLUMN {temp} TO {new}"));

        if self.reset_trigger {
            // A plan cached against the pre-swap column type would corrupt
            // or reject writes; replacing the function forces recompilation.
            let name = rename_trigger_name(&self.table, &self.old_column, &self.new_column);
            statements.push(trigger::function_sql(
                &name,
                &self.old_column,
                &self.new_column,
            )?);
        }

        statements.push(default_statement(&table, &old, old_default));
        statements.push(default_statement(&table, &new, new_default));

        if let Some(sequence) = &self.owned_sequence {
            statements.push(format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                quote_ident(sequence)?,
                table,
                old
            ));
        }

        // Constraint names are exchanged while both constraints still
        // exist: dropping the old primary key below cascades to the
        // foreign keys depending on it, so a rename issued after the drop
        // would reference a vanished constraint.
        for swap in &self.constraint_name_swaps {
            let t = quote_ident(&swap.table)?;
            let a = quote_ident(&swap.a)?;
            let b = quote_ident(&swap.b)?;
            let tmp = quote_ident(&Self::temp_name(&swap.a)?)?;
            statements.push(format!("ALTER TABLE {t} RENAME CONSTRAINT {a} TO {tmp}"));
            statements.push(format!("ALTER TABLE {t} RENAME CONSTRAINT {b} TO {a}"));
            statements.push(format!("ALTER TABLE {t} RENAME CONSTRAINT {tmp} TO {b}"));
        }

        if let Some(pk) = &self.primary_key {
            // CASCADE takes the obsolete foreign keys down with the old
            // key; the replacement keys attached during Preparing already
            // reference the new unique index, so integrity never lapses.
            statements.push(format!(
                "ALTER TABLE {} DROP CONSTRAINT {} CASCADE",
                table,
                quote_ident(&pk.constraint)?
            ));
            statements.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY USING INDEX {}",
                table,
                quote_ident(&pk.constraint)?,
                quote_ident(&pk.replacement_index)?
            ));
        }

        for (a, b) in &self.index_name_swaps {
            let a_q = quote_ident(a)?;
            let b_q = quote_ident(b)?;
            let tmp = quote_ident(&Self::temp_name(a)?)?;
            statements.push(format!("ALTER INDEX {a_q} RENAME TO {tmp}"));
            statements.push(format!("ALTER INDEX {b_q} RENAME TO {a_q}"));
            statements.push(format!("ALTER INDEX {tmp} RENAME TO {b_q}"));
        }

        Ok(statements)
    }
}

fn default_statement(table: &str, column: &str, default: Option<&str>) -> String {
    match default {
        Some(expr) => format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
            table, column, expr
        ),
        None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, column),
    }
}

/// Executes [`SwapPlan`]s: replacement objects outside the lock, the rename
/// dance and constraint exchange inside one retried, all-or-nothing locked
/// transaction.
#[derive(Debug, Clone)]
pub struct SwapCoordinator {
    pool: PgPool,
    lock_retry: LockRetryExecutor,
    builder: ConcurrentIndexBuilder,
}

impl SwapCoordinator {
    /// Creates a coordinator with default lock-retry timing.
    pub fn new(pool: PgPool) -> Self {
        let lock_retry = LockRetryExecutor::new(pool.clone());
        let builder = ConcurrentIndexBuilder::new(pool.clone(), lock_retry.clone());
        Self {
            pool,
            lock_retry,
            builder,
        }
    }

    /// Creates a coordinator from preconfigured components.
    pub fn with_components(
        pool: PgPool,
        lock_retry: LockRetryExecutor,
        builder: ConcurrentIndexBuilder,
    ) -> Self {
        Self {
            pool,
            lock_retry,
            builder,
        }
    }

    /// Runs the full swap protocol.
    ///
    /// Rollback is the same call: swapping twice restores every original
    /// column, default, primary key, index, and foreign key identifier.
    pub async fn swap(&self, plan: &SwapPlan) -> Result<(), SwapError> {
        plan.validate()?;
        info!(
            "swap {}.{} <-> {}: {:?}",
            plan.table,
            plan.old_column,
            plan.new_column,
            SwapPhase::Preparing
        );

        // Preparing -> IndexesReady: everything here is skip-safe and runs
        // without an exclusive lock, so it may execute any time before the
        // swap, even while the backfill is still running. Indexes go first:
        // the replacement foreign keys reference the unique index.
        for spec in &plan.replacement_indexes {
            self.builder.add_index(spec).await?;
        }
        for spec in &plan.replacement_foreign_keys {
            // Validation is deferred; it runs out of band so no single
            // migration step stays long.
            self.builder.add_foreign_key(spec, false).await?;
        }
        info!(
            "swap {}.{}: {:?}",
            plan.table, plan.old_column, SwapPhase::IndexesReady
        );

        // Defaults are read before locking; concurrent default changes are
        // excluded by the one-evolution-per-table operational rule.
        let old_default = self.column_default(&plan.table, &plan.old_column).await?;
        let new_default = self.column_default(&plan.table, &plan.new_column).await?;

        let statements =
            plan.locked_statements(old_default.as_deref(), new_default.as_deref())?;

        // IndexesReady -> Locked -> ColumnsSwapped -> ConstraintsSwapped:
        // one retried transaction of pure metadata operations. A lock
        // timeout rolls the whole section back and retries; exhaustion
        // aborts with the schema untouched.
        self.lock_retry
            .run(move |tx| {
                let statements = statements.clone();
                Box::pin(async move {
                    for sql in &statements {
                        sqlx::query(sql).execute(&mut **tx).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(
            "swap {}.{} <-> {}: {:?}",
            plan.table,
            plan.old_column,
            plan.new_column,
            SwapPhase::Done
        );
        Ok(())
    }

    /// The column's default expression, if any.
    async fn column_default(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, SwapError> {
        let row = sqlx::query(
            r#"
            SELECT column_default
            FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = $1
              AND column_name = $2
            "#,
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| r.try_get::<Option<String>, _>(0).ok().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SwapPlan {
        SwapPlan::new("events", "id", "id_convert")
    }

    #[test]
    fn lock_order_is_parents_first_then_target() {
        let mut p = plan();
        p.parent_tables = vec!["projects".to_string(), "namespaces".to_string()];

        assert_eq!(
            p.lock_order(),
            vec![
                "namespaces".to_string(),
                "projects".to_string(),
                "events".to_string(),
            ]
        );
    }

    #[test]
    fn lock_order_deduplicates_and_excludes_target() {
        let mut p = plan();
        p.parent_tables = vec![
            "projects".to_string(),
            "projects".to_string(),
            "events".to_string(),
        ];

        assert_eq!(
            p.lock_order(),
            vec!["projects".to_string(), "events".to_string()]
        );
    }

    #[test]
    fn rename_dance_is_three_steps_without_data_copy() {
        let statements = plan().locked_statements(None, None).unwrap();

        let renames: Vec<&String> = statements
            .iter()
            .filter(|s| s.contains("RENAME COLUMN"))
            .collect();
        assert_eq!(
            renames,
            vec![
                "ALTER TABLE \"events\" RENAME COLUMN \"id\" TO \"id_swap_tmp\"",
                "ALTER TABLE \"events\" RENAME COLUMN \"id_convert\" TO \"id\"",
                "ALTER TABLE \"events\" RENAME COLUMN \"id_swap_tmp\" TO \"id_convert\"",
            ]
        );
        assert!(statements.iter().all(|s| !s.contains("UPDATE")));
    }

    #[test]
    fn locks_are_acquired_before_any_rename() {
        let statements = plan().locked_statements(None, None).unwrap();

        let first_rename = statements
            .iter()
            .position(|s| s.contains("RENAME"))
            .unwrap();
        let last_lock = statements
            .iter()
            .rposition(|s| s.starts_with("LOCK TABLE"))
            .unwrap();
        assert!(last_lock < first_rename);
        assert!(statements[0].contains("ACCESS EXCLUSIVE MODE"));
    }

    #[test]
    fn trigger_reset_follows_the_rename_dance() {
        let statements = plan().locked_statements(None, None).unwrap();

        let last_rename = statements
            .iter()
            .rposition(|s| s.contains("RENAME COLUMN"))
            .unwrap();
        let reset = statements
            .iter()
            .position(|s| s.contains("CREATE OR REPLACE FUNCTION"))
            .unwrap();
        assert!(reset > last_rename);
    }

    #[test]
    fn primary_key_is_rebuilt_under_its_original_name() {
        let mut p = plan();
        p.primary_key = Some(PrimaryKeySwap {
            constraint: "events_pkey".to_string(),
            replacement_index: "idx_events_id_convert".to_string(),
        });

        let statements = p.locked_statements(None, None).unwrap();
        let drop = statements
            .iter()
            .position(|s| s.contains("DROP CONSTRAINT \"events_pkey\" CASCADE"))
            .unwrap();
        let add = statements
            .iter()
            .position(|s| {
                s.contains("ADD CONSTRAINT \"events_pkey\" PRIMARY KEY USING INDEX \"idx_events_id_convert\"")
            })
            .unwrap();
        assert!(drop < add);
    }

    #[test]
    fn defaults_follow_the_name_not_the_physical_column() {
        let statements = plan()
            .locked_statements(Some("nextval('events_id_seq'::regclass)"), None)
            .unwrap();

        assert!(statements.iter().any(|s| s
            == "ALTER TABLE \"events\" ALTER COLUMN \"id\" SET DEFAULT nextval('events_id_seq'::regclass)"));
        assert!(statements
            .iter()
            .any(|s| s == "ALTER TABLE \"events\" ALTER COLUMN \"id_convert\" DROP DEFAULT"));
    }

    #[test]
    fn sequence_is_reowned_to_the_stable_name() {
        let mut p = plan();
        p.owned_sequence = Some("events_id_seq".to_string());

        let statements = p.locked_statements(None, None).unwrap();
        assert!(statements
            .iter()
            .any(|s| s == "ALTER SEQUENCE \"events_id_seq\" OWNED BY \"events\".\"id\""));
    }

    #[test]
    fn constraint_and_index_swaps_are_involutions() {
        let mut p = plan();
        p.constraint_name_swaps = vec![ConstraintSwap {
            table: "ci_builds".to_string(),
            a: "fk_old".to_string(),
            b: "fk_new".to_string(),
        }];
        p.index_name_swaps = vec![("idx_a".to_string(), "idx_b".to_string())];

        let statements = p.locked_statements(None, None).unwrap();

        // Each exchange is a three-step rename through a temp name, so
        // applying the same plan twice restores the original names.
        assert!(statements
            .iter()
            .any(|s| s == "ALTER TABLE \"ci_builds\" RENAME CONSTRAINT \"fk_old\" TO \"fk_old_swap_tmp\""));
        assert!(statements
            .iter()
            .any(|s| s == "ALTER TABLE \"ci_builds\" RENAME CONSTRAINT \"fk_new\" TO \"fk_old\""));
        assert!(statements
            .iter()
            .any(|s| s == "ALTER TABLE \"ci_builds\" RENAME CONSTRAINT \"fk_old_swap_tmp\" TO \"fk_new\""));
        assert!(statements.iter().any(|s| s == "ALTER INDEX \"idx_a\" RENAME TO \"idx_a_swap_tmp\""));
    }

    #[test]
    fn constraint_names_are_exchanged_before_the_primary_key_drop() {
        let mut p = plan();
        p.primary_key = Some(PrimaryKeySwap {
            constraint: "events_pkey".to_string(),
            replacement_index: "idx_events_id_convert".to_string(),
        });
        p.constraint_name_swaps = vec![ConstraintSwap {
            table: "ci_builds".to_string(),
            a: "fk_old".to_string(),
            b: "fk_new".to_string(),
        }];

        let statements = p.locked_statements(None, None).unwrap();

        // The cascade of the primary-key drop removes the old foreign key;
        // its name must already have been handed over by then.
        let last_constraint_rename = statements
            .iter()
            .rposition(|s| s.contains("RENAME CONSTRAINT"))
            .unwrap();
        let pk_drop = statements
            .iter()
            .position(|s| s.contains("DROP CONSTRAINT \"events_pkey\" CASCADE"))
            .unwrap();
        assert!(last_constraint_rename < pk_drop);
    }

    #[test]
    fn identical_columns_are_rejected() {
        let p = SwapPlan::new("events", "id", "id");
        assert!(matches!(
            p.locked_statements(None, None),
            Err(SwapError::InvalidPlan(_))
        ));
    }

    #[test]
    fn unsafe_plan_names_are_rejected() {
        let p = SwapPlan::new("events; DROP TABLE users", "id", "id_convert");
        assert!(p.locked_statements(None, None).is_err());
    }

    #[test]
    fn locked_section_contains_only_metadata_operations() {
        let mut p = plan();
        p.primary_key = Some(PrimaryKeySwap {
            constraint: "events_pkey".to_string(),
            replacement_index: "idx_events_id_convert".to_string(),
        });
        p.owned_sequence = Some("events_id_seq".to_string());

        for statement in p.locked_statements(None, None).unwrap() {
            let metadata_only = statement.starts_with("LOCK TABLE")
                || statement.starts_with("ALTER TABLE")
                || statement.starts_with("ALTER INDEX")
                || statement.starts_with("ALTER SEQUENCE")
                || statement.trim_start().starts_with("CREATE OR REPLACE FUNCTION");
            assert!(metadata_only, "unexpected statement in locked section: {statement}");
        }
    }
}
