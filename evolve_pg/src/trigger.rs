//! Dual-write trigger management.
//!
//! While a column is being evolved, a database-side trigger mirrors every
//! `INSERT`/`UPDATE` of the old column into its shadow column. Because the
//! trigger runs inside the same statement, no write path can bypass it:
//! application traffic, ad-hoc admin queries, and the backfill itself all
//! keep the two representations consistent, which is what lets the backfill
//! run concurrently with live traffic.

use evolve_core::ident::{quote_ident, rename_trigger_name, IdentError};
use log::info;
use sqlx::PgPool;

/// Errors from trigger installation or removal.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// A table or column name failed validation.
    #[error(transparent)]
    Ident(#[from] IdentError),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A `(table, old_column, new_column)` dual-write binding.
///
/// The binding is created before any backfill starts and removed only after
/// the swap has completed and the retired column is dropped or repurposed
/// for the reverse direction.
#[derive(Debug, Clone)]
pub struct DualWriteTrigger {
    pool: PgPool,
}

impl DualWriteTrigger {
    /// Creates a trigger manager over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The deterministic trigger (and trigger function) name for a binding.
    pub fn name(table: &str, old_column: &str, new_column: &str) -> String {
        rename_trigger_name(table, old_column, new_column)
    }

    /// Installs the dual-write trigger for a binding.
    ///
    /// Idempotent at the SQL level: the function is `CREATE OR REPLACE`d
    /// and the trigger is dropped-if-exists before recreation, so re-running
    /// an interrupted installation is safe.
    pub async fn install(
        &self,
        table: &str,
        old_column: &str,
        new_column: &str,
    ) -> Result<(), TriggerError> {
        let name = Self::name(table, old_column, new_column);

        sqlx::query(&function_sql(&name, old_column, new_column)?)
            .execute(&self.pool)
            .await?;
        sqlx::query(&drop_trigger_sql(&name, table)?)
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_trigger_sql(&name, table)?)
            .execute(&self.pool)
            .await?;

        info!(
            "installed dual-write trigger {} on {} ({} -> {})",
            name, table, old_column, new_column
        );
        Ok(())
    }

    /// Recreates the trigger function body, discarding its cached plan.
    ///
    /// After a swap promotes the shadow column, a plan cached against the
    /// old column type (e.g. a 32-bit integer that is now a bigint) can
    /// produce type-mismatch failures or truncation. Replacing the function
    /// forces recompilation on next fire.
    pub async fn reset(
        &self,
        table: &str,
        old_column: &str,
        new_column: &str,
    ) -> Result<(), TriggerError> {
        let name = Self::name(table, old_column, new_column);
        sqlx::query(&function_sql(&name, old_column, new_column)?)
            .execute(&self.pool)
            .await?;

        info!("reset dual-write trigger function {} on {}", name, table);
        Ok(())
    }

    /// Removes the trigger and its function.
    ///
    /// Only valid once dual-write is no longer needed, i.e. after the swap
    /// finished and the obsolete shadow column was retired.
    pub async fn uninstall(
        &self,
        table: &str,
        old_column: &str,
        new_column: &str,
    ) -> Result<(), TriggerError> {
        let name = Self::name(table, old_column, new_column);

        sqlx::query(&drop_trigger_sql(&name, table)?)
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "DROP FUNCTION IF EXISTS {}()",
            quote_ident(&name)?
        ))
        .execute(&self.pool)
        .await?;

        info!("removed dual-write trigger {} from {}", name, table);
        Ok(())
    }
}

pub(crate) fn function_sql(
    name: &str,
    old_column: &str,
    new_column: &str,
) -> Result<String, IdentError> {
    Ok(format!(
        r#"
        CREATE OR REPLACE FUNCTION {name}()
        RETURNS trigger AS
        $BODY$
        BEGIN
          NEW.{new} := NEW.{old};
          RETURN NEW;
        END;
        $BODY$
        LANGUAGE 'plpgsql'
        VOLATILE
        "#,
        name = quote_ident(name)?,
        new = quote_ident(new_column)?,
        old = quote_ident(old_column)?,
    ))
}

fn drop_trigger_sql(name: &str, table: &str) -> Result<String, IdentError> {
    Ok(format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_ident(name)?,
        quote_ident(table)?
    ))
}

fn create_trigger_sql(name: &str, table: &str) -> Result<String, IdentError> {
    Ok(format!(
        r#"
        CREATE TRIGGER {name}
        BEFORE INSERT OR UPDATE
        ON {table}
        FOR EACH ROW
        EXECUTE FUNCTION {name}()
        "#,
        name = quote_ident(name)?,
        table = quote_ident(table)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_sql_copies_old_into_new() {
        let sql = function_sql("trigger_abc", "id", "id_shadow").unwrap();

        assert!(sql.contains("CREATE OR REPLACE FUNCTION \"trigger_abc\"()"));
        assert!(sql.contains("NEW.\"id_shadow\" := NEW.\"id\";"));
        assert!(sql.contains("RETURNS trigger"));
    }

    #[test]
    fn trigger_fires_before_insert_and_update() {
        let sql = create_trigger_sql("trigger_abc", "events").unwrap();

        assert!(sql.contains("BEFORE INSERT OR UPDATE"));
        assert!(sql.contains("ON \"events\""));
        assert!(sql.contains("FOR EACH ROW"));
    }

    #[test]
    fn drop_is_idempotent() {
        let sql = drop_trigger_sql("trigger_abc", "events").unwrap();
        assert!(sql.contains("DROP TRIGGER IF EXISTS"));
    }

    #[test]
    fn unsafe_names_are_rejected_before_reaching_sql() {
        assert!(function_sql("trigger_abc", "id; --", "id_shadow").is_err());
        assert!(create_trigger_sql("trigger_abc", "events\"").is_err());
    }

    #[test]
    fn binding_name_is_stable() {
        let a = DualWriteTrigger::name("events", "id", "id_convert");
        let b = DualWriteTrigger::name("events", "id", "id_convert");
        assert_eq!(a, b);
        assert!(a.starts_with("trigger_"));
    }
}
