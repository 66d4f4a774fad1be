//! Non-blocking index and constraint construction.
//!
//! Indexes are built with `CREATE INDEX CONCURRENTLY` so writers are never
//! blocked; foreign keys and check constraints are attached `NOT VALID`
//! (a short exclusive lock, metadata only) and validated later by a
//! separate, independently retryable step that takes no exclusive lock.
//! Every operation is skip-safe: if a prior partially-completed run already
//! created the object, construction logs and moves on instead of erroring.

use crate::lock_retry::{LockRetryError, LockRetryExecutor};
use evolve_core::ident::{
    check_constraint_name, concurrent_foreign_key_name, quote_ident, IdentError,
};
use log::{info, warn};
use sqlx::{PgPool, Row};

/// Errors from index or constraint construction.
#[derive(Debug, thiserror::Error)]
pub enum IndexBuildError {
    /// A table, column, or object name failed validation.
    #[error(transparent)]
    Ident(#[from] IdentError),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The exclusive lock for attaching a constraint was never acquired.
    #[error(transparent)]
    LockRetry(#[from] LockRetryError),

    /// Validation referenced an object that does not exist.
    #[error("{kind} {name:?} not found on table {table:?}")]
    MissingObject {
        /// `"index"`, `"foreign key"`, or `"check constraint"`.
        kind: &'static str,
        /// The missing object's name.
        name: String,
        /// The table it was expected on.
        table: String,
    },
}

/// Declarative description of an index to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// The index name.
    pub name: String,
    /// The table to index.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
    /// Optional partial-index predicate (validated as a plain column
    /// comparison is the caller's responsibility; interpolated verbatim).
    pub where_clause: Option<String>,
}

/// Declarative description of a foreign key to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeySpec {
    /// The constraint name; [`ForeignKeySpec::named_after`] derives the
    /// conventional hashed name.
    pub name: String,
    /// The referencing table.
    pub source_table: String,
    /// The referencing column.
    pub column: String,
    /// The referenced table.
    pub target_table: String,
    /// The referenced column.
    pub target_column: String,
    /// Referential action on delete.
    pub on_delete: OnDelete,
}

impl ForeignKeySpec {
    /// Derives the conventional constraint name for `(table, column)`.
    pub fn named_after(
        source_table: impl Into<String>,
        column: impl Into<String>,
        target_table: impl Into<String>,
        target_column: impl Into<String>,
        on_delete: OnDelete,
    ) -> Self {
        let source_table = source_table.into();
        let column = column.into();
        Self {
            name: concurrent_foreign_key_name(&source_table, &column),
            source_table,
            column,
            target_table: target_table.into(),
            target_column: target_column.into(),
            on_delete,
        }
    }
}

/// Referential action for a foreign key's `ON DELETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    /// `ON DELETE CASCADE`.
    #[default]
    Cascade,
    /// `ON DELETE SET NULL`.
    SetNull,
    /// `ON DELETE RESTRICT`.
    Restrict,
    /// No action clause.
    NoAction,
}

impl OnDelete {
    fn clause(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "ON DELETE CASCADE",
            OnDelete::SetNull => "ON DELETE SET NULL",
            OnDelete::Restrict => "ON DELETE RESTRICT",
            OnDelete::NoAction => "",
        }
    }
}

/// Builds indexes and constraints without blocking writers.
#[derive(Debug, Clone)]
pub struct ConcurrentIndexBuilder {
    pool: PgPool,
    lock_retry: LockRetryExecutor,
}

impl ConcurrentIndexBuilder {
    /// Creates a builder; constraint attachment uses the given lock-retry
    /// executor.
    pub fn new(pool: PgPool, lock_retry: LockRetryExecutor) -> Self {
        Self { pool, lock_retry }
    }

    /// Builds an index concurrently under its declared name.
    ///
    /// Must not run inside a transaction (`CREATE INDEX CONCURRENTLY`
    /// forbids it); the statement timeout is disabled for the build since
    /// concurrent builds on huge tables routinely exceed it.
    pub async fn add_index(&self, spec: &IndexSpec) -> Result<(), IndexBuildError> {
        if self.index_exists(&spec.table, &spec.name).await? {
            warn!(
                "index {} on {} already exists (possibly from an aborted run); skipping",
                spec.name, spec.table
            );
            return Ok(());
        }

        let sql = create_index_sql(spec)?;
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SET statement_timeout TO 0")
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query(&sql).execute(&mut *conn).await;
        sqlx::query("RESET statement_timeout")
            .execute(&mut *conn)
            .await?;
        result?;

        info!("built index {} on {} concurrently", spec.name, spec.table);
        Ok(())
    }

    /// Attaches a foreign key `NOT VALID` under a short retried lock, then
    /// optionally validates it.
    ///
    /// `NOT VALID` keeps the `ALTER TABLE` lock brief: the key is enforced
    /// for new writes immediately while existing rows are checked later.
    pub async fn add_foreign_key(
        &self,
        spec: &ForeignKeySpec,
        validate: bool,
    ) -> Result<(), IndexBuildError> {
        if self
            .foreign_key_exists(&spec.source_table, &spec.name)
            .await?
        {
            warn!(
                "foreign key {} on {} already exists (possibly from an aborted run); skipping",
                spec.name, spec.source_table
            );
        } else {
            let sql = add_foreign_key_sql(spec)?;
            self.lock_retry
                .run(move |tx| {
                    let sql = sql.clone();
                    Box::pin(async move {
                        sqlx::query(&sql).execute(&mut **tx).await?;
                        Ok(())
                    })
                })
                .await?;
            info!(
                "attached foreign key {} on {} (NOT VALID)",
                spec.name, spec.source_table
            );
        }

        if validate {
            self.validate_foreign_key(&spec.source_table, &spec.name)
                .await?;
        }
        Ok(())
    }

    /// Validates a previously attached foreign key.
    ///
    /// Holds no exclusive lock and can run long after the attaching
    /// migration, out of band. A no-op if the constraint is already valid.
    pub async fn validate_foreign_key(
        &self,
        table: &str,
        name: &str,
    ) -> Result<(), IndexBuildError> {
        if !self.foreign_key_exists(table, name).await? {
            return Err(IndexBuildError::MissingObject {
                kind: "foreign key",
                name: name.to_string(),
                table: table.to_string(),
            });
        }

        self.validate_constraint(table, name).await?;
        info!("validated foreign key {} on {}", name, table);
        Ok(())
    }

    /// Attaches a check constraint `NOT VALID` under a short retried lock,
    /// then optionally validates it.
    pub async fn add_check_constraint(
        &self,
        table: &str,
        check: &str,
        name: &str,
        validate: bool,
    ) -> Result<(), IndexBuildError> {
        if self.check_constraint_exists(table, name).await? {
            warn!(
                "check constraint {} on {} already exists (possibly from an aborted run); skipping",
                name, table
            );
        } else {
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ( {} ) NOT VALID",
                quote_ident(table)?,
                quote_ident(name)?,
                check
            );
            self.lock_retry
                .run(move |tx| {
                    let sql = sql.clone();
                    Box::pin(async move {
                        sqlx::query(&sql).execute(&mut **tx).await?;
                        Ok(())
                    })
                })
                .await?;
            info!("attached check constraint {} on {} (NOT VALID)", name, table);
        }

        if validate {
            self.validate_check_constraint(table, name).await?;
        }
        Ok(())
    }

    /// Attaches a `NOT NULL` check constraint under its conventional hashed
    /// name, optionally validating it.
    ///
    /// The check-constraint form (rather than `SET NOT NULL`) is what allows
    /// the attachment to be `NOT VALID` and the full-table scan deferred.
    pub async fn add_not_null_constraint(
        &self,
        table: &str,
        column: &str,
        validate: bool,
    ) -> Result<(), IndexBuildError> {
        let name = check_constraint_name(table, column, "not_null");
        let check = format!("{} IS NOT NULL", quote_ident(column)?);
        self.add_check_constraint(table, &check, &name, validate)
            .await
    }

    /// Validates a previously attached check constraint.
    pub async fn validate_check_constraint(
        &self,
        table: &str,
        name: &str,
    ) -> Result<(), IndexBuildError> {
        if !self.check_constraint_exists(table, name).await? {
            return Err(IndexBuildError::MissingObject {
                kind: "check constraint",
                name: name.to_string(),
                table: table.to_string(),
            });
        }

        self.validate_constraint(table, name).await?;
        info!("validated check constraint {} on {}", name, table);
        Ok(())
    }

    /// Drops a constraint under a short retried lock.
    pub async fn remove_constraint(&self, table: &str, name: &str) -> Result<(), IndexBuildError> {
        let sql = format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            quote_ident(table)?,
            quote_ident(name)?
        );
        self.lock_retry
            .run(move |tx| {
                let sql = sql.clone();
                Box::pin(async move {
                    sqlx::query(&sql).execute(&mut **tx).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    /// Whether an index with this name exists on the table.
    pub async fn index_exists(&self, table: &str, name: &str) -> Result<bool, IndexBuildError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_indexes
                WHERE schemaname = current_schema()
                  AND tablename = $1
                  AND indexname = $2
            )
            "#,
        )
        .bind(table)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    /// Whether a foreign key with this name exists on the table.
    pub async fn foreign_key_exists(
        &self,
        table: &str,
        name: &str,
    ) -> Result<bool, IndexBuildError> {
        self.constraint_exists(table, name, "f").await
    }

    /// Whether a check constraint with this name exists on the table.
    pub async fn check_constraint_exists(
        &self,
        table: &str,
        name: &str,
    ) -> Result<bool, IndexBuildError> {
        self.constraint_exists(table, name, "c").await
    }

    async fn constraint_exists(
        &self,
        table: &str,
        name: &str,
        contype: &str,
    ) -> Result<bool, IndexBuildError> {
        // Constraint names are unique per table, not per schema, so the
        // lookup filters on table, name, and the current schema.
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_constraint
                JOIN pg_class ON pg_constraint.conrelid = pg_class.oid
                JOIN pg_namespace ON pg_class.relnamespace = pg_namespace.oid
                WHERE pg_constraint.contype = $3
                  AND pg_constraint.conname = $2
                  AND pg_class.relname = $1
                  AND pg_namespace.nspname = current_schema()
            )
            "#,
        )
        .bind(table)
        .bind(name)
        .bind(contype)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn validate_constraint(&self, table: &str, name: &str) -> Result<(), IndexBuildError> {
        let sql = format!(
            "ALTER TABLE {} VALIDATE CONSTRAINT {}",
            quote_ident(table)?,
            quote_ident(name)?
        );

        // Validation scans the whole table; disable the statement timeout
        // on a dedicated connection for its duration.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SET statement_timeout TO 0")
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query(&sql).execute(&mut *conn).await;
        sqlx::query("RESET statement_timeout")
            .execute(&mut *conn)
            .await?;
        result?;
        Ok(())
    }
}

fn create_index_sql(spec: &IndexSpec) -> Result<String, IdentError> {
    let columns = spec
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    let mut sql = format!(
        "CREATE {unique}INDEX CONCURRENTLY IF NOT EXISTS {name} ON {table} ({columns})",
        unique = if spec.unique { "UNIQUE " } else { "" },
        name = quote_ident(&spec.name)?,
        table = quote_ident(&spec.table)?,
        columns = columns,
    );
    if let Some(where_clause) = &spec.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(where_clause);
    }
    Ok(sql)
}

fn add_foreign_key_sql(spec: &ForeignKeySpec) -> Result<String, IdentError> {
    let clause = spec.on_delete.clause();
    Ok(format!(
        "ALTER TABLE {source} ADD CONSTRAINT {name} FOREIGN KEY ({column}) REFERENCES {target} ({target_column}) {on_delete} NOT VALID",
        source = quote_ident(&spec.source_table)?,
        name = quote_ident(&spec.name)?,
        column = quote_ident(&spec.column)?,
        target = quote_ident(&spec.target_table)?,
        target_column = quote_ident(&spec.target_column)?,
        on_delete = clause,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_sql_is_concurrent_and_skip_safe() {
        let spec = IndexSpec {
            name: "idx_events_actor_id".to_string(),
            table: "events".to_string(),
            columns: vec!["actor_id".to_string()],
            unique: false,
            where_clause: None,
        };

        let sql = create_index_sql(&spec).unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"idx_events_actor_id\" ON \"events\" (\"actor_id\")"
        );
    }

    #[test]
    fn unique_partial_index_sql() {
        let spec = IndexSpec {
            name: "idx_events_id_convert".to_string(),
            table: "events".to_string(),
            columns: vec!["id_convert".to_string()],
            unique: true,
            where_clause: Some("id_convert IS NOT NULL".to_string()),
        };

        let sql = create_index_sql(&spec).unwrap();
        assert!(sql.starts_with("CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS"));
        assert!(sql.ends_with("WHERE id_convert IS NOT NULL"));
    }

    #[test]
    fn foreign_key_sql_is_not_valid() {
        let spec = ForeignKeySpec::named_after("ci_builds", "project_id", "projects", "id", OnDelete::Cascade);

        let sql = add_foreign_key_sql(&spec).unwrap();
        assert!(sql.contains("ADD CONSTRAINT"));
        assert!(sql.contains("ON DELETE CASCADE"));
        assert!(sql.ends_with("NOT VALID"));
        assert!(spec.name.starts_with("fk_"));
    }

    #[test]
    fn on_delete_clauses() {
        assert_eq!(OnDelete::Cascade.clause(), "ON DELETE CASCADE");
        assert_eq!(OnDelete::SetNull.clause(), "ON DELETE SET NULL");
        assert_eq!(OnDelete::Restrict.clause(), "ON DELETE RESTRICT");
        assert_eq!(OnDelete::NoAction.clause(), "");
    }

    #[test]
    fn unsafe_spec_names_are_rejected() {
        let spec = IndexSpec {
            name: "idx; DROP TABLE events".to_string(),
            table: "events".to_string(),
            columns: vec!["id".to_string()],
            unique: false,
            where_clause: None,
        };
        assert!(create_index_sql(&spec).is_err());
    }
}
