//! Identifier validation, quoting, and deterministic derived names.
//!
//! Online evolution DDL interpolates table and column names into statements
//! that cannot be parameterized. Every identifier entering the engine is
//! validated against a conservative allowlist here, and every derived
//! object name (triggers, foreign keys, check constraints) is produced by
//! hashing so it stays inside PostgreSQL's 63-byte identifier limit no
//! matter how long the source names are.

use sha2::{Digest, Sha256};

/// PostgreSQL truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Errors raised when an identifier fails validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentError {
    /// The identifier contains characters outside the allowlist, starts
    /// with a digit, or is empty.
    #[error("unsafe SQL identifier: {0:?}")]
    Unsafe(String),

    /// The identifier exceeds PostgreSQL's 63-byte limit.
    #[error("identifier exceeds {MAX_IDENTIFIER_LENGTH} bytes: {0:?}")]
    TooLong(String),
}

/// Whether `name` is a plain lower-risk SQL identifier: ASCII letters,
/// digits, and underscores, not starting with a digit, within the length
/// limit.
pub fn is_safe_identifier(name: &str) -> bool {
    validate_identifier(name).is_ok()
}

/// Validates `name`, returning it unchanged on success.
pub fn validate_identifier(name: &str) -> Result<&str, IdentError> {
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IdentError::TooLong(name.to_string()));
    }

    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_head && valid_tail {
        Ok(name)
    } else {
        Err(IdentError::Unsafe(name.to_string()))
    }
}

/// Validates and double-quotes an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> Result<String, IdentError> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

fn hashed_name(prefix: &str, identifier: &str, hash_len: usize) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}{}", prefix, &hex[..hash_len])
}

/// The deterministic name of the dual-write trigger (and its function) for
/// a `(table, old_column, new_column)` binding.
///
/// `"trigger_"` plus the first 12 hex characters of
/// `sha256("{table}_{old}_{new}")`.
pub fn rename_trigger_name(table: &str, old_column: &str, new_column: &str) -> String {
    hashed_name(
        "trigger_",
        &format!("{}_{}_{}", table, old_column, new_column),
        12,
    )
}

/// The deterministic name of a concurrently-added foreign key.
///
/// `"fk_"` plus the first 10 hex characters of
/// `sha256("{table}_{column}_fk")`.
pub fn concurrent_foreign_key_name(table: &str, column: &str) -> String {
    hashed_name("fk_", &format!("{}_{}_fk", table, column), 10)
}

/// The deterministic name of a check constraint.
///
/// Constraint names are unique per table, and a column can carry several
/// checks, so the `(table, column, kind)` triplet is hashed; `kind` is a
/// short tag such as `"not_null"` or `"max_length"`.
pub fn check_constraint_name(table: &str, column: &str, kind: &str) -> String {
    hashed_name("check_", &format!("{}_{}_check_{}", table, column, kind), 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_are_safe() {
        assert!(is_safe_identifier("events"));
        assert!(is_safe_identifier("merge_requests"));
        assert!(is_safe_identifier("_private"));
        assert!(is_safe_identifier("col2"));
    }

    #[test]
    fn injection_shaped_identifiers_are_rejected() {
        assert!(!is_safe_identifier("events; DROP TABLE users"));
        assert!(!is_safe_identifier("events\""));
        assert!(!is_safe_identifier("ev ents"));
        assert!(!is_safe_identifier("2fast"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("naïve"));
    }

    #[test]
    fn over_long_identifiers_are_rejected() {
        let long = "a".repeat(64);
        assert_eq!(
            validate_identifier(&long),
            Err(IdentError::TooLong(long.clone()))
        );
        assert!(is_safe_identifier(&"a".repeat(63)));
    }

    #[test]
    fn quote_ident_wraps_in_double_quotes() {
        assert_eq!(quote_ident("events").unwrap(), "\"events\"");
        assert!(quote_ident("ev\"ents").is_err());
    }

    #[test]
    fn trigger_name_is_deterministic_and_bounded() {
        let a = rename_trigger_name("merge_requests", "source_project_id", "source_project_id_new");
        let b = rename_trigger_name("merge_requests", "source_project_id", "source_project_id_new");

        assert_eq!(a, b);
        assert!(a.starts_with("trigger_"));
        assert_eq!(a.len(), "trigger_".len() + 12);
        assert!(a.len() <= MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn trigger_name_varies_with_inputs() {
        let a = rename_trigger_name("events", "id", "id_new");
        let b = rename_trigger_name("events", "id", "id_shadow");
        assert_ne!(a, b);
    }

    #[test]
    fn foreign_key_name_shape() {
        let name = concurrent_foreign_key_name("ci_builds", "project_id");
        assert!(name.starts_with("fk_"));
        assert_eq!(name.len(), "fk_".len() + 10);
    }

    #[test]
    fn check_constraint_name_varies_with_kind() {
        let not_null = check_constraint_name("users", "name", "not_null");
        let max_length = check_constraint_name("users", "name", "max_length");

        assert!(not_null.starts_with("check_"));
        assert_ne!(not_null, max_length);
    }

    #[test]
    fn derived_names_are_themselves_safe_identifiers() {
        assert!(is_safe_identifier(&rename_trigger_name("t", "a", "b")));
        assert!(is_safe_identifier(&concurrent_foreign_key_name("t", "a")));
        assert!(is_safe_identifier(&check_constraint_name("t", "a", "k")));
    }
}
