//! Backend capability flags.
//!
//! Different relational backends support different online-evolution
//! tactics. A backend advertises its capabilities once at startup and the
//! engine picks strategies accordingly (e.g. fall back to a lock-retried
//! plain index build where concurrent builds are unavailable).

/// The set of online-DDL features a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// `CREATE INDEX CONCURRENTLY` or an equivalent non-blocking build.
    pub concurrent_index_build: bool,
    /// Constraints can be attached unvalidated (`NOT VALID`) and validated
    /// later without an exclusive lock.
    pub deferred_constraint_validation: bool,
    /// Partial (predicated) indexes.
    pub partial_indexes: bool,
}

impl BackendCapabilities {
    /// The capability set of a modern PostgreSQL server.
    pub fn postgres() -> Self {
        Self {
            concurrent_index_build: true,
            deferred_constraint_validation: true,
            partial_indexes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_supports_the_full_set() {
        let caps = BackendCapabilities::postgres();
        assert!(caps.concurrent_index_build);
        assert!(caps.deferred_constraint_validation);
        assert!(caps.partial_indexes);
    }

    #[test]
    fn default_advertises_nothing() {
        assert_eq!(
            BackendCapabilities::default(),
            BackendCapabilities {
                concurrent_index_build: false,
                deferred_constraint_validation: false,
                partial_indexes: false,
            }
        );
    }
}
