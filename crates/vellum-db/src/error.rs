//! Error types for the `vellum` database facade.

use vellum_core::engine::EngineError;
use vellum_core::scheduler::SchedulerError;

/// Errors from database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Coordination core error
    #[error("Core error: {0}")]
    Core(#[from] vellum_core::Error),

    /// Database is shut down
    #[error("Database is shut down")]
    Shutdown,

    /// A write block gave up; its transaction was rolled back
    #[error("Write error: {0}")]
    Write(String),
}

impl From<EngineError> for DbError {
    fn from(e: EngineError) -> Self {
        Self::Core(e.into())
    }
}

impl From<SchedulerError> for DbError {
    fn from(e: SchedulerError) -> Self {
        Self::Core(e.into())
    }
}

impl DbError {
    /// Returns `true` for invalid begin/commit/rollback sequences, such as a
    /// nested write.
    #[must_use]
    pub fn is_invalid_transaction_state(&self) -> bool {
        matches!(self, Self::Core(vellum_core::Error::InvalidTransactionState(_)))
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::engine::RealmPtr;

    #[test]
    fn test_engine_errors_keep_core_taxonomy() {
        let realm = RealmPtr::from_raw(7);
        let err = DbError::from(EngineError::AlreadyInTransaction(realm));
        assert!(err.is_invalid_transaction_state());
        assert!(matches!(
            DbError::from(EngineError::Closed(realm)),
            DbError::Core(vellum_core::Error::ClosedHandle(_))
        ));
    }

    #[test]
    fn test_scheduler_error_display() {
        let err = DbError::from(SchedulerError::Closed("vellum-writer".into()));
        assert_eq!(
            err.to_string(),
            "Core error: Scheduler error: scheduler context 'vellum-writer' is closed"
        );
    }
}
