//! Fluent builder for [`Database`] construction.

use std::sync::Arc;

use vellum_core::engine::NativeEngine;

use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::error::DbError;

/// Fluent builder for constructing a [`Database`] instance.
///
/// # Example
///
/// ```rust,ignore
/// let db = DatabaseBuilder::new()
///     .path("inventory.vellum")
///     .event_buffer_size(256)
///     .build(Arc::new(MemoryEngine::new()))
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DatabaseBuilder {
    config: DatabaseConfig,
}

impl DatabaseBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set how many events an observer stream buffers before failing.
    #[must_use]
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.notifier.event_buffer_size = size;
        self
    }

    /// Set the tracked-version warning threshold of both the writer and the
    /// notifier.
    #[must_use]
    pub fn tracked_version_warning_threshold(mut self, threshold: usize) -> Self {
        self.config.tracked_version_warning_threshold = threshold;
        self.config.notifier.tracked_version_warning_threshold = threshold;
        self
    }

    /// Set the writer context's thread name.
    #[must_use]
    pub fn writer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.writer_thread_name = name.into();
        self
    }

    /// Set the notifier context's thread name.
    #[must_use]
    pub fn notifier_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.notifier_thread_name = name.into();
        self
    }

    /// The configuration built so far.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Build the `Database` instance on `engine`.
    ///
    /// # Errors
    ///
    /// Returns `DbError` if either context or the writer handle cannot be
    /// created.
    pub async fn build<E: NativeEngine>(self, engine: Arc<E>) -> Result<Database<E>, DbError> {
        Database::open_with_config(engine, self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_both_thresholds() {
        let builder = DatabaseBuilder::new()
            .path("builder.vellum")
            .event_buffer_size(8)
            .tracked_version_warning_threshold(4)
            .writer_thread_name("w")
            .notifier_thread_name("n");
        let config = builder.config();
        assert_eq!(config.path, "builder.vellum");
        assert_eq!(config.notifier.event_buffer_size, 8);
        assert_eq!(config.tracked_version_warning_threshold, 4);
        assert_eq!(config.notifier.tracked_version_warning_threshold, 4);
        assert_eq!(config.writer_thread_name, "w");
        assert_eq!(config.notifier_thread_name, "n");
    }
}
