//! Configuration for a `vellum` [`Database`](crate::Database).

use vellum_core::tracker::DEFAULT_WARNING_THRESHOLD;
use vellum_core::NotifierConfig;

/// Configuration for a [`Database`](crate::Database) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Path of the database file, as understood by the engine.
    pub path: String,
    /// Change-notifier settings.
    pub notifier: NotifierConfig,
    /// Thread name of the writer's scheduler context.
    pub writer_thread_name: String,
    /// Thread name of the notifier's scheduler context.
    pub notifier_thread_name: String,
    /// Tracked-version count above which the writer's tracker warns.
    pub tracked_version_warning_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "default.vellum".to_string(),
            notifier: NotifierConfig::default(),
            writer_thread_name: "vellum-writer".to_string(),
            notifier_thread_name: "vellum-notifier".to_string(),
            tracked_version_warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}
