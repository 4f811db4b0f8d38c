//! # vellum core
//!
//! Version and change-notification coordination for an embedded object
//! database whose storage engine is single-threaded per handle.
//!
//! This crate provides:
//! - **Scheduler Context**: one thread per live handle, bound to a native scheduler
//! - **Version References**: live and frozen handles with cached schema metadata
//! - **Version Tracker**: deterministic release of intermediate frozen snapshots
//! - **Write Transactions**: begin/commit/rollback with nesting rejected
//! - **Change Notifier**: native callbacks bridged into async streams
//! - **Changeset Builders**: structured list/set/map/object change descriptions
//!
//! ## Design Principles
//!
//! 1. **Affinity by construction** - native calls only ever run on the owning context
//! 2. **Explicit lifecycles** - every native handle is closed exactly once
//! 3. **Ordered delivery** - realm-level events precede entity-level events
//! 4. **No silent loss** - slow entity observers fail loudly
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vellum_core::engine::{memory::MemoryEngine, OpenConfig};
//! use vellum_core::notifier::{ChangeNotifier, NotifierConfig};
//! use vellum_core::scheduler::{SchedulerConfig, SchedulerContext};
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let context = Arc::new(SchedulerContext::create(engine.clone(), &SchedulerConfig::default())?);
//! let notifier = ChangeNotifier::new(OpenConfig::new("app.vellum"), context, NotifierConfig::default());
//!
//! let mut versions = notifier.realm_changed().await?;
//! while let Some(version) = versions.next().await {
//!     println!("advanced to {version}");
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod changeset;
pub mod engine;
pub mod notifier;
pub mod realm;
pub mod scheduler;
pub mod tracker;
pub mod transaction;

// Re-export key types
pub use changeset::{ListChangeSet, MapChangeSet, ObjectChangeSet, Range, SetChangeSet};
pub use notifier::{ChangeEvent, ChangeNotifier, NotifierConfig};
pub use realm::{FrozenRealmReference, LiveRealmReference, RealmReference, VersionId};
pub use scheduler::{SchedulerConfig, SchedulerContext};
pub use tracker::VersionTracker;
pub use transaction::WriteTransactionManager;

use engine::EngineError;

/// Result type for vellum-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for vellum-core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation on a released native handle
    #[error("Closed handle: {0}")]
    ClosedHandle(String),

    /// Begin while in a transaction, or commit/rollback while idle
    #[error("Invalid transaction state: {0}")]
    InvalidTransactionState(String),

    /// An entity-level stream could not keep up with its producer
    #[error("Backpressure exceeded: {0}")]
    BackpressureExceeded(String),

    /// A broken invariant between this layer and the engine
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    /// Negative version identifier
    #[error("Invalid version id: {0}")]
    InvalidVersion(i64),

    /// Engine failure without a more specific category
    #[error("Engine error: {0}")]
    Engine(EngineError),

    /// Scheduler context failure
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] scheduler::SchedulerError),
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Closed(_) => Self::ClosedHandle(e.to_string()),
            EngineError::AlreadyInTransaction(_) | EngineError::NotInTransaction(_) => {
                Self::InvalidTransactionState(e.to_string())
            }
            other => Self::Engine(other),
        }
    }
}
