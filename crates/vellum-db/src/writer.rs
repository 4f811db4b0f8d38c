//! The database's writer handle.
//!
//! ```text
//!   write(f) on the writer context
//!     begin ──► f(&MutableRealm) ──► commit ──► refresh schema ──► snapshot + track
//!       │             │ Err / panic
//!       │             ▼
//!       │          rollback (guard drop)
//!       ▼
//!   InvalidTransactionState if a write is already open
//! ```
//!
//! Closing the writer or registering an observer from inside a write block
//! fails with `InvalidTransactionState` and leaves the write untouched.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vellum_core::engine::{NativeEngine, OpenConfig, RealmPtr, SchedulerPtr};
use vellum_core::realm::{
    FrozenRealmReference, LiveRealmReference, RealmReference, SchemaMetadata, VersionId,
};
use vellum_core::scheduler::SchedulerContext;
use vellum_core::transaction::TransactionGuard;
use vellum_core::{VersionTracker, WriteTransactionManager};

use crate::config::DatabaseConfig;
use crate::error::{DbError, Result};

/// The writer's view of its handle inside a write block.
///
/// Mutations go through [`engine`](Self::engine) against
/// [`realm_ptr`](Self::realm_ptr).
pub struct MutableRealm<'a, E> {
    engine: &'a E,
    reference: &'a LiveRealmReference,
}

impl<'a, E: NativeEngine> MutableRealm<'a, E> {
    /// The engine.
    #[must_use]
    pub fn engine(&self) -> &'a E {
        self.engine
    }

    /// The writer's native handle.
    #[must_use]
    pub fn realm_ptr(&self) -> RealmPtr {
        self.reference.realm_ptr()
    }

    /// Version the transaction started from.
    ///
    /// # Errors
    ///
    /// Closed handle.
    pub fn version(&self) -> Result<VersionId> {
        Ok(self.reference.version()?)
    }

    /// Schema metadata cached before the transaction began.
    #[must_use]
    pub fn schema(&self) -> Arc<SchemaMetadata> {
        self.reference.schema_metadata()
    }

    /// Returns `true` while the write transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.reference.is_in_transaction()
    }
}

impl<E> std::fmt::Debug for MutableRealm<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableRealm")
            .field("owner", &self.reference.owner())
            .field("realm", &self.reference.realm_ptr())
            .finish_non_exhaustive()
    }
}

/// Live writer handle with its tracked snapshots.
pub(crate) struct Writer<E> {
    engine: Arc<E>,
    reference: LiveRealmReference,
    tracker: Mutex<VersionTracker>,
    current: Mutex<Option<Arc<FrozenRealmReference>>>,
    closed: AtomicBool,
}

impl<E: NativeEngine> Writer<E> {
    /// Opens the writer handle and tracks a snapshot of its first version.
    /// Must run on the writer context.
    pub(crate) fn open(
        engine: Arc<E>,
        config: &DatabaseConfig,
        scheduler: Option<SchedulerPtr>,
    ) -> Result<Self> {
        let shared: Arc<dyn NativeEngine> = engine.clone();
        let owner = format!("{}#writer", config.path);
        let reference = LiveRealmReference::open(
            owner.clone(),
            Arc::clone(&shared),
            &OpenConfig::new(config.path.clone()),
            scheduler,
        )?;
        let tracker = VersionTracker::new(owner, shared)
            .with_warning_threshold(config.tracked_version_warning_threshold);
        let writer = Self {
            engine,
            reference,
            tracker: Mutex::new(tracker),
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if let Err(e) = writer.track_snapshot() {
            let _ = writer.close();
            return Err(e);
        }
        Ok(writer)
    }

    /// Runs `f` in a write transaction. Must run on the writer context.
    pub(crate) fn write<T, F>(&self, f: F) -> Result<(T, VersionId)>
    where
        F: FnOnce(&MutableRealm<'_, E>) -> Result<T>,
    {
        self.check_open()?;
        let guard = TransactionGuard::begin(self)?;
        let realm = MutableRealm {
            engine: self.engine.as_ref(),
            reference: &self.reference,
        };
        let value = f(&realm)?;
        let version = guard.commit()?;
        self.reference.refresh_schema_metadata()?;
        self.track_snapshot()?;
        tracing::debug!(owner = %self.reference.owner(), %version, "committed write");
        Ok((value, version))
    }

    /// Advances to the latest version. Must run on the writer context.
    pub(crate) fn refresh(&self) -> Result<VersionId> {
        self.check_open()?;
        if self.reference.refresh()? {
            self.reference.refresh_schema_metadata()?;
            self.track_snapshot()?;
        }
        Ok(self.reference.version()?)
    }

    fn track_snapshot(&self) -> Result<Arc<FrozenRealmReference>> {
        let snapshot = Arc::new(self.reference.snapshot()?);
        let mut tracker = self.tracker.lock();
        tracker.track_reference(&snapshot);
        let previous = self.current.lock().replace(Arc::clone(&snapshot));
        drop(previous);
        tracker.close_expired_references();
        Ok(snapshot)
    }

    pub(crate) fn version(&self) -> Result<VersionId> {
        Ok(self.reference.version()?)
    }

    pub(crate) fn schema(&self) -> Arc<SchemaMetadata> {
        self.reference.schema_metadata()
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<FrozenRealmReference>> {
        self.current.lock().clone().ok_or(DbError::Shutdown)
    }

    pub(crate) fn tracked_versions(&self) -> BTreeSet<VersionId> {
        self.tracker.lock().versions()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Shutdown);
        }
        Ok(())
    }

    /// Fails on the writer context while a write block is running. Off the
    /// context, anything queued behind the running write sees it finished.
    pub(crate) fn ensure_no_write_open(
        &self,
        context: &SchedulerContext,
        operation: &str,
    ) -> Result<()> {
        if context.is_on_context() {
            self.ensure_not_in_transaction(operation)?;
        }
        Ok(())
    }

    /// Drops the current snapshot, closes every tracked version, then the
    /// live handle. Idempotent.
    ///
    /// Fails with `InvalidTransactionState`, leaving the writer open, while a
    /// write transaction is open.
    pub(crate) fn close(&self) -> Result<()> {
        self.ensure_not_in_transaction("close")?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.current.lock().take();
        self.tracker.lock().close();
        self.reference.close()?;
        tracing::debug!(owner = %self.reference.owner(), "closed writer");
        Ok(())
    }
}

impl<E: NativeEngine> WriteTransactionManager for Writer<E> {
    fn live_reference(&self) -> &LiveRealmReference {
        &self.reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::engine::memory::MemoryEngine;

    fn open(engine: &Arc<MemoryEngine>) -> Writer<MemoryEngine> {
        let config = DatabaseConfig {
            path: "writer.vellum".to_string(),
            ..DatabaseConfig::default()
        };
        Writer::open(Arc::clone(engine), &config, None).unwrap()
    }

    #[test]
    fn test_close_refuses_open_transaction() {
        let engine = Arc::new(MemoryEngine::new());
        let writer = open(&engine);

        writer.begin_transaction().unwrap();
        let err = writer.close().unwrap_err();
        assert!(err.is_invalid_transaction_state());
        assert!(writer.check_open().is_ok());
        assert!(writer.is_in_transaction());

        writer.cancel_write().unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert_eq!(engine.open_handle_count(), 0);
    }
}
