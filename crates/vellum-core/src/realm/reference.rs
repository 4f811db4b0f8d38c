//! Live and frozen version references.
//!
//! A reference owns exactly one native handle and releases it at most once;
//! repeated `close()` calls are no-ops so concurrent teardown paths never
//! race into an error.
//!
//! ```text
//!   LiveRealmReference ──snapshot()──► FrozenRealmReference
//!        │  advances in place              pinned (begin_read)
//!        └─ refresh_schema_metadata()      schema fixed at creation
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::schema::SchemaMetadata;
use super::version::VersionId;
use crate::engine::{NativeEngine, OpenConfig, RealmPtr, SchedulerPtr};
use crate::{Error, Result};

/// Whether a reference advances or is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Mutable; advances in place.
    Live,
    /// Immutable point-in-time view.
    Frozen,
}

/// Operations shared by live and frozen references.
pub trait RealmReference: Send + Sync {
    /// Label of the owning database, used in error messages.
    fn owner(&self) -> &str;

    /// Engine the handle belongs to.
    fn engine(&self) -> &Arc<dyn NativeEngine>;

    /// The native handle.
    fn realm_ptr(&self) -> RealmPtr;

    /// Live or frozen.
    fn kind(&self) -> ReferenceKind;

    /// Cached schema metadata.
    fn schema_metadata(&self) -> Arc<SchemaMetadata>;

    /// Releases the native handle. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// Propagates an engine failure from the first release only.
    fn close(&self) -> Result<()>;

    /// Version of the referenced snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] once the handle is released.
    fn version(&self) -> Result<VersionId> {
        self.check_closed()?;
        VersionId::new(self.engine().version_id(self.realm_ptr())?)
    }

    /// Returns `true` for frozen handles.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] once the handle is released.
    fn is_frozen(&self) -> Result<bool> {
        self.check_closed()?;
        Ok(self.engine().is_frozen(self.realm_ptr())?)
    }

    /// Returns `true` once the native handle is released.
    fn is_closed(&self) -> bool {
        self.engine().is_closed(self.realm_ptr())
    }

    /// Fails with [`Error::ClosedHandle`] if the handle is released.
    ///
    /// # Errors
    ///
    /// See above.
    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedHandle(format!(
                "realm has been closed and is no longer accessible: {}",
                self.owner()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NativeHandle
// ---------------------------------------------------------------------------

struct NativeHandle {
    owner: String,
    engine: Arc<dyn NativeEngine>,
    ptr: RealmPtr,
    released: AtomicBool,
}

impl NativeHandle {
    fn new(owner: String, engine: Arc<dyn NativeEngine>, ptr: RealmPtr) -> Self {
        Self {
            owner,
            engine,
            ptr,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::trace!(owner = %self.owner, realm = %self.ptr, "closing realm handle");
        self.engine.close(self.ptr)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FrozenRealmReference
// ---------------------------------------------------------------------------

/// An immutable view of one version.
///
/// Creation eagerly begins a read transaction so the engine cannot reclaim
/// the version before it is first used.
pub struct FrozenRealmReference {
    handle: NativeHandle,
    schema: Arc<SchemaMetadata>,
}

impl FrozenRealmReference {
    /// Wraps a frozen native handle and pins its version.
    ///
    /// The handle is closed again if pinning fails.
    ///
    /// # Errors
    ///
    /// Propagates the engine's `begin_read` failure.
    pub fn new(
        owner: impl Into<String>,
        engine: Arc<dyn NativeEngine>,
        ptr: RealmPtr,
        schema: Arc<SchemaMetadata>,
    ) -> Result<Self> {
        if let Err(e) = engine.begin_read(ptr) {
            let _ = engine.close(ptr);
            return Err(e.into());
        }
        Ok(Self {
            handle: NativeHandle::new(owner.into(), engine, ptr),
            schema,
        })
    }
}

impl RealmReference for FrozenRealmReference {
    fn owner(&self) -> &str {
        &self.handle.owner
    }

    fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.handle.engine
    }

    fn realm_ptr(&self) -> RealmPtr {
        self.handle.ptr
    }

    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Frozen
    }

    fn schema_metadata(&self) -> Arc<SchemaMetadata> {
        Arc::clone(&self.schema)
    }

    fn close(&self) -> Result<()> {
        self.handle.release()
    }
}

impl fmt::Debug for FrozenRealmReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenRealmReference")
            .field("owner", &self.handle.owner)
            .field("realm", &self.handle.ptr)
            .field("version", &self.version().ok())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// LiveRealmReference
// ---------------------------------------------------------------------------

/// A live handle that advances in place.
///
/// Must only be used from the scheduler context it was opened on.
pub struct LiveRealmReference {
    handle: NativeHandle,
    schema: RwLock<Arc<SchemaMetadata>>,
}

impl LiveRealmReference {
    /// Opens a live handle bound to `scheduler`.
    ///
    /// # Errors
    ///
    /// Propagates engine failures; the handle is closed again if the schema
    /// cannot be read.
    pub fn open(
        owner: impl Into<String>,
        engine: Arc<dyn NativeEngine>,
        config: &OpenConfig,
        scheduler: Option<SchedulerPtr>,
    ) -> Result<Self> {
        let ptr = engine.open(config, scheduler)?;
        Self::new(owner, engine, ptr)
    }

    /// Wraps an already opened live handle.
    ///
    /// # Errors
    ///
    /// Propagates engine failures; the handle is closed on failure.
    pub fn new(owner: impl Into<String>, engine: Arc<dyn NativeEngine>, ptr: RealmPtr) -> Result<Self> {
        let schema = match SchemaMetadata::load(engine.as_ref(), ptr) {
            Ok(schema) => schema,
            Err(e) => {
                let _ = engine.close(ptr);
                return Err(e);
            }
        };
        Ok(Self {
            handle: NativeHandle::new(owner.into(), engine, ptr),
            schema: RwLock::new(Arc::new(schema)),
        })
    }

    /// Freezes the current version into a new pinned reference that shares
    /// this reference's schema metadata.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] if closed; engine failures otherwise.
    pub fn snapshot(&self) -> Result<FrozenRealmReference> {
        self.check_closed()?;
        let frozen = self.handle.engine.freeze(self.handle.ptr)?;
        FrozenRealmReference::new(
            self.handle.owner.clone(),
            Arc::clone(&self.handle.engine),
            frozen,
            self.schema_metadata(),
        )
    }

    /// Replaces the cached schema metadata with the current version's.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] if closed; engine failures otherwise.
    pub fn refresh_schema_metadata(&self) -> Result<()> {
        self.check_closed()?;
        let schema = SchemaMetadata::load(self.handle.engine.as_ref(), self.handle.ptr)?;
        tracing::trace!(
            owner = %self.handle.owner,
            schema_version = schema.schema_version(),
            "refreshed schema metadata"
        );
        *self.schema.write() = Arc::new(schema);
        Ok(())
    }

    /// Advances to the latest version, delivering pending callbacks.
    /// Returns `true` if the version changed.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] if closed; engine failures otherwise.
    pub fn refresh(&self) -> Result<bool> {
        self.check_closed()?;
        Ok(self.handle.engine.refresh(self.handle.ptr)?)
    }
}

impl RealmReference for LiveRealmReference {
    fn owner(&self) -> &str {
        &self.handle.owner
    }

    fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.handle.engine
    }

    fn realm_ptr(&self) -> RealmPtr {
        self.handle.ptr
    }

    fn kind(&self) -> ReferenceKind {
        ReferenceKind::Live
    }

    fn schema_metadata(&self) -> Arc<SchemaMetadata> {
        Arc::clone(&self.schema.read())
    }

    fn close(&self) -> Result<()> {
        self.handle.release()
    }
}

impl fmt::Debug for LiveRealmReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRealmReference")
            .field("owner", &self.handle.owner)
            .field("realm", &self.handle.ptr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{ClassInfo, PropertyType};

    fn open_live(engine: &MemoryEngine) -> LiveRealmReference {
        LiveRealmReference::open(
            "test.vellum",
            Arc::new(engine.clone()),
            &OpenConfig::new("test.vellum"),
            None,
        )
        .unwrap()
    }

    fn commit_empty(engine: &MemoryEngine, live: &LiveRealmReference) {
        engine.begin_write(live.realm_ptr()).unwrap();
        engine.commit(live.realm_ptr()).unwrap();
    }

    #[test]
    fn test_live_version_advances() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        let mut previous = live.version().unwrap();
        for _ in 0..5 {
            commit_empty(&engine, &live);
            let current = live.version().unwrap();
            assert!(current > previous);
            previous = current;
        }
        assert_eq!(live.kind(), ReferenceKind::Live);
        assert!(!live.is_frozen().unwrap());
    }

    #[test]
    fn test_snapshot_is_pinned_and_frozen() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        let frozen = live.snapshot().unwrap();
        assert!(engine.is_pinned(frozen.realm_ptr()));
        assert!(frozen.is_frozen().unwrap());
        assert_eq!(frozen.kind(), ReferenceKind::Frozen);

        let pinned_at = frozen.version().unwrap();
        commit_empty(&engine, &live);
        commit_empty(&engine, &live);
        assert_eq!(frozen.version().unwrap(), pinned_at);
        assert!(engine.retained_versions("test.vellum").contains(&pinned_at.version()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        let frozen = live.snapshot().unwrap();
        for _ in 0..3 {
            frozen.close().unwrap();
            live.close().unwrap();
        }
        assert!(frozen.is_closed());
        assert!(live.is_closed());
        assert_eq!(engine.open_handle_count(), 0);
    }

    #[test]
    fn test_closed_reference_rejects_queries() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        live.close().unwrap();
        assert!(matches!(live.version(), Err(Error::ClosedHandle(_))));
        assert!(matches!(live.is_frozen(), Err(Error::ClosedHandle(_))));
        assert!(matches!(live.snapshot(), Err(Error::ClosedHandle(_))));
        assert!(matches!(
            live.refresh_schema_metadata(),
            Err(Error::ClosedHandle(_))
        ));
    }

    #[test]
    fn test_refresh_schema_metadata_replaces_cache() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        let before = live.schema_metadata();
        let frozen = live.snapshot().unwrap();

        engine.begin_write(live.realm_ptr()).unwrap();
        engine
            .add_class(
                live.realm_ptr(),
                ClassInfo::new("Dog").with_property("name", PropertyType::String),
            )
            .unwrap();
        engine.commit(live.realm_ptr()).unwrap();

        // Stale until refreshed.
        assert!(live.schema_metadata().class("Dog").is_none());
        live.refresh_schema_metadata().unwrap();
        assert!(live.schema_metadata().class("Dog").is_some());

        // Earlier instances are untouched.
        assert!(before.class("Dog").is_none());
        assert!(frozen.schema_metadata().class("Dog").is_none());
    }

    #[test]
    fn test_frozen_creation_fails_on_reclaimed_version() {
        let engine = MemoryEngine::new();
        let live = open_live(&engine);
        let raw = engine.freeze(live.realm_ptr()).unwrap();
        commit_empty(&engine, &live);

        let result = FrozenRealmReference::new(
            "test.vellum",
            Arc::new(engine.clone()),
            raw,
            live.schema_metadata(),
        );
        assert!(result.is_err());
        assert!(engine.is_closed(raw));
    }
}
