//! Scheduler-bound live handle holder.
//!
//! [`LiveRealm`] owns a [`LiveRealmReference`] opened on a
//! [`SchedulerContext`] and keeps a GC-tracked frozen snapshot of its
//! current version. On every version advance it:
//!
//! 1. has its schema metadata refreshed by the schema-changed callback
//!    (delivered before the realm-changed callback of the same advance),
//! 2. freezes the new version and tracks the snapshot,
//! 3. closes snapshots nobody holds any more,
//! 4. reports the new version to its owner.
//!
//! All methods except the version queries must run on the owning context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::reference::{FrozenRealmReference, LiveRealmReference, RealmReference};
use super::version::VersionId;
use crate::engine::{NotificationTokenPtr, OpenConfig, RealmPtr};
use crate::scheduler::SchedulerContext;
use crate::tracker::{VersionTracker, DEFAULT_WARNING_THRESHOLD};
use crate::{Error, Result};

/// Called on the owning context after each version advance.
pub type VersionHook = Box<dyn Fn(VersionId) + Send + Sync>;

/// Options for [`LiveRealm::open`].
pub struct LiveRealmOptions {
    /// Label used in logs and errors.
    pub owner: String,
    /// Tracked-version count above which the tracker warns.
    pub tracked_version_warning_threshold: usize,
    /// Invoked with the new version after each advance.
    pub on_version: Option<VersionHook>,
}

impl LiveRealmOptions {
    /// Options with the given owner label and no hook.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            tracked_version_warning_threshold: DEFAULT_WARNING_THRESHOLD,
            on_version: None,
        }
    }

    /// Sets the version hook.
    #[must_use]
    pub fn on_version(mut self, hook: impl Fn(VersionId) + Send + Sync + 'static) -> Self {
        self.on_version = Some(Box::new(hook));
        self
    }

    /// Sets the tracker warning threshold.
    #[must_use]
    pub fn tracked_version_warning_threshold(mut self, threshold: usize) -> Self {
        self.tracked_version_warning_threshold = threshold;
        self
    }
}

impl fmt::Debug for LiveRealmOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRealmOptions")
            .field("owner", &self.owner)
            .field(
                "tracked_version_warning_threshold",
                &self.tracked_version_warning_threshold,
            )
            .field("on_version", &self.on_version.is_some())
            .finish()
    }
}

struct SnapshotState {
    current: Option<Arc<FrozenRealmReference>>,
    version: VersionId,
}

/// A live handle plus the frozen snapshot of its current version.
pub struct LiveRealm {
    reference: LiveRealmReference,
    tracker: Mutex<VersionTracker>,
    snapshot: Mutex<SnapshotState>,
    tokens: Mutex<Vec<NotificationTokenPtr>>,
    on_version: Option<VersionHook>,
    closed: AtomicBool,
}

impl LiveRealm {
    /// Opens a live handle on `context` and registers its schema-changed and
    /// realm-changed callbacks.
    ///
    /// Must be called on `context`.
    ///
    /// # Errors
    ///
    /// Engine failures; nothing stays open on failure.
    pub fn open(
        context: &SchedulerContext,
        config: &OpenConfig,
        options: LiveRealmOptions,
    ) -> Result<Arc<Self>> {
        let engine = Arc::clone(context.engine());
        let scheduler = context
            .scheduler()
            .ok_or_else(|| Error::ClosedHandle(format!("scheduler context '{}'", context.name())))?;
        let reference =
            LiveRealmReference::open(options.owner.clone(), Arc::clone(&engine), config, Some(scheduler))?;

        let initial = match reference.snapshot().map(Arc::new) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let _ = reference.close();
                return Err(e);
            }
        };
        let version = match initial.version() {
            Ok(version) => version,
            Err(e) => {
                let _ = initial.close();
                let _ = reference.close();
                return Err(e);
            }
        };
        let mut tracker = VersionTracker::new(options.owner.clone(), engine)
            .with_warning_threshold(options.tracked_version_warning_threshold);
        tracker.track_reference(&initial);

        let realm = Arc::new(Self {
            reference,
            tracker: Mutex::new(tracker),
            snapshot: Mutex::new(SnapshotState {
                current: Some(initial),
                version,
            }),
            tokens: Mutex::new(Vec::new()),
            on_version: options.on_version,
            closed: AtomicBool::new(false),
        });
        if let Err(e) = realm.register_callbacks() {
            let _ = realm.close();
            return Err(e);
        }
        tracing::debug!(owner = %options.owner, %version, "opened live realm");
        Ok(realm)
    }

    fn register_callbacks(self: &Arc<Self>) -> Result<()> {
        let engine = self.reference.engine();
        let ptr = self.reference.realm_ptr();

        let weak: Weak<Self> = Arc::downgrade(self);
        let realm_token = engine.register_realm_changed_callback(
            ptr,
            Arc::new(move || {
                if let Some(realm) = weak.upgrade() {
                    realm.on_realm_changed();
                }
            }),
        )?;
        self.tokens.lock().push(realm_token);

        let weak: Weak<Self> = Arc::downgrade(self);
        let schema_token = engine.register_schema_changed_callback(
            ptr,
            Arc::new(move || {
                if let Some(realm) = weak.upgrade() {
                    realm.on_schema_changed();
                }
            }),
        )?;
        self.tokens.lock().push(schema_token);
        Ok(())
    }

    fn on_schema_changed(&self) {
        if let Err(e) = self.reference.refresh_schema_metadata() {
            tracing::warn!(owner = %self.reference.owner(), error = %e, "schema refresh failed");
        }
    }

    fn on_realm_changed(&self) {
        match self.advance_snapshot() {
            Ok(version) => {
                if let Some(hook) = &self.on_version {
                    hook(version);
                }
            }
            Err(e) => {
                tracing::warn!(owner = %self.reference.owner(), error = %e, "failed to snapshot new version");
            }
        }
    }

    fn advance_snapshot(&self) -> Result<VersionId> {
        let snapshot = Arc::new(self.reference.snapshot()?);
        let version = snapshot.version()?;
        let mut tracker = self.tracker.lock();
        tracker.track_reference(&snapshot);
        {
            let mut state = self.snapshot.lock();
            state.current = Some(snapshot);
            state.version = version;
        }
        tracker.close_expired_references();
        Ok(version)
    }

    /// The live reference.
    #[must_use]
    pub fn reference(&self) -> &LiveRealmReference {
        &self.reference
    }

    /// The live native handle.
    #[must_use]
    pub fn realm_ptr(&self) -> RealmPtr {
        self.reference.realm_ptr()
    }

    /// Current version of the live handle.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] once closed.
    pub fn version(&self) -> Result<VersionId> {
        self.reference.version()
    }

    /// Version of the most recent tracked snapshot.
    #[must_use]
    pub fn snapshot_version(&self) -> VersionId {
        self.snapshot.lock().version
    }

    /// The tracked frozen snapshot of the current version.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] once closed.
    pub fn gc_tracked_snapshot(&self) -> Result<Arc<FrozenRealmReference>> {
        self.snapshot.lock().current.clone().ok_or_else(|| {
            Error::ClosedHandle(format!(
                "realm has been closed and is no longer accessible: {}",
                self.reference.owner()
            ))
        })
    }

    /// Advances to the latest version, delivering pending callbacks
    /// synchronously. Returns `true` if the version changed.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] once closed; engine failures otherwise.
    pub fn refresh(&self) -> Result<bool> {
        self.reference.refresh()
    }

    /// Versions of tracked snapshots that are still reachable.
    #[must_use]
    pub fn tracked_versions(&self) -> BTreeSet<VersionId> {
        self.tracker.lock().versions()
    }

    /// Returns `true` once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases callbacks, every tracked snapshot and the live handle.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the live handle.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let engine = self.reference.engine();
        for token in self.tokens.lock().drain(..) {
            if let Err(e) = engine.release_token(token) {
                tracing::warn!(owner = %self.reference.owner(), %token, error = %e, "failed to release realm callback");
            }
        }
        self.snapshot.lock().current = None;
        self.tracker.lock().close();
        tracing::debug!(owner = %self.reference.owner(), "closed live realm");
        self.reference.close()
    }
}

impl Drop for LiveRealm {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close live realm on drop");
        }
    }
}

impl fmt::Debug for LiveRealm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveRealm")
            .field("reference", &self.reference)
            .field("snapshot_version", &self.snapshot_version())
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
    use crate::engine::{ClassInfo, NativeEngine};
    use crate::scheduler::SchedulerConfig;

    struct Fixture {
        engine: MemoryEngine,
        context: Arc<SchedulerContext>,
        writer: RealmPtr,
    }

    fn fixture(path: &str) -> Fixture {
        let engine = MemoryEngine::new();
        let context = Arc::new(
            SchedulerContext::create(Arc::new(engine.clone()), &SchedulerConfig::new(path))
                .unwrap(),
        );
        let writer = engine.open(&OpenConfig::new(path), None).unwrap();
        Fixture {
            engine,
            context,
            writer,
        }
    }

    fn open_realm(f: &Fixture, path: &str, options: LiveRealmOptions) -> Arc<LiveRealm> {
        let context = Arc::clone(&f.context);
        let config = OpenConfig::new(path);
        f.context
            .run_blocking(move || LiveRealm::open(&context, &config, options))
            .unwrap()
            .unwrap()
    }

    fn commit(f: &Fixture, add_class: Option<&str>) {
        f.engine.begin_write(f.writer).unwrap();
        if let Some(name) = add_class {
            f.engine.add_class(f.writer, ClassInfo::new(name)).unwrap();
        }
        f.engine.commit(f.writer).unwrap();
    }

    fn refresh(f: &Fixture, realm: &Arc<LiveRealm>) {
        let realm = Arc::clone(realm);
        f.context
            .run_blocking(move || realm.refresh())
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_open_tracks_initial_snapshot() {
        let f = fixture("live-open");
        let realm = open_realm(&f, "live-open", LiveRealmOptions::new("live-open"));
        assert_eq!(realm.snapshot_version(), VersionId::from(1_u64));
        assert_eq!(realm.tracked_versions().len(), 1);
        assert_eq!(
            realm.gc_tracked_snapshot().unwrap().version().unwrap(),
            realm.snapshot_version()
        );
    }

    #[test]
    fn test_advance_snapshots_and_reports() {
        let f = fixture("live-advance");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let realm = open_realm(
            &f,
            "live-advance",
            LiveRealmOptions::new("live-advance").on_version(move |v| hook_seen.lock().push(v)),
        );

        commit(&f, None);
        commit(&f, None);
        refresh(&f, &realm);

        assert_eq!(realm.snapshot_version(), VersionId::from(3_u64));
        assert_eq!(seen.lock().last().copied(), Some(VersionId::from(3_u64)));
        // Superseded snapshots nobody held are closed.
        assert_eq!(realm.tracked_versions().len(), 1);
    }

    #[test]
    fn test_held_snapshot_survives_advance() {
        let f = fixture("live-held");
        let realm = open_realm(&f, "live-held", LiveRealmOptions::new("live-held"));
        let held = realm.gc_tracked_snapshot().unwrap();

        commit(&f, None);
        refresh(&f, &realm);

        assert!(!held.is_closed());
        let versions: Vec<_> = realm.tracked_versions().into_iter().collect();
        assert_eq!(versions, vec![VersionId::from(1_u64), VersionId::from(2_u64)]);

        drop(held);
        commit(&f, None);
        refresh(&f, &realm);
        assert_eq!(
            realm.tracked_versions().into_iter().collect::<Vec<_>>(),
            vec![VersionId::from(3_u64)]
        );
    }

    #[test]
    fn test_schema_refreshed_before_version_hook() {
        let f = fixture("live-schema");
        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let realm = {
            let context = Arc::clone(&f.context);
            let config = OpenConfig::new("live-schema");
            f.context
                .run_blocking(move || {
                    let holder: Arc<Mutex<Option<Weak<LiveRealm>>>> = Arc::new(Mutex::new(None));
                    let hook_holder = Arc::clone(&holder);
                    let realm = LiveRealm::open(
                        &context,
                        &config,
                        LiveRealmOptions::new("live-schema").on_version(move |_| {
                            let has_class = hook_holder
                                .lock()
                                .as_ref()
                                .and_then(Weak::upgrade)
                                .map(|r| r.reference().schema_metadata().class("Cat").is_some());
                            *slot.lock() = has_class;
                        }),
                    )?;
                    *holder.lock() = Some(Arc::downgrade(&realm));
                    Ok::<_, Error>(realm)
                })
                .unwrap()
                .unwrap()
        };

        commit(&f, Some("Cat"));
        refresh(&f, &realm);
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_close_releases_everything() {
        let f = fixture("live-close");
        let realm = open_realm(&f, "live-close", LiveRealmOptions::new("live-close"));
        let closing = Arc::clone(&realm);
        f.context
            .run_blocking(move || closing.close())
            .unwrap()
            .unwrap();
        assert!(realm.is_closed());
        assert!(realm.reference().is_closed());
        assert!(matches!(realm.gc_tracked_snapshot(), Err(Error::ClosedHandle(_))));
        // Only the test's writer handle remains.
        assert_eq!(f.engine.open_handle_count(), 1);
        assert_eq!(f.engine.token_count(), 0);
        // Idempotent.
        realm.close().unwrap();
    }
}
