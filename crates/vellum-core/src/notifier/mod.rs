//! # Change Notifier
//!
//! Owns a private live handle, opened lazily on a [`SchedulerContext`], that
//! exists only to carry native change callbacks. User writes go through other
//! handles, so registration never contends with a write transaction.
//!
//! ## Delivery
//!
//! ```text
//!   commit ──► engine posts work ──► context thread
//!                                      │ 1. schema callback   (refresh metadata)
//!                                      │ 2. realm callback    (snapshot, publish version)
//!                                      │ 3. entity callbacks  (build changeset, try_send)
//!                                      ▼
//!        VersionStream (watch, latest only)   ObserverStream (bounded mpsc)
//! ```
//!
//! Steps run in that order on one thread, so a consumer that receives an
//! entity event for version V can already read V from
//! [`ChangeNotifier::latest_version`].
//!
//! ## Backpressure
//!
//! - `realm_changed()` keeps only the latest version.
//! - Entity streams are bounded by [`NotifierConfig::event_buffer_size`]; a
//!   full channel ends the stream with [`Error::BackpressureExceeded`].

mod event;
mod observable;
mod stream;
mod token;

pub use event::{ChangeEvent, EventType};
pub use observable::{
    ChangeSetOf, Observable, ObservedList, ObservedMap, ObservedObject, ObservedSet,
};
pub use stream::{ObserverStream, VersionStream};
pub use token::NotificationToken;

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_stream::wrappers::{ReceiverStream, WatchStream};

use self::stream::ObserverShared;
use crate::changeset::ChangeSetBuilder;
use crate::engine::{ChangesPtr, EntityKey, KeyFilter, NativeEngine, OpenConfig};
use crate::realm::{LiveRealm, LiveRealmOptions, RealmReference, SchemaMetadata, VersionId};
use crate::scheduler::SchedulerContext;
use crate::tracker::DEFAULT_WARNING_THRESHOLD;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default capacity of an entity observer stream.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

/// Configuration for a [`ChangeNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Events an observer stream buffers before it fails with
    /// [`Error::BackpressureExceeded`].
    pub event_buffer_size: usize,
    /// Tracked-version count above which the notifier's tracker warns.
    pub tracked_version_warning_threshold: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            tracked_version_warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Version broadcast
// ---------------------------------------------------------------------------

/// Latest-value broadcast of the private handle's version.
struct VersionBroadcast {
    sender: Mutex<Option<watch::Sender<VersionId>>>,
}

impl VersionBroadcast {
    fn new() -> Self {
        let (sender, _) = watch::channel(VersionId::MIN);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Publishes `version` unless a newer one already went out.
    fn publish(&self, version: VersionId) {
        if let Some(sender) = self.sender.lock().as_ref() {
            sender.send_if_modified(|current| {
                if version > *current {
                    *current = version;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn subscribe(&self) -> Option<watch::Receiver<VersionId>> {
        self.sender.lock().as_ref().map(watch::Sender::subscribe)
    }

    fn latest(&self) -> Option<VersionId> {
        self.sender.lock().as_ref().map(|sender| *sender.borrow())
    }

    /// Ends every subscriber's stream.
    fn close(&self) {
        self.sender.lock().take();
    }
}

struct NotifierRealm {
    live: Arc<LiveRealm>,
    versions: Arc<VersionBroadcast>,
}

// ---------------------------------------------------------------------------
// ChangeNotifier
// ---------------------------------------------------------------------------

/// Bridges native change callbacks into async streams.
pub struct ChangeNotifier {
    owner: String,
    open_config: OpenConfig,
    context: Arc<SchedulerContext>,
    config: NotifierConfig,
    state: OnceCell<NotifierRealm>,
    closed: AtomicBool,
}

impl ChangeNotifier {
    /// Creates a notifier for the database at `open_config`. Nothing is
    /// opened until the first subscriber attaches.
    #[must_use]
    pub fn new(
        open_config: OpenConfig,
        context: Arc<SchedulerContext>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            owner: format!("{}#notifier", open_config.path),
            open_config,
            context,
            config,
            state: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` once the private handle has been opened.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// Latest version published to `realm_changed()` subscribers, `None`
    /// before initialization or after close.
    #[must_use]
    pub fn latest_version(&self) -> Option<VersionId> {
        self.state.get().and_then(|realm| realm.versions.latest())
    }

    /// Schema metadata of the private handle's current version.
    #[must_use]
    pub fn schema_metadata(&self) -> Option<Arc<SchemaMetadata>> {
        self.state
            .get()
            .map(|realm| realm.live.reference().schema_metadata())
    }

    /// Versions of snapshots the notifier still tracks.
    #[must_use]
    pub fn tracked_versions(&self) -> BTreeSet<VersionId> {
        self.state
            .get()
            .map(|realm| realm.live.tracked_versions())
            .unwrap_or_default()
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedHandle(format!(
                "notifier has been closed: {}",
                self.owner
            )));
        }
        Ok(())
    }

    /// Opens the private handle on first use.
    async fn realm(&self) -> Result<&NotifierRealm> {
        self.check_closed()?;
        self.state
            .get_or_try_init(|| async {
                let versions = Arc::new(VersionBroadcast::new());
                let hook = Arc::clone(&versions);
                let options = LiveRealmOptions::new(self.owner.clone())
                    .tracked_version_warning_threshold(
                        self.config.tracked_version_warning_threshold,
                    )
                    .on_version(move |version| hook.publish(version));
                let context = Arc::clone(&self.context);
                let config = self.open_config.clone();
                let live = self
                    .context
                    .run_on(move || LiveRealm::open(&context, &config, options))
                    .await??;
                versions.publish(live.snapshot_version());
                tracing::debug!(
                    owner = %self.owner,
                    version = %live.snapshot_version(),
                    "initialized notifier realm"
                );
                Ok::<_, Error>(NotifierRealm { live, versions })
            })
            .await
    }

    /// Stream of versions, starting with the latest known one.
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] after close; initialization failures.
    pub async fn realm_changed(&self) -> Result<VersionStream> {
        let realm = self.realm().await?;
        let receiver = realm.versions.subscribe().ok_or_else(|| {
            Error::ClosedHandle(format!("notifier has been closed: {}", self.owner))
        })?;
        Ok(VersionStream::new(WatchStream::new(receiver)))
    }

    /// Observes one entity.
    ///
    /// The private handle is refreshed before registering. An entity that no
    /// longer exists yields a single [`ChangeEvent::Deleted`] and the stream
    /// ends; otherwise the first event is [`ChangeEvent::Initial`].
    ///
    /// # Errors
    ///
    /// [`Error::ClosedHandle`] after close, engine failures otherwise.
    /// Registering from inside a write is rejected by the caller that owns
    /// the writer.
    pub async fn register_observer<O: Observable>(
        &self,
        observable: O,
        filter: KeyFilter,
    ) -> Result<ObserverStream<ChangeSetOf<O>>> {
        let realm = self.realm().await?;
        let live = Arc::clone(&realm.live);
        let context = Arc::downgrade(&self.context);
        let capacity = self.config.event_buffer_size.max(1);
        self.context
            .run_on(move || register::<O>(&live, context, &observable, &filter, capacity))
            .await?
    }

    /// Advances the private handle to the latest version, delivering every
    /// pending callback before returning.
    ///
    /// # Errors
    ///
    /// [`Error::InternalConsistency`] if the handle's version and the last
    /// snapshot version disagree afterwards.
    pub async fn refresh(&self) -> Result<VersionId> {
        let realm = self.realm().await?;
        let live = Arc::clone(&realm.live);
        let owner = self.owner.clone();
        self.context
            .run_on(move || {
                live.refresh()?;
                let refreshed = live.version()?;
                let observed = live.snapshot_version();
                if refreshed != observed {
                    tracing::error!(
                        owner = %owner,
                        %refreshed,
                        %observed,
                        "refreshed version does not match the snapshot version"
                    );
                    return Err(Error::InternalConsistency(format!(
                        "{owner}: refreshed version {refreshed} != snapshot version {observed}"
                    )));
                }
                Ok(refreshed)
            })
            .await?
    }

    /// Closes the private handle on its context. A notifier that was never
    /// initialized has nothing to close. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a failure to close the native handle.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(realm) = self.state.get() else {
            return Ok(());
        };
        realm.versions.close();
        let live = Arc::clone(&realm.live);
        match self.context.run_blocking(move || live.close()) {
            Ok(result) => result?,
            // The context is gone; close in place.
            Err(e) => {
                tracing::debug!(owner = %self.owner, error = %e, "closing notifier realm off context");
                realm.live.close()?;
            }
        }
        tracing::debug!(owner = %self.owner, "closed notifier");
        Ok(())
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(owner = %self.owner, error = %e, "failed to close notifier on drop");
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("owner", &self.owner)
            .field("initialized", &self.is_initialized())
            .field("latest_version", &self.latest_version())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Observer registration (runs on the notifier context)
// ---------------------------------------------------------------------------

fn register<O: Observable>(
    live: &Arc<LiveRealm>,
    context: Weak<SchedulerContext>,
    observable: &O,
    filter: &KeyFilter,
    capacity: usize,
) -> Result<ObserverStream<ChangeSetOf<O>>> {
    live.refresh()?;

    let entity = observable.entity();
    let shared = Arc::new(ObserverShared::new(format!("{} {entity}", observable.kind())));
    let (sender, receiver) = mpsc::channel(capacity);
    let engine = Arc::clone(live.reference().engine());

    if !engine.entity_exists(live.realm_ptr(), entity)? {
        tracing::debug!(observer = shared.description(), "observed entity does not exist");
        let _ = sender.try_send(ChangeEvent::Deleted {
            version: live.snapshot_version(),
        });
        return Ok(ObserverStream::new(
            ReceiverStream::new(receiver),
            shared,
            entity,
        ));
    }

    let callback = Arc::new(ObserverCallback::<O::Builder> {
        entity,
        engine: Arc::clone(&engine),
        live: Arc::downgrade(live),
        sender: Mutex::new(Some(sender)),
        shared: Arc::downgrade(&shared),
        capacity,
        initial_sent: AtomicBool::new(false),
        _builder: PhantomData,
    });
    let token = engine.register_change_callback(
        live.realm_ptr(),
        entity,
        filter,
        Arc::new(move |changes| callback.on_change(changes)),
    )?;
    shared.set_token(NotificationToken::new(token, engine, context));
    tracing::debug!(observer = shared.description(), %token, "registered observer");
    Ok(ObserverStream::new(
        ReceiverStream::new(receiver),
        shared,
        entity,
    ))
}

/// Translates native callbacks for one observer into events.
struct ObserverCallback<B: ChangeSetBuilder> {
    entity: EntityKey,
    engine: Arc<dyn NativeEngine>,
    live: Weak<LiveRealm>,
    sender: Mutex<Option<mpsc::Sender<ChangeEvent<B::ChangeSet>>>>,
    shared: Weak<ObserverShared>,
    capacity: usize,
    initial_sent: AtomicBool,
    _builder: PhantomData<fn() -> B>,
}

impl<B: ChangeSetBuilder> ObserverCallback<B> {
    fn on_change(&self, changes: ChangesPtr) {
        let Some(sender) = self.sender.lock().clone() else {
            return;
        };
        let Some(live) = self.live.upgrade() else {
            self.finish();
            return;
        };

        let exists = self
            .engine
            .entity_exists(live.realm_ptr(), self.entity)
            .unwrap_or(false);
        if !exists {
            let event = ChangeEvent::Deleted {
                version: live.snapshot_version(),
            };
            self.send(&sender, event);
            self.finish();
            return;
        }

        let snapshot = match live.gc_tracked_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let version = live.snapshot_version();
        let event = if self.initial_sent.swap(true, Ordering::AcqRel) {
            match B::build(self.engine.as_ref(), changes) {
                Ok(changes) => ChangeEvent::Updated {
                    version,
                    snapshot,
                    changes,
                },
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        } else {
            ChangeEvent::Initial { version, snapshot }
        };
        self.send(&sender, event);
    }

    fn send(&self, sender: &mpsc::Sender<ChangeEvent<B::ChangeSet>>, event: ChangeEvent<B::ChangeSet>) {
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let description = self.description();
                tracing::warn!(
                    observer = %description,
                    capacity = self.capacity,
                    "observer stream fell behind; terminating it"
                );
                self.fail(Error::BackpressureExceeded(format!(
                    "observer of {description} did not keep up with {} buffered events",
                    self.capacity
                )));
            }
            Err(TrySendError::Closed(_)) => self.finish(),
        }
    }

    fn description(&self) -> String {
        self.shared
            .upgrade()
            .map_or_else(|| self.entity.to_string(), |s| s.description().to_string())
    }

    fn fail(&self, error: Error) {
        if let Some(shared) = self.shared.upgrade() {
            shared.fail(error);
        }
        self.finish();
    }

    /// Ends the stream after the buffered events and releases the token.
    fn finish(&self) {
        self.sender.lock().take();
        if let Some(shared) = self.shared.upgrade() {
            shared.release_token();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;
    use crate::changeset::ListChangeSet;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::RealmPtr;
    use crate::scheduler::SchedulerConfig;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        engine: MemoryEngine,
        writer: RealmPtr,
        notifier: ChangeNotifier,
    }

    fn fixture(path: &str, config: NotifierConfig) -> Fixture {
        let engine = MemoryEngine::new();
        let context = Arc::new(
            SchedulerContext::create(
                Arc::new(engine.clone()),
                &SchedulerConfig::new(format!("{path}-notifier")),
            )
            .unwrap(),
        );
        let writer = engine.open(&OpenConfig::new(path), None).unwrap();
        let notifier = ChangeNotifier::new(OpenConfig::new(path), context, config);
        Fixture {
            engine,
            writer,
            notifier,
        }
    }

    impl Fixture {
        fn write<T>(&self, f: impl FnOnce(&MemoryEngine, RealmPtr) -> T) -> T {
            self.engine.begin_write(self.writer).unwrap();
            let out = f(&self.engine, self.writer);
            self.engine.commit(self.writer).unwrap();
            out
        }
    }

    async fn next<S: tokio_stream::Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
        tokio::time::timeout(WAIT, stream.next()).await.unwrap()
    }

    // --- lifecycle ---

    #[tokio::test]
    async fn test_close_without_subscribers_is_noop() {
        let f = fixture("n-lazy", NotifierConfig::default());
        assert!(!f.notifier.is_initialized());
        f.notifier.close().unwrap();
        assert!(!f.notifier.is_initialized());
        // Only the test's writer handle was ever opened.
        assert_eq!(f.engine.open_handle_count(), 1);
        assert!(matches!(
            f.notifier.realm_changed().await,
            Err(Error::ClosedHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_private_handle() {
        let f = fixture("n-close", NotifierConfig::default());
        let mut versions = f.notifier.realm_changed().await.unwrap();
        assert!(f.notifier.is_initialized());
        assert!(f.engine.open_handle_count() > 1);

        f.notifier.close().unwrap();
        f.notifier.close().unwrap();
        assert_eq!(next(&mut versions).await, Some(VersionId::from(1_u64)));
        assert_eq!(next(&mut versions).await, None);
        assert_eq!(f.engine.open_handle_count(), 1);
        assert_eq!(f.engine.token_count(), 0);
    }

    // --- realm_changed ---

    #[tokio::test]
    async fn test_realm_changed_replays_latest() {
        let f = fixture("n-replay", NotifierConfig::default());
        let mut first = f.notifier.realm_changed().await.unwrap();
        assert_eq!(next(&mut first).await, Some(VersionId::from(1_u64)));

        f.write(|_, _| ());
        f.write(|_, _| ());
        let refreshed = f.notifier.refresh().await.unwrap();
        assert_eq!(refreshed, VersionId::from(3_u64));

        // Late subscriber sees only the latest.
        let mut late = f.notifier.realm_changed().await.unwrap();
        assert_eq!(next(&mut late).await, Some(VersionId::from(3_u64)));
        // Slow subscriber skips the intermediate version.
        assert_eq!(next(&mut first).await, Some(VersionId::from(3_u64)));
        assert_eq!(f.notifier.latest_version(), Some(VersionId::from(3_u64)));
    }

    #[tokio::test]
    async fn test_refresh_keeps_snapshot_in_step() {
        let f = fixture("n-refresh", NotifierConfig::default());
        for expected in 2..6_u64 {
            f.write(|_, _| ());
            assert_eq!(f.notifier.refresh().await.unwrap(), VersionId::from(expected));
        }
        // Only the current snapshot stays reachable.
        assert_eq!(f.notifier.tracked_versions().len(), 1);
    }

    // --- observers ---

    #[tokio::test]
    async fn test_observer_initial_then_updates() {
        let f = fixture("n-observe", NotifierConfig::default());
        let list = f.write(|e, w| e.create_list(w).unwrap());
        let mut stream = f
            .notifier
            .register_observer(ObservedList(list), KeyFilter::all())
            .await
            .unwrap();

        let initial = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(initial.event_type(), EventType::Initial);
        assert_eq!(initial.version(), VersionId::from(2_u64));

        f.write(|e, w| e.list_push(w, list, 1_i64).unwrap());
        let update = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(update.event_type(), EventType::Updated);
        let changes: &ListChangeSet = update.changes().unwrap();
        assert_eq!(changes.insertions(), &[0]);
        assert_eq!(
            update.snapshot().unwrap().version().unwrap(),
            update.version()
        );
    }

    #[tokio::test]
    async fn test_missing_entity_yields_single_deleted() {
        let f = fixture("n-missing", NotifierConfig::default());
        let mut stream = f
            .notifier
            .register_observer(ObservedObject(EntityKey::from_raw(999)), KeyFilter::all())
            .await
            .unwrap();
        assert!(next(&mut stream).await.unwrap().unwrap().is_deleted());
        assert!(next(&mut stream).await.is_none());
        assert_eq!(f.engine.token_count(), 2);
    }

    #[tokio::test]
    async fn test_observer_sees_deletion_then_completes() {
        let f = fixture("n-delete", NotifierConfig::default());
        let map = f.write(|e, w| e.create_map(w).unwrap());
        let mut stream = f
            .notifier
            .register_observer(ObservedMap(map), KeyFilter::all())
            .await
            .unwrap();
        assert_eq!(
            next(&mut stream).await.unwrap().unwrap().event_type(),
            EventType::Initial
        );

        f.write(|e, w| e.delete_entity(w, map).unwrap());
        let deleted = next(&mut stream).await.unwrap().unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(deleted.version(), VersionId::from(3_u64));
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_object_filter_suppresses_unrelated_changes() {
        let f = fixture("n-filter", NotifierConfig::default());
        let dog = f.write(|e, w| {
            let dog = e.create_object(w, "Dog").unwrap();
            e.set_property(w, dog, "name", "rex").unwrap();
            dog
        });
        let mut stream = f
            .notifier
            .register_observer(ObservedObject(dog), KeyFilter::properties(["name"]))
            .await
            .unwrap();
        next(&mut stream).await.unwrap().unwrap();

        f.write(|e, w| e.set_property(w, dog, "age", 4_i64).unwrap());
        f.write(|e, w| e.set_property(w, dog, "name", "max").unwrap());
        let update = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(update.version(), VersionId::from(4_u64));
        assert!(update.changes().unwrap().is_field_changed("name"));
    }

    #[tokio::test]
    async fn test_slow_observer_fails_with_backpressure() {
        let f = fixture(
            "n-backpressure",
            NotifierConfig {
                event_buffer_size: 2,
                ..NotifierConfig::default()
            },
        );
        let set = f.write(|e, w| e.create_set(w).unwrap());
        let mut stream = f
            .notifier
            .register_observer(ObservedSet(set), KeyFilter::all())
            .await
            .unwrap();
        for i in 0..10_i64 {
            f.write(|e, w| e.set_insert(w, set, i).unwrap());
            f.notifier.refresh().await.unwrap();
        }

        let mut delivered = 0;
        loop {
            match next(&mut stream).await {
                Some(Ok(_)) => delivered += 1,
                Some(Err(Error::BackpressureExceeded(_))) => break,
                other => panic!("unexpected item: {other:?}"),
            }
        }
        assert_eq!(delivered, 2);
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_token() {
        let f = fixture("n-drop", NotifierConfig::default());
        let list = f.write(|e, w| e.create_list(w).unwrap());
        let stream = f
            .notifier
            .register_observer(ObservedList(list), KeyFilter::all())
            .await
            .unwrap();
        let with_observer = f.engine.token_count();
        drop(stream);
        // Flush the deferred release.
        f.notifier.refresh().await.unwrap();
        assert_eq!(f.engine.token_count(), with_observer - 1);
    }
}
