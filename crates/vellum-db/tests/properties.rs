//! Version, lifecycle and ordering properties of the database facade.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use vellum_core::engine::memory::MemoryEngine;
use vellum_core::engine::{KeyFilter, NativeEngine, OpenConfig};
use vellum_core::notifier::{ChangeNotifier, EventType, NotifierConfig, ObservedList};
use vellum_core::realm::{LiveRealmReference, RealmReference, VersionId};
use vellum_core::scheduler::{SchedulerConfig, SchedulerContext};
use vellum_core::{Error, ListChangeSet, Range};
use vellum_db::Database;

const WAIT: Duration = Duration::from_secs(5);

async fn next<S: Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("stream did not yield in time")
}

fn covered(ranges: &[Range]) -> BTreeSet<usize> {
    ranges.iter().flat_map(Range::positions).collect()
}

fn indices(values: &[usize]) -> BTreeSet<usize> {
    values.iter().copied().collect()
}

// --- version monotonicity ---

#[tokio::test]
async fn test_versions_strictly_increase_across_commits() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::open(engine, "monotonic.vellum").await.unwrap();
    let mut previous = db.version().unwrap();
    for _ in 0..20 {
        db.write(|_| Ok(())).await.unwrap();
        let current = db.version().unwrap();
        assert!(current > previous);
        previous = current;
    }
}

#[test]
fn test_negative_version_ids_are_rejected() {
    for raw in [-1_i64, -2, -1_000, i64::MIN] {
        assert_eq!(VersionId::new(raw), Err(Error::InvalidVersion(raw)));
    }
    assert_eq!(VersionId::new(0).unwrap(), VersionId::MIN);
}

// --- close idempotence ---

#[test]
fn test_reference_close_is_idempotent() {
    let engine = MemoryEngine::new();
    let shared: Arc<dyn NativeEngine> = Arc::new(engine.clone());
    let live = LiveRealmReference::open(
        "idempotent",
        shared,
        &OpenConfig::new("idempotent.vellum"),
        None,
    )
    .unwrap();
    let frozen = live.snapshot().unwrap();

    for _ in 0..3 {
        frozen.close().unwrap();
        live.close().unwrap();
    }
    assert!(frozen.is_closed());
    assert!(live.is_closed());
    assert!(matches!(live.version(), Err(Error::ClosedHandle(_))));
    assert_eq!(engine.open_handle_count(), 0);
}

#[tokio::test]
async fn test_database_close_is_idempotent() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::open(Arc::clone(&engine), "db-idempotent.vellum")
        .await
        .unwrap();
    db.realm_changed().await.unwrap();
    for _ in 0..3 {
        db.close().unwrap();
    }
    drop(db);
    assert_eq!(engine.open_handle_count(), 0);
}

// --- ranges and indices agree ---

#[tokio::test]
async fn test_list_ranges_cover_exactly_the_indices() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::open(engine, "ranges.vellum").await.unwrap();
    let list = db
        .write(|realm| {
            let list = realm.engine().create_list(realm.realm_ptr())?;
            for v in 0..12_i64 {
                realm.engine().list_push(realm.realm_ptr(), list, v)?;
            }
            Ok(list)
        })
        .await
        .unwrap();
    let mut events = db.observe(ObservedList(list), KeyFilter::all()).await.unwrap();
    next(&mut events).await.unwrap().unwrap();

    let edits: [fn(&MemoryEngine, vellum_core::engine::RealmPtr, vellum_core::engine::EntityKey); 3] = [
        |e, r, l| {
            e.list_remove(r, l, 2).unwrap();
            e.list_remove(r, l, 2).unwrap();
            e.list_set(r, l, 5, 100_i64).unwrap();
            e.list_insert(r, l, 0, -1_i64).unwrap();
        },
        |e, r, l| {
            for i in [1, 3, 5] {
                e.list_set(r, l, i, 7_i64).unwrap();
            }
            e.list_push(r, l, 99_i64).unwrap();
            e.list_push(r, l, 98_i64).unwrap();
        },
        |e, r, l| {
            e.list_remove(r, l, 0).unwrap();
            e.list_insert(r, l, 4, 4_i64).unwrap();
            e.list_insert(r, l, 5, 5_i64).unwrap();
            e.list_set(r, l, 8, 0_i64).unwrap();
        },
    ];

    for edit in edits {
        db.write(move |realm| {
            edit(realm.engine(), realm.realm_ptr(), list);
            Ok(())
        })
        .await
        .unwrap();
        let event = next(&mut events).await.unwrap().unwrap();
        assert_eq!(event.event_type(), EventType::Updated);
        let changes: &ListChangeSet = event.changes().unwrap();
        assert!(!changes.is_empty());
        assert_eq!(indices(changes.deletions()), covered(changes.deletion_ranges()));
        assert_eq!(indices(changes.insertions()), covered(changes.insertion_ranges()));
        assert_eq!(indices(changes.changes()), covered(changes.change_ranges()));
    }
}

// --- tracker reclamation ---

#[tokio::test]
async fn test_dropped_snapshot_is_closed_on_next_scan() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::open(Arc::clone(&engine), "reclaim.vellum").await.unwrap();

    let held = db.snapshot().unwrap();
    let held_version = held.version().unwrap();
    let held_ptr = held.realm_ptr();

    db.write(|_| Ok(())).await.unwrap();
    assert!(db.tracked_versions().contains(&held_version));
    assert!(!engine.is_closed(held_ptr));

    drop(held);
    db.write(|_| Ok(())).await.unwrap();

    assert!(engine.is_closed(held_ptr));
    assert!(!db.tracked_versions().contains(&held_version));
    assert_eq!(
        db.tracked_versions().into_iter().collect::<Vec<_>>(),
        vec![db.version().unwrap()]
    );
}

// --- ordering ---

#[tokio::test]
async fn test_realm_event_precedes_entity_event_of_same_version() {
    let engine = Arc::new(MemoryEngine::new());
    let db = Database::open(engine, "ordering.vellum").await.unwrap();
    let list = db
        .write(|realm| Ok(realm.engine().create_list(realm.realm_ptr())?))
        .await
        .unwrap();
    let mut versions = db.realm_changed().await.unwrap();
    let mut events = db.observe(ObservedList(list), KeyFilter::all()).await.unwrap();
    next(&mut events).await.unwrap().unwrap();

    for v in 0..20_i64 {
        db.write(move |realm| Ok(realm.engine().list_push(realm.realm_ptr(), list, v)?))
            .await
            .unwrap();
        let event = next(&mut events).await.unwrap().unwrap();
        // By the time the entity event exists, its version was published.
        let published = db.notifier().latest_version().unwrap();
        assert!(published >= event.version());

        let mut seen = next(&mut versions).await.unwrap();
        while seen < event.version() {
            seen = next(&mut versions).await.unwrap();
        }
        assert_eq!(seen, event.version());
    }
}

#[tokio::test]
async fn test_standalone_notifier_orders_version_before_entity() {
    let engine = MemoryEngine::new();
    let context = Arc::new(
        SchedulerContext::create(
            Arc::new(engine.clone()),
            &SchedulerConfig::new("ordering-notifier"),
        )
        .unwrap(),
    );
    let writer = engine
        .open(&OpenConfig::new("ordering-standalone.vellum"), None)
        .unwrap();
    engine.begin_write(writer).unwrap();
    let list = engine.create_list(writer).unwrap();
    engine.commit(writer).unwrap();

    let notifier = ChangeNotifier::new(
        OpenConfig::new("ordering-standalone.vellum"),
        context,
        NotifierConfig::default(),
    );
    let mut events = notifier
        .register_observer(ObservedList(list), KeyFilter::all())
        .await
        .unwrap();
    next(&mut events).await.unwrap().unwrap();

    engine.begin_write(writer).unwrap();
    engine.list_push(writer, list, "a").unwrap();
    engine.commit(writer).unwrap();

    let event = next(&mut events).await.unwrap().unwrap();
    assert_eq!(event.version(), VersionId::from(3_u64));
    assert_eq!(notifier.latest_version(), Some(VersionId::from(3_u64)));
    notifier.close().unwrap();
}
