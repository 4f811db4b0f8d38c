//! # Changeset Builders
//!
//! Pure translators from an engine change token ([`ChangesPtr`]) into value
//! types describing one transition of an observed entity.
//!
//! | Entity | Changeset | Content |
//! |--------|-----------|---------|
//! | list   | [`ListChangeSet`] | indices and coalesced ranges, per category |
//! | set    | [`SetChangeSet`] | insertion and deletion counts |
//! | map    | [`MapChangeSet`] | three disjoint key sets |
//! | object | [`ObjectChangeSet`] | names of changed properties |
//!
//! List ranges are decoded separately from the indices. Both must cover the
//! same positions; [`ListChangeSet::is_consistent`] checks it.
//!
//! Change tokens are only valid inside the engine callback that received
//! them, so builders must run synchronously in that callback.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use crate::engine::{ChangesPtr, NativeEngine};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

/// A run of consecutive positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    /// First position.
    pub start_index: usize,
    /// Number of positions.
    pub length: usize,
}

impl Range {
    /// Creates a range.
    #[must_use]
    pub const fn new(start_index: usize, length: usize) -> Self {
        Self {
            start_index,
            length,
        }
    }

    /// Creates a range from half-open `[from, to)` bounds.
    #[must_use]
    pub const fn from_bounds(from: usize, to: usize) -> Self {
        Self::new(from, to.saturating_sub(from))
    }

    /// One past the last position.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start_index + self.length
    }

    /// Returns `true` if `index` lies in the range.
    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        index >= self.start_index && index < self.end()
    }

    /// Iterates the covered positions.
    pub fn positions(&self) -> std::ops::Range<usize> {
        self.start_index..self.end()
    }
}

// ---------------------------------------------------------------------------
// Changesets
// ---------------------------------------------------------------------------

/// Positional changes of a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListChangeSet {
    deletions: Vec<usize>,
    insertions: Vec<usize>,
    changes: Vec<usize>,
    deletion_ranges: Vec<Range>,
    insertion_ranges: Vec<Range>,
    change_ranges: Vec<Range>,
}

impl ListChangeSet {
    /// Deleted positions in the previous list.
    #[must_use]
    pub fn deletions(&self) -> &[usize] {
        &self.deletions
    }

    /// Inserted positions in the new list.
    #[must_use]
    pub fn insertions(&self) -> &[usize] {
        &self.insertions
    }

    /// Modified positions in the new list.
    #[must_use]
    pub fn changes(&self) -> &[usize] {
        &self.changes
    }

    /// Deleted positions as ranges.
    #[must_use]
    pub fn deletion_ranges(&self) -> &[Range] {
        &self.deletion_ranges
    }

    /// Inserted positions as ranges.
    #[must_use]
    pub fn insertion_ranges(&self) -> &[Range] {
        &self.insertion_ranges
    }

    /// Modified positions as ranges.
    #[must_use]
    pub fn change_ranges(&self) -> &[Range] {
        &self.change_ranges
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.changes.is_empty()
    }

    /// Returns `true` if, for each category, the ranges cover exactly the
    /// listed indices.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        covers(&self.deletions, &self.deletion_ranges)
            && covers(&self.insertions, &self.insertion_ranges)
            && covers(&self.changes, &self.change_ranges)
    }
}

fn covers(indices: &[usize], ranges: &[Range]) -> bool {
    let from_indices: BTreeSet<usize> = indices.iter().copied().collect();
    let from_ranges: BTreeSet<usize> = ranges.iter().flat_map(Range::positions).collect();
    from_indices == from_ranges
}

/// Changes of a set. Sets have no stable positions, so only counts are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetChangeSet {
    /// Number of inserted elements.
    pub insertions: usize,
    /// Number of deleted elements.
    pub deletions: usize,
}

impl SetChangeSet {
    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insertions == 0 && self.deletions == 0
    }
}

/// Key changes of a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChangeSet<K> {
    /// Keys removed.
    pub deletions: Vec<K>,
    /// Keys added.
    pub insertions: Vec<K>,
    /// Keys whose value changed.
    pub changes: Vec<K>,
}

impl<K> Default for MapChangeSet<K> {
    fn default() -> Self {
        Self {
            deletions: Vec::new(),
            insertions: Vec::new(),
            changes: Vec::new(),
        }
    }
}

impl<K> MapChangeSet<K> {
    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.changes.is_empty()
    }
}

/// Changed properties of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChangeSet {
    /// Names of the changed properties.
    pub changed_fields: Vec<String>,
}

impl ObjectChangeSet {
    /// Returns `true` if `field` changed.
    #[must_use]
    pub fn is_field_changed(&self, field: &str) -> bool {
        self.changed_fields.iter().any(|f| f == field)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Decodes an engine change token.
pub trait ChangeSetBuilder {
    /// The decoded changeset.
    type ChangeSet: Send + 'static;

    /// Decodes `changes`. Must run inside the callback that received it.
    ///
    /// # Errors
    ///
    /// Unknown or mismatched token, or an inconsistent engine report.
    fn build(engine: &dyn NativeEngine, changes: ChangesPtr) -> Result<Self::ChangeSet>;
}

/// Builds [`ListChangeSet`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListChangeSetBuilder;

impl ChangeSetBuilder for ListChangeSetBuilder {
    type ChangeSet = ListChangeSet;

    fn build(engine: &dyn NativeEngine, changes: ChangesPtr) -> Result<ListChangeSet> {
        let indices = engine.collection_change_indices(changes)?;
        let ranges = engine.collection_change_ranges(changes)?;
        let to_ranges = |bounds: Vec<(usize, usize)>| -> Vec<Range> {
            bounds
                .into_iter()
                .map(|(from, to)| Range::from_bounds(from, to))
                .collect()
        };
        Ok(ListChangeSet {
            deletions: indices.deletions,
            insertions: indices.insertions,
            changes: indices.modifications,
            deletion_ranges: to_ranges(ranges.deletions),
            insertion_ranges: to_ranges(ranges.insertions),
            change_ranges: to_ranges(ranges.modifications),
        })
    }
}

/// Builds [`SetChangeSet`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetChangeSetBuilder;

impl ChangeSetBuilder for SetChangeSetBuilder {
    type ChangeSet = SetChangeSet;

    fn build(engine: &dyn NativeEngine, changes: ChangesPtr) -> Result<SetChangeSet> {
        let indices = engine.collection_change_indices(changes)?;
        Ok(SetChangeSet {
            insertions: indices.insertions.len(),
            deletions: indices.deletions.len(),
        })
    }
}

/// Builds [`MapChangeSet`]s with keys converted to `K`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapChangeSetBuilder<K = String>(PhantomData<fn() -> K>);

impl<K> ChangeSetBuilder for MapChangeSetBuilder<K>
where
    K: From<String> + Send + 'static,
{
    type ChangeSet = MapChangeSet<K>;

    fn build(engine: &dyn NativeEngine, changes: ChangesPtr) -> Result<MapChangeSet<K>> {
        let keys = engine.map_changes(changes)?;
        let deleted: BTreeSet<&str> = keys.deletions.iter().map(String::as_str).collect();
        let inserted: BTreeSet<&str> = keys.insertions.iter().map(String::as_str).collect();
        if let Some(key) = keys
            .modifications
            .iter()
            .find(|k| deleted.contains(k.as_str()) || inserted.contains(k.as_str()))
        {
            return Err(Error::InternalConsistency(format!(
                "map key '{key}' reported as both modified and inserted or deleted in {changes}"
            )));
        }
        if let Some(key) = keys.insertions.iter().find(|k| deleted.contains(k.as_str())) {
            return Err(Error::InternalConsistency(format!(
                "map key '{key}' reported as both inserted and deleted in {changes}"
            )));
        }
        let convert = |keys: Vec<String>| keys.into_iter().map(K::from).collect();
        Ok(MapChangeSet {
            deletions: convert(keys.deletions),
            insertions: convert(keys.insertions),
            changes: convert(keys.modifications),
        })
    }
}

/// Builds [`ObjectChangeSet`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectChangeSetBuilder;

impl ChangeSetBuilder for ObjectChangeSetBuilder {
    type ChangeSet = ObjectChangeSet;

    fn build(engine: &dyn NativeEngine, changes: ChangesPtr) -> Result<ObjectChangeSet> {
        let object = engine.object_changes(changes)?;
        Ok(ObjectChangeSet {
            changed_fields: object.modified_properties,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::memory::{MemoryEngine, Value};
    use crate::engine::{EntityKey, KeyFilter, OpenConfig, RealmPtr};
    use crate::scheduler::{SchedulerConfig, SchedulerContext};

    // --- value types ---

    #[test]
    fn test_range_bounds() {
        let range = Range::from_bounds(3, 6);
        assert_eq!(range, Range::new(3, 3));
        assert_eq!(range.end(), 6);
        assert!(range.contains(3));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert_eq!(range.positions().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(Range::from_bounds(4, 4).length, 0);
    }

    #[test]
    fn test_consistency_detects_mismatch() {
        let mut changes = ListChangeSet {
            deletions: vec![0, 1, 4],
            deletion_ranges: vec![Range::new(0, 2), Range::new(4, 1)],
            ..ListChangeSet::default()
        };
        assert!(changes.is_consistent());
        changes.deletion_ranges = vec![Range::new(0, 3)];
        assert!(!changes.is_consistent());
    }

    #[test]
    fn test_object_changeset_lookup() {
        let changes = ObjectChangeSet {
            changed_fields: vec!["name".into()],
        };
        assert!(changes.is_field_changed("name"));
        assert!(!changes.is_field_changed("age"));
    }

    // --- builders against the memory engine ---

    type Captured<C> = Arc<Mutex<Vec<Result<C>>>>;

    struct Harness {
        engine: MemoryEngine,
        context: SchedulerContext,
        writer: RealmPtr,
        observer: RealmPtr,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let engine = MemoryEngine::new();
            let context =
                SchedulerContext::create(Arc::new(engine.clone()), &SchedulerConfig::new(name))
                    .unwrap();
            let writer = engine.open(&OpenConfig::new(name), None).unwrap();
            let scheduler = context.scheduler();
            let open = engine.clone();
            let config = OpenConfig::new(name);
            let observer = context
                .run_blocking(move || open.open(&config, scheduler))
                .unwrap()
                .unwrap();
            Self {
                engine,
                context,
                writer,
                observer,
            }
        }

        fn write<T>(&self, f: impl FnOnce(&MemoryEngine, RealmPtr) -> T) -> T {
            self.engine.begin_write(self.writer).unwrap();
            let out = f(&self.engine, self.writer);
            self.engine.commit(self.writer).unwrap();
            out
        }

        fn capture<B: ChangeSetBuilder + 'static>(&self, entity: EntityKey) -> Captured<B::ChangeSet> {
            let captured: Captured<B::ChangeSet> = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&captured);
            let engine = self.engine.clone();
            let decode = self.engine.clone();
            let observer = self.observer;
            self.context
                .run_blocking(move || {
                    engine.register_change_callback(
                        observer,
                        entity,
                        &KeyFilter::all(),
                        Arc::new(move |changes| sink.lock().push(B::build(&decode, changes))),
                    )
                })
                .unwrap()
                .unwrap();
            self.flush();
            captured
        }

        fn flush(&self) {
            self.context.run_blocking(|| ()).unwrap();
        }
    }

    #[test]
    fn test_list_builder_initial_is_empty() {
        let h = Harness::new("cs-list-initial");
        let list = h.write(|e, w| e.create_list(w).unwrap());
        let captured = h.capture::<ListChangeSetBuilder>(list);
        let events = captured.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_list_builder_decodes_transition() {
        let h = Harness::new("cs-list");
        let list = h.write(|e, w| {
            let list = e.create_list(w).unwrap();
            for v in 0..5_i64 {
                e.list_push(w, list, v).unwrap();
            }
            list
        });
        let captured = h.capture::<ListChangeSetBuilder>(list);

        h.write(|e, w| {
            e.list_remove(w, list, 1).unwrap();
            e.list_remove(w, list, 1).unwrap();
            e.list_set(w, list, 0, 100_i64).unwrap();
            e.list_push(w, list, 7_i64).unwrap();
        });
        h.flush();

        let events = captured.lock();
        assert_eq!(events.len(), 2);
        let changes = events[1].as_ref().unwrap();
        assert_eq!(changes.deletions(), &[1, 2]);
        assert_eq!(changes.deletion_ranges(), &[Range::new(1, 2)]);
        assert_eq!(changes.insertions(), &[3]);
        assert_eq!(changes.changes(), &[0]);
        assert!(changes.is_consistent());
    }

    #[test]
    fn test_list_ranges_match_indices_under_random_edits() {
        let h = Harness::new("cs-list-random");
        let list = h.write(|e, w| {
            let list = e.create_list(w).unwrap();
            for v in 0..20_i64 {
                e.list_push(w, list, v).unwrap();
            }
            list
        });
        let captured = h.capture::<ListChangeSetBuilder>(list);

        // Deterministic LCG so failures reproduce.
        let mut seed: u64 = 0x5eed;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            usize::try_from(seed >> 33).unwrap() % bound.max(1)
        };
        for round in 0..50_i64 {
            h.write(|e, w| {
                for _ in 0..1 + next(6) {
                    let len = e.list_values(w, list).unwrap().len();
                    match next(3) {
                        0 if len > 0 => {
                            e.list_remove(w, list, next(len)).unwrap();
                        }
                        1 if len > 0 => {
                            e.list_set(w, list, next(len), round * 1000).unwrap();
                        }
                        _ => {
                            e.list_insert(w, list, next(len + 1), round).unwrap();
                        }
                    }
                }
            });
            h.flush();
        }

        let events = captured.lock();
        assert!(events.len() > 40);
        for changes in events.iter() {
            assert!(changes.as_ref().unwrap().is_consistent());
        }
    }

    #[test]
    fn test_set_builder_counts() {
        let h = Harness::new("cs-set");
        let set = h.write(|e, w| {
            let set = e.create_set(w).unwrap();
            e.set_insert(w, set, "a").unwrap();
            e.set_insert(w, set, "b").unwrap();
            set
        });
        let captured = h.capture::<SetChangeSetBuilder>(set);
        h.write(|e, w| {
            e.set_remove(w, set, &Value::from("a")).unwrap();
            e.set_insert(w, set, "c").unwrap();
            e.set_insert(w, set, "d").unwrap();
        });
        h.flush();

        let events = captured.lock();
        assert_eq!(
            *events[1].as_ref().unwrap(),
            SetChangeSet {
                insertions: 2,
                deletions: 1
            }
        );
    }

    #[test]
    fn test_map_builder_disjoint_keys() {
        let h = Harness::new("cs-map");
        let map = h.write(|e, w| {
            let map = e.create_map(w).unwrap();
            e.map_insert(w, map, "keep", 1_i64).unwrap();
            e.map_insert(w, map, "drop", 2_i64).unwrap();
            map
        });
        let captured = h.capture::<MapChangeSetBuilder>(map);
        h.write(|e, w| {
            e.map_insert(w, map, "keep", 10_i64).unwrap();
            e.map_remove(w, map, "drop").unwrap();
            e.map_insert(w, map, "new", 3_i64).unwrap();
        });
        h.flush();

        let events = captured.lock();
        let changes = events[1].as_ref().unwrap();
        assert_eq!(changes.deletions, vec!["drop".to_string()]);
        assert_eq!(changes.insertions, vec!["new".to_string()]);
        assert_eq!(changes.changes, vec!["keep".to_string()]);
    }

    #[test]
    fn test_object_builder() {
        let h = Harness::new("cs-object");
        let object = h.write(|e, w| {
            let object = e.create_object(w, "Dog").unwrap();
            e.set_property(w, object, "name", "rex").unwrap();
            object
        });
        let captured = h.capture::<ObjectChangeSetBuilder>(object);
        h.write(|e, w| e.set_property(w, object, "age", 3_i64).unwrap());
        h.flush();

        let events = captured.lock();
        assert_eq!(
            events[1].as_ref().unwrap().changed_fields,
            vec!["age".to_string()]
        );
    }

    #[test]
    fn test_builder_rejects_mismatched_token() {
        let h = Harness::new("cs-mismatch");
        let map = h.write(|e, w| e.create_map(w).unwrap());
        let captured = h.capture::<ListChangeSetBuilder>(map);
        let events = captured.lock();
        assert!(matches!(events[0], Err(Error::Engine(_))));
    }
}
