//! In-process [`NativeEngine`] with copy-on-write versions.
//!
//! Every commit publishes an immutable snapshot (a persistent
//! [`im::OrdMap`] of entities) under version `latest + 1`. Versions that no
//! open live handle, pinned frozen handle or pending change callback still
//! refers to are reclaimed after each commit, so frozen handles that were
//! never pinned with `begin_read` can lose their data.
//!
//! Callbacks are computed under the engine lock and invoked after it is
//! released, so a callback may call back into the engine (release its own
//! token, read through a handle, freeze).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use im::OrdMap;
use parking_lot::Mutex;

use super::{
    ChangeCallback, ChangesPtr, ClassInfo, CollectionIndices, CollectionRanges, EngineError,
    EntityKey, EntityKind, KeyFilter, MapKeyChanges, NativeEngine, NotificationTokenPtr,
    ObjectChanges, OpenConfig, RealmCallback, RealmPtr, SchedulerExecutor, SchedulerPtr,
    SchemaInfo,
};

// ---------------------------------------------------------------------------
// Values and entities
// ---------------------------------------------------------------------------

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// UTF-8 string.
    String(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ListElement {
    id: u64,
    value: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Entity {
    Object {
        class: String,
        properties: BTreeMap<String, Value>,
    },
    List(Vec<ListElement>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<String, Value>),
}

impl Entity {
    fn kind(&self) -> EntityKind {
        match self {
            Self::Object { .. } => EntityKind::Object,
            Self::List(_) => EntityKind::List,
            Self::Set(_) => EntityKind::Set,
            Self::Map(_) => EntityKind::Map,
        }
    }
}

#[derive(Debug, Clone)]
struct DbSnapshot {
    entities: OrdMap<EntityKey, Entity>,
    schema: Arc<SchemaInfo>,
}

impl DbSnapshot {
    fn empty() -> Self {
        Self {
            entities: OrdMap::new(),
            schema: Arc::new(SchemaInfo::default()),
        }
    }

    fn entity(&self, key: EntityKey, expected: EntityKind) -> Result<&Entity, EngineError> {
        let entity = self
            .entities
            .get(&key)
            .ok_or(EngineError::EntityNotFound(key))?;
        if entity.kind() == expected {
            Ok(entity)
        } else {
            Err(EngineError::WrongEntityKind {
                entity: key,
                expected,
            })
        }
    }

    fn entity_mut(
        &mut self,
        key: EntityKey,
        expected: EntityKind,
    ) -> Result<&mut Entity, EngineError> {
        let entity = self
            .entities
            .get_mut(&key)
            .ok_or(EngineError::EntityNotFound(key))?;
        if entity.kind() == expected {
            Ok(entity)
        } else {
            Err(EngineError::WrongEntityKind {
                entity: key,
                expected,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct FileState {
    versions: BTreeMap<u64, Arc<DbSnapshot>>,
    latest: u64,
    writer: Option<RealmPtr>,
    next_key: u64,
}

impl FileState {
    fn new() -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(1, Arc::new(DbSnapshot::empty()));
        Self {
            versions,
            latest: 1,
            writer: None,
            next_key: 0,
        }
    }

    fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }
}

struct RealmState {
    path: String,
    frozen: bool,
    closed: bool,
    version: u64,
    scheduler: Option<SchedulerPtr>,
    pinned: bool,
    write: Option<DbSnapshot>,
    notified_version: u64,
    notified_schema: u64,
}

enum TokenKind {
    Realm(RealmCallback),
    Schema(RealmCallback),
    Entity {
        entity: EntityKey,
        filter: KeyFilter,
        callback: ChangeCallback,
        seen_version: Option<u64>,
    },
}

struct TokenState {
    realm: RealmPtr,
    kind: TokenKind,
}

#[derive(Debug, Clone)]
enum ChangeRecord {
    Collection {
        indices: CollectionIndices,
        ranges: CollectionRanges,
    },
    Map(MapKeyChanges),
    Object(ObjectChanges),
}

enum Action {
    Notify(RealmCallback),
    Changes(ChangeCallback, ChangesPtr),
}

struct PendingCall {
    token: NotificationTokenPtr,
    action: Action,
}

#[derive(Default)]
struct State {
    files: HashMap<String, FileState>,
    realms: HashMap<RealmPtr, RealmState>,
    schedulers: HashMap<SchedulerPtr, Arc<dyn SchedulerExecutor>>,
    tokens: BTreeMap<NotificationTokenPtr, TokenState>,
    changes: HashMap<ChangesPtr, ChangeRecord>,
    next_id: u64,
}

fn open_handle(
    realms: &HashMap<RealmPtr, RealmState>,
    realm: RealmPtr,
) -> Result<&RealmState, EngineError> {
    let handle = realms.get(&realm).ok_or(EngineError::UnknownRealm(realm))?;
    if handle.closed {
        return Err(EngineError::Closed(realm));
    }
    Ok(handle)
}

fn check_affinity(
    schedulers: &HashMap<SchedulerPtr, Arc<dyn SchedulerExecutor>>,
    realm: RealmPtr,
    handle: &RealmState,
) -> Result<(), EngineError> {
    if handle.frozen {
        return Ok(());
    }
    match handle.scheduler.and_then(|s| schedulers.get(&s)) {
        Some(executor) if !executor.is_on_context() => Err(EngineError::WrongThread(realm)),
        _ => Ok(()),
    }
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Looks up an open live handle and checks the caller's thread.
    fn live_handle(&self, realm: RealmPtr) -> Result<&RealmState, EngineError> {
        let handle = open_handle(&self.realms, realm)?;
        if handle.frozen {
            return Err(EngineError::Frozen(realm));
        }
        check_affinity(&self.schedulers, realm, handle)?;
        Ok(handle)
    }

    fn read<T>(
        &self,
        realm: RealmPtr,
        f: impl FnOnce(&DbSnapshot) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let handle = open_handle(&self.realms, realm)?;
        check_affinity(&self.schedulers, realm, handle)?;
        if let Some(working) = &handle.write {
            return f(working);
        }
        let snapshot = self
            .files
            .get(&handle.path)
            .and_then(|file| file.versions.get(&handle.version))
            .ok_or(EngineError::VersionReclaimed {
                realm,
                version: handle.version,
            })?;
        f(snapshot)
    }

    fn write<T>(
        &mut self,
        realm: RealmPtr,
        f: impl FnOnce(&mut DbSnapshot, &mut FileState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.live_handle(realm)?;
        let Self { realms, files, .. } = self;
        let handle = realms
            .get_mut(&realm)
            .ok_or(EngineError::UnknownRealm(realm))?;
        let working = handle
            .write
            .as_mut()
            .ok_or(EngineError::NotInTransaction(realm))?;
        let file = files
            .get_mut(&handle.path)
            .ok_or(EngineError::UnknownRealm(realm))?;
        f(working, file)
    }

    fn register_token(
        &mut self,
        realm: RealmPtr,
        kind: TokenKind,
    ) -> Result<NotificationTokenPtr, EngineError> {
        let handle = self.live_handle(realm)?;
        if handle.scheduler.is_none() {
            return Err(EngineError::NoScheduler(realm));
        }
        let token = NotificationTokenPtr::from_raw(self.allocate_id());
        self.tokens.insert(token, TokenState { realm, kind });
        Ok(token)
    }

    /// Advances a live handle to the latest version and collects the
    /// callbacks that advance triggers, in delivery order.
    fn advance(&mut self, realm: RealmPtr) -> Result<(bool, Vec<PendingCall>), EngineError> {
        let Self {
            files,
            realms,
            tokens,
            changes,
            next_id,
            ..
        } = self;
        let handle = realms
            .get_mut(&realm)
            .ok_or(EngineError::UnknownRealm(realm))?;
        if handle.write.is_some() {
            return Ok((false, Vec::new()));
        }
        let file = files
            .get(&handle.path)
            .ok_or(EngineError::UnknownRealm(realm))?;
        let latest = file.latest;
        let current = file
            .versions
            .get(&latest)
            .cloned()
            .ok_or(EngineError::VersionReclaimed {
                realm,
                version: latest,
            })?;

        let advanced = handle.version != latest;
        handle.version = latest;
        let notify_realm = handle.notified_version != latest;
        let notify_schema = handle.notified_schema != current.schema.schema_version;
        handle.notified_version = latest;
        handle.notified_schema = current.schema.schema_version;

        let mut calls = Vec::new();
        for (id, token) in tokens.iter().filter(|(_, t)| t.realm == realm) {
            if let TokenKind::Schema(callback) = &token.kind {
                if notify_schema {
                    calls.push(PendingCall {
                        token: *id,
                        action: Action::Notify(Arc::clone(callback)),
                    });
                }
            }
        }
        for (id, token) in tokens.iter().filter(|(_, t)| t.realm == realm) {
            if let TokenKind::Realm(callback) = &token.kind {
                if notify_realm {
                    calls.push(PendingCall {
                        token: *id,
                        action: Action::Notify(Arc::clone(callback)),
                    });
                }
            }
        }

        for (id, token) in tokens.iter_mut() {
            if token.realm != realm {
                continue;
            }
            let TokenKind::Entity {
                entity,
                filter,
                callback,
                seen_version,
            } = &mut token.kind
            else {
                continue;
            };
            let key = *entity;
            let now = current.entities.get(&key);
            let record = match *seen_version {
                None => Some(initial_record(now)),
                Some(seen) if seen == latest => None,
                Some(seen) => {
                    let before = file
                        .versions
                        .get(&seen)
                        .and_then(|snapshot| snapshot.entities.get(&key));
                    diff_entity(before, now, filter)
                }
            };
            *seen_version = Some(latest);
            if let Some(record) = record {
                *next_id += 1;
                let ptr = ChangesPtr::from_raw(*next_id);
                changes.insert(ptr, record);
                calls.push(PendingCall {
                    token: *id,
                    action: Action::Changes(Arc::clone(callback), ptr),
                });
            }
        }

        Ok((advanced, calls))
    }

    /// Drops versions of `path` that nothing refers to any more.
    fn compact(&mut self, path: &str) {
        let mut keep = BTreeSet::new();
        for handle in self.realms.values() {
            if handle.path == path && !handle.closed && (!handle.frozen || handle.pinned) {
                keep.insert(handle.version);
            }
        }
        for token in self.tokens.values() {
            if let TokenKind::Entity {
                seen_version: Some(seen),
                ..
            } = &token.kind
            {
                if self
                    .realms
                    .get(&token.realm)
                    .is_some_and(|handle| handle.path == path)
                {
                    keep.insert(*seen);
                }
            }
        }
        if let Some(file) = self.files.get_mut(path) {
            keep.insert(file.latest);
            file.versions.retain(|version, _| keep.contains(version));
        }
    }

    fn scheduled_live_handles(&self, path: &str) -> Vec<(RealmPtr, Arc<dyn SchedulerExecutor>)> {
        self.realms
            .iter()
            .filter(|(_, h)| h.path == path && !h.closed && !h.frozen)
            .filter_map(|(ptr, h)| {
                h.scheduler
                    .and_then(|s| self.schedulers.get(&s))
                    .map(|executor| (*ptr, Arc::clone(executor)))
            })
            .collect()
    }

    fn change_record(&self, changes: ChangesPtr) -> Result<&ChangeRecord, EngineError> {
        self.changes
            .get(&changes)
            .ok_or(EngineError::UnknownChanges(changes))
    }
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

/// Coalesces sorted positions into `[from, to)` ranges.
pub(crate) fn coalesce_ranges(positions: &[usize]) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &position in positions {
        match ranges.last_mut() {
            Some((_, to)) if *to == position => *to += 1,
            _ => ranges.push((position, position + 1)),
        }
    }
    ranges
}

fn collection_record(indices: CollectionIndices) -> ChangeRecord {
    let ranges = CollectionRanges {
        deletions: coalesce_ranges(&indices.deletions),
        insertions: coalesce_ranges(&indices.insertions),
        modifications: coalesce_ranges(&indices.modifications),
    };
    ChangeRecord::Collection { indices, ranges }
}

fn entity_len(entity: &Entity) -> usize {
    match entity {
        Entity::List(items) => items.len(),
        Entity::Set(items) => items.len(),
        Entity::Map(items) => items.len(),
        Entity::Object { .. } => 0,
    }
}

fn initial_record(entity: Option<&Entity>) -> ChangeRecord {
    match entity {
        None => ChangeRecord::Object(ObjectChanges {
            deleted: true,
            modified_properties: Vec::new(),
        }),
        Some(Entity::Object { .. }) => ChangeRecord::Object(ObjectChanges::default()),
        Some(Entity::Map(_)) => ChangeRecord::Map(MapKeyChanges::default()),
        Some(Entity::List(_) | Entity::Set(_)) => collection_record(CollectionIndices::default()),
    }
}

fn removed_record(entity: &Entity) -> ChangeRecord {
    match entity {
        Entity::Object { .. } => ChangeRecord::Object(ObjectChanges {
            deleted: true,
            modified_properties: Vec::new(),
        }),
        Entity::Map(items) => ChangeRecord::Map(MapKeyChanges {
            deletions: items.keys().cloned().collect(),
            ..MapKeyChanges::default()
        }),
        other => collection_record(CollectionIndices {
            deletions: (0..entity_len(other)).collect(),
            ..CollectionIndices::default()
        }),
    }
}

fn created_record(entity: &Entity) -> ChangeRecord {
    match entity {
        Entity::Object { properties, .. } => ChangeRecord::Object(ObjectChanges {
            deleted: false,
            modified_properties: properties.keys().cloned().collect(),
        }),
        Entity::Map(items) => ChangeRecord::Map(MapKeyChanges {
            insertions: items.keys().cloned().collect(),
            ..MapKeyChanges::default()
        }),
        other => collection_record(CollectionIndices {
            insertions: (0..entity_len(other)).collect(),
            ..CollectionIndices::default()
        }),
    }
}

fn diff_list(before: &[ListElement], after: &[ListElement]) -> CollectionIndices {
    let surviving: HashSet<u64> = after.iter().map(|e| e.id).collect();
    let previous: HashMap<u64, &Value> = before.iter().map(|e| (e.id, &e.value)).collect();

    let deletions = before
        .iter()
        .enumerate()
        .filter(|(_, e)| !surviving.contains(&e.id))
        .map(|(i, _)| i)
        .collect();
    let mut insertions = Vec::new();
    let mut modifications = Vec::new();
    for (i, element) in after.iter().enumerate() {
        match previous.get(&element.id) {
            None => insertions.push(i),
            Some(old) if **old != element.value => modifications.push(i),
            Some(_) => {}
        }
    }
    CollectionIndices {
        deletions,
        insertions,
        modifications,
    }
}

fn diff_set(before: &BTreeSet<Value>, after: &BTreeSet<Value>) -> CollectionIndices {
    CollectionIndices {
        deletions: before
            .iter()
            .enumerate()
            .filter(|(_, v)| !after.contains(*v))
            .map(|(i, _)| i)
            .collect(),
        insertions: after
            .iter()
            .enumerate()
            .filter(|(_, v)| !before.contains(*v))
            .map(|(i, _)| i)
            .collect(),
        modifications: Vec::new(),
    }
}

fn diff_map(before: &BTreeMap<String, Value>, after: &BTreeMap<String, Value>) -> MapKeyChanges {
    let mut changes = MapKeyChanges::default();
    for (key, value) in before {
        match after.get(key) {
            None => changes.deletions.push(key.clone()),
            Some(new) if new != value => changes.modifications.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in after.keys() {
        if !before.contains_key(key) {
            changes.insertions.push(key.clone());
        }
    }
    changes
}

fn diff_object(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
    filter: &KeyFilter,
) -> Vec<String> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    names
        .into_iter()
        .filter(|name| before.get(*name) != after.get(*name) && filter.matches(name))
        .cloned()
        .collect()
}

/// Returns `None` when the transition does not concern the observer.
fn diff_entity(
    before: Option<&Entity>,
    after: Option<&Entity>,
    filter: &KeyFilter,
) -> Option<ChangeRecord> {
    match (before, after) {
        (None, None) => None,
        (Some(old), None) => Some(removed_record(old)),
        (None, Some(new)) => Some(created_record(new)),
        (Some(old), Some(new)) if old == new => None,
        (Some(old), Some(new)) => match (old, new) {
            (Entity::Object { properties: a, .. }, Entity::Object { properties: b, .. }) => {
                let modified = diff_object(a, b, filter);
                (!modified.is_empty()).then(|| {
                    ChangeRecord::Object(ObjectChanges {
                        deleted: false,
                        modified_properties: modified,
                    })
                })
            }
            (Entity::List(a), Entity::List(b)) => Some(collection_record(diff_list(a, b))),
            (Entity::Set(a), Entity::Set(b)) => Some(collection_record(diff_set(a, b))),
            (Entity::Map(a), Entity::Map(b)) => Some(ChangeRecord::Map(diff_map(a, b))),
            _ => Some(created_record(new)),
        },
    }
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

/// An in-process engine. Clones share the same databases.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryEngine")
            .field("files", &state.files.len())
            .field("open_handles", &state.realms.values().filter(|h| !h.closed).count())
            .field("tokens", &state.tokens.len())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Creates an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances `realm` and invokes the callbacks the advance triggers.
    ///
    /// This is the work the engine posts onto a handle's scheduler after a
    /// commit; `refresh` runs it synchronously.
    fn deliver(&self, realm: RealmPtr) -> Result<bool, EngineError> {
        let (advanced, calls) = {
            let mut state = self.state.lock();
            let path = state.live_handle(realm)?.path.clone();
            let outcome = state.advance(realm)?;
            state.compact(&path);
            outcome
        };

        for call in calls {
            let live = self.state.lock().tokens.contains_key(&call.token);
            match call.action {
                Action::Notify(callback) => {
                    if live {
                        callback();
                    }
                }
                Action::Changes(callback, changes) => {
                    if live {
                        callback(changes);
                    }
                    self.state.lock().changes.remove(&changes);
                }
            }
        }
        Ok(advanced)
    }

    fn post_deliveries(&self, targets: Vec<(RealmPtr, Arc<dyn SchedulerExecutor>)>) {
        for (realm, executor) in targets {
            let engine = self.clone();
            executor.post(Box::new(move || {
                if let Err(e) = engine.deliver(realm) {
                    tracing::trace!(%realm, error = %e, "skipped notification delivery");
                }
            }));
        }
    }

    // -- mutation (inside a write transaction) ------------------------------

    /// Adds a class to the schema.
    ///
    /// # Errors
    ///
    /// No open transaction, or the class already exists.
    pub fn add_class(&self, realm: RealmPtr, class: ClassInfo) -> Result<(), EngineError> {
        self.state.lock().write(realm, |working, _| {
            if working.schema.classes.iter().any(|c| c.name == class.name) {
                return Err(EngineError::DuplicateClass(class.name));
            }
            let mut schema = (*working.schema).clone();
            schema.schema_version += 1;
            schema.classes.push(class);
            working.schema = Arc::new(schema);
            Ok(())
        })
    }

    /// Creates an object of `class` with no properties set.
    ///
    /// # Errors
    ///
    /// No open transaction.
    pub fn create_object(&self, realm: RealmPtr, class: &str) -> Result<EntityKey, EngineError> {
        self.create(
            realm,
            Entity::Object {
                class: class.to_string(),
                properties: BTreeMap::new(),
            },
        )
    }

    /// Creates an empty list.
    ///
    /// # Errors
    ///
    /// No open transaction.
    pub fn create_list(&self, realm: RealmPtr) -> Result<EntityKey, EngineError> {
        self.create(realm, Entity::List(Vec::new()))
    }

    /// Creates an empty set.
    ///
    /// # Errors
    ///
    /// No open transaction.
    pub fn create_set(&self, realm: RealmPtr) -> Result<EntityKey, EngineError> {
        self.create(realm, Entity::Set(BTreeSet::new()))
    }

    /// Creates an empty dictionary.
    ///
    /// # Errors
    ///
    /// No open transaction.
    pub fn create_map(&self, realm: RealmPtr) -> Result<EntityKey, EngineError> {
        self.create(realm, Entity::Map(BTreeMap::new()))
    }

    fn create(&self, realm: RealmPtr, entity: Entity) -> Result<EntityKey, EngineError> {
        self.state.lock().write(realm, |working, file| {
            let key = EntityKey::from_raw(file.allocate_key());
            working.entities.insert(key, entity);
            Ok(key)
        })
    }

    /// Deletes an entity of any kind.
    ///
    /// # Errors
    ///
    /// No open transaction, or the entity does not exist.
    pub fn delete_entity(&self, realm: RealmPtr, entity: EntityKey) -> Result<(), EngineError> {
        self.state.lock().write(realm, |working, _| {
            working
                .entities
                .remove(&entity)
                .map(|_| ())
                .ok_or(EngineError::EntityNotFound(entity))
        })
    }

    /// Sets a property of an object.
    ///
    /// # Errors
    ///
    /// No open transaction, missing object.
    pub fn set_property(
        &self,
        realm: RealmPtr,
        object: EntityKey,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, _| {
            if let Entity::Object { properties, .. } =
                working.entity_mut(object, EntityKind::Object)?
            {
                properties.insert(property.to_string(), value);
            }
            Ok(())
        })
    }

    /// Appends to a list.
    ///
    /// # Errors
    ///
    /// No open transaction, missing list.
    pub fn list_push(
        &self,
        realm: RealmPtr,
        list: EntityKey,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, file| {
            let id = file.allocate_key();
            if let Entity::List(items) = working.entity_mut(list, EntityKind::List)? {
                items.push(ListElement { id, value });
            }
            Ok(())
        })
    }

    /// Inserts into a list at `index`.
    ///
    /// # Errors
    ///
    /// No open transaction, missing list, `index > len`.
    pub fn list_insert(
        &self,
        realm: RealmPtr,
        list: EntityKey,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, file| {
            let id = file.allocate_key();
            if let Entity::List(items) = working.entity_mut(list, EntityKind::List)? {
                if index > items.len() {
                    return Err(EngineError::IndexOutOfBounds {
                        entity: list,
                        index,
                        len: items.len(),
                    });
                }
                items.insert(index, ListElement { id, value });
            }
            Ok(())
        })
    }

    /// Replaces the value at `index`, keeping the element's identity.
    ///
    /// # Errors
    ///
    /// No open transaction, missing list, `index >= len`.
    pub fn list_set(
        &self,
        realm: RealmPtr,
        list: EntityKey,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, _| {
            if let Entity::List(items) = working.entity_mut(list, EntityKind::List)? {
                let len = items.len();
                let slot = items.get_mut(index).ok_or(EngineError::IndexOutOfBounds {
                    entity: list,
                    index,
                    len,
                })?;
                slot.value = value;
            }
            Ok(())
        })
    }

    /// Removes the element at `index` and returns its value.
    ///
    /// # Errors
    ///
    /// No open transaction, missing list, `index >= len`.
    pub fn list_remove(
        &self,
        realm: RealmPtr,
        list: EntityKey,
        index: usize,
    ) -> Result<Value, EngineError> {
        self.state.lock().write(realm, |working, _| {
            match working.entity_mut(list, EntityKind::List)? {
                Entity::List(items) if index < items.len() => Ok(items.remove(index).value),
                other => Err(EngineError::IndexOutOfBounds {
                    entity: list,
                    index,
                    len: entity_len(other),
                }),
            }
        })
    }

    /// Adds a value to a set. Returns `false` if it was already present.
    ///
    /// # Errors
    ///
    /// No open transaction, missing set.
    pub fn set_insert(
        &self,
        realm: RealmPtr,
        set: EntityKey,
        value: impl Into<Value>,
    ) -> Result<bool, EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, _| {
            match working.entity_mut(set, EntityKind::Set)? {
                Entity::Set(items) => Ok(items.insert(value)),
                _ => Ok(false),
            }
        })
    }

    /// Removes a value from a set. Returns `false` if it was absent.
    ///
    /// # Errors
    ///
    /// No open transaction, missing set.
    pub fn set_remove(
        &self,
        realm: RealmPtr,
        set: EntityKey,
        value: &Value,
    ) -> Result<bool, EngineError> {
        self.state.lock().write(realm, |working, _| {
            match working.entity_mut(set, EntityKind::Set)? {
                Entity::Set(items) => Ok(items.remove(value)),
                _ => Ok(false),
            }
        })
    }

    /// Inserts or replaces a dictionary entry, returning the previous value.
    ///
    /// # Errors
    ///
    /// No open transaction, missing dictionary.
    pub fn map_insert(
        &self,
        realm: RealmPtr,
        map: EntityKey,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, EngineError> {
        let value = value.into();
        self.state.lock().write(realm, |working, _| {
            match working.entity_mut(map, EntityKind::Map)? {
                Entity::Map(items) => Ok(items.insert(key.to_string(), value)),
                _ => Ok(None),
            }
        })
    }

    /// Removes a dictionary entry, returning its value.
    ///
    /// # Errors
    ///
    /// No open transaction, missing dictionary.
    pub fn map_remove(
        &self,
        realm: RealmPtr,
        map: EntityKey,
        key: &str,
    ) -> Result<Option<Value>, EngineError> {
        self.state.lock().write(realm, |working, _| {
            match working.entity_mut(map, EntityKind::Map)? {
                Entity::Map(items) => Ok(items.remove(key)),
                _ => Ok(None),
            }
        })
    }

    // -- reads --------------------------------------------------------------

    /// Reads a property of an object.
    ///
    /// # Errors
    ///
    /// Closed handle, reclaimed version, missing object.
    pub fn get_property(
        &self,
        realm: RealmPtr,
        object: EntityKey,
        property: &str,
    ) -> Result<Option<Value>, EngineError> {
        self.state.lock().read(realm, |snapshot| {
            match snapshot.entity(object, EntityKind::Object)? {
                Entity::Object { properties, .. } => Ok(properties.get(property).cloned()),
                _ => Ok(None),
            }
        })
    }

    /// Returns the class name of an object.
    ///
    /// # Errors
    ///
    /// Closed handle, reclaimed version, missing object.
    pub fn class_of(&self, realm: RealmPtr, object: EntityKey) -> Result<String, EngineError> {
        self.state.lock().read(realm, |snapshot| {
            match snapshot.entity(object, EntityKind::Object)? {
                Entity::Object { class, .. } => Ok(class.clone()),
                _ => Err(EngineError::EntityNotFound(object)),
            }
        })
    }

    /// Returns the values of a list in order.
    ///
    /// # Errors
    ///
    /// Closed handle, reclaimed version, missing list.
    pub fn list_values(&self, realm: RealmPtr, list: EntityKey) -> Result<Vec<Value>, EngineError> {
        self.state.lock().read(realm, |snapshot| {
            match snapshot.entity(list, EntityKind::List)? {
                Entity::List(items) => Ok(items.iter().map(|e| e.value.clone()).collect()),
                _ => Ok(Vec::new()),
            }
        })
    }

    /// Returns the values of a set in sorted order.
    ///
    /// # Errors
    ///
    /// Closed handle, reclaimed version, missing set.
    pub fn set_values(&self, realm: RealmPtr, set: EntityKey) -> Result<Vec<Value>, EngineError> {
        self.state.lock().read(realm, |snapshot| {
            match snapshot.entity(set, EntityKind::Set)? {
                Entity::Set(items) => Ok(items.iter().cloned().collect()),
                _ => Ok(Vec::new()),
            }
        })
    }

    /// Returns the entries of a dictionary sorted by key.
    ///
    /// # Errors
    ///
    /// Closed handle, reclaimed version, missing dictionary.
    pub fn map_entries(
        &self,
        realm: RealmPtr,
        map: EntityKey,
    ) -> Result<Vec<(String, Value)>, EngineError> {
        self.state.lock().read(realm, |snapshot| {
            match snapshot.entity(map, EntityKind::Map)? {
                Entity::Map(items) => Ok(items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()),
                _ => Ok(Vec::new()),
            }
        })
    }

    // -- diagnostics --------------------------------------------------------

    /// Number of handles that are open.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.state.lock().realms.values().filter(|h| !h.closed).count()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Number of live schedulers.
    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.state.lock().schedulers.len()
    }

    /// Versions of `path` still held in memory, ascending.
    #[must_use]
    pub fn retained_versions(&self, path: &str) -> Vec<u64> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|file| file.versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if `realm` is a frozen handle that pinned its version.
    #[must_use]
    pub fn is_pinned(&self, realm: RealmPtr) -> bool {
        self.state
            .lock()
            .realms
            .get(&realm)
            .is_some_and(|h| h.frozen && h.pinned && !h.closed)
    }
}

impl NativeEngine for MemoryEngine {
    fn create_scheduler(
        &self,
        executor: Arc<dyn SchedulerExecutor>,
    ) -> Result<SchedulerPtr, EngineError> {
        let mut state = self.state.lock();
        let scheduler = SchedulerPtr::from_raw(state.allocate_id());
        state.schedulers.insert(scheduler, executor);
        Ok(scheduler)
    }

    fn release_scheduler(&self, scheduler: SchedulerPtr) {
        self.state.lock().schedulers.remove(&scheduler);
    }

    fn open(
        &self,
        config: &OpenConfig,
        scheduler: Option<SchedulerPtr>,
    ) -> Result<RealmPtr, EngineError> {
        let mut state = self.state.lock();
        if let Some(s) = scheduler {
            if !state.schedulers.contains_key(&s) {
                return Err(EngineError::UnknownScheduler(s));
            }
        }
        let file = state
            .files
            .entry(config.path.clone())
            .or_insert_with(FileState::new);
        let version = file.latest;
        let schema_version = file
            .versions
            .get(&version)
            .map_or(0, |snapshot| snapshot.schema.schema_version);

        let realm = RealmPtr::from_raw(state.allocate_id());
        state.realms.insert(
            realm,
            RealmState {
                path: config.path.clone(),
                frozen: false,
                closed: false,
                version,
                scheduler,
                pinned: false,
                write: None,
                notified_version: version,
                notified_schema: schema_version,
            },
        );
        Ok(realm)
    }

    fn close(&self, realm: RealmPtr) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let State {
            realms,
            files,
            tokens,
            ..
        } = &mut *state;
        let handle = realms
            .get_mut(&realm)
            .ok_or(EngineError::UnknownRealm(realm))?;
        if handle.closed {
            return Ok(());
        }
        handle.closed = true;
        handle.write = None;
        if let Some(file) = files.get_mut(&handle.path) {
            if file.writer == Some(realm) {
                file.writer = None;
            }
        }
        tokens.retain(|_, token| token.realm != realm);
        let path = handle.path.clone();
        state.compact(&path);
        Ok(())
    }

    fn freeze(&self, live: RealmPtr) -> Result<RealmPtr, EngineError> {
        let mut state = self.state.lock();
        let handle = open_handle(&state.realms, live)?;
        check_affinity(&state.schedulers, live, handle)?;
        let path = handle.path.clone();
        let version = handle.version;
        let frozen = RealmPtr::from_raw(state.allocate_id());
        state.realms.insert(
            frozen,
            RealmState {
                path,
                frozen: true,
                closed: false,
                version,
                scheduler: None,
                pinned: false,
                write: None,
                notified_version: version,
                notified_schema: 0,
            },
        );
        Ok(frozen)
    }

    fn begin_read(&self, realm: RealmPtr) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let State { realms, files, .. } = &mut *state;
        let handle = realms
            .get_mut(&realm)
            .ok_or(EngineError::UnknownRealm(realm))?;
        if handle.closed {
            return Err(EngineError::Closed(realm));
        }
        if !handle.frozen {
            return Ok(());
        }
        let available = files
            .get(&handle.path)
            .is_some_and(|file| file.versions.contains_key(&handle.version));
        if !available {
            return Err(EngineError::VersionReclaimed {
                realm,
                version: handle.version,
            });
        }
        handle.pinned = true;
        Ok(())
    }

    fn refresh(&self, live: RealmPtr) -> Result<bool, EngineError> {
        if self.is_in_transaction(live) {
            return Err(EngineError::AlreadyInTransaction(live));
        }
        self.deliver(live)
    }

    fn version_id(&self, realm: RealmPtr) -> Result<i64, EngineError> {
        let state = self.state.lock();
        let handle = open_handle(&state.realms, realm)?;
        Ok(i64::try_from(handle.version).unwrap_or(i64::MAX))
    }

    fn is_frozen(&self, realm: RealmPtr) -> Result<bool, EngineError> {
        let state = self.state.lock();
        open_handle(&state.realms, realm).map(|handle| handle.frozen)
    }

    fn is_closed(&self, realm: RealmPtr) -> bool {
        self.state
            .lock()
            .realms
            .get(&realm)
            .map_or(true, |handle| handle.closed)
    }

    fn schema(&self, realm: RealmPtr) -> Result<SchemaInfo, EngineError> {
        self.state
            .lock()
            .read(realm, |snapshot| Ok((*snapshot.schema).clone()))
    }

    fn begin_write(&self, live: RealmPtr) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.live_handle(live)?;
        let State { realms, files, .. } = &mut *state;
        let handle = realms
            .get_mut(&live)
            .ok_or(EngineError::UnknownRealm(live))?;
        if handle.write.is_some() {
            return Err(EngineError::AlreadyInTransaction(live));
        }
        let file = files
            .get_mut(&handle.path)
            .ok_or(EngineError::UnknownRealm(live))?;
        if let Some(writer) = file.writer {
            if writer != live {
                return Err(EngineError::WriteLocked {
                    path: handle.path.clone(),
                });
            }
        }
        let latest = file
            .versions
            .get(&file.latest)
            .ok_or(EngineError::VersionReclaimed {
                realm: live,
                version: file.latest,
            })?;
        handle.write = Some((**latest).clone());
        handle.version = file.latest;
        file.writer = Some(live);
        Ok(())
    }

    fn commit(&self, live: RealmPtr) -> Result<(), EngineError> {
        let targets = {
            let mut state = self.state.lock();
            state.live_handle(live)?;
            let State { realms, files, .. } = &mut *state;
            let handle = realms
                .get_mut(&live)
                .ok_or(EngineError::UnknownRealm(live))?;
            let working = handle
                .write
                .take()
                .ok_or(EngineError::NotInTransaction(live))?;
            let path = handle.path.clone();
            let file = files.get_mut(&path).ok_or(EngineError::UnknownRealm(live))?;
            let version = file.latest + 1;
            file.versions.insert(version, Arc::new(working));
            file.latest = version;
            file.writer = None;
            handle.version = version;
            tracing::trace!(realm = %live, version, "committed");

            state.compact(&path);
            state.scheduled_live_handles(&path)
        };
        self.post_deliveries(targets);
        Ok(())
    }

    fn rollback(&self, live: RealmPtr) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.live_handle(live)?;
        let State { realms, files, .. } = &mut *state;
        let handle = realms
            .get_mut(&live)
            .ok_or(EngineError::UnknownRealm(live))?;
        if handle.write.take().is_none() {
            return Err(EngineError::NotInTransaction(live));
        }
        if let Some(file) = files.get_mut(&handle.path) {
            file.writer = None;
        }
        Ok(())
    }

    fn is_in_transaction(&self, realm: RealmPtr) -> bool {
        self.state
            .lock()
            .realms
            .get(&realm)
            .is_some_and(|handle| !handle.closed && handle.write.is_some())
    }

    fn register_realm_changed_callback(
        &self,
        live: RealmPtr,
        callback: RealmCallback,
    ) -> Result<NotificationTokenPtr, EngineError> {
        self.state
            .lock()
            .register_token(live, TokenKind::Realm(callback))
    }

    fn register_schema_changed_callback(
        &self,
        live: RealmPtr,
        callback: RealmCallback,
    ) -> Result<NotificationTokenPtr, EngineError> {
        self.state
            .lock()
            .register_token(live, TokenKind::Schema(callback))
    }

    fn entity_exists(&self, realm: RealmPtr, entity: EntityKey) -> Result<bool, EngineError> {
        self.state
            .lock()
            .read(realm, |snapshot| Ok(snapshot.entities.contains_key(&entity)))
    }

    fn register_change_callback(
        &self,
        live: RealmPtr,
        entity: EntityKey,
        filter: &KeyFilter,
        callback: ChangeCallback,
    ) -> Result<NotificationTokenPtr, EngineError> {
        let (token, target) = {
            let mut state = self.state.lock();
            if !state.read(live, |snapshot| Ok(snapshot.entities.contains_key(&entity)))? {
                return Err(EngineError::EntityNotFound(entity));
            }
            let token = state.register_token(
                live,
                TokenKind::Entity {
                    entity,
                    filter: filter.clone(),
                    callback,
                    seen_version: None,
                },
            )?;
            let target = state
                .realms
                .get(&live)
                .and_then(|h| h.scheduler)
                .and_then(|s| state.schedulers.get(&s))
                .map(|executor| (live, Arc::clone(executor)));
            (token, target)
        };
        self.post_deliveries(target.into_iter().collect());
        Ok(token)
    }

    fn release_token(&self, token: NotificationTokenPtr) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let Some(owner) = state.tokens.get(&token).map(|t| t.realm) else {
            return Ok(());
        };
        if let Ok(handle) = open_handle(&state.realms, owner) {
            check_affinity(&state.schedulers, owner, handle)?;
        }
        state.tokens.remove(&token);
        Ok(())
    }

    fn collection_change_indices(
        &self,
        changes: ChangesPtr,
    ) -> Result<CollectionIndices, EngineError> {
        match self.state.lock().change_record(changes)? {
            ChangeRecord::Collection { indices, .. } => Ok(indices.clone()),
            _ => Err(EngineError::ChangesKindMismatch(changes)),
        }
    }

    fn collection_change_ranges(
        &self,
        changes: ChangesPtr,
    ) -> Result<CollectionRanges, EngineError> {
        match self.state.lock().change_record(changes)? {
            ChangeRecord::Collection { ranges, .. } => Ok(ranges.clone()),
            _ => Err(EngineError::ChangesKindMismatch(changes)),
        }
    }

    fn map_changes(&self, changes: ChangesPtr) -> Result<MapKeyChanges, EngineError> {
        match self.state.lock().change_record(changes)? {
            ChangeRecord::Map(keys) => Ok(keys.clone()),
            _ => Err(EngineError::ChangesKindMismatch(changes)),
        }
    }

    fn object_changes(&self, changes: ChangesPtr) -> Result<ObjectChanges, EngineError> {
        match self.state.lock().change_record(changes)? {
            ChangeRecord::Object(object) => Ok(object.clone()),
            _ => Err(EngineError::ChangesKindMismatch(changes)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
