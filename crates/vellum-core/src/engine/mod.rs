//! # Native Engine Interface
//!
//! The storage engine underneath vellum is opaque and single-threaded per
//! handle. This module describes the surface the coordination layer consumes:
//! handle lifecycle, version queries, the write-transaction primitives and
//! the push-style change-callback mechanism.
//!
//! ## Handles
//!
//! Every engine object is addressed through a copyable pointer newtype
//! ([`RealmPtr`], [`SchedulerPtr`], [`NotificationTokenPtr`], [`ChangesPtr`],
//! [`EntityKey`]). Pointers carry no ownership; the layer above decides who
//! releases what and when.
//!
//! ## Scheduling
//!
//! The engine never spawns threads. A live handle opened with a scheduler is
//! bound to the [`SchedulerExecutor`] that scheduler was created from: the
//! engine posts "perform work" tasks onto it after commits, and rejects
//! advancing or mutating calls that arrive from any other thread.
//!
//! ```text
//!   commit on handle A ──► engine posts work ──► executor of handle B
//!                                                    │
//!                                      schema cb → realm cb → entity cbs
//! ```
//!
//! [`memory::MemoryEngine`] is a complete in-process implementation used by
//! tests and by embedders that do not link a native engine.

use std::fmt;
use std::sync::Arc;

pub mod memory;

// ---------------------------------------------------------------------------
// Pointers
// ---------------------------------------------------------------------------

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw engine identifier.
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw engine identifier.
            #[must_use]
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

native_handle!(
    /// Opaque pointer to a live or frozen database handle.
    RealmPtr,
    "realm"
);
native_handle!(
    /// Opaque pointer to a scheduler bound to one execution context.
    SchedulerPtr,
    "scheduler"
);
native_handle!(
    /// Opaque pointer to one registered change callback.
    NotificationTokenPtr,
    "token"
);
native_handle!(
    /// Opaque change token passed to a change callback.
    ///
    /// Only valid for the duration of the callback invocation.
    ChangesPtr,
    "changes"
);
native_handle!(
    /// Stable key of an entity (object or collection) inside a database file.
    EntityKey,
    "entity"
);

// ---------------------------------------------------------------------------
// Configuration and filters
// ---------------------------------------------------------------------------

/// Shape of an observable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// An object with named properties.
    Object,
    /// An ordered collection.
    List,
    /// An unordered collection of distinct values.
    Set,
    /// A string-keyed dictionary.
    Map,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object => write!(f, "object"),
            Self::List => write!(f, "list"),
            Self::Set => write!(f, "set"),
            Self::Map => write!(f, "map"),
        }
    }
}

/// Engine-level open configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConfig {
    /// Path of the database file. Handles opened on the same path share data.
    pub path: String,
}

impl OpenConfig {
    /// Creates a configuration for the given path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self::new("default.vellum")
    }
}

/// Restricts which property changes trigger an object callback.
///
/// The default filter matches every property. Collections ignore filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter(Option<Vec<String>>);

impl KeyFilter {
    /// A filter that matches every property.
    #[must_use]
    pub fn all() -> Self {
        Self(None)
    }

    /// A filter that matches only the named properties.
    #[must_use]
    pub fn properties<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Some(properties.into_iter().map(Into::into).collect()))
    }

    /// Returns `true` if the filter matches every property.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.0.is_none()
    }

    /// Returns `true` if a change to `property` passes the filter.
    #[must_use]
    pub fn matches(&self, property: &str) -> bool {
        self.0
            .as_ref()
            .map_or(true, |keys| keys.iter().any(|k| k == property))
    }
}

// ---------------------------------------------------------------------------
// Scheduling and callbacks
// ---------------------------------------------------------------------------

/// A unit of work posted onto an execution context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution context a native scheduler is bound to.
pub trait SchedulerExecutor: Send + Sync {
    /// Enqueues `task` for execution on the context. Never runs it inline.
    fn post(&self, task: Task);

    /// Returns `true` if the calling thread is the context's thread.
    fn is_on_context(&self) -> bool;
}

/// Callback invoked with an opaque change token.
pub type ChangeCallback = Arc<dyn Fn(ChangesPtr) + Send + Sync>;

/// Callback invoked on realm-level events (version advanced, schema changed).
pub type RealmCallback = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Decoded change data
// ---------------------------------------------------------------------------

/// Raw positional changes of an ordered or unordered collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionIndices {
    /// Positions removed, relative to the old collection.
    pub deletions: Vec<usize>,
    /// Positions inserted, relative to the new collection.
    pub insertions: Vec<usize>,
    /// Positions modified in place, relative to the new collection.
    pub modifications: Vec<usize>,
}

/// Coalesced `[from, to)` ranges covering the same positions as
/// [`CollectionIndices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionRanges {
    /// Deleted position ranges.
    pub deletions: Vec<(usize, usize)>,
    /// Inserted position ranges.
    pub insertions: Vec<(usize, usize)>,
    /// Modified position ranges.
    pub modifications: Vec<(usize, usize)>,
}

/// Raw key changes of a dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapKeyChanges {
    /// Keys removed.
    pub deletions: Vec<String>,
    /// Keys added.
    pub insertions: Vec<String>,
    /// Keys whose value changed.
    pub modifications: Vec<String>,
}

/// Raw property changes of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChanges {
    /// The object was deleted in this transition.
    pub deleted: bool,
    /// Names of properties whose value changed.
    pub modified_properties: Vec<String>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Storage type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// UTF-8 string.
    String,
    /// Link to another object.
    Object,
    /// Ordered collection.
    List,
    /// Set collection.
    Set,
    /// Dictionary.
    Map,
    /// Any value.
    Mixed,
}

/// One property of a class as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Storage type.
    pub property_type: PropertyType,
    /// Whether the property accepts null.
    pub nullable: bool,
}

/// One class of the schema as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Class name.
    pub name: String,
    /// Name of the primary key property, if any.
    pub primary_key: Option<String>,
    /// Properties in declaration order.
    pub properties: Vec<PropertyInfo>,
}

impl ClassInfo {
    /// Creates a class with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            properties: Vec::new(),
        }
    }

    /// Adds a non-nullable property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, property_type: PropertyType) -> Self {
        self.properties.push(PropertyInfo {
            name: name.into(),
            property_type,
            nullable: false,
        });
        self
    }

    /// Marks `name` as the primary key.
    #[must_use]
    pub fn with_primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }
}

/// Schema of one database version as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaInfo {
    /// Incremented by every schema-affecting commit.
    pub schema_version: u64,
    /// Classes in creation order.
    pub classes: Vec<ClassInfo>,
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Failures reported by the native engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The handle was already closed.
    #[error("realm handle {0} is closed")]
    Closed(RealmPtr),

    /// The handle was never opened by this engine.
    #[error("unknown realm handle {0}")]
    UnknownRealm(RealmPtr),

    /// The scheduler was never created or was already released.
    #[error("unknown scheduler {0}")]
    UnknownScheduler(SchedulerPtr),

    /// A live handle was used from outside its scheduler's context.
    #[error("realm handle {0} accessed from outside its scheduler context")]
    WrongThread(RealmPtr),

    /// A mutating or advancing call was made on a frozen handle.
    #[error("realm handle {0} is frozen")]
    Frozen(RealmPtr),

    /// The handle has no scheduler, so it cannot deliver notifications.
    #[error("realm handle {0} has no scheduler")]
    NoScheduler(RealmPtr),

    /// A write transaction is already open on the handle.
    #[error("realm handle {0} is already in a write transaction")]
    AlreadyInTransaction(RealmPtr),

    /// No write transaction is open on the handle.
    #[error("realm handle {0} is not in a write transaction")]
    NotInTransaction(RealmPtr),

    /// Another handle holds the file's write lock.
    #[error("database '{path}' is locked by another writer")]
    WriteLocked {
        /// Path of the locked file.
        path: String,
    },

    /// The version a frozen handle refers to has been reclaimed.
    #[error("version {version} of realm handle {realm} was reclaimed")]
    VersionReclaimed {
        /// The frozen handle.
        realm: RealmPtr,
        /// The reclaimed version.
        version: u64,
    },

    /// No entity with the key exists in the handle's version.
    #[error("entity {0} not found")]
    EntityNotFound(EntityKey),

    /// The entity exists but has a different shape.
    #[error("entity {entity} is not a {expected}")]
    WrongEntityKind {
        /// The entity.
        entity: EntityKey,
        /// The shape the operation needs.
        expected: EntityKind,
    },

    /// A list position outside the list.
    #[error("index {index} out of bounds for {entity} of length {len}")]
    IndexOutOfBounds {
        /// The list.
        entity: EntityKey,
        /// Requested position.
        index: usize,
        /// Current length.
        len: usize,
    },

    /// A class with the same name already exists.
    #[error("class '{0}' already exists")]
    DuplicateClass(String),

    /// The change token is not valid (outside its callback or never issued).
    #[error("unknown change token {0}")]
    UnknownChanges(ChangesPtr),

    /// The change token describes a different entity shape.
    #[error("change token {0} does not describe this kind of entity")]
    ChangesKindMismatch(ChangesPtr),
}

// ---------------------------------------------------------------------------
// NativeEngine
// ---------------------------------------------------------------------------

/// The storage engine as seen by the coordination layer.
///
/// All calls are blocking. Calls on a live handle bound to a scheduler must
/// come from that scheduler's context; implementations reject others with
/// [`EngineError::WrongThread`]. Pure queries (`version_id`, `is_frozen`,
/// `is_closed`, `is_in_transaction`) may be issued from anywhere.
pub trait NativeEngine: Send + Sync + 'static {
    /// Creates a native scheduler bound to `executor`.
    ///
    /// # Errors
    ///
    /// Implementation-defined resource failures.
    fn create_scheduler(
        &self,
        executor: Arc<dyn SchedulerExecutor>,
    ) -> Result<SchedulerPtr, EngineError>;

    /// Releases a scheduler. Unknown schedulers are ignored.
    fn release_scheduler(&self, scheduler: SchedulerPtr);

    /// Opens a live handle at the latest version of `config.path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownScheduler`] if `scheduler` is not known.
    fn open(
        &self,
        config: &OpenConfig,
        scheduler: Option<SchedulerPtr>,
    ) -> Result<RealmPtr, EngineError>;

    /// Closes a handle. Closing a closed handle succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownRealm`] for handles this engine never issued.
    fn close(&self, realm: RealmPtr) -> Result<(), EngineError>;

    /// Creates a frozen handle at the live handle's current version.
    ///
    /// # Errors
    ///
    /// Closed handle or thread-affinity violation.
    fn freeze(&self, live: RealmPtr) -> Result<RealmPtr, EngineError>;

    /// Pins a frozen handle's version against reclamation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::VersionReclaimed`] if the version is already gone.
    fn begin_read(&self, realm: RealmPtr) -> Result<(), EngineError>;

    /// Advances a live handle to the latest version and delivers pending
    /// callbacks synchronously. Returns `true` if the version changed.
    ///
    /// # Errors
    ///
    /// Closed, frozen, in-transaction or wrong-thread handle.
    fn refresh(&self, live: RealmPtr) -> Result<bool, EngineError>;

    /// Returns the version the handle currently refers to.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the handle is closed.
    fn version_id(&self, realm: RealmPtr) -> Result<i64, EngineError>;

    /// Returns `true` for frozen handles.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the handle is closed.
    fn is_frozen(&self, realm: RealmPtr) -> Result<bool, EngineError>;

    /// Returns `true` once the handle is closed (or was never issued).
    fn is_closed(&self, realm: RealmPtr) -> bool;

    /// Returns the schema of the handle's current version.
    ///
    /// # Errors
    ///
    /// Closed handle or reclaimed version.
    fn schema(&self, realm: RealmPtr) -> Result<SchemaInfo, EngineError>;

    /// Opens a write transaction, advancing the handle to the latest version.
    ///
    /// # Errors
    ///
    /// Already in a transaction, write lock held elsewhere, frozen handle.
    fn begin_write(&self, live: RealmPtr) -> Result<(), EngineError>;

    /// Publishes the open write transaction as a new version.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInTransaction`] without an open transaction.
    fn commit(&self, live: RealmPtr) -> Result<(), EngineError>;

    /// Discards the open write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInTransaction`] without an open transaction.
    fn rollback(&self, live: RealmPtr) -> Result<(), EngineError>;

    /// Returns `true` while a write transaction is open on the handle.
    fn is_in_transaction(&self, realm: RealmPtr) -> bool;

    /// Registers a callback fired once per version advance of `live`.
    ///
    /// # Errors
    ///
    /// Closed handle, no scheduler, wrong thread.
    fn register_realm_changed_callback(
        &self,
        live: RealmPtr,
        callback: RealmCallback,
    ) -> Result<NotificationTokenPtr, EngineError>;

    /// Registers a callback fired when an advance changes the schema.
    ///
    /// Schema callbacks run before realm-changed callbacks of the same advance.
    ///
    /// # Errors
    ///
    /// Closed handle, no scheduler, wrong thread.
    fn register_schema_changed_callback(
        &self,
        live: RealmPtr,
        callback: RealmCallback,
    ) -> Result<NotificationTokenPtr, EngineError>;

    /// Returns `true` if `entity` exists in the handle's current version.
    ///
    /// # Errors
    ///
    /// Closed handle or reclaimed version.
    fn entity_exists(&self, realm: RealmPtr, entity: EntityKey) -> Result<bool, EngineError>;

    /// Registers a change callback on `entity` as seen through `live`.
    ///
    /// The first invocation carries an empty change set; later invocations
    /// describe one advance each.
    ///
    /// # Errors
    ///
    /// Closed handle, no scheduler, wrong thread, missing entity.
    fn register_change_callback(
        &self,
        live: RealmPtr,
        entity: EntityKey,
        filter: &KeyFilter,
        callback: ChangeCallback,
    ) -> Result<NotificationTokenPtr, EngineError>;

    /// Releases a callback registration. Unknown tokens are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WrongThread`] if called off the owning context.
    fn release_token(&self, token: NotificationTokenPtr) -> Result<(), EngineError>;

    /// Decodes positional changes of a list or set.
    ///
    /// # Errors
    ///
    /// Unknown or mismatched change token.
    fn collection_change_indices(&self, changes: ChangesPtr)
        -> Result<CollectionIndices, EngineError>;

    /// Decodes coalesced positional ranges of a list.
    ///
    /// # Errors
    ///
    /// Unknown or mismatched change token.
    fn collection_change_ranges(&self, changes: ChangesPtr)
        -> Result<CollectionRanges, EngineError>;

    /// Decodes key changes of a dictionary.
    ///
    /// # Errors
    ///
    /// Unknown or mismatched change token.
    fn map_changes(&self, changes: ChangesPtr) -> Result<MapKeyChanges, EngineError>;

    /// Decodes property changes of an object.
    ///
    /// # Errors
    ///
    /// Unknown or mismatched change token.
    fn object_changes(&self, changes: ChangesPtr) -> Result<ObjectChanges, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_display() {
        assert_eq!(RealmPtr::from_raw(7).to_string(), "realm-7");
        assert_eq!(EntityKey::from_raw(3).to_string(), "entity-3");
        assert_eq!(ChangesPtr::from_raw(1).as_raw(), 1);
    }

    #[test]
    fn test_key_filter() {
        let all = KeyFilter::all();
        assert!(all.is_all());
        assert!(all.matches("anything"));

        let some = KeyFilter::properties(["name", "age"]);
        assert!(!some.is_all());
        assert!(some.matches("age"));
        assert!(!some.matches("email"));
        assert_eq!(KeyFilter::default(), KeyFilter::all());
    }

    #[test]
    fn test_class_info_builder() {
        let class = ClassInfo::new("Person")
            .with_property("id", PropertyType::Int)
            .with_property("name", PropertyType::String)
            .with_primary_key("id");
        assert_eq!(class.properties.len(), 2);
        assert_eq!(class.primary_key.as_deref(), Some("id"));
    }
}
