//! Version references and the scheduler-bound live realm.
//!
//! - [`VersionId`]: monotonically increasing snapshot identifier
//! - [`SchemaMetadata`]: cached class/property metadata
//! - [`LiveRealmReference`] / [`FrozenRealmReference`]: native handle owners
//! - [`LiveRealm`]: live handle plus its GC-tracked current snapshot

mod live;
mod reference;
mod schema;
mod version;

pub use live::{LiveRealm, LiveRealmOptions, VersionHook};
pub use reference::{FrozenRealmReference, LiveRealmReference, RealmReference, ReferenceKind};
pub use schema::{ClassMetadata, SchemaMetadata};
pub use version::VersionId;
