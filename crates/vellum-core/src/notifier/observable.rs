//! Entities that can be observed, and the builder each one decodes with.

use crate::changeset::{
    ChangeSetBuilder, ListChangeSetBuilder, MapChangeSetBuilder, ObjectChangeSetBuilder,
    SetChangeSetBuilder,
};
use crate::engine::{EntityKey, EntityKind};

/// An entity a native change callback can be registered on.
pub trait Observable: Send + 'static {
    /// Decodes the entity's change tokens.
    type Builder: ChangeSetBuilder + 'static;

    /// Key of the observed entity.
    fn entity(&self) -> EntityKey;

    /// Kind of the observed entity.
    fn kind(&self) -> EntityKind;
}

/// Changeset type produced when observing `O`.
pub type ChangeSetOf<O> = <<O as Observable>::Builder as ChangeSetBuilder>::ChangeSet;

macro_rules! observable {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $builder:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub EntityKey);

        impl Observable for $name {
            type Builder = $builder;

            fn entity(&self) -> EntityKey {
                self.0
            }

            fn kind(&self) -> EntityKind {
                EntityKind::$kind
            }
        }
    };
}

observable!(
    /// An object; updates name the changed properties.
    ObservedObject,
    Object,
    ObjectChangeSetBuilder
);
observable!(
    /// A list; updates carry positional indices and ranges.
    ObservedList,
    List,
    ListChangeSetBuilder
);
observable!(
    /// A set; updates carry counts.
    ObservedSet,
    Set,
    SetChangeSetBuilder
);
observable!(
    /// A string-keyed map; updates carry keys.
    ObservedMap,
    Map,
    MapChangeSetBuilder<String>
);
