//! Entity-level change events.

use std::sync::Arc;

use crate::realm::{FrozenRealmReference, VersionId};

/// Discriminant for [`ChangeEvent`] kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First event after attaching; carries no changes.
    Initial,
    /// The entity changed.
    Updated,
    /// The entity is gone. Always the last event of a stream.
    Deleted,
}

/// One event of an entity observer stream.
///
/// `snapshot` is the tracked frozen version the event was computed against;
/// holding it keeps that version readable.
#[derive(Debug, Clone)]
pub enum ChangeEvent<C> {
    /// State at the time the observer attached.
    Initial {
        /// Version the observer attached at.
        version: VersionId,
        /// Frozen view of that version.
        snapshot: Arc<FrozenRealmReference>,
    },
    /// The entity changed between the previous event and `version`.
    Updated {
        /// Version after the change.
        version: VersionId,
        /// Frozen view of that version.
        snapshot: Arc<FrozenRealmReference>,
        /// What changed.
        changes: C,
    },
    /// The entity was deleted, or never existed.
    Deleted {
        /// Version at which the deletion was observed.
        version: VersionId,
    },
}

impl<C> ChangeEvent<C> {
    /// Returns the [`EventType`] of this event.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Initial { .. } => EventType::Initial,
            Self::Updated { .. } => EventType::Updated,
            Self::Deleted { .. } => EventType::Deleted,
        }
    }

    /// Version the event describes.
    #[must_use]
    pub fn version(&self) -> VersionId {
        match self {
            Self::Initial { version, .. }
            | Self::Updated { version, .. }
            | Self::Deleted { version } => *version,
        }
    }

    /// Frozen view of the event's version, `None` for deletions.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Arc<FrozenRealmReference>> {
        match self {
            Self::Initial { snapshot, .. } | Self::Updated { snapshot, .. } => Some(snapshot),
            Self::Deleted { .. } => None,
        }
    }

    /// The changeset of an update.
    #[must_use]
    pub fn changes(&self) -> Option<&C> {
        match self {
            Self::Updated { changes, .. } => Some(changes),
            _ => None,
        }
    }

    /// Returns `true` for [`ChangeEvent::Deleted`].
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_accessors() {
        let event: ChangeEvent<()> = ChangeEvent::Deleted {
            version: VersionId::from(4_u64),
        };
        assert_eq!(event.event_type(), EventType::Deleted);
        assert_eq!(event.version(), VersionId::from(4_u64));
        assert!(event.snapshot().is_none());
        assert!(event.changes().is_none());
        assert!(event.is_deleted());
    }
}
