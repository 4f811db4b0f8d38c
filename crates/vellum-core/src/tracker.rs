//! # Version Tracker
//!
//! Bookkeeping for the intermediate frozen snapshots a live handle hands out.
//!
//! Each tracked entry pairs the native handle with a [`Weak`] to the
//! consumer-facing [`FrozenRealmReference`]. Consumers never close these
//! snapshots themselves: once the last `Arc` is dropped the entry's strong
//! count reaches zero and the next [`VersionTracker::close_expired_references`]
//! scan closes the native handle.
//!
//! ## Reclamation
//!
//! Reclamation is deterministic and happens only at scan points (once per
//! version advance in practice):
//!
//! ```text
//!   track ──► [ (ptr, gen, weak) ... ] ──scan──► strong_count == 0 ? close : keep
//! ```
//!
//! ## Concurrency
//!
//! Methods take `&mut self`. The owner of the live handle serializes access,
//! usually by only touching the tracker from its scheduler context.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crate::engine::{NativeEngine, RealmPtr};
use crate::realm::{FrozenRealmReference, RealmReference, VersionId};

/// Default number of tracked versions above which a warning is logged.
pub const DEFAULT_WARNING_THRESHOLD: usize = 32;

struct IntermediateReference {
    ptr: RealmPtr,
    generation: u64,
    reference: Weak<FrozenRealmReference>,
}

/// Tracks frozen snapshots and closes them once unreachable.
pub struct VersionTracker {
    owner: String,
    engine: Arc<dyn NativeEngine>,
    references: Vec<IntermediateReference>,
    next_generation: u64,
    warning_threshold: usize,
    above_threshold: bool,
}

impl VersionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(owner: impl Into<String>, engine: Arc<dyn NativeEngine>) -> Self {
        Self {
            owner: owner.into(),
            engine,
            references: Vec::new(),
            next_generation: 0,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            above_threshold: false,
        }
    }

    /// Sets the tracked-version count above which a warning is logged.
    #[must_use]
    pub fn with_warning_threshold(mut self, threshold: usize) -> Self {
        self.warning_threshold = threshold;
        self
    }

    /// Starts tracking `reference`. Returns the entry's generation.
    pub fn track_reference(&mut self, reference: &Arc<FrozenRealmReference>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let ptr = reference.realm_ptr();
        tracing::trace!(
            owner = %self.owner,
            realm = %ptr,
            generation,
            version = ?reference.version().ok(),
            "TRACK-VERSION"
        );
        self.references.push(IntermediateReference {
            ptr,
            generation,
            reference: Arc::downgrade(reference),
        });

        let tracked = self.references.len();
        if tracked > self.warning_threshold {
            if !self.above_threshold {
                self.above_threshold = true;
                tracing::warn!(
                    owner = %self.owner,
                    tracked,
                    threshold = self.warning_threshold,
                    "many frozen versions are still reachable; snapshots may be held too long"
                );
            }
        } else {
            self.above_threshold = false;
        }
        generation
    }

    /// Closes and forgets every entry whose reference is no longer held.
    ///
    /// Entries whose handle the owner already closed are forgotten without
    /// closing. Returns the number of entries removed.
    pub fn close_expired_references(&mut self) -> usize {
        let before = self.references.len();
        let engine = &self.engine;
        let owner = &self.owner;
        self.references.retain(|entry| {
            if entry.reference.strong_count() > 0 {
                return true;
            }
            if !engine.is_closed(entry.ptr) {
                tracing::trace!(
                    owner = %owner,
                    realm = %entry.ptr,
                    generation = entry.generation,
                    "CLOSE-FREED"
                );
                if let Err(e) = engine.close(entry.ptr) {
                    tracing::warn!(owner = %owner, realm = %entry.ptr, error = %e, "failed to close expired version");
                }
            }
            false
        });
        before - self.references.len()
    }

    /// Versions of the tracked references that are still reachable.
    #[must_use]
    pub fn versions(&self) -> BTreeSet<VersionId> {
        self.references
            .iter()
            .filter_map(|entry| entry.reference.upgrade())
            .filter_map(|reference| reference.version().ok())
            .collect()
    }

    /// Oldest still-reachable version.
    #[must_use]
    pub fn oldest_version(&self) -> Option<VersionId> {
        self.versions().into_iter().next()
    }

    /// Number of entries, reachable or not.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.references.len()
    }

    /// Closes every tracked handle regardless of reachability.
    pub fn close(&mut self) {
        for entry in self.references.drain(..) {
            tracing::trace!(
                owner = %self.owner,
                realm = %entry.ptr,
                generation = entry.generation,
                "CLOSE-ACTIVE"
            );
            if let Err(e) = self.engine.close(entry.ptr) {
                tracing::warn!(owner = %self.owner, realm = %entry.ptr, error = %e, "failed to close tracked version");
            }
        }
        self.above_threshold = false;
    }
}

impl std::fmt::Debug for VersionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionTracker")
            .field("owner", &self.owner)
            .field("tracked", &self.references.len())
            .field("warning_threshold", &self.warning_threshold)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
