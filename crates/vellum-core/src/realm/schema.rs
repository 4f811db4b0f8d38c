//! Cached schema metadata.
//!
//! A [`SchemaMetadata`] is built once per version from the engine's schema
//! and never mutated afterwards. Live references swap in a fresh instance
//! when the schema changes; frozen references keep the one they were
//! created with.

use std::collections::BTreeMap;

use crate::engine::{ClassInfo, NativeEngine, PropertyInfo, RealmPtr, SchemaInfo};
use crate::Result;

/// Layout of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMetadata {
    info: ClassInfo,
}

impl ClassMetadata {
    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Primary key property, if the class has one.
    #[must_use]
    pub fn primary_key(&self) -> Option<&str> {
        self.info.primary_key.as_deref()
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.info.properties.iter().find(|p| p.name == name)
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> impl Iterator<Item = &PropertyInfo> {
        self.info.properties.iter()
    }
}

/// Immutable class/property layout as of one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMetadata {
    schema_version: u64,
    classes: BTreeMap<String, ClassMetadata>,
}

impl SchemaMetadata {
    /// Builds metadata from the engine's schema description.
    #[must_use]
    pub fn from_info(info: SchemaInfo) -> Self {
        let classes = info
            .classes
            .into_iter()
            .map(|class| (class.name.clone(), ClassMetadata { info: class }))
            .collect();
        Self {
            schema_version: info.schema_version,
            classes,
        }
    }

    /// Reads the schema of `realm`'s current version.
    ///
    /// # Errors
    ///
    /// Propagates engine failures (closed handle, reclaimed version).
    pub fn load(engine: &dyn NativeEngine, realm: RealmPtr) -> Result<Self> {
        Ok(Self::from_info(engine.schema(realm)?))
    }

    /// Engine schema version this metadata was built from.
    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    /// Looks up a class by name.
    #[must_use]
    pub fn class(&self, name: &str) -> Option<&ClassMetadata> {
        self.classes.get(name)
    }

    /// Classes sorted by name.
    pub fn classes(&self) -> impl Iterator<Item = &ClassMetadata> {
        self.classes.values()
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if the schema has no classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
