//! Version identifiers.

use std::fmt;

use crate::{Error, Result};

/// Identifies one immutable database version.
///
/// Non-negative and strictly ordered: `VersionId(n) < VersionId(n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId(u64);

impl VersionId {
    /// The smallest representable version.
    pub const MIN: Self = Self(0);

    /// Creates a version identifier from the engine's signed representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidVersion`] for negative values.
    pub fn new(version: i64) -> Result<Self> {
        u64::try_from(version)
            .map(Self)
            .map_err(|_| Error::InvalidVersion(version))
    }

    /// Returns the numeric version.
    #[must_use]
    pub const fn version(self) -> u64 {
        self.0
    }

    /// Returns the version that directly follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl TryFrom<i64> for VersionId {
    type Error = Error;

    fn try_from(version: i64) -> Result<Self> {
        Self::new(version)
    }
}

impl From<u64> for VersionId {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_version_rejected() {
        for n in [-1_i64, -2, -1000, i64::MIN] {
            assert_eq!(VersionId::new(n), Err(Error::InvalidVersion(n)));
        }
        assert!(VersionId::try_from(-7_i64).is_err());
    }

    #[test]
    fn test_ordering_follows_value() {
        let v = VersionId::new(41).unwrap();
        assert!(v < v.next());
        assert_eq!(v.next().version(), 42);
        assert_eq!(VersionId::new(0).unwrap(), VersionId::MIN);
        assert_eq!(VersionId::from(9_u64).to_string(), "9");
    }
}
