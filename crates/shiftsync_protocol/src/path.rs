//! Dotted field paths.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated dotted locator into an entity, such as
/// `production.tonnes.mined`.
///
/// Segments are non-empty and contain only ASCII letters, digits, `_` and
/// `-`. Prefix relations are segment-wise: `production.tonnes` is an
/// ancestor of `production.tonnes.mined` but not of `production.tonnesMax`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    /// Parses and validates a path.
    pub fn parse(path: impl Into<String>) -> ProtocolResult<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(ProtocolError::InvalidFieldPath {
                path,
                reason: "empty path",
            });
        }
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(ProtocolError::InvalidFieldPath {
                    path,
                    reason: "empty segment",
                });
            }
            if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            {
                return Err(ProtocolError::InvalidFieldPath {
                    path,
                    reason: "invalid character",
                });
            }
        }
        Ok(Self(path))
    }

    /// Returns the path as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Returns true if `self` is `other` or one of its ancestors.
    #[must_use]
    pub fn covers(&self, other: &FieldPath) -> bool {
        other.0 == self.0
            || (other.0.len() > self.0.len()
                && other.0.starts_with(&self.0)
                && other.0.as_bytes()[self.0.len()] == b'.')
    }

    /// Returns true if `self` is a strict ancestor of `other`.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &FieldPath) -> bool {
        self != other && self.covers(other)
    }

    /// Returns true if the paths are equal or one contains the other.
    #[must_use]
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.covers(other) || other.covers(self)
    }

    /// Returns the parent path, or `None` for a single-segment path.
    #[must_use]
    pub fn parent(&self) -> Option<FieldPath> {
        self.0.rfind('.').map(|i| FieldPath(self.0[..i].to_string()))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FieldPath {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        Self::parse(value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> String {
        path.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("safety..hazards").is_err());
        assert!(FieldPath::parse(".status").is_err());
        assert!(FieldPath::parse("status.").is_err());
        assert!(FieldPath::parse("safety hazards").is_err());
    }

    #[test]
    fn prefix_relations_are_segment_wise() {
        assert!(p("production.tonnes").covers(&p("production.tonnes.mined")));
        assert!(p("production.tonnes").covers(&p("production.tonnes")));
        assert!(!p("production.tonnes").covers(&p("production.tonnesMax")));
        assert!(p("production").is_ancestor_of(&p("production.tonnes")));
        assert!(!p("production").is_ancestor_of(&p("production")));
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = p("equipment.assets");
        let b = p("equipment.assets.truck7");
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&p("equipment.breakdowns")));
    }

    #[test]
    fn parent_and_depth() {
        let path = p("safety.safetyMetrics.totalIncidents");
        assert_eq!(path.depth(), 3);
        assert_eq!(path.parent(), Some(p("safety.safetyMetrics")));
        assert_eq!(p("status").parent(), None);
    }
}
