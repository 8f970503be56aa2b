use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared result type of a location or catalog entry.
///
/// Kinds are compared by name. [`ResourceKind::ANY`] acts as a wildcard on
/// the request side: every kind is assignable to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    /// Name of the wildcard kind.
    pub const ANY_NAME: &'static str = "*";

    /// Create a kind from a type name.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The wildcard kind, matching any declared kind.
    pub fn any() -> Self {
        Self(Self::ANY_NAME.to_owned())
    }

    /// The type name this kind was created from.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns true for the wildcard kind.
    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY_NAME
    }

    /// Whether a value of this kind satisfies a request for `requested`.
    pub fn is_assignable_to(&self, requested: &Self) -> bool {
        requested.is_any() || self == requested
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignability() {
        let mesh = ResourceKind::from_name("mesh");
        let texture = ResourceKind::from_name("texture");

        assert!(mesh.is_assignable_to(&mesh));
        assert!(!mesh.is_assignable_to(&texture));
        assert!(mesh.is_assignable_to(&ResourceKind::any()));
        assert!(!ResourceKind::any().is_assignable_to(&mesh));
    }
}
