use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ResourceKind;

/// Size and version metadata carried by a location.
///
/// Only locations that stand for downloadable content (bundles) carry a
/// non-zero declared size; the hash identifies the exact content revision for
/// cache lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPayload {
    /// Bytes that must be fetched when the content is not cached.
    pub declared_size: u64,
    /// Content hash of the revision this location was generated against.
    pub content_hash: Option<String>,
}

/// An immutable description of where one piece of content lives and how to
/// load it.
///
/// Locations are created once, during catalog generation or by direct
/// registration, and shared as `Arc<Location>` from then on. Identity is
/// pointer identity: the registry hands out the same allocation for every
/// resolution of the same source entry.
#[derive(Debug)]
pub struct Location {
    primary_key: String,
    internal_id: String,
    provider_id: String,
    kind: ResourceKind,
    dependencies: Vec<Arc<Location>>,
    payload: LocationPayload,
}

impl Location {
    /// Create a location with no dependencies and an empty payload.
    pub fn new(
        primary_key: impl Into<String>,
        internal_id: impl Into<String>,
        provider_id: impl Into<String>,
        kind: ResourceKind,
    ) -> Self {
        Self {
            primary_key: primary_key.into(),
            internal_id: internal_id.into(),
            provider_id: provider_id.into(),
            kind,
            dependencies: Vec::new(),
            payload: LocationPayload::default(),
        }
    }

    /// Attach the ordered dependency list. Dependencies are loaded before the
    /// location itself.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<Arc<Location>>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attach size/version metadata.
    #[must_use]
    pub fn with_payload(mut self, payload: LocationPayload) -> Self {
        self.payload = payload;
        self
    }

    /// The canonical load key. First key of the catalog entry this location
    /// was generated from.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Loader-specific address, stable across catalog regenerations of the
    /// same source entry.
    pub fn internal_id(&self) -> &str {
        &self.internal_id
    }

    /// Identifier of the loader provider able to produce this content.
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Declared result kind.
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Locations that must be loaded before this one.
    pub fn dependencies(&self) -> &[Arc<Location>] {
        &self.dependencies
    }

    /// Size/version metadata.
    pub fn payload(&self) -> &LocationPayload {
        &self.payload
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.internal_id)
    }
}
