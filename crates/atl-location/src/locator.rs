use std::collections::HashMap;
use std::sync::Arc;

use crate::{AssetKey, Location, ResourceKind};

/// Maps keys to zero or more locations.
///
/// Implementations are registered with the [`crate::LocatorRegistry`];
/// resolution queries them in registration order.
pub trait Locator: Send + Sync {
    /// Locations known for `key`, filtered by assignability to `kind`.
    ///
    /// `None` means the key is unknown to this locator; `Some` with an empty
    /// vector means the key is known but nothing matches the requested kind.
    /// Resolution treats both as "no match here" and moves on, never as an
    /// error.
    fn locate(&self, key: &AssetKey, kind: &ResourceKind) -> Option<Vec<Arc<Location>>>;
}

/// In-memory locator over an explicit key map.
///
/// Used for direct runtime registration and as the backing store for catalog
/// derived locators. Insertion order per key is preserved.
#[derive(Default)]
pub struct KeyedLocator {
    map: HashMap<AssetKey, Vec<Arc<Location>>>,
}

impl KeyedLocator {
    /// Create an empty locator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `location` under `key`, after any locations already mapped to
    /// that key.
    pub fn insert(&mut self, key: AssetKey, location: Arc<Location>) {
        self.map.entry(key).or_default().push(location);
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no key is mapped.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Locator for KeyedLocator {
    fn locate(&self, key: &AssetKey, kind: &ResourceKind) -> Option<Vec<Arc<Location>>> {
        let locations = self.map.get(key)?;
        Some(
            locations
                .iter()
                .filter(|l| l.kind().is_assignable_to(kind))
                .map(Arc::clone)
                .collect(),
        )
    }
}
