use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::{AssetKey, Location, Locator, ResourceKind};

/// Policy for combining per-key location sets when resolving several keys at
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// The first key's non-empty result set wins.
    UseFirst,
    /// Set union across all keys, first-seen order, de-duplicated by location
    /// identity.
    Union,
    /// Only locations present in every key's set. Any key with zero matches
    /// fails the whole call.
    Intersection,
}

/// Identifier returned by [`LocatorRegistry::add_locator`], used to remove a
/// locator later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocatorId(u64);

struct Inner {
    locators: Vec<(LocatorId, Arc<dyn Locator>)>,
    next_id: u64,
}

/// Ordered list of locators shared by the whole runtime.
///
/// All mutation goes through one lock, held only for the duration of the
/// table change; resolution takes a read snapshot of the list.
pub struct LocatorRegistry {
    inner: RwLock<Inner>,
}

impl Default for LocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LocatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                locators: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Append a locator. Resolution order is registration order.
    pub fn add_locator(&self, locator: Arc<dyn Locator>) -> LocatorId {
        let mut inner = self.inner.write().unwrap();
        let id = LocatorId(inner.next_id);
        inner.next_id += 1;
        inner.locators.push((id, locator));
        id
    }

    /// Remove a previously added locator. Returns false if `id` is not
    /// registered.
    pub fn remove_locator(&self, id: LocatorId) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.locators.len();
        inner.locators.retain(|(lid, _)| *lid != id);
        inner.locators.len() != before
    }

    /// Number of registered locators.
    pub fn locator_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .locators
            .len()
    }

    /// Resolve `keys` to locations under `mode`, filtered by assignability to
    /// `kind`.
    ///
    /// Returns `None` when resolution fails per the merge-mode rules: no key
    /// produced a match (`UseFirst`/`Union`), or any per-key set was empty or
    /// the final intersection came out empty (`Intersection`). An unknown key
    /// on its own is not an error; it just contributes an empty set.
    pub fn resolve(
        &self,
        keys: &[AssetKey],
        kind: &ResourceKind,
        mode: MergeMode,
    ) -> Option<Vec<Arc<Location>>> {
        if keys.is_empty() {
            debug!("resolve called with no keys");
            return None;
        }

        let locators: Vec<Arc<dyn Locator>> = {
            let inner = self.inner.read().unwrap();
            inner.locators.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        match mode {
            MergeMode::UseFirst => {
                for key in keys {
                    let set = locate_key_first(&locators, key, kind);
                    if !set.is_empty() {
                        return Some(set);
                    }
                }
                debug!(?mode, "no key produced a location");
                None
            }
            MergeMode::Union => {
                let mut seen = HashSet::new();
                let mut merged = Vec::new();
                for key in keys {
                    for location in locate_key(&locators, key, kind) {
                        if seen.insert(Arc::as_ptr(&location)) {
                            merged.push(location);
                        }
                    }
                }
                if merged.is_empty() {
                    debug!(?mode, "no key produced a location");
                    return None;
                }
                Some(merged)
            }
            MergeMode::Intersection => {
                let mut merged: Option<Vec<Arc<Location>>> = None;
                for key in keys {
                    let set = locate_key(&locators, key, kind);
                    if set.is_empty() {
                        // Intersection with an empty set is failure, not an
                        // empty result.
                        debug!(%key, "intersection key has no locations");
                        return None;
                    }
                    merged = Some(match merged {
                        None => set,
                        Some(acc) => {
                            let keep: HashSet<_> = set.iter().map(Arc::as_ptr).collect();
                            acc.into_iter()
                                .filter(|l| keep.contains(&Arc::as_ptr(l)))
                                .collect()
                        }
                    });
                }
                match merged {
                    Some(m) if !m.is_empty() => Some(m),
                    _ => {
                        debug!("intersection is empty");
                        None
                    }
                }
            }
        }
    }
}

/// First-match per-key set: locators queried in registration order, the first
/// non-empty filtered result wins outright.
fn locate_key_first(
    locators: &[Arc<dyn Locator>],
    key: &AssetKey,
    kind: &ResourceKind,
) -> Vec<Arc<Location>> {
    for locator in locators {
        if let Some(found) = locator.locate(key, kind) {
            if !found.is_empty() {
                return found;
            }
        }
    }
    Vec::new()
}

/// Per-key location set: every locator queried in order, matches concatenated
/// and de-duplicated by identity. For a single-locator registry this is just
/// that locator's filtered result.
fn locate_key(
    locators: &[Arc<dyn Locator>],
    key: &AssetKey,
    kind: &ResourceKind,
) -> Vec<Arc<Location>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for locator in locators {
        if let Some(found) = locator.locate(key, kind) {
            for location in found {
                if seen.insert(Arc::as_ptr(&location)) {
                    out.push(location);
                }
            }
        }
    }
    out
}
