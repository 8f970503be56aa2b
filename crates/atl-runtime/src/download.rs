//! Pre-download accounting: how many bytes a set of locations would fetch.

use std::collections::HashSet;
use std::sync::Arc;

use atl_location::{AssetKey, Location, MergeMode, ResourceKind};

use crate::{OperationRegistry, RuntimeError};

/// Answers whether a remote payload is already present in the local cache
/// under a specific content hash. A stale cached copy (different hash) does
/// not count.
pub trait CacheInspector: Send + Sync {
    /// True if `bundle_id` is cached with exactly `content_hash`.
    fn is_cached(&self, bundle_id: &str, content_hash: &str) -> bool;
}

/// Cache inspector that reports nothing as cached.
pub struct NoCache;

impl CacheInspector for NoCache {
    fn is_cached(&self, _bundle_id: &str, _content_hash: &str) -> bool {
        false
    }
}

/// Total bytes that loading `roots` (and all their transitive dependencies)
/// would download.
///
/// Each distinct payload — identified by internal id plus content hash — is
/// counted once no matter how many roots depend on it. Payloads with no
/// declared size cost nothing, and payloads already cached under their
/// current hash cost nothing.
pub fn compute_download_size(roots: &[Arc<Location>], cache: &dyn CacheInspector) -> u64 {
    let mut visited: HashSet<*const Location> = HashSet::new();
    let mut counted: HashSet<(String, String)> = HashSet::new();
    let mut total = 0u64;

    let mut stack: Vec<&Arc<Location>> = roots.iter().collect();
    while let Some(location) = stack.pop() {
        if !visited.insert(Arc::as_ptr(location)) {
            continue;
        }
        stack.extend(location.dependencies());

        let payload = location.payload();
        if payload.declared_size == 0 {
            continue;
        }
        let hash = payload.content_hash.as_deref().unwrap_or("");
        let fingerprint = (location.internal_id().to_owned(), hash.to_owned());
        if counted.contains(&fingerprint) {
            continue;
        }
        counted.insert(fingerprint);
        if !hash.is_empty() && cache.is_cached(location.internal_id(), hash) {
            continue;
        }
        total += payload.declared_size;
    }

    total
}

impl OperationRegistry {
    /// Bytes a [`load`](Self::load) of `keys` would download, given the
    /// current cache state. Resolves with [`MergeMode::Union`] across all
    /// kinds so every location the keys could produce is accounted for.
    ///
    /// # Errors
    /// `RuntimeError::ResolutionFailed` when no key resolves.
    pub fn download_size(
        &self,
        keys: &[AssetKey],
        cache: &dyn CacheInspector,
    ) -> Result<u64, RuntimeError> {
        let locations = self
            .locators()
            .resolve(keys, &ResourceKind::any(), MergeMode::Union)
            .ok_or(RuntimeError::ResolutionFailed)?;
        Ok(compute_download_size(&locations, cache))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use atl_location::LocationPayload;

    use super::*;

    struct HashSetCache(HashSet<(String, String)>);

    impl CacheInspector for HashSetCache {
        fn is_cached(&self, bundle_id: &str, content_hash: &str) -> bool {
            self.0
                .contains(&(bundle_id.to_owned(), content_hash.to_owned()))
        }
    }

    fn bundle(id: &str, size: u64, hash: &str) -> Arc<Location> {
        Arc::new(
            Location::new(id, id, "bundle", ResourceKind::from_name("bundle")).with_payload(
                LocationPayload {
                    declared_size: size,
                    content_hash: Some(hash.to_owned()),
                },
            ),
        )
    }

    fn asset(id: &str, deps: Vec<Arc<Location>>) -> Arc<Location> {
        Arc::new(
            Location::new(id, id, "file", ResourceKind::from_name("texture"))
                .with_dependencies(deps),
        )
    }

    #[test]
    fn shared_bundle_is_counted_once() {
        let shared = bundle("shared.bundle", 1000, "h1");
        let a = asset("a", vec![Arc::clone(&shared), bundle("a.bundle", 200, "h2")]);
        let b = asset("b", vec![shared, bundle("b.bundle", 300, "h3")]);

        let total = compute_download_size(&[a, b], &NoCache);
        assert_eq!(total, 1500);
    }

    #[test]
    fn cached_payloads_cost_nothing() {
        let mut cached = HashSet::new();
        cached.insert(("shared.bundle".to_owned(), "h1".to_owned()));
        let cache = HashSetCache(cached);

        let a = asset(
            "a",
            vec![bundle("shared.bundle", 1000, "h1"), bundle("a.bundle", 200, "h2")],
        );
        assert_eq!(compute_download_size(&[a], &cache), 200);
    }

    #[test]
    fn stale_cache_entry_still_downloads() {
        let mut cached = HashSet::new();
        cached.insert(("shared.bundle".to_owned(), "old".to_owned()));
        let cache = HashSetCache(cached);

        let a = asset("a", vec![bundle("shared.bundle", 1000, "new")]);
        assert_eq!(compute_download_size(&[a], &cache), 1000);
    }

    #[test]
    fn sizeless_locations_cost_nothing() {
        let a = asset("a", vec![asset("nested", vec![])]);
        assert_eq!(compute_download_size(&[a], &NoCache), 0);
    }
}
