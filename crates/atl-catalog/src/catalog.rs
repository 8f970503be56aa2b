use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use atl_location::{AssetKey, KeyedLocator, Location, LocationPayload, ResourceKind};
use serde::{Deserialize, Serialize};

/// Error type for catalog persistence and locator construction.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    /// Reading or writing the catalog file failed.
    #[error("catalog i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The catalog file is not valid JSON or violates the row schema.
    #[error("catalog is malformed: {0}")]
    Json(#[from] serde_json::Error),

    /// An entry has no keys; every row needs a canonical load key.
    #[error("catalog entry '{0}' has an empty key list")]
    EmptyKeyList(String),

    /// A dependency key matches no entry in the catalog.
    #[error("dependency key '{0}' matches no catalog entry")]
    UnknownDependency(String),

    /// Entry dependencies form a cycle.
    #[error("dependency cycle through catalog entry '{0}'")]
    DependencyCycle(String),
}

/// One loader-ready row of the catalog.
///
/// Generated by catalog expansion and never mutated afterwards. The key list
/// order is significant: the first key is the canonical load key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Ordered keys this row resolves under.
    pub keys: Vec<AssetKey>,
    /// Declared result kind.
    pub kind: ResourceKind,
    /// Loader-specific address.
    pub internal_id: String,
    /// Identifier of the loader provider able to load this row.
    pub provider_id: String,
    /// Canonical keys of rows that must be loaded first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_keys: Vec<AssetKey>,
    /// Opaque data attached by the build step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    /// Size/version metadata, carried through to the runtime location.
    #[serde(default, skip_serializing_if = "payload_is_empty")]
    pub payload: LocationPayload,
}

fn payload_is_empty(payload: &LocationPayload) -> bool {
    *payload == LocationPayload::default()
}

impl CatalogEntry {
    /// Create a row with no dependencies, extra data or payload.
    pub fn new(
        keys: Vec<AssetKey>,
        kind: ResourceKind,
        internal_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            kind,
            internal_id: internal_id.into(),
            provider_id: provider_id.into(),
            dependency_keys: Vec::new(),
            extra: None,
            payload: LocationPayload::default(),
        }
    }

    /// Attach dependency keys.
    #[must_use]
    pub fn with_dependencies(mut self, dependency_keys: Vec<AssetKey>) -> Self {
        self.dependency_keys = dependency_keys;
        self
    }

    /// Attach opaque build-step data.
    #[must_use]
    pub fn with_extra(mut self, extra: Option<serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Attach size/version metadata.
    #[must_use]
    pub fn with_payload(mut self, payload: LocationPayload) -> Self {
        self.payload = payload;
        self
    }

    /// The canonical load key, if the row has any keys at all.
    pub fn canonical_key(&self) -> Option<&AssetKey> {
        self.keys.first()
    }
}

/// The persisted catalog: a flat, ordered list of [`CatalogEntry`] rows.
///
/// This is the only on-disk contract between the build step and the runtime;
/// it round-trips exactly through JSON.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// The rows, in generation order.
    pub entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Serialize to a writer as JSON.
    ///
    /// # Errors
    /// `CatalogError::Json` on serialization failure.
    pub fn save<W: Write>(&self, writer: W) -> Result<(), CatalogError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Deserialize from a reader.
    ///
    /// # Errors
    /// `CatalogError::Json` when the content is not a valid catalog.
    pub fn load<R: Read>(reader: R) -> Result<Self, CatalogError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Serialize to a file at `path`.
    ///
    /// # Errors
    /// `CatalogError::Io` when the file cannot be created, `Json` on
    /// serialization failure.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), CatalogError> {
        self.save(std::fs::File::create(path)?)
    }

    /// Deserialize from a file at `path`.
    ///
    /// # Errors
    /// `CatalogError::Io` when the file cannot be opened, `Json` when its
    /// content is not a valid catalog.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::load(std::fs::File::open(path)?)
    }

    /// Build the runtime locator for this catalog.
    ///
    /// Every row becomes one shared `Arc<Location>`, registered under each of
    /// its keys; rows referencing the same dependency row share the
    /// dependency's single location instance, so resolution hands out
    /// reference-identical locations and download accounting can de-duplicate
    /// by identity.
    ///
    /// # Errors
    /// `EmptyKeyList`, `UnknownDependency` or `DependencyCycle` when the rows
    /// are not a well-formed dependency DAG.
    pub fn into_locator(&self) -> Result<KeyedLocator, CatalogError> {
        let mut by_key: HashMap<&AssetKey, usize> = HashMap::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.keys.is_empty() {
                return Err(CatalogError::EmptyKeyList(entry.internal_id.clone()));
            }
            for key in &entry.keys {
                by_key.entry(key).or_insert(index);
            }
        }

        let mut built: Vec<Option<Arc<Location>>> = vec![None; self.entries.len()];
        let mut visiting = vec![false; self.entries.len()];
        for index in 0..self.entries.len() {
            self.build_location(index, &by_key, &mut built, &mut visiting)?;
        }

        let mut locator = KeyedLocator::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let location = built[index].as_ref().map(Arc::clone);
            if let Some(location) = location {
                for key in &entry.keys {
                    locator.insert(key.clone(), Arc::clone(&location));
                }
            }
        }
        Ok(locator)
    }

    fn build_location(
        &self,
        index: usize,
        by_key: &HashMap<&AssetKey, usize>,
        built: &mut Vec<Option<Arc<Location>>>,
        visiting: &mut Vec<bool>,
    ) -> Result<Arc<Location>, CatalogError> {
        if let Some(location) = &built[index] {
            return Ok(Arc::clone(location));
        }
        let entry = &self.entries[index];
        if visiting[index] {
            return Err(CatalogError::DependencyCycle(entry.internal_id.clone()));
        }
        visiting[index] = true;

        let mut dependencies = Vec::with_capacity(entry.dependency_keys.len());
        for key in &entry.dependency_keys {
            let dependency = *by_key
                .get(key)
                .ok_or_else(|| CatalogError::UnknownDependency(key.as_request_str()))?;
            dependencies.push(self.build_location(dependency, by_key, built, visiting)?);
        }

        let location = Arc::new(
            Location::new(
                entry.keys[0].as_request_str(),
                entry.internal_id.clone(),
                entry.provider_id.clone(),
                entry.kind.clone(),
            )
            .with_dependencies(dependencies)
            .with_payload(entry.payload.clone()),
        );
        visiting[index] = false;
        built[index] = Some(Arc::clone(&location));
        Ok(location)
    }
}
