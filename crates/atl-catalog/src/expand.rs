use std::collections::{HashMap, HashSet};

use atl_location::{AssetKey, ResourceKind};
use tracing::warn;

use crate::{
    entry::resources_relative, AssetEntry, AssetSource, CatalogEntry, CollectionRecord,
    COLLECTION_KIND, FOLDER_KIND, RESOURCES_GUID, SCENE_LIST_GUID,
};

/// Kind of a scene asset on the authoring side.
pub const SCENE_KIND: &str = "scene";

/// Kind a scene asset loads as at runtime.
pub const SCENE_INSTANCE_KIND: &str = "scene-instance";

/// How an authoring-only kind appears in the catalog.
#[derive(Debug, Clone)]
pub enum KindMapping {
    /// Substituted by its runtime-facing counterpart.
    Runtime(ResourceKind),
    /// Not loadable at runtime; rows of this kind are dropped with a
    /// diagnostic.
    Unsupported,
}

/// Explicit substitution table for authoring-only kinds.
///
/// Kinds absent from the table pass through unchanged. The table must name
/// every authoring-only kind the project uses; there is no assembly scanning
/// fallback.
#[derive(Debug, Clone)]
pub struct KindRemap {
    map: HashMap<ResourceKind, KindMapping>,
}

impl Default for KindRemap {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(
            ResourceKind::from_name("animator-controller"),
            KindMapping::Runtime(ResourceKind::from_name("runtime-animator-controller")),
        );
        map.insert(
            ResourceKind::from_name("audio-mixer-controller"),
            KindMapping::Runtime(ResourceKind::from_name("audio-mixer")),
        );
        map.insert(
            ResourceKind::from_name("audio-mixer-group-controller"),
            KindMapping::Runtime(ResourceKind::from_name("audio-mixer-group")),
        );
        Self { map }
    }
}

impl KindRemap {
    /// Register or override a mapping.
    pub fn insert(&mut self, authoring: ResourceKind, mapping: KindMapping) {
        self.map.insert(authoring, mapping);
    }

    /// The runtime kind for `kind`, or `None` when rows of this kind must be
    /// dropped.
    pub fn resolve(&self, kind: &ResourceKind) -> Option<ResourceKind> {
        match self.map.get(kind) {
            None => Some(kind.clone()),
            Some(KindMapping::Runtime(runtime)) => Some(runtime.clone()),
            Some(KindMapping::Unsupported) => None,
        }
    }
}

/// Controls how far [`Expander::gather`] expands an entry.
#[derive(Debug, Clone, Copy)]
pub struct ExpandFlags {
    /// Include the entry itself when it is atomic.
    pub include_self: bool,
    /// Recurse into sub-folders instead of emitting one sub-entry per
    /// immediate sub-folder.
    pub recurse_all: bool,
    /// Emit one sub-entry per named sub-representation of atomic assets.
    pub include_sub_objects: bool,
}

impl Default for ExpandFlags {
    fn default() -> Self {
        Self {
            include_self: true,
            recurse_all: true,
            include_sub_objects: false,
        }
    }
}

/// Flattens composite asset entries and projects them into catalog rows.
///
/// The expander owns the sub-entry table that makes expansion idempotent:
/// a sub-entry is created once per guid, and expanding the same composite
/// entry again yields the same entries, never duplicates.
pub struct Expander<'a> {
    source: &'a dyn AssetSource,
    sub_entries: HashMap<String, AssetEntry>,
    remap: KindRemap,
}

impl<'a> Expander<'a> {
    /// Create an expander over `source` with the default kind remap table.
    pub fn new(source: &'a dyn AssetSource) -> Self {
        Self::with_remap(source, KindRemap::default())
    }

    /// Create an expander with a project-specific remap table.
    pub fn with_remap(source: &'a dyn AssetSource, remap: KindRemap) -> Self {
        Self {
            source,
            sub_entries: HashMap::new(),
            remap,
        }
    }

    /// Number of distinct sub-entries created so far.
    pub fn sub_entry_count(&self) -> usize {
        self.sub_entries.len()
    }

    /// Expand `entry` into the concrete entries it stands for.
    ///
    /// Composite forms (scene list, resources folders, addressable folders,
    /// collections) yield their members; atomic entries yield themselves and,
    /// on request, one synthetic entry per sub-representation.
    pub fn gather(&mut self, entry: &AssetEntry, flags: ExpandFlags) -> Vec<AssetEntry> {
        let mut gathered = Vec::new();

        if entry.guid == SCENE_LIST_GUID {
            self.gather_scene_list(entry, &mut gathered);
        } else if entry.guid == RESOURCES_GUID {
            self.gather_resources(entry, flags, &mut gathered);
        } else if self.source.is_folder(&entry.path) {
            self.gather_folder(entry, flags, &mut gathered);
        } else if entry.kind.name() == COLLECTION_KIND {
            if let Some(records) = self.source.collection_records(&entry.path) {
                self.gather_collection(entry, &records, &mut gathered);
            }
        } else {
            if flags.include_self {
                gathered.push(entry.clone());
            }
            if flags.include_sub_objects {
                for sub in self.source.sub_objects(&entry.path) {
                    let mut synthetic = AssetEntry::new(
                        "",
                        format!("{}[{}]", entry.address, sub.name),
                        entry.path.clone(),
                        sub.kind,
                    );
                    synthetic.is_sub_asset = true;
                    synthetic.in_resources = entry.in_resources;
                    gathered.push(synthetic);
                }
            }
        }

        gathered
    }

    fn gather_scene_list(&mut self, parent: &AssetEntry, gathered: &mut Vec<AssetEntry>) {
        let mut index = 0u64;
        for scene in self.source.scene_list() {
            if !scene.enabled {
                continue;
            }
            let address = file_stem(&scene.path);
            let sub = sub_entry_if_unique(
                &mut self.sub_entries,
                &scene.guid,
                &address,
                &scene.path,
                ResourceKind::from_name(SCENE_KIND),
            );
            sub.in_scene_list = true;
            sub.scene_index = Some(index);
            sub.labels = parent.labels.clone();
            gathered.push(sub.clone());
            index += 1;
        }
    }

    fn gather_resources(
        &mut self,
        parent: &AssetEntry,
        flags: ExpandFlags,
        gathered: &mut Vec<AssetEntry>,
    ) {
        for root in self.source.resources_roots() {
            for file in self.source.files(&root, flags.recurse_all) {
                let address = resources_relative(&file.path);
                let sub = sub_entry_if_unique(
                    &mut self.sub_entries,
                    &file.guid,
                    &address,
                    &file.path,
                    file.kind,
                );
                sub.in_resources = true;
                sub.labels = parent.labels.clone();
                gathered.push(sub.clone());
            }
            if !flags.recurse_all {
                for folder in self.source.folders(&root) {
                    let address = resources_relative(&folder.path);
                    let sub = sub_entry_if_unique(
                        &mut self.sub_entries,
                        &folder.guid,
                        &address,
                        &folder.path,
                        ResourceKind::from_name(FOLDER_KIND),
                    );
                    sub.in_resources = true;
                    sub.labels = parent.labels.clone();
                    gathered.push(sub.clone());
                }
            }
        }
    }

    fn gather_folder(
        &mut self,
        parent: &AssetEntry,
        flags: ExpandFlags,
        gathered: &mut Vec<AssetEntry>,
    ) {
        let listed_scenes: HashSet<String> = self
            .source
            .scene_list()
            .into_iter()
            .map(|scene| scene.guid)
            .collect();

        for file in self.source.files(&parent.path, flags.recurse_all) {
            // scene-list members already have their own entries
            if listed_scenes.contains(&file.guid) {
                continue;
            }
            let address = format!("{}{}", parent.address, relative_path(&file.path, &parent.path));
            let sub = sub_entry_if_unique(
                &mut self.sub_entries,
                &file.guid,
                &address,
                &file.path,
                file.kind,
            );
            sub.in_resources = parent.in_resources;
            sub.labels = parent.labels.clone();
            gathered.push(sub.clone());
        }
        if !flags.recurse_all {
            for folder in self.source.folders(&parent.path) {
                let address =
                    format!("{}{}", parent.address, relative_path(&folder.path, &parent.path));
                let sub = sub_entry_if_unique(
                    &mut self.sub_entries,
                    &folder.guid,
                    &address,
                    &folder.path,
                    ResourceKind::from_name(FOLDER_KIND),
                );
                sub.in_resources = parent.in_resources;
                sub.labels = parent.labels.clone();
                gathered.push(sub.clone());
            }
        }
    }

    fn gather_collection(
        &mut self,
        parent: &AssetEntry,
        records: &[CollectionRecord],
        gathered: &mut Vec<AssetEntry>,
    ) {
        for record in records {
            let sub = sub_entry_if_unique(
                &mut self.sub_entries,
                &record.guid,
                &record.address,
                &record.path,
                record.kind.clone(),
            );
            sub.in_resources = record.in_resources;
            let mut labels = record.labels.clone();
            for label in &parent.labels {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
            sub.labels = labels;
            gathered.push(sub.clone());
        }
    }

    /// Project one gathered entry into catalog rows.
    ///
    /// Emits the main row, one row per loadable sub-representation (addressed
    /// `address[name]`, depending on the main row's canonical key) and, for
    /// each sub-representation kind the asset had not declared before, a
    /// typed alias row with the full key list so typed loads of the whole
    /// asset resolve. Authoring-only kinds go through the remap table;
    /// unsupported kinds are dropped with a diagnostic.
    pub fn catalog_entries(
        &self,
        entry: &AssetEntry,
        provider_id: &str,
        dependency_keys: &[AssetKey],
        extra: Option<&serde_json::Value>,
        entries: &mut Vec<CatalogEntry>,
    ) {
        // synthetic sub-asset entries are covered by their parent's rows
        if entry.is_sub_asset || entry.path.is_empty() {
            return;
        }

        let load_path = entry.load_path();
        let keys = entry.key_list();
        let mut main_kind = entry.kind.clone();
        if main_kind.name() == SCENE_KIND {
            main_kind = ResourceKind::from_name(SCENE_INSTANCE_KIND);
        }
        let Some(main_kind) = self.remap.resolve(&main_kind) else {
            warn!(
                kind = %entry.kind,
                internal_id = %load_path,
                "kind is not loadable at runtime, dropping entry"
            );
            return;
        };

        entries.push(
            CatalogEntry::new(keys.clone(), main_kind.clone(), load_path.clone(), provider_id)
                .with_dependencies(dependency_keys.to_vec())
                .with_extra(extra.cloned()),
        );
        let canonical = keys[0].clone();

        let mut kinds_seen = HashSet::new();
        kinds_seen.insert(main_kind);
        for sub in self.source.sub_objects(&entry.path) {
            let Some(kind) = self.remap.resolve(&sub.kind) else {
                warn!(
                    kind = %sub.kind,
                    name = %sub.name,
                    "sub-representation kind is not loadable at runtime, dropping"
                );
                continue;
            };
            let mut sub_keys = vec![AssetKey::Address(format!("{}[{}]", entry.address, sub.name))];
            if !entry.guid.is_empty() {
                sub_keys.push(AssetKey::Guid(format!("{}[{}]", entry.guid, sub.name)));
            }
            entries.push(
                CatalogEntry::new(
                    sub_keys,
                    kind.clone(),
                    format!("{}[{}]", load_path, sub.name),
                    provider_id,
                )
                .with_dependencies(vec![canonical.clone()])
                .with_extra(extra.cloned()),
            );
            if kinds_seen.insert(kind.clone()) {
                entries.push(
                    CatalogEntry::new(keys.clone(), kind, load_path.clone(), provider_id)
                        .with_dependencies(dependency_keys.to_vec())
                        .with_extra(extra.cloned()),
                );
            }
        }
    }
}

/// Fetch or create the cached sub-entry for `guid`. Expansion is idempotent:
/// the same guid always maps to the same entry.
fn sub_entry_if_unique<'m>(
    sub_entries: &'m mut HashMap<String, AssetEntry>,
    guid: &str,
    address: &str,
    path: &str,
    kind: ResourceKind,
) -> &'m mut AssetEntry {
    sub_entries
        .entry(guid.to_owned())
        .or_insert_with(|| AssetEntry::new(guid, address, path, kind))
}

fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(dot) => name[..dot].to_owned(),
        None => name.to_owned(),
    }
}

fn relative_path<'a>(file: &'a str, folder: &str) -> &'a str {
    file.strip_prefix(folder).unwrap_or(file)
}
