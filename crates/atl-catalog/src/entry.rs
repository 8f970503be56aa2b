use atl_location::{AssetKey, ResourceKind};

/// Guid of the built-in scene-list pseudo entry.
pub const SCENE_LIST_GUID: &str = "scene-list";

/// Guid of the implicit resources-folders pseudo entry.
pub const RESOURCES_GUID: &str = "resources";

/// Kind of an entry that is itself a collection of other entries.
pub const COLLECTION_KIND: &str = "entry-collection";

/// Kind of a folder sub-entry produced by non-recursive expansion.
pub const FOLDER_KIND: &str = "folder";

/// A raw addressable entry as the authoring database stores it.
///
/// Entries may stand for a single asset, a folder, a collection or one of the
/// built-in pseudo entries ([`SCENE_LIST_GUID`], [`RESOURCES_GUID`]); the
/// [`crate::Expander`] flattens the composite forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// Stable identifier assigned by the authoring database. Empty for
    /// synthetic sub-representation entries.
    pub guid: String,
    /// Human-assigned address; the canonical load key.
    pub address: String,
    /// Authoring-side path of the backing asset.
    pub path: String,
    /// Declared kind of the main asset.
    pub kind: ResourceKind,
    /// Labels applied to this entry.
    pub labels: Vec<String>,
    /// True when the asset lives under a resources folder and is addressed
    /// by its resources-relative path.
    pub in_resources: bool,
    /// True when the entry was produced from the built-in scene list.
    pub in_scene_list: bool,
    /// Position in the enabled scene list, when applicable.
    pub scene_index: Option<u64>,
    /// True for synthetic entries addressing one sub-representation of a
    /// parent asset.
    pub is_sub_asset: bool,
}

impl AssetEntry {
    /// Create a plain entry with no labels.
    pub fn new(
        guid: impl Into<String>,
        address: impl Into<String>,
        path: impl Into<String>,
        kind: ResourceKind,
    ) -> Self {
        Self {
            guid: guid.into(),
            address: address.into(),
            path: path.into(),
            kind,
            labels: Vec::new(),
            in_resources: false,
            in_scene_list: false,
            scene_index: None,
            is_sub_asset: false,
        }
    }

    /// The ordered key list of this entry's catalog rows.
    ///
    /// The address must be the first key; then the guid if present, the scene
    /// index for scene-list members, and finally every label.
    pub fn key_list(&self) -> Vec<AssetKey> {
        let mut keys = vec![AssetKey::Address(self.address.clone())];
        if !self.guid.is_empty() {
            keys.push(AssetKey::Guid(self.guid.clone()));
        }
        if self.in_scene_list {
            if let Some(index) = self.scene_index {
                keys.push(AssetKey::Index(index));
            }
        }
        keys.extend(self.labels.iter().cloned().map(AssetKey::Label));
        keys
    }

    /// The internal id the loader addresses this asset by. Resources-folder
    /// assets load by their resources-relative, extension-stripped path.
    pub fn load_path(&self) -> String {
        if self.in_resources {
            resources_relative(&self.path)
        } else {
            self.path.clone()
        }
    }
}

/// Strip everything up to and including the last `Resources/` segment and
/// drop the file extension.
pub(crate) fn resources_relative(path: &str) -> String {
    let relative = match path.rfind("Resources/") {
        Some(at) => &path[at + "Resources/".len()..],
        None => path,
    };
    match relative.rfind('.') {
        Some(dot) if !relative[dot..].contains('/') => relative[..dot].to_owned(),
        _ => relative.to_owned(),
    }
}

/// One scene of the built-in scene list.
#[derive(Debug, Clone)]
pub struct SceneRef {
    /// Stable identifier of the scene asset.
    pub guid: String,
    /// Authoring-side path of the scene asset.
    pub path: String,
    /// Disabled scenes are skipped during expansion.
    pub enabled: bool,
}

/// One record of a collection entry.
#[derive(Debug, Clone)]
pub struct CollectionRecord {
    /// Stable identifier of the referenced asset.
    pub guid: String,
    /// Address the record was exported under.
    pub address: String,
    /// Authoring-side path of the referenced asset.
    pub path: String,
    /// Declared kind of the referenced asset.
    pub kind: ResourceKind,
    /// Labels carried by the record itself, merged with the collection's.
    pub labels: Vec<String>,
    /// Whether the referenced asset lives under a resources folder.
    pub in_resources: bool,
}

/// One named sub-representation of an asset.
#[derive(Debug, Clone)]
pub struct SubObject {
    /// Name, unique within the parent asset.
    pub name: String,
    /// Declared kind of the sub-representation.
    pub kind: ResourceKind,
}

/// A file or folder enumerated by an [`AssetSource`].
#[derive(Debug, Clone)]
pub struct SourceAsset {
    /// Authoring-side path.
    pub path: String,
    /// Stable identifier.
    pub guid: String,
    /// Declared kind.
    pub kind: ResourceKind,
}

/// The authoring database the expander enumerates. File-system or project
/// backed; out of scope here beyond this interface.
pub trait AssetSource {
    /// True if `path` names a folder rather than a single asset.
    fn is_folder(&self, path: &str) -> bool;

    /// Asset files under `path`, recursively or one level deep.
    fn files(&self, path: &str, recursive: bool) -> Vec<SourceAsset>;

    /// Immediate sub-folders of `path`.
    fn folders(&self, path: &str) -> Vec<SourceAsset>;

    /// Roots of every resources folder in the project.
    fn resources_roots(&self) -> Vec<String>;

    /// The built-in scene list, in build order.
    fn scene_list(&self) -> Vec<SceneRef>;

    /// Records of a collection asset, or `None` if `path` is not one.
    fn collection_records(&self, path: &str) -> Option<Vec<CollectionRecord>>;

    /// Named sub-representations of the asset at `path`.
    fn sub_objects(&self, path: &str) -> Vec<SubObject>;
}
