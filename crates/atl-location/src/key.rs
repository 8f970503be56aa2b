use std::fmt;

use serde::{Deserialize, Serialize};

/// A symbolic key under which content can be requested.
///
/// The runtime treats all variants uniformly; the distinction matters at
/// catalog-build time, where the order of an entry's key list is significant:
/// the address comes first and is the canonical load key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetKey {
    /// The human-assigned address of an asset.
    Address(String),
    /// The stable identifier assigned by the authoring database.
    Guid(String),
    /// The index of an entry inside an ordered list (e.g. a scene list).
    Index(u64),
    /// A label shared by any number of assets.
    Label(String),
}

impl AssetKey {
    /// Render the key the way it appears in a load request or a catalog row.
    pub fn as_request_str(&self) -> String {
        self.to_string()
    }
}

impl From<&str> for AssetKey {
    fn from(address: &str) -> Self {
        Self::Address(address.to_owned())
    }
}

impl From<String> for AssetKey {
    fn from(address: String) -> Self {
        Self::Address(address)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(s) | Self::Guid(s) | Self::Label(s) => f.write_str(s),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}
