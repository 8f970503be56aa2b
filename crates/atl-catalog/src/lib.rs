//! Authoring-side catalog generation for addressable content.
//!
//! An authoring database exposes raw [`AssetEntry`] values through an
//! [`AssetSource`]. The [`Expander`] flattens composite entries (scene lists,
//! folders, collections, assets with sub-representations) into the concrete
//! entries they stand for, then projects each of them into loader-ready
//! [`CatalogEntry`] rows. A [`Catalog`] is the persisted, ordered list of
//! those rows; at runtime it turns back into a locator whose dependency
//! locations are shared.

#![warn(missing_docs)]

mod catalog;
pub use catalog::*;

mod entry;
pub use entry::*;

mod expand;
pub use expand::*;
