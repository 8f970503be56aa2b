//! Symbolic key to concrete location mapping.
//!
//! Callers address content by [`AssetKey`] (an address string, a stable guid,
//! a label shared by many assets, or a list index). A [`Locator`] maps keys to
//! [`Location`]s, the immutable descriptions of where a piece of content
//! lives and which loader provider can produce it. The [`LocatorRegistry`]
//! holds an ordered list of locators and merges their per-key results under a
//! [`MergeMode`] policy.
//!
//! Locations are always shared as `Arc<Location>`; two resolutions of the
//! same key return the same allocation, which downstream layers rely on for
//! de-duplication.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod key;
pub use key::*;

mod kind;
pub use kind::*;

mod location;
pub use location::*;

mod locator;
pub use locator::*;

mod registry;
pub use registry::*;
