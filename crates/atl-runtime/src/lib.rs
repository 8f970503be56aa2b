//! Asynchronous operation runtime for addressable content.
//!
//! Every load is represented by an operation living in an arena owned by the
//! [`OperationRegistry`]. Callers hold copyable, generation-checked
//! [`HandleUntyped`]/[`Handle`] values and drive progress with
//! [`OperationRegistry::update`]; the runtime never spawns threads of its
//! own. A [`LoaderProvider`] may delegate work to background threads or tasks
//! and report back through whatever channel its [`ProviderWork`] polls.
//!
//! Operations compose into arbitrary DAGs:
//! - a *chain* runs a continuation against the first stage's result to
//!   produce its second stage;
//! - a *group* aggregates a fixed set of children into one handle.
//!
//! Reference counting is explicit (`acquire`/`release`). When an operation's
//! count reaches zero its result is handed back to the provider that produced
//! it, the in-flight de-duplication entry is removed, and every handle to it
//! becomes invalid. Two requests for the same canonical key and kind share
//! one underlying operation while it is alive.

// crate-specific lint exceptions:
#![allow(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub use error::*;

mod handle;
pub use handle::*;

mod operation;
pub use operation::*;

mod provider;
pub use provider::*;

mod registry;
pub use registry::*;

mod download;
pub use download::*;

#[cfg(test)]
mod test_provider;
