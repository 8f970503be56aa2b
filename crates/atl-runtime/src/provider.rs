use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use atl_location::Location;

use crate::RuntimeError;

/// Outcome of one cooperative step of provider work.
pub enum WorkState {
    /// Still working; current percent-complete estimate in `0.0..1.0`.
    InProgress(f32),
    /// Finished with a result.
    Completed(Box<dyn Any + Send>),
    /// Finished with an error.
    Failed(RuntimeError),
}

/// One in-flight provider load, polled by the runtime on every
/// [`crate::OperationRegistry::update`] tick.
///
/// `step` must not block: a provider that delegates to a background thread or
/// task polls its completion channel here and returns `InProgress` until the
/// work reports back.
pub trait ProviderWork: Send {
    /// Advance the work and report its state.
    fn step(&mut self) -> WorkState;
}

/// Capability that turns a [`Location`] into loaded content.
///
/// One implementation is registered per provider identifier string; locations
/// carry the identifier of the provider able to load them. `load` and
/// `release` are called with the registry's internal lock held and must not
/// call back into the registry.
pub trait LoaderProvider: Send + Sync {
    /// Identifier this provider is registered under.
    fn id(&self) -> &str;

    /// Begin loading the content described by `location`.
    fn load(&self, location: &Arc<Location>) -> Box<dyn ProviderWork>;

    /// Dispose of a result produced by this provider, so backing resources
    /// can be freed or pooled. Called when the owning operation's reference
    /// count reaches zero.
    fn release(&self, result: Box<dyn Any + Send>) {
        drop(result);
    }
}

/// Provider that reads raw bytes from files under a root directory. The
/// location's internal id is the path relative to the root; the result is a
/// `Vec<u8>`.
pub struct FileProvider {
    id: String,
    root: PathBuf,
}

impl FileProvider {
    /// Default identifier of [`FileProvider`].
    pub const ID: &'static str = "file";

    /// Create a provider rooted at `root`, registered as [`Self::ID`].
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_id(Self::ID, root)
    }

    /// Create a provider registered under a custom identifier.
    pub fn with_id(id: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            root: root.as_ref().to_owned(),
        }
    }
}

impl LoaderProvider for FileProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn load(&self, location: &Arc<Location>) -> Box<dyn ProviderWork> {
        Box::new(FileWork {
            path: self.root.join(location.internal_id()),
        })
    }
}

struct FileWork {
    path: PathBuf,
}

impl ProviderWork for FileWork {
    fn step(&mut self) -> WorkState {
        match std::fs::read(&self.path) {
            Ok(bytes) => WorkState::Completed(Box::new(bytes)),
            Err(err) => WorkState::Failed(RuntimeError::LoadFailed(format!(
                "{}: {}",
                self.path.display(),
                err
            ))),
        }
    }
}
