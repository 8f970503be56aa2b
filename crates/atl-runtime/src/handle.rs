use std::any::Any;
use std::marker::PhantomData;

use crate::{OperationGuard, OperationKey, OperationRegistry, OperationStatus, RuntimeError};

/// Type-less view onto one operation.
///
/// Handles are plain copyable values; validity is checked against the
/// registry arena on every use. A handle whose operation has been fully
/// released fails with [`RuntimeError::InvalidHandle`], never returns stale
/// data. Copying a handle does not acquire a reference; use
/// [`OperationRegistry::acquire`] for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleUntyped {
    key: OperationKey,
}

impl HandleUntyped {
    pub(crate) fn new(key: OperationKey) -> Self {
        Self { key }
    }

    /// The arena key this handle refers to.
    pub fn key(&self) -> OperationKey {
        self.key
    }

    /// Assume a result type, producing a typed handle.
    pub fn typed<T: Any + Send>(self) -> Handle<T> {
        Handle {
            key: self.key,
            _pd: PhantomData,
        }
    }

    /// True if the operation is still alive in `registry`.
    pub fn is_valid(&self, registry: &OperationRegistry) -> bool {
        registry.is_valid(*self)
    }

    /// Current status of the operation.
    pub fn status(&self, registry: &OperationRegistry) -> Result<OperationStatus, RuntimeError> {
        registry.status(*self)
    }

    /// Current percent-complete of the operation.
    pub fn progress(&self, registry: &OperationRegistry) -> Result<f32, RuntimeError> {
        registry.progress(*self)
    }
}

/// Typed view onto one operation producing a `T`.
pub struct Handle<T: Any + Send> {
    key: OperationKey,
    _pd: PhantomData<fn() -> T>,
}

impl<T: Any + Send> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Any + Send> Copy for Handle<T> {}

impl<T: Any + Send> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("key", &self.key).finish()
    }
}

impl<T: Any + Send> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T: Any + Send> From<HandleUntyped> for Handle<T> {
    fn from(handle: HandleUntyped) -> Self {
        handle.typed()
    }
}

impl<T: Any + Send> Handle<T> {
    /// The arena key this handle refers to.
    pub fn key(&self) -> OperationKey {
        self.key
    }

    /// Discard the result type.
    pub fn untyped(self) -> HandleUntyped {
        HandleUntyped::new(self.key)
    }

    /// Retrieve a guarded reference to the result, if the operation succeeded
    /// and produced a `T`.
    pub fn get<'a>(&self, registry: &'a OperationRegistry) -> Option<OperationGuard<'a, T>> {
        registry.get::<T>(self.untyped())
    }

    /// True if the operation is still alive in `registry`.
    pub fn is_valid(&self, registry: &OperationRegistry) -> bool {
        registry.is_valid(self.untyped())
    }

    /// Current status of the operation.
    pub fn status(&self, registry: &OperationRegistry) -> Result<OperationStatus, RuntimeError> {
        registry.status(self.untyped())
    }

    /// Current percent-complete of the operation.
    pub fn progress(&self, registry: &OperationRegistry) -> Result<f32, RuntimeError> {
        registry.progress(self.untyped())
    }
}
