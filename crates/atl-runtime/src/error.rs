use crate::OperationKey;

/// Error type for the operation runtime.
///
/// Clonable so a dependency's failure can be attached verbatim to every
/// operation that depended on it.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A handle referenced an operation that no longer exists.
    #[error("invalid operation handle {0:?}")]
    InvalidHandle(OperationKey),

    /// A handle was released more times than it was acquired.
    #[error("operation {0:?} was already fully released")]
    AlreadyReleased(OperationKey),

    /// A location named a loader provider that is not registered.
    #[error("no loader provider registered for '{0}'")]
    ProviderNotFound(String),

    /// Key resolution produced no locations under the requested merge mode.
    #[error("no locations found for the requested keys")]
    ResolutionFailed,

    /// A provider reported a load failure.
    #[error("load failed: {0}")]
    LoadFailed(String),
}
