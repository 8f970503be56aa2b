use std::any::Any;
use std::sync::Arc;

use atl_location::{Location, ResourceKind};
use slotmap::new_key_type;

use crate::{HandleUntyped, ProviderWork, RuntimeError};

new_key_type! {
    /// Generation-checked key of an operation slot in the registry arena.
    pub struct OperationKey;
}

/// Highest progress an operation may report while still running. Exactly 1.0
/// is reserved for terminal states.
pub(crate) const MAX_RUNNING_PROGRESS: f32 = 0.999_999;

/// Lifecycle state of an operation.
///
/// Transitions are one-directional: `Pending → Running → {Succeeded,
/// Failed}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Created, not yet started.
    Pending,
    /// Started; progress may change monotonically.
    Running,
    /// Finished with a result.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl OperationStatus {
    /// True for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Fired when an operation reaches a terminal state. Callbacks for one
/// operation run in registration order, after the result is fully set.
pub type CompletionCallback =
    Box<dyn FnOnce(&crate::OperationRegistry, HandleUntyped, OperationStatus) + Send>;

/// Produces a chain's second stage from the first stage's result. Invoked
/// exactly once, only after the first stage succeeded.
pub type Continuation =
    Box<dyn FnOnce(&crate::OperationRegistry, &(dyn Any + Send)) -> HandleUntyped + Send>;

/// De-duplication key of a load request: canonical load key plus requested
/// kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Fingerprint {
    pub(crate) key: String,
    pub(crate) kind: ResourceKind,
}

impl Fingerprint {
    pub(crate) fn of(location: &Location) -> Self {
        Self {
            key: location.primary_key().to_owned(),
            kind: location.kind().clone(),
        }
    }
}

pub(crate) enum OperationKind {
    /// Leaf load executed by a registered provider. The job is created when
    /// the operation starts.
    Provider {
        location: Arc<Location>,
        job: Option<Box<dyn ProviderWork>>,
    },
    /// Two-stage operation; the second stage is produced by a continuation
    /// once the first stage succeeds.
    Chain {
        first: HandleUntyped,
        continuation: Option<Continuation>,
        second: Option<HandleUntyped>,
    },
    /// Fixed ordered set of child operations aggregated into one handle.
    Group { children: Vec<HandleUntyped> },
    /// Operation created directly in a terminal state.
    Immediate,
}

pub(crate) struct OperationSlot {
    pub(crate) kind: OperationKind,
    pub(crate) status: OperationStatus,
    pub(crate) progress: f32,
    pub(crate) refs: usize,
    pub(crate) result: Option<Box<dyn Any + Send>>,
    pub(crate) error: Option<RuntimeError>,
    pub(crate) callbacks: Vec<CompletionCallback>,
    pub(crate) auto_release: bool,
    pub(crate) fingerprint: Option<Fingerprint>,
    pub(crate) provider_id: Option<String>,
}

impl OperationSlot {
    pub(crate) fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            status: OperationStatus::Pending,
            progress: 0.0,
            refs: 1,
            result: None,
            error: None,
            callbacks: Vec::new(),
            auto_release: false,
            fingerprint: None,
            provider_id: None,
        }
    }

    pub(crate) fn succeed(&mut self, result: Option<Box<dyn Any + Send>>) {
        self.status = OperationStatus::Succeeded;
        self.progress = 1.0;
        if result.is_some() {
            self.result = result;
        }
        self.drop_job();
    }

    pub(crate) fn fail(&mut self, error: RuntimeError) {
        self.status = OperationStatus::Failed;
        self.progress = 1.0;
        self.error = Some(error);
        self.drop_job();
    }

    /// Raise progress monotonically, staying below 1.0 until terminal.
    pub(crate) fn raise_progress(&mut self, progress: f32) -> bool {
        let clamped = progress.clamp(0.0, MAX_RUNNING_PROGRESS);
        if clamped > self.progress {
            self.progress = clamped;
            true
        } else {
            false
        }
    }

    fn drop_job(&mut self) {
        if let OperationKind::Provider { job, .. } = &mut self.kind {
            *job = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
    }

    #[test]
    fn progress_never_reaches_one_while_running() {
        let mut slot = OperationSlot::new(OperationKind::Immediate);
        assert!(slot.raise_progress(0.5));
        assert!(!slot.raise_progress(0.25), "progress is monotone");
        assert!(slot.raise_progress(2.0));
        assert!(slot.progress < 1.0);

        slot.succeed(None);
        assert!((slot.progress - 1.0).abs() < f32::EPSILON);
    }
}
