//! A hand-driven provider for exercising the operation runtime.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use atl_location::Location;

use crate::{LoaderProvider, ProviderWork, RuntimeError, WorkState};

pub(crate) enum ManualState {
    InProgress(f32),
    Completed(Option<Box<dyn Any + Send>>),
    Failed(RuntimeError),
}

/// Provider whose loads only advance when the test says so. Each load is
/// keyed by the location's internal id; tests push progress, a result or a
/// failure and then tick the registry.
pub(crate) struct ManualProvider {
    id: String,
    states: Arc<Mutex<HashMap<String, ManualState>>>,
    load_calls: Arc<Mutex<Vec<String>>>,
    release_count: Arc<Mutex<usize>>,
}

impl ManualProvider {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            states: Arc::new(Mutex::new(HashMap::new())),
            load_calls: Arc::new(Mutex::new(Vec::new())),
            release_count: Arc::new(Mutex::new(0)),
        }
    }

    pub(crate) fn set_progress(&self, internal_id: &str, progress: f32) {
        self.states
            .lock()
            .unwrap()
            .insert(internal_id.to_owned(), ManualState::InProgress(progress));
    }

    pub(crate) fn complete<T: Any + Send>(&self, internal_id: &str, value: T) {
        self.states.lock().unwrap().insert(
            internal_id.to_owned(),
            ManualState::Completed(Some(Box::new(value))),
        );
    }

    pub(crate) fn fail(&self, internal_id: &str, error: RuntimeError) {
        self.states
            .lock()
            .unwrap()
            .insert(internal_id.to_owned(), ManualState::Failed(error));
    }

    /// Internal ids passed to `load`, in call order.
    pub(crate) fn load_calls(&self) -> Vec<String> {
        self.load_calls.lock().unwrap().clone()
    }

    pub(crate) fn release_count(&self) -> usize {
        *self.release_count.lock().unwrap()
    }
}

impl LoaderProvider for ManualProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn load(&self, location: &Arc<Location>) -> Box<dyn ProviderWork> {
        self.load_calls
            .lock()
            .unwrap()
            .push(location.internal_id().to_owned());
        Box::new(ManualWork {
            internal_id: location.internal_id().to_owned(),
            states: Arc::clone(&self.states),
        })
    }

    fn release(&self, result: Box<dyn Any + Send>) {
        *self.release_count.lock().unwrap() += 1;
        drop(result);
    }
}

struct ManualWork {
    internal_id: String,
    states: Arc<Mutex<HashMap<String, ManualState>>>,
}

impl ProviderWork for ManualWork {
    fn step(&mut self) -> WorkState {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&self.internal_id) else {
            return WorkState::InProgress(0.0);
        };
        match state {
            ManualState::InProgress(progress) => WorkState::InProgress(*progress),
            ManualState::Completed(value) => match value.take() {
                Some(value) => WorkState::Completed(value),
                None => WorkState::Failed(RuntimeError::LoadFailed(
                    "result was already taken".to_owned(),
                )),
            },
            ManualState::Failed(error) => WorkState::Failed(error.clone()),
        }
    }
}
