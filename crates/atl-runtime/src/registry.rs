use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use atl_location::{AssetKey, Location, Locator, LocatorRegistry, MergeMode, ResourceKind};
use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, error};

use crate::{
    CompletionCallback, Continuation, Fingerprint, HandleUntyped, LoaderProvider, OperationKey,
    OperationKind, OperationSlot, OperationStatus, RuntimeError, WorkState,
};
use crate::Handle;

/// Notification sent to event subscribers.
#[derive(Debug, Clone, Copy)]
pub enum OperationEvent {
    /// An operation reached a terminal state.
    Completed {
        /// The completed operation.
        handle: HandleUntyped,
        /// Its terminal status.
        status: OperationStatus,
    },
    /// An operation's reference count reached zero and its slot was freed.
    Released(HandleUntyped),
}

/// Options which can be used to configure the creation of
/// [`OperationRegistry`].
pub struct RuntimeOptions {
    providers: HashMap<String, Arc<dyn LoaderProvider>>,
    locators: Vec<Arc<dyn Locator>>,
}

impl RuntimeOptions {
    /// Creates a blank set of options.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            locators: Vec::new(),
        }
    }

    /// Register a loader provider under its own identifier.
    #[must_use]
    pub fn add_provider(mut self, provider: Arc<dyn LoaderProvider>) -> Self {
        self.providers.insert(provider.id().to_owned(), provider);
        self
    }

    /// Append a locator to the resolution order.
    #[must_use]
    pub fn add_locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locators.push(locator);
        self
    }

    /// Creates an [`OperationRegistry`] based on these options.
    pub fn create(self) -> Arc<OperationRegistry> {
        let locators = LocatorRegistry::new();
        for locator in self.locators {
            locators.add_locator(locator);
        }
        Arc::new(OperationRegistry {
            inner: RwLock::new(Inner {
                ops: SlotMap::with_key(),
            }),
            providers: self.providers,
            locators,
            in_flight: Mutex::new(HashMap::new()),
            event_txs: Mutex::new(Vec::new()),
        })
    }
}

struct Inner {
    ops: SlotMap<OperationKey, OperationSlot>,
}

/// Guarded reference to an operation's result.
pub struct OperationGuard<'a, T> {
    _guard: RwLockReadGuard<'a, Inner>,
    ptr: *const T,
}

impl<'a, T> std::ops::Deref for OperationGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

/// Runtime context owning the operation arena, the loader-provider capability
/// table, the locator registry and the in-flight de-duplication table.
///
/// The host drives progress by calling [`update`](Self::update); operations
/// never run on dedicated threads of their own.
pub struct OperationRegistry {
    inner: RwLock<Inner>,
    providers: HashMap<String, Arc<dyn LoaderProvider>>,
    locators: LocatorRegistry,
    in_flight: Mutex<HashMap<Fingerprint, OperationKey>>,
    event_txs: Mutex<Vec<crossbeam_channel::Sender<OperationEvent>>>,
}

impl OperationRegistry {
    /// The locator registry backing key resolution.
    pub fn locators(&self) -> &LocatorRegistry {
        &self.locators
    }

    /// Resolve keys to locations; see [`LocatorRegistry::resolve`].
    pub fn resolve(
        &self,
        keys: &[AssetKey],
        kind: &ResourceKind,
        mode: MergeMode,
    ) -> Option<Vec<Arc<Location>>> {
        self.locators.resolve(keys, kind, mode)
    }

    /// Resolve `keys` under `mode` and start loading the result.
    ///
    /// A single resolved location yields its own operation; several locations
    /// are aggregated into a group. Requests that resolve to the same
    /// canonical load key and kind share one underlying operation.
    ///
    /// # Errors
    /// `RuntimeError::ResolutionFailed` when resolution fails per the
    /// merge-mode rules.
    pub fn load(
        &self,
        keys: &[AssetKey],
        kind: &ResourceKind,
        mode: MergeMode,
    ) -> Result<HandleUntyped, RuntimeError> {
        let locations = self
            .locators
            .resolve(keys, kind, mode)
            .ok_or(RuntimeError::ResolutionFailed)?;
        if locations.len() == 1 {
            Ok(self.load_location(&locations[0]))
        } else {
            let children = locations
                .iter()
                .map(|location| self.load_location(location))
                .collect();
            Ok(self.group(children))
        }
    }

    /// Start loading one resolved location, sharing an already in-flight
    /// operation for the same canonical key and kind if one exists.
    ///
    /// Dependency locations are loaded first (as a group chained into the
    /// main load), each through this same de-duplicating path, so a bundle
    /// shared by several requested assets is loaded once.
    pub fn load_location(&self, location: &Arc<Location>) -> HandleUntyped {
        let fingerprint = Fingerprint::of(location);

        let existing = self.in_flight.lock().unwrap().get(&fingerprint).copied();
        if let Some(key) = existing {
            let handle = HandleUntyped::new(key);
            if self.acquire(handle).is_ok() {
                debug!(key = %fingerprint.key, "sharing in-flight operation");
                return handle;
            }
            // stale table entry from a teardown that raced us; fall through
            // and start a fresh load
        }

        let handle = if location.dependencies().is_empty() {
            self.provider_operation(location)
        } else {
            let children: Vec<HandleUntyped> = location
                .dependencies()
                .iter()
                .map(|dependency| self.load_location(dependency))
                .collect();
            let group = self.group(children);
            let main = Arc::clone(location);
            self.chain_untyped(
                group,
                Box::new(move |registry, _| registry.provider_operation(&main)),
            )
        };

        {
            let mut inner = self.inner.write().unwrap();
            if let Some(slot) = inner.ops.get_mut(handle.key()) {
                slot.fingerprint = Some(fingerprint.clone());
            }
        }
        self.in_flight
            .lock()
            .unwrap()
            .insert(fingerprint, handle.key());
        handle
    }

    /// Create the leaf operation for one location. No de-duplication at this
    /// level; callers go through [`load_location`](Self::load_location).
    pub(crate) fn provider_operation(&self, location: &Arc<Location>) -> HandleUntyped {
        let mut slot = OperationSlot::new(OperationKind::Provider {
            location: Arc::clone(location),
            job: None,
        });
        slot.provider_id = Some(location.provider_id().to_owned());
        self.insert(slot)
    }

    /// Create an operation that already succeeded with `value`.
    pub fn completed<T: Any + Send>(&self, value: T) -> Handle<T> {
        let mut slot = OperationSlot::new(OperationKind::Immediate);
        slot.succeed(Some(Box::new(value)));
        let handle = self.insert(slot);
        self.send_event(OperationEvent::Completed {
            handle,
            status: OperationStatus::Succeeded,
        });
        handle.typed()
    }

    /// Create an operation that already failed with `error`.
    pub fn failed(&self, error: RuntimeError) -> HandleUntyped {
        let mut slot = OperationSlot::new(OperationKind::Immediate);
        slot.fail(error);
        let handle = self.insert(slot);
        self.send_event(OperationEvent::Completed {
            handle,
            status: OperationStatus::Failed,
        });
        handle
    }

    /// Chain a typed continuation onto `first`.
    ///
    /// The continuation is invoked exactly once, after `first` succeeds; if
    /// `first` fails the chain fails with the same error and the continuation
    /// is never invoked. The chain takes over the caller's reference to
    /// `first`.
    pub fn chain<A, B, F>(&self, first: Handle<A>, continuation: F) -> Handle<B>
    where
        A: Any + Send,
        B: Any + Send,
        F: FnOnce(&OperationRegistry, &A) -> Handle<B> + Send + 'static,
    {
        self.chain_untyped(
            first.untyped(),
            Box::new(move |registry, result| match result.downcast_ref::<A>() {
                Some(value) => continuation(registry, value).untyped(),
                None => registry.failed(RuntimeError::LoadFailed(
                    "first stage produced a result of an unexpected type".to_owned(),
                )),
            }),
        )
        .typed()
    }

    /// Type-less variant of [`chain`](Self::chain).
    pub fn chain_untyped(&self, first: HandleUntyped, continuation: Continuation) -> HandleUntyped {
        self.insert(OperationSlot::new(OperationKind::Chain {
            first,
            continuation: Some(continuation),
            second: None,
        }))
    }

    /// Aggregate a fixed ordered set of operations into one handle.
    ///
    /// The group takes over the caller's reference to each child and releases
    /// each exactly once when it is torn down. It completes when every child
    /// is terminal and succeeds only if all of them succeeded; the first
    /// child failure (in child order) is recorded while the remaining
    /// children are still drained to completion.
    pub fn group(&self, children: Vec<HandleUntyped>) -> HandleUntyped {
        self.insert(OperationSlot::new(OperationKind::Group { children }))
    }

    /// Increment the reference count of an operation.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was already torn down.
    pub fn acquire(&self, handle: HandleUntyped) -> Result<(), RuntimeError> {
        let mut inner = self.inner.write().unwrap();
        let slot = inner
            .ops
            .get_mut(handle.key())
            .ok_or(RuntimeError::InvalidHandle(handle.key()))?;
        slot.refs += 1;
        Ok(())
    }

    /// Decrement the reference count of an operation; at zero the operation
    /// is torn down: its result goes back to the owning provider, its
    /// in-flight entry is removed, its children are released exactly once and
    /// every handle to it becomes invalid.
    ///
    /// # Errors
    /// `RuntimeError::AlreadyReleased` on a double release; the call is a
    /// no-op beyond the report.
    pub fn release(&self, handle: HandleUntyped) -> Result<(), RuntimeError> {
        let mut disposals: Vec<(String, Box<dyn Any + Send>)> = Vec::new();
        let mut fingerprints: Vec<Fingerprint> = Vec::new();
        let mut released: Vec<HandleUntyped> = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            let Some(slot) = inner.ops.get_mut(handle.key()) else {
                error!(key = ?handle.key(), "release of an already released handle");
                return Err(RuntimeError::AlreadyReleased(handle.key()));
            };
            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(());
            }

            let mut teardown = vec![handle.key()];
            while let Some(key) = teardown.pop() {
                let Some(slot) = inner.ops.get_mut(key) else {
                    error!(?key, "dangling child reference during teardown");
                    continue;
                };
                if key != handle.key() {
                    slot.refs -= 1;
                    if slot.refs > 0 {
                        continue;
                    }
                }
                // refs hit zero: free the slot and cascade to children
                let slot = match inner.ops.remove(key) {
                    Some(slot) => slot,
                    None => continue,
                };
                if let Some(fingerprint) = slot.fingerprint {
                    fingerprints.push(fingerprint);
                }
                if let Some(result) = slot.result {
                    if let Some(provider_id) = slot.provider_id {
                        disposals.push((provider_id, result));
                    }
                }
                match slot.kind {
                    OperationKind::Chain { first, second, .. } => {
                        teardown.push(first.key());
                        if let Some(second) = second {
                            teardown.push(second.key());
                        }
                    }
                    OperationKind::Group { children } => {
                        teardown.extend(children.iter().map(HandleUntyped::key));
                    }
                    OperationKind::Provider { .. } | OperationKind::Immediate => {}
                }
                debug!(?key, "operation torn down");
                released.push(HandleUntyped::new(key));
            }
        }

        if !fingerprints.is_empty() {
            let mut in_flight = self.in_flight.lock().unwrap();
            for fingerprint in fingerprints {
                in_flight.remove(&fingerprint);
            }
        }
        for (provider_id, result) in disposals {
            if let Some(provider) = self.providers.get(&provider_id) {
                provider.release(result);
            }
        }
        for handle in released {
            self.send_event(OperationEvent::Released(handle));
        }
        Ok(())
    }

    /// True if `handle` refers to a live operation.
    pub fn is_valid(&self, handle: HandleUntyped) -> bool {
        self.inner.read().unwrap().ops.contains_key(handle.key())
    }

    /// Current status of an operation.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn status(&self, handle: HandleUntyped) -> Result<OperationStatus, RuntimeError> {
        self.inner
            .read()
            .unwrap()
            .ops
            .get(handle.key())
            .map(|slot| slot.status)
            .ok_or(RuntimeError::InvalidHandle(handle.key()))
    }

    /// Current percent-complete in `0.0..=1.0`; exactly 1.0 iff terminal.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn progress(&self, handle: HandleUntyped) -> Result<f32, RuntimeError> {
        self.inner
            .read()
            .unwrap()
            .ops
            .get(handle.key())
            .map(|slot| slot.progress)
            .ok_or(RuntimeError::InvalidHandle(handle.key()))
    }

    /// Error attached to a failed operation, if any.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn operation_error(
        &self,
        handle: HandleUntyped,
    ) -> Result<Option<RuntimeError>, RuntimeError> {
        self.inner
            .read()
            .unwrap()
            .ops
            .get(handle.key())
            .map(|slot| slot.error.clone())
            .ok_or(RuntimeError::InvalidHandle(handle.key()))
    }

    /// Live reference count of an operation.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn ref_count(&self, handle: HandleUntyped) -> Result<usize, RuntimeError> {
        self.inner
            .read()
            .unwrap()
            .ops
            .get(handle.key())
            .map(|slot| slot.refs)
            .ok_or(RuntimeError::InvalidHandle(handle.key()))
    }

    /// Child handles of a group operation, in construction order.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if `handle` does not refer to a live
    /// group.
    pub fn group_children(
        &self,
        handle: HandleUntyped,
    ) -> Result<Vec<HandleUntyped>, RuntimeError> {
        let inner = self.inner.read().unwrap();
        match inner.ops.get(handle.key()).map(|slot| &slot.kind) {
            Some(OperationKind::Group { children }) => Ok(children.clone()),
            _ => Err(RuntimeError::InvalidHandle(handle.key())),
        }
    }

    /// Retrieve a guarded reference to a succeeded operation's result.
    ///
    /// Chains resolve to their second stage's result. Returns `None` when the
    /// operation is not terminal, failed, was torn down or produced a
    /// different type.
    pub fn get<T: Any>(&self, handle: HandleUntyped) -> Option<OperationGuard<'_, T>> {
        let guard = self.inner.read().unwrap();
        let key = resolve_result_key(&guard, handle.key());
        let slot = guard.ops.get(key)?;
        if slot.status != OperationStatus::Succeeded {
            return None;
        }
        let ptr: *const T = slot.result.as_ref()?.downcast_ref::<T>()?;
        Some(OperationGuard { _guard: guard, ptr })
    }

    /// Register a completion callback.
    ///
    /// Callbacks for one operation fire in registration order, after the
    /// result is fully set. Registering on an operation that is already
    /// terminal fires the callback immediately.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn on_completed<F>(&self, handle: HandleUntyped, callback: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&OperationRegistry, HandleUntyped, OperationStatus) + Send + 'static,
    {
        let mut callback = Some(Box::new(callback) as CompletionCallback);
        let fire_now = {
            let mut inner = self.inner.write().unwrap();
            let slot = inner
                .ops
                .get_mut(handle.key())
                .ok_or(RuntimeError::InvalidHandle(handle.key()))?;
            if slot.status.is_terminal() {
                Some(slot.status)
            } else {
                slot.callbacks.push(callback.take().unwrap());
                None
            }
        };
        if let (Some(status), Some(callback)) = (fire_now, callback) {
            callback(self, handle, status);
        }
        Ok(())
    }

    /// Release the caller's reference automatically the instant the operation
    /// reaches a terminal state, after completion callbacks have run.
    ///
    /// # Errors
    /// `RuntimeError::InvalidHandle` if the operation was torn down.
    pub fn set_auto_release(&self, handle: HandleUntyped) -> Result<(), RuntimeError> {
        let already_terminal = {
            let mut inner = self.inner.write().unwrap();
            let slot = inner
                .ops
                .get_mut(handle.key())
                .ok_or(RuntimeError::InvalidHandle(handle.key()))?;
            if slot.status.is_terminal() {
                true
            } else {
                slot.auto_release = true;
                false
            }
        };
        if already_terminal {
            self.release(handle)?;
        }
        Ok(())
    }

    /// Subscribe to operation lifecycle events.
    pub fn subscribe(&self) -> crossbeam_channel::Receiver<OperationEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.event_txs.lock().unwrap().push(tx);
        rx
    }

    /// Number of live operations, for diagnostics.
    pub fn operation_count(&self) -> usize {
        self.inner.read().unwrap().ops.len()
    }

    /// Advance the runtime by one cooperative step.
    ///
    /// Starts pending operations, polls provider work, settles chain and
    /// group state to a fixpoint, runs due continuations, then dispatches
    /// completion callbacks, events and auto-releases.
    pub fn update(&self) {
        let mut newly_terminal: Vec<HandleUntyped> = Vec::new();

        self.step_providers(&mut newly_terminal);

        // A continuation can create operations that are already terminal,
        // which may settle further composites in the same tick.
        loop {
            let continuations = self.settle_composites(&mut newly_terminal);
            if continuations.is_empty() {
                break;
            }
            for (chain_key, continuation) in continuations {
                self.run_continuation(chain_key, continuation);
            }
        }

        self.dispatch_completions(newly_terminal);
    }

    fn insert(&self, slot: OperationSlot) -> HandleUntyped {
        let key = self.inner.write().unwrap().ops.insert(slot);
        HandleUntyped::new(key)
    }

    fn step_providers(&self, newly_terminal: &mut Vec<HandleUntyped>) {
        let mut inner = self.inner.write().unwrap();
        let keys: Vec<OperationKey> = inner.ops.keys().collect();
        for key in keys {
            let Some(slot) = inner.ops.get_mut(key) else {
                continue;
            };
            if slot.status.is_terminal() {
                continue;
            }

            // start
            if slot.status == OperationStatus::Pending {
                if let OperationKind::Provider { location, job } = &mut slot.kind {
                    match self.providers.get(location.provider_id()) {
                        Some(provider) => {
                            debug!(location = %location, "starting load");
                            *job = Some(provider.load(location));
                            slot.status = OperationStatus::Running;
                        }
                        None => {
                            let provider_id = location.provider_id().to_owned();
                            error!(%provider_id, "no provider for location");
                            slot.fail(RuntimeError::ProviderNotFound(provider_id));
                            newly_terminal.push(HandleUntyped::new(key));
                            continue;
                        }
                    }
                }
            }

            // poll
            if slot.status == OperationStatus::Running {
                let outcome = match &mut slot.kind {
                    OperationKind::Provider { job: Some(job), .. } => Some(job.step()),
                    _ => None,
                };
                match outcome {
                    Some(WorkState::InProgress(progress)) => {
                        slot.raise_progress(progress);
                    }
                    Some(WorkState::Completed(value)) => {
                        slot.succeed(Some(value));
                        newly_terminal.push(HandleUntyped::new(key));
                    }
                    Some(WorkState::Failed(err)) => {
                        error!(?key, %err, "load failed");
                        slot.fail(err);
                        newly_terminal.push(HandleUntyped::new(key));
                    }
                    None => {}
                }
            }
        }
    }

    /// Recompute chain/group status and progress until nothing changes.
    /// Returns continuations that became due; the caller runs them without
    /// holding the lock and calls back in.
    fn settle_composites(
        &self,
        newly_terminal: &mut Vec<HandleUntyped>,
    ) -> Vec<(OperationKey, Continuation)> {
        let mut continuations = Vec::new();
        let mut inner = self.inner.write().unwrap();

        loop {
            let mut changed = false;
            let snapshot: SecondaryMap<OperationKey, (OperationStatus, f32, Option<RuntimeError>)> =
                inner
                    .ops
                    .iter()
                    .map(|(key, slot)| (key, (slot.status, slot.progress, slot.error.clone())))
                    .collect();

            let keys: Vec<OperationKey> = inner.ops.keys().collect();
            for key in keys {
                let Some(slot) = inner.ops.get_mut(key) else {
                    continue;
                };
                if slot.status.is_terminal() {
                    continue;
                }

                let mut new_progress: Option<f32> = None;
                // Ok(result) completes the operation, Err fails it with the
                // dependency's error attached verbatim.
                let mut finish: Option<Result<Option<Box<dyn Any + Send>>, RuntimeError>> = None;
                let mut composite = true;

                match &mut slot.kind {
                    OperationKind::Chain {
                        first,
                        continuation,
                        second,
                    } => match snapshot.get(first.key()) {
                        None => {
                            finish = Some(Err(RuntimeError::InvalidHandle(first.key())));
                        }
                        Some((OperationStatus::Failed, _, error)) => {
                            finish = Some(Err(dependency_error(error, first.key())));
                        }
                        Some((OperationStatus::Succeeded, _, _)) => {
                            if let Some(second) = second {
                                match snapshot.get(second.key()) {
                                    None => {
                                        finish =
                                            Some(Err(RuntimeError::InvalidHandle(second.key())));
                                    }
                                    Some((OperationStatus::Succeeded, _, _)) => {
                                        finish = Some(Ok(None));
                                    }
                                    Some((OperationStatus::Failed, _, error)) => {
                                        finish = Some(Err(dependency_error(error, second.key())));
                                    }
                                    Some((_, second_progress, _)) => {
                                        new_progress = Some((1.0 + second_progress) / 2.0);
                                    }
                                }
                            } else if let Some(continuation) = continuation.take() {
                                continuations.push((key, continuation));
                                new_progress = Some(0.5);
                            } else {
                                // continuation handed out, second stage not
                                // installed yet
                                new_progress = Some(0.5);
                            }
                        }
                        Some((_, first_progress, _)) => {
                            new_progress = Some(first_progress / 2.0);
                        }
                    },
                    OperationKind::Group { children } => {
                        if children.is_empty() {
                            finish = Some(Ok(Some(Box::new(Vec::<HandleUntyped>::new()))));
                        } else {
                            let mut sum = 0.0f32;
                            let mut all_terminal = true;
                            let mut first_error: Option<RuntimeError> = None;
                            for child in children.iter() {
                                match snapshot.get(child.key()) {
                                    None => {
                                        sum += 1.0;
                                        if first_error.is_none() {
                                            first_error =
                                                Some(RuntimeError::InvalidHandle(child.key()));
                                        }
                                    }
                                    Some((status, progress, error)) => {
                                        sum += progress;
                                        if status.is_terminal() {
                                            if *status == OperationStatus::Failed
                                                && first_error.is_none()
                                            {
                                                first_error =
                                                    Some(dependency_error(error, child.key()));
                                            }
                                        } else {
                                            all_terminal = false;
                                        }
                                    }
                                }
                            }
                            if all_terminal {
                                finish = Some(match first_error {
                                    None => Ok(Some(Box::new(children.clone()))),
                                    Some(error) => Err(error),
                                });
                            } else {
                                new_progress = Some(sum / children.len() as f32);
                            }
                        }
                    }
                    OperationKind::Provider { .. } | OperationKind::Immediate => {
                        composite = false;
                    }
                }

                if !composite {
                    continue;
                }

                if slot.status == OperationStatus::Pending {
                    slot.status = OperationStatus::Running;
                    changed = true;
                }
                if let Some(progress) = new_progress {
                    if slot.raise_progress(progress) {
                        changed = true;
                    }
                }
                if let Some(outcome) = finish {
                    match outcome {
                        Ok(result) => slot.succeed(result),
                        Err(error) => {
                            error!(?key, %error, "dependency failed");
                            slot.fail(error);
                        }
                    }
                    changed = true;
                    newly_terminal.push(HandleUntyped::new(key));
                }
            }

            if !changed {
                break;
            }
        }

        continuations
    }

    /// Run a chain continuation outside the registry lock. The first stage's
    /// result is checked out of its slot for the duration of the call and
    /// restored afterwards.
    fn run_continuation(&self, chain_key: OperationKey, continuation: Continuation) {
        let checkout = {
            let mut inner = self.inner.write().unwrap();
            let first = match inner.ops.get(chain_key).map(|slot| &slot.kind) {
                Some(OperationKind::Chain { first, .. }) => *first,
                // chain released while the tick was in progress
                _ => return,
            };
            let result_key = resolve_result_key(&inner, first.key());
            let result = inner
                .ops
                .get_mut(result_key)
                .and_then(|slot| slot.result.take());
            (result_key, result)
        };

        let (result_key, result) = checkout;
        let second = match &result {
            Some(value) => continuation(self, value.as_ref()),
            None => self.failed(RuntimeError::LoadFailed(
                "first stage completed without a result".to_owned(),
            )),
        };

        let orphaned = {
            let mut inner = self.inner.write().unwrap();
            if let Some(value) = result {
                if let Some(slot) = inner.ops.get_mut(result_key) {
                    slot.result = Some(value);
                }
            }
            match inner.ops.get_mut(chain_key).map(|slot| &mut slot.kind) {
                Some(OperationKind::Chain { second: slot, .. }) => {
                    *slot = Some(second);
                    false
                }
                _ => true,
            }
        };
        if orphaned {
            // the chain vanished while the continuation ran; don't leak the
            // second stage
            if let Err(err) = self.release(second) {
                error!(%err, "failed to release orphaned second stage");
            }
        }
    }

    fn dispatch_completions(&self, newly_terminal: Vec<HandleUntyped>) {
        for handle in newly_terminal {
            let fired = {
                let mut inner = self.inner.write().unwrap();
                match inner.ops.get_mut(handle.key()) {
                    Some(slot) => Some((
                        std::mem::take(&mut slot.callbacks),
                        slot.status,
                        slot.auto_release,
                    )),
                    // released during this tick
                    None => None,
                }
            };
            let Some((callbacks, status, auto_release)) = fired else {
                continue;
            };
            for callback in callbacks {
                callback(self, handle, status);
            }
            self.send_event(OperationEvent::Completed { handle, status });
            if auto_release {
                if let Err(err) = self.release(handle) {
                    error!(%err, "auto-release failed");
                }
            }
        }
    }

    fn send_event(&self, event: OperationEvent) {
        let mut txs = self.event_txs.lock().unwrap();
        txs.retain(|tx| tx.send(event).is_ok());
    }
}

/// Follow chain indirection to the slot that physically holds a result.
fn resolve_result_key(inner: &Inner, mut key: OperationKey) -> OperationKey {
    loop {
        match inner.ops.get(key) {
            Some(slot) if slot.status == OperationStatus::Succeeded => {
                if let OperationKind::Chain {
                    second: Some(second),
                    ..
                } = &slot.kind
                {
                    key = second.key();
                } else {
                    return key;
                }
            }
            _ => return key,
        }
    }
}

/// The error a dependent operation fails with: the dependency's own error,
/// attached verbatim.
fn dependency_error(error: &Option<RuntimeError>, key: OperationKey) -> RuntimeError {
    error
        .clone()
        .unwrap_or_else(|| RuntimeError::InvalidHandle(key))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use atl_location::KeyedLocator;

    use super::*;
    use crate::test_provider::ManualProvider;

    fn texture() -> ResourceKind {
        ResourceKind::from_name("texture")
    }

    fn location(key: &str, internal_id: &str) -> Arc<Location> {
        Arc::new(Location::new(key, internal_id, "manual", texture()))
    }

    fn setup(locations: &[Arc<Location>]) -> (Arc<OperationRegistry>, Arc<ManualProvider>) {
        let provider = Arc::new(ManualProvider::new("manual"));
        let mut locator = KeyedLocator::new();
        for loc in locations {
            locator.insert(AssetKey::from(loc.primary_key()), Arc::clone(loc));
        }
        let registry = RuntimeOptions::new()
            .add_provider(provider.clone())
            .add_locator(Arc::new(locator))
            .create();
        (registry, provider)
    }

    fn load(registry: &OperationRegistry, key: &str) -> HandleUntyped {
        registry
            .load(&[AssetKey::from(key)], &texture(), MergeMode::UseFirst)
            .unwrap()
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-5,
            "expected progress {expected}, got {actual}"
        );
    }

    #[test]
    fn load_lifecycle() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let handle = load(&registry, "a");
        assert_eq!(registry.status(handle).unwrap(), OperationStatus::Pending);

        registry.update();
        assert_eq!(registry.status(handle).unwrap(), OperationStatus::Running);
        assert_close(registry.progress(handle).unwrap(), 0.0);

        provider.set_progress("a", 0.25);
        registry.update();
        assert_close(registry.progress(handle).unwrap(), 0.25);

        provider.complete("a", 42u32);
        registry.update();
        assert_eq!(registry.status(handle).unwrap(), OperationStatus::Succeeded);
        assert_close(registry.progress(handle).unwrap(), 1.0);
        assert_eq!(*registry.get::<u32>(handle).unwrap(), 42);

        registry.release(handle).unwrap();
        assert!(!registry.is_valid(handle));
        assert_eq!(provider.release_count(), 1);
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn identical_requests_share_one_operation() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let first = load(&registry, "a");
        let second = load(&registry, "a");
        assert_eq!(first, second);
        assert_eq!(registry.ref_count(first).unwrap(), 2);

        provider.complete("a", 1u32);
        registry.update();
        assert_eq!(provider.load_calls(), vec!["a".to_owned()]);

        registry.release(first).unwrap();
        assert!(registry.is_valid(second));
        registry.release(second).unwrap();
        assert!(!registry.is_valid(second));

        // teardown cleared the in-flight entry, so a fresh request reloads
        let again = load(&registry, "a");
        provider.complete("a", 2u32);
        registry.update();
        assert_eq!(provider.load_calls().len(), 2);
        registry.release(again).unwrap();
    }

    #[test]
    fn chain_halves_each_stage() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let first = load(&registry, "a");
        let second_location = location("b", "b");
        let chain = registry.chain_untyped(
            first,
            Box::new(move |registry, _| registry.load_location(&second_location)),
        );

        registry.update();
        assert_close(registry.progress(chain).unwrap(), 0.0);

        provider.set_progress("a", 0.4);
        registry.update();
        assert_close(registry.progress(chain).unwrap(), 0.2);

        provider.complete("a", ());
        registry.update();
        assert_close(registry.progress(chain).unwrap(), 0.5);

        provider.set_progress("b", 0.6);
        registry.update();
        assert_close(registry.progress(chain).unwrap(), 0.8);

        provider.complete("b", 7u32);
        registry.update();
        assert_eq!(registry.status(chain).unwrap(), OperationStatus::Succeeded);
        assert_close(registry.progress(chain).unwrap(), 1.0);
        assert_eq!(*registry.get::<u32>(chain).unwrap(), 7);

        registry.release(chain).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn chain_failure_skips_continuation() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let first = load(&registry, "a");
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_in_chain = Arc::clone(&invoked);
        let chain = registry.chain_untyped(
            first,
            Box::new(move |registry, _| {
                invoked_in_chain.store(true, Ordering::SeqCst);
                registry.failed(RuntimeError::ResolutionFailed)
            }),
        );

        provider.fail("a", RuntimeError::LoadFailed("disk error".to_owned()));
        registry.update();

        assert_eq!(registry.status(chain).unwrap(), OperationStatus::Failed);
        assert_eq!(
            registry.operation_error(chain).unwrap(),
            Some(RuntimeError::LoadFailed("disk error".to_owned()))
        );
        assert!(!invoked.load(Ordering::SeqCst));

        registry.release(chain).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn group_progress_is_the_mean_of_children() {
        let (registry, provider) = setup(&[
            location("a", "a"),
            location("b", "b"),
            location("c", "c"),
        ]);
        let children = vec![
            load(&registry, "a"),
            load(&registry, "b"),
            load(&registry, "c"),
        ];
        let group = registry.group(children.clone());

        registry.update();
        provider.set_progress("a", 0.3);
        provider.set_progress("b", 0.6);
        registry.update();
        assert_close(registry.progress(group).unwrap(), 0.3);

        provider.complete("a", ());
        provider.complete("b", ());
        provider.complete("c", ());
        registry.update();
        assert_eq!(registry.status(group).unwrap(), OperationStatus::Succeeded);
        assert_eq!(*registry.get::<Vec<HandleUntyped>>(group).unwrap(), children);

        registry.release(group).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn group_failure_still_drains_every_child() {
        let (registry, provider) = setup(&[location("a", "a"), location("b", "b")]);
        let group = registry.group(vec![load(&registry, "a"), load(&registry, "b")]);

        provider.fail("a", RuntimeError::LoadFailed("boom".to_owned()));
        registry.update();
        // one child failed but the other is still running
        assert_eq!(registry.status(group).unwrap(), OperationStatus::Running);

        provider.complete("b", 9u32);
        registry.update();
        assert_eq!(registry.status(group).unwrap(), OperationStatus::Failed);
        assert_eq!(
            registry.operation_error(group).unwrap(),
            Some(RuntimeError::LoadFailed("boom".to_owned()))
        );
        assert_eq!(provider.load_calls().len(), 2);

        registry.release(group).unwrap();
        // only the successful child had a result to hand back
        assert_eq!(provider.release_count(), 1);
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn empty_group_succeeds_immediately() {
        let (registry, _provider) = setup(&[]);
        let group = registry.group(Vec::new());
        registry.update();
        assert_eq!(registry.status(group).unwrap(), OperationStatus::Succeeded);
        assert!(registry.get::<Vec<HandleUntyped>>(group).unwrap().is_empty());
        registry.release(group).unwrap();
    }

    #[test]
    fn double_release_is_reported() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let handle = load(&registry, "a");
        provider.complete("a", ());
        registry.update();

        registry.release(handle).unwrap();
        assert_eq!(
            registry.release(handle),
            Err(RuntimeError::AlreadyReleased(handle.key()))
        );
    }

    #[test]
    fn released_handles_are_invalid() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let handle = load(&registry, "a");
        provider.complete("a", 3u32);
        registry.update();
        registry.release(handle).unwrap();

        assert!(!registry.is_valid(handle));
        assert_eq!(
            registry.status(handle),
            Err(RuntimeError::InvalidHandle(handle.key()))
        );
        assert_eq!(
            registry.progress(handle),
            Err(RuntimeError::InvalidHandle(handle.key()))
        );
        assert!(registry.get::<u32>(handle).is_none());
        assert_eq!(
            registry.acquire(handle),
            Err(RuntimeError::InvalidHandle(handle.key()))
        );
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let handle = load(&registry, "a");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in [1, 2] {
            let order = Arc::clone(&order);
            registry
                .on_completed(handle, move |_, _, status| {
                    assert_eq!(status, OperationStatus::Succeeded);
                    order.lock().unwrap().push(tag);
                })
                .unwrap();
        }

        provider.complete("a", ());
        registry.update();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        // registering on an already terminal operation fires inline
        let order_late = Arc::clone(&order);
        registry
            .on_completed(handle, move |_, _, _| order_late.lock().unwrap().push(3))
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);

        registry.release(handle).unwrap();
    }

    #[test]
    fn auto_release_runs_after_callbacks() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let handle = load(&registry, "a");
        registry.set_auto_release(handle).unwrap();

        let saw_valid = Arc::new(AtomicBool::new(false));
        let saw_valid_in_callback = Arc::clone(&saw_valid);
        registry
            .on_completed(handle, move |registry, handle, _| {
                saw_valid_in_callback.store(registry.is_valid(handle), Ordering::SeqCst);
            })
            .unwrap();

        provider.complete("a", ());
        registry.update();

        assert!(saw_valid.load(Ordering::SeqCst));
        assert!(!registry.is_valid(handle));
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn subscribers_see_completions_and_releases() {
        let (registry, provider) = setup(&[location("a", "a")]);
        let events = registry.subscribe();
        let handle = load(&registry, "a");

        provider.complete("a", ());
        registry.update();
        registry.release(handle).unwrap();

        let events: Vec<OperationEvent> = events.try_iter().collect();
        assert!(matches!(
            events[0],
            OperationEvent::Completed {
                handle: h,
                status: OperationStatus::Succeeded,
            } if h == handle
        ));
        assert!(matches!(events.last(), Some(OperationEvent::Released(h)) if *h == handle));
    }

    #[test]
    fn shared_dependency_loads_once() {
        let shared = location("shared", "shared");
        let a = Arc::new(
            Location::new("a", "a", "manual", texture())
                .with_dependencies(vec![Arc::clone(&shared)]),
        );
        let b = Arc::new(
            Location::new("b", "b", "manual", texture())
                .with_dependencies(vec![Arc::clone(&shared)]),
        );
        let (registry, provider) = setup(&[a, b]);

        let handle_a = load(&registry, "a");
        let handle_b = load(&registry, "b");

        registry.update();
        provider.complete("shared", ());
        registry.update();
        provider.complete("a", 1u32);
        provider.complete("b", 2u32);
        registry.update();

        assert_eq!(registry.status(handle_a).unwrap(), OperationStatus::Succeeded);
        assert_eq!(registry.status(handle_b).unwrap(), OperationStatus::Succeeded);
        assert_eq!(*registry.get::<u32>(handle_a).unwrap(), 1);
        assert_eq!(*registry.get::<u32>(handle_b).unwrap(), 2);
        let shared_loads = provider
            .load_calls()
            .iter()
            .filter(|id| id.as_str() == "shared")
            .count();
        assert_eq!(shared_loads, 1);

        registry.release(handle_a).unwrap();
        registry.release(handle_b).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn missing_provider_fails_the_operation() {
        let orphan = Arc::new(Location::new("x", "x", "nope", texture()));
        let (registry, _provider) = setup(&[orphan]);
        let handle = load(&registry, "x");
        registry.update();
        assert_eq!(registry.status(handle).unwrap(), OperationStatus::Failed);
        assert_eq!(
            registry.operation_error(handle).unwrap(),
            Some(RuntimeError::ProviderNotFound("nope".to_owned()))
        );
        registry.release(handle).unwrap();
    }

    #[test]
    fn unresolvable_keys_fail_to_load() {
        let (registry, _provider) = setup(&[location("a", "a")]);
        assert_eq!(
            registry.load(&[AssetKey::from("missing")], &texture(), MergeMode::UseFirst),
            Err(RuntimeError::ResolutionFailed)
        );
    }

    #[test]
    fn multi_location_requests_become_a_group() {
        let (registry, provider) = setup(&[location("a", "a"), location("b", "b")]);
        let handle = registry
            .load(
                &[AssetKey::from("a"), AssetKey::from("b")],
                &texture(),
                MergeMode::Union,
            )
            .unwrap();
        assert_eq!(registry.group_children(handle).unwrap().len(), 2);

        provider.complete("a", ());
        provider.complete("b", ());
        registry.update();
        assert_eq!(registry.status(handle).unwrap(), OperationStatus::Succeeded);
        registry.release(handle).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn typed_chains_downcast_their_first_stage() {
        let (registry, _provider) = setup(&[]);
        let first = registry.completed(21u32);
        let chain = registry.chain(first, |registry, value: &u32| registry.completed(*value * 2));

        registry.update();
        assert_eq!(*chain.get(&registry).unwrap(), 42u32);

        registry.release(chain.untyped()).unwrap();
        assert_eq!(registry.operation_count(), 0);
    }

    #[test]
    fn immediate_operations_are_terminal_at_creation() {
        let (registry, _provider) = setup(&[]);
        let done = registry.completed(5u32);
        assert_eq!(done.status(&registry).unwrap(), OperationStatus::Succeeded);
        assert_eq!(*done.get(&registry).unwrap(), 5);

        let failed = registry.failed(RuntimeError::ResolutionFailed);
        assert_eq!(registry.status(failed).unwrap(), OperationStatus::Failed);

        registry.release(done.untyped()).unwrap();
        registry.release(failed).unwrap();
    }
}
