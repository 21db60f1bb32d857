//! Mutations
//!
//! Write operations with tracked lifecycles. Mutations are structurally
//! parallel to queries but unkeyed: concurrent mutations with identical
//! keys coexist, each with its own state and retryer. The cache retains
//! settled mutations until their retention elapses and can resume
//! mutations that paused while offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::notify::notify_manager;
use crate::query::{DEFAULT_CACHE_TIME, NEVER};
use crate::retry::{QueryError, RetryDelay, RetryPolicy, Retryer, RetryerCallbacks};
use crate::types::{try_spawn, MutationId, MutationStatus, QueryKey, QueryObserverId};

pub type MutationFunction =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Called before the mutate function runs; may produce a context value that
/// is threaded through the later hooks (optimistic-update bookkeeping).
pub type OnMutateFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;
/// `(data, variables, context)`
pub type OnSuccessFn = Arc<dyn Fn(&Value, &Value, Option<&Value>) + Send + Sync>;
/// `(error, variables, context)`
pub type OnErrorFn = Arc<dyn Fn(&QueryError, &Value, Option<&Value>) + Send + Sync>;
/// `(data, error, variables, context)`
pub type OnSettledFn =
    Arc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>) + Send + Sync>;

type MutationResultFuture = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

/// Options for mutation configuration
#[derive(Clone, Default)]
pub struct MutationOptions {
    pub mutation_fn: Option<MutationFunction>,
    /// Optional key, used for per-key defaults and filtering; never deduped
    pub mutation_key: Option<QueryKey>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub cache_time: Option<Duration>,
    /// Called before mutation executes (for optimistic updates)
    pub on_mutate: Option<OnMutateFn>,
    /// Called on successful mutation
    pub on_success: Option<OnSuccessFn>,
    /// Called on failed mutation
    pub on_error: Option<OnErrorFn>,
    /// Called after mutation settles (success or error)
    pub on_settled: Option<OnSettledFn>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mutation_fn(mut self, mutation_fn: MutationFunction) -> Self {
        self.mutation_fn = Some(mutation_fn);
        self
    }

    pub fn with_mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_cache_time(mut self, duration: Duration) -> Self {
        self.cache_time = Some(duration);
        self
    }

    pub fn on_mutate(mut self, f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        self.on_mutate = Some(Arc::new(f));
        self
    }

    pub fn on_success(
        mut self,
        f: impl Fn(&Value, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&QueryError, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    // Mutations do not retry unless asked to.
    pub(crate) fn retry_or_default(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy::Never)
    }

    pub(crate) fn retry_delay_or_default(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn cache_time_or_default(&self) -> Duration {
        self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
    }

    /// Fill unset fields from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &MutationOptions) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = defaults.$field.clone();
                }
            };
        }
        fill!(mutation_fn);
        fill!(retry);
        fill!(retry_delay);
        fill!(cache_time);
        fill!(on_mutate);
        fill!(on_success);
        fill!(on_error);
        fill!(on_settled);
    }
}

/// Observable state of one mutation.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub variables: Option<Value>,
    pub context: Option<Value>,
    pub failure_count: u32,
    /// The retryer parked while offline; `resume_paused_mutations` restarts it
    pub is_paused: bool,
}

/// One tracked write operation.
pub struct Mutation {
    id: MutationId,
    cache: Weak<MutationCacheInner>,
    state: Mutex<MutationState>,
    options: MutationOptions,
    observers: Mutex<Vec<Weak<MutationObserverInner>>>,
    retryer: Mutex<Option<Arc<Retryer>>>,
    in_flight: Mutex<Option<MutationResultFuture>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Mutation {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn state(&self) -> MutationState {
        self.state.lock().clone()
    }

    pub fn options(&self) -> &MutationOptions {
        &self.options
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    /// Run the mutate function through the retryer, firing lifecycle hooks.
    ///
    /// Calling `execute` again while running returns the in-flight future.
    pub(crate) fn execute(self: &Arc<Self>, variables: Value) -> MutationResultFuture {
        if let Some(in_flight) = self.in_flight.lock().as_ref() {
            return in_flight.clone();
        }

        let mutation_fn = match self.options.mutation_fn.clone() {
            Some(f) => f,
            None => {
                return futures::future::ready(Err(QueryError::MissingQueryFn))
                    .boxed()
                    .shared()
            }
        };
        let retry = self.options.retry_or_default();
        let retry_delay = self.options.retry_delay_or_default();

        let context = self
            .options
            .on_mutate
            .as_ref()
            .and_then(|on_mutate| on_mutate(&variables));
        self.dispatch_loading(variables.clone(), context.clone());

        let retryer = Arc::new(Retryer::new());
        *self.retryer.lock() = Some(retryer.clone());

        let (tx, rx) = tokio::sync::oneshot::channel::<Result<Value, QueryError>>();
        let shared: MutationResultFuture = async move {
            rx.await.unwrap_or(Err(QueryError::Cancelled {
                revert: false,
                silent: true,
            }))
        }
        .boxed()
        .shared();
        *self.in_flight.lock() = Some(shared.clone());

        let mutation = self.clone();
        tokio::spawn(async move {
            let callbacks = RetryerCallbacks {
                on_fail: Some(Box::new({
                    let mutation = mutation.clone();
                    move |count, _error| mutation.dispatch_failed_attempt(count)
                })),
                on_pause: Some(Box::new({
                    let mutation = mutation.clone();
                    move || mutation.dispatch_paused(true)
                })),
                on_continue: Some(Box::new({
                    let mutation = mutation.clone();
                    move || mutation.dispatch_paused(false)
                })),
            };
            let attempt_vars = variables.clone();
            let result = retryer
                .run(
                    move || (mutation_fn)(attempt_vars.clone()),
                    &retry,
                    &retry_delay,
                    &callbacks,
                )
                .await;

            match &result {
                Ok(data) => {
                    mutation.dispatch_success(data.clone());
                    if let Some(on_success) = &mutation.options.on_success {
                        on_success(data, &variables, context.as_ref());
                    }
                    if let Some(on_settled) = &mutation.options.on_settled {
                        on_settled(Some(data), None, &variables, context.as_ref());
                    }
                }
                Err(error) => {
                    mutation.dispatch_error(error.clone());
                    if let Some(on_error) = &mutation.options.on_error {
                        on_error(error, &variables, context.as_ref());
                    }
                    if let Some(on_settled) = &mutation.options.on_settled {
                        on_settled(None, Some(error), &variables, context.as_ref());
                    }
                }
            }

            *mutation.retryer.lock() = None;
            *mutation.in_flight.lock() = None;
            if mutation.observer_count() == 0 {
                mutation.schedule_gc();
            }
            let _ = tx.send(result);
        });

        shared
    }

    /// Resume a retryer that paused while offline. Returns whether there was
    /// one to resume.
    pub(crate) fn continue_execution(&self) -> bool {
        match self.retryer.lock().as_ref() {
            Some(retryer) if retryer.is_paused() => {
                retryer.continue_execution();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn in_flight_future(&self) -> Option<MutationResultFuture> {
        self.in_flight.lock().clone()
    }

    pub(crate) fn add_observer(&self, observer: &Arc<MutationObserverInner>) {
        {
            let mut observers = self.observers.lock();
            let id = observer.id;
            if observers
                .iter()
                .any(|w| w.upgrade().map_or(false, |o| o.id == id))
            {
                return;
            }
            observers.push(Arc::downgrade(observer));
        }
        self.abort_gc();
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, id: u64) {
        let empty = {
            let mut observers = self.observers.lock();
            observers.retain(|w| w.upgrade().map_or(false, |o| o.id != id));
            observers.is_empty()
        };
        if empty {
            self.schedule_gc();
        }
    }

    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|w| w.strong_count() > 0);
        observers.len()
    }

    fn dispatch_loading(self: &Arc<Self>, variables: Value, context: Option<Value>) {
        {
            let mut state = self.state.lock();
            *state = MutationState {
                status: MutationStatus::Loading,
                data: None,
                error: None,
                variables: Some(variables),
                context,
                failure_count: 0,
                is_paused: false,
            };
        }
        self.notify_observers();
    }

    fn dispatch_failed_attempt(self: &Arc<Self>, failure_count: u32) {
        self.state.lock().failure_count = failure_count;
        self.notify_observers();
    }

    fn dispatch_paused(self: &Arc<Self>, paused: bool) {
        tracing::debug!(mutation = self.id.0, paused, "mutation pause state changed");
        self.state.lock().is_paused = paused;
        self.notify_observers();
    }

    fn dispatch_success(self: &Arc<Self>, data: Value) {
        {
            let mut state = self.state.lock();
            state.status = MutationStatus::Success;
            state.data = Some(data);
            state.error = None;
            state.is_paused = false;
        }
        self.notify_observers();
    }

    fn dispatch_error(self: &Arc<Self>, error: QueryError) {
        tracing::debug!(mutation = self.id.0, %error, "mutation settled with error");
        {
            let mut state = self.state.lock();
            state.status = MutationStatus::Error;
            state.error = Some(error);
            state.is_paused = false;
        }
        self.notify_observers();
    }

    fn notify_observers(self: &Arc<Self>) {
        let observers: Vec<Arc<MutationObserverInner>> = {
            let mut observers = self.observers.lock();
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_mutation_update();
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.emit(MutationCacheEvent::Updated, self);
        }
    }

    fn schedule_gc(self: &Arc<Self>) {
        self.abort_gc();
        let cache_time = self.options.cache_time_or_default();
        if cache_time == NEVER {
            return;
        }
        let mutation = self.clone();
        let handle = try_spawn(async move {
            tokio::time::sleep(cache_time).await;
            mutation.try_remove();
        });
        *self.gc_task.lock() = handle;
    }

    fn try_remove(self: &Arc<Self>) {
        if self.observer_count() > 0 || self.state.lock().status == MutationStatus::Loading {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.remove(self);
        }
    }

    pub(crate) fn destroy(&self) {
        self.abort_gc();
        if let Some(retryer) = self.retryer.lock().as_ref() {
            retryer.cancel(crate::retry::CancelOptions {
                revert: false,
                silent: true,
            });
        }
    }

    fn abort_gc(&self) {
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
        }
    }
}

/// Mutation cache lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationCacheEvent {
    Added,
    Removed,
    Updated,
}

type MutationCacheListener = Arc<dyn Fn(MutationCacheEvent, &Arc<Mutation>) + Send + Sync>;

/// Filters selecting a subset of retained mutations.
#[derive(Clone, Default)]
pub struct MutationFilters {
    pub key: Option<QueryKey>,
    pub exact: bool,
    /// Mutations currently running
    pub fetching: Option<bool>,
    pub predicate: Option<Arc<dyn Fn(&Mutation) -> bool + Send + Sync>>,
}

impl MutationFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Mutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(key) = &self.key {
            let mutation_key = match &mutation.options.mutation_key {
                Some(k) => k,
                None => return false,
            };
            let key_matches = if self.exact {
                mutation_key.hash() == key.hash()
            } else {
                key.partial_match(mutation_key)
            };
            if !key_matches {
                return false;
            }
        }
        if let Some(fetching) = self.fetching {
            let loading = mutation.state.lock().status == MutationStatus::Loading;
            if loading != fetching {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

pub(crate) struct MutationCacheInner {
    mutations: Mutex<Vec<Arc<Mutation>>>,
    listeners: Mutex<Vec<(u64, MutationCacheListener)>>,
    next_listener_id: AtomicU64,
}

impl MutationCacheInner {
    fn emit(&self, event: MutationCacheEvent, mutation: &Arc<Mutation>) {
        let listeners: Vec<MutationCacheListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let mutation = mutation.clone();
        notify_manager().schedule(move || {
            for listener in &listeners {
                listener(event, &mutation);
            }
        });
    }

    fn remove(&self, mutation: &Arc<Mutation>) {
        let removed = {
            let mut mutations = self.mutations.lock();
            let before = mutations.len();
            mutations.retain(|m| !Arc::ptr_eq(m, mutation));
            mutations.len() != before
        };
        if removed {
            mutation.destroy();
            self.emit(MutationCacheEvent::Removed, mutation);
        }
    }
}

/// Unkeyed retained list of mutations.
#[derive(Clone)]
pub struct MutationCache {
    inner: Arc<MutationCacheInner>,
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutationCacheInner {
                mutations: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create and retain a new mutation. Unlike queries there is no keyed
    /// slot; every build yields a fresh entry.
    pub fn build(&self, options: MutationOptions) -> Arc<Mutation> {
        let mutation = Arc::new(Mutation {
            id: MutationId::new(),
            cache: Arc::downgrade(&self.inner),
            state: Mutex::new(MutationState::default()),
            options,
            observers: Mutex::new(Vec::new()),
            retryer: Mutex::new(None),
            in_flight: Mutex::new(None),
            gc_task: Mutex::new(None),
        });
        self.inner.mutations.lock().push(mutation.clone());
        mutation.schedule_gc();
        self.inner.emit(MutationCacheEvent::Added, &mutation);
        mutation
    }

    pub fn get_all(&self) -> Vec<Arc<Mutation>> {
        self.inner.mutations.lock().clone()
    }

    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<Mutation>> {
        self.get_all()
            .into_iter()
            .filter(|mutation| filters.matches(mutation))
            .collect()
    }

    pub fn remove(&self, mutation: &Arc<Mutation>) {
        self.inner.remove(mutation);
    }

    pub fn clear(&self) {
        let mutations: Vec<Arc<Mutation>> = {
            let mut list = self.inner.mutations.lock();
            std::mem::take(&mut *list)
        };
        notify_manager().batch(|| {
            for mutation in &mutations {
                mutation.destroy();
                self.inner.emit(MutationCacheEvent::Removed, mutation);
            }
        });
    }

    /// Subscribe to cache lifecycle events. Returns an id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        listener: impl Fn(MutationCacheEvent, &Arc<Mutation>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.listeners.lock().retain(|(i, _)| *i != id);
    }

    /// Re-run mutations whose retryer paused while offline, oldest first,
    /// one at a time.
    pub async fn resume_paused_mutations(&self) {
        let mut paused: Vec<Arc<Mutation>> = self
            .get_all()
            .into_iter()
            .filter(|m| m.is_paused())
            .collect();
        paused.sort_by_key(|m| m.id());

        for mutation in paused {
            if !mutation.continue_execution() {
                continue;
            }
            if let Some(settled) = mutation.in_flight_future() {
                let _ = settled.await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.mutations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mutations.lock().is_empty()
    }
}

/// The view a mutation observer derives for its consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationObserverResult {
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub status: MutationStatus,
    pub is_idle: bool,
    pub is_loading: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_paused: bool,
    pub failure_count: u32,
    pub variables: Option<Value>,
}

impl MutationObserverResult {
    fn from_state(state: &MutationState) -> Self {
        Self {
            data: state.data.clone(),
            error: state.error.clone(),
            status: state.status,
            is_idle: state.status == MutationStatus::Idle,
            is_loading: state.status == MutationStatus::Loading,
            is_success: state.status == MutationStatus::Success,
            is_error: state.status == MutationStatus::Error,
            is_paused: state.is_paused,
            failure_count: state.failure_count,
            variables: state.variables.clone(),
        }
    }

    fn idle() -> Self {
        Self::from_state(&MutationState::default())
    }

    /// Typed view over `data`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

type MutationListener = Arc<dyn Fn(MutationObserverResult) + Send + Sync>;

pub(crate) struct MutationObserverInner {
    id: u64,
    cache: MutationCache,
    options: Mutex<MutationOptions>,
    current: Mutex<Option<Arc<Mutation>>>,
    result: Mutex<MutationObserverResult>,
    listeners: Mutex<Vec<(u64, MutationListener)>>,
    next_listener_id: AtomicU64,
}

impl MutationObserverInner {
    pub(crate) fn on_mutation_update(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        notify_manager().schedule_keyed(self.id, move || {
            if let Some(observer) = weak.upgrade() {
                observer.update_result();
            }
        });
    }

    fn update_result(&self) {
        let new_result = match self.current.lock().as_ref() {
            Some(mutation) => MutationObserverResult::from_state(&mutation.state()),
            None => MutationObserverResult::idle(),
        };
        let changed = {
            let mut result = self.result.lock();
            let changed = *result != new_result;
            *result = new_result.clone();
            changed
        };
        if !changed {
            return;
        }
        let listeners: Vec<MutationListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(new_result.clone());
        }
    }
}

/// Subscription from one consumer to its mutations. Each `mutate` call
/// builds a fresh mutation; the observer tracks the most recent one.
pub struct MutationObserver {
    inner: Arc<MutationObserverInner>,
}

impl MutationObserver {
    pub(crate) fn with_cache(cache: MutationCache, options: MutationOptions) -> Self {
        Self {
            inner: Arc::new(MutationObserverInner {
                id: QueryObserverId::new().0,
                cache,
                options: Mutex::new(options),
                current: Mutex::new(None),
                result: Mutex::new(MutationObserverResult::idle()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start a mutation with the observer's options and the given variables.
    /// The returned future settles with the mutation's final result.
    pub async fn mutate(&self, variables: Value) -> Result<Value, QueryError> {
        let options = self.inner.options.lock().clone();
        let mutation = self.inner.cache.build(options);

        {
            let mut current = self.inner.current.lock();
            if let Some(previous) = current.take() {
                previous.remove_observer(self.inner.id);
            }
            *current = Some(mutation.clone());
        }
        mutation.add_observer(&self.inner);
        self.inner.update_result();

        mutation.execute(variables).await
    }

    pub fn set_options(&self, options: MutationOptions) {
        *self.inner.options.lock() = options;
    }

    /// Register a listener. Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        listener: impl Fn(MutationObserverResult) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.listeners.lock().retain(|(i, _)| *i != id);
    }

    pub fn get_current_result(&self) -> MutationObserverResult {
        self.inner.result.lock().clone()
    }

    /// Forget the tracked mutation and return to the idle view.
    pub fn reset(&self) {
        {
            let mut current = self.inner.current.lock();
            if let Some(previous) = current.take() {
                previous.remove_observer(self.inner.id);
            }
        }
        self.inner.update_result();
    }
}

impl Drop for MutationObserver {
    fn drop(&mut self) {
        self.reset();
    }
}
