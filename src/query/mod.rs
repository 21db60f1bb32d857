//! Query State Machine
//!
//! A [`Query`] is one cache entry: it owns the observable state for a key,
//! drives fetches through the retryer, fans results out to observers, and
//! schedules its own retention once the last observer detaches.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::QueryCacheInner;
use crate::observer::ObserverInner;
use crate::retry::{
    CancelOptions, QueryError, RetryDelay, RetryPolicy, Retryer, RetryerCallbacks,
};
use crate::types::{now_millis, try_spawn, QueryKey, QueryObserverId, QueryStatus};

/// Default retention for an unobserved query: 5 minutes.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default stale window: data is stale immediately.
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;

/// `Duration::MAX` disables a time window (never stale / never collected).
pub const NEVER: Duration = Duration::MAX;

pub type QueryFnResult = Result<Value, QueryError>;

/// Type-erased fetch function. Typed closures are lifted into this shape at
/// the client facade.
pub type QueryFunction = Arc<dyn Fn() -> BoxFuture<'static, QueryFnResult> + Send + Sync>;

pub type DataEqualFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, QueryFnResult>>;

/// Per-query configuration. Unset fields fall back to client defaults and
/// then to the crate defaults.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub query_fn: Option<QueryFunction>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub initial_data: Option<Value>,
    pub initial_data_updated_at: Option<i64>,
    pub is_data_equal: Option<DataEqualFn>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_fn(mut self, query_fn: QueryFunction) -> Self {
        self.query_fn = Some(query_fn);
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

    pub fn with_stale_time(mut self, duration: Duration) -> Self {
        self.stale_time = Some(duration);
        self
    }

    pub fn with_cache_time(mut self, duration: Duration) -> Self {
        self.cache_time = Some(duration);
        self
    }

    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    pub(crate) fn retry_delay(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    pub(crate) fn stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(DEFAULT_STALE_TIME)
    }

    pub(crate) fn cache_time(&self) -> Duration {
        self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
    }

    /// Fill unset fields from `defaults`.
    pub fn merge_defaults(&mut self, defaults: &QueryOptions) {
        if self.query_fn.is_none() {
            self.query_fn = defaults.query_fn.clone();
        }
        if self.retry.is_none() {
            self.retry = defaults.retry.clone();
        }
        if self.retry_delay.is_none() {
            self.retry_delay = defaults.retry_delay.clone();
        }
        if self.stale_time.is_none() {
            self.stale_time = defaults.stale_time;
        }
        if self.cache_time.is_none() {
            self.cache_time = defaults.cache_time;
        }
        if self.is_data_equal.is_none() {
            self.is_data_equal = defaults.is_data_equal.clone();
        }
    }
}

/// Observable state of one query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState {
    /// Last successful payload
    pub data: Option<Value>,
    /// Wall-clock ms of the last success, 0 when never succeeded
    pub data_updated_at: i64,
    /// Last failure
    pub error: Option<QueryError>,
    /// Wall-clock ms of the last failure, 0 when never failed
    pub error_updated_at: i64,
    /// Consecutive failed attempts of the current fetch
    pub fetch_failure_count: u32,
    pub is_fetching: bool,
    /// Marked stale on demand by `invalidate`
    pub is_invalidated: bool,
    pub status: QueryStatus,
}

impl QueryState {
    pub(crate) fn initial(options: &QueryOptions) -> Self {
        match &options.initial_data {
            Some(data) => Self {
                data: Some(data.clone()),
                data_updated_at: options.initial_data_updated_at.unwrap_or_else(now_millis),
                error: None,
                error_updated_at: 0,
                fetch_failure_count: 0,
                is_fetching: false,
                is_invalidated: false,
                status: QueryStatus::Success,
            },
            None => Self {
                data: None,
                data_updated_at: 0,
                error: None,
                error_updated_at: 0,
                fetch_failure_count: 0,
                is_fetching: false,
                is_invalidated: false,
                status: QueryStatus::Idle,
            },
        }
    }

    /// Timestamp used for hydration freshness comparisons.
    pub fn updated_at(&self) -> i64 {
        self.data_updated_at.max(self.error_updated_at)
    }
}

pub(crate) struct InFlight {
    pub future: SharedFetch,
    pub retryer: Arc<Retryer>,
}

/// One cache entry: the per-key state machine.
///
/// Exclusively owned by one [`QueryCache`](crate::cache::QueryCache) for its
/// lifetime. Observers hold a strong reference; the query keeps weak
/// back-references and prunes the dead ones.
pub struct Query {
    key: QueryKey,
    hash: String,
    cache: Weak<QueryCacheInner>,
    state: Mutex<QueryState>,
    initial_state: QueryState,
    revert_state: Mutex<Option<QueryState>>,
    options: Mutex<QueryOptions>,
    observers: Mutex<Vec<Weak<ObserverInner>>>,
    in_flight: Mutex<Option<InFlight>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCacheInner>,
        key: QueryKey,
        hash: String,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Arc<Self> {
        let initial_state = QueryState::initial(&options);
        let query = Arc::new(Self {
            key,
            hash,
            cache,
            state: Mutex::new(state.unwrap_or_else(|| initial_state.clone())),
            initial_state,
            revert_state: Mutex::new(None),
            options: Mutex::new(options),
            observers: Mutex::new(Vec::new()),
            in_flight: Mutex::new(None),
            gc_task: Mutex::new(None),
        });
        // Unobserved from birth; retention starts immediately.
        query.schedule_gc();
        query
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    pub(crate) fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    /// Merge new options in. `cache_time` only ever grows, and a missing
    /// query function never erases a known one, so a data-only consumer
    /// cannot degrade the entry.
    pub(crate) fn set_options(&self, new: QueryOptions) {
        let mut options = self.options.lock();
        let cache_time = match (new.cache_time, options.cache_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let merged = QueryOptions {
            query_fn: new.query_fn.or_else(|| options.query_fn.clone()),
            retry: new.retry.or_else(|| options.retry.clone()),
            retry_delay: new.retry_delay.or_else(|| options.retry_delay.clone()),
            stale_time: new.stale_time.or(options.stale_time),
            cache_time,
            initial_data: new.initial_data.or_else(|| options.initial_data.clone()),
            initial_data_updated_at: new
                .initial_data_updated_at
                .or(options.initial_data_updated_at),
            is_data_equal: new.is_data_equal.or_else(|| options.is_data_equal.clone()),
        };
        *options = merged;
    }

    /// A query is stale when invalidated, never fetched, or older than the
    /// given stale window. `NEVER` disables the window.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.state.lock();
        if state.is_invalidated || state.data_updated_at == 0 {
            return true;
        }
        if stale_time == NEVER {
            return false;
        }
        let age = now_millis().saturating_sub(state.data_updated_at);
        age as u128 >= stale_time.as_millis()
    }

    /// Staleness against the query's own merged options.
    pub fn is_stale(&self) -> bool {
        let stale_time = self.options.lock().stale_time();
        self.is_stale_by_time(stale_time)
    }

    pub fn is_fetching(&self) -> bool {
        self.state.lock().is_fetching
    }

    /// Has observers whose options have not disabled them.
    pub fn is_active(&self) -> bool {
        self.live_observers().iter().any(|o| o.enabled())
    }

    pub fn observer_count(&self) -> usize {
        self.live_observers().len()
    }

    fn live_observers(&self) -> Vec<Arc<ObserverInner>> {
        let mut observers = self.observers.lock();
        observers.retain(|weak| weak.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn add_observer(&self, observer: &Arc<ObserverInner>) {
        {
            let mut observers = self.observers.lock();
            let id = observer.id();
            if observers
                .iter()
                .any(|w| w.upgrade().map_or(false, |o| o.id() == id))
            {
                return;
            }
            observers.push(Arc::downgrade(observer));
        }
        self.abort_gc();
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, id: QueryObserverId) {
        let empty = {
            let mut observers = self.observers.lock();
            observers.retain(|w| w.upgrade().map_or(false, |o| o.id() != id));
            observers.is_empty()
        };
        if empty {
            self.schedule_gc();
        }
    }

    /// Start (or restart) the fetch for this query.
    ///
    /// Single-flight: while a fetch is in flight the existing shared future
    /// is returned; options from the new call update the query but do not
    /// restart the fetch.
    pub(crate) fn fetch(self: &Arc<Self>, options: Option<QueryOptions>) -> SharedFetch {
        // Retry settings given for this call win over merged options, so an
        // explicit no-retry fetch is not upgraded by an observer's policy.
        let call_retry = options.as_ref().and_then(|o| o.retry.clone());
        let call_retry_delay = options.as_ref().and_then(|o| o.retry_delay.clone());
        if let Some(options) = options {
            self.set_options(options);
        }

        if let Some(in_flight) = self.in_flight.lock().as_ref() {
            return in_flight.future.clone();
        }

        let (query_fn, retry, retry_delay) = {
            let options = self.options.lock();
            (
                options.query_fn.clone(),
                call_retry.unwrap_or_else(|| options.retry()),
                call_retry_delay.unwrap_or_else(|| options.retry_delay()),
            )
        };
        let query_fn = match query_fn {
            Some(query_fn) => query_fn,
            None => {
                tracing::warn!(query = %self.hash, "fetch without a query function");
                return futures::future::ready(Err(QueryError::MissingQueryFn))
                    .boxed()
                    .shared();
            }
        };

        let snapshot = self.state.lock().clone();
        *self.revert_state.lock() = Some(snapshot);

        let retryer = Arc::new(Retryer::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<QueryFnResult>();
        let shared: SharedFetch = async move {
            rx.await.unwrap_or(Err(QueryError::Cancelled {
                revert: false,
                silent: true,
            }))
        }
        .boxed()
        .shared();
        // The slot is taken before the transition is published, so a fetch
        // triggered from a notification joins this one.
        *self.in_flight.lock() = Some(InFlight {
            future: shared.clone(),
            retryer: retryer.clone(),
        });
        self.dispatch_fetch_start();

        let query = self.clone();
        tokio::spawn(async move {
            let callbacks = RetryerCallbacks {
                on_fail: Some(Box::new({
                    let query = query.clone();
                    move |count, error| query.dispatch_failed_attempt(count, error)
                })),
                ..Default::default()
            };
            let result = retryer
                .run(move || (query_fn)(), &retry, &retry_delay, &callbacks)
                .await;

            match &result {
                Ok(value) => query.dispatch_fetch_success(value.clone()),
                Err(QueryError::Cancelled { revert: true, silent }) => {
                    query.dispatch_revert(*silent)
                }
                Err(error) => query.dispatch_fetch_error(error.clone()),
            }

            *query.in_flight.lock() = None;
            if query.observer_count() == 0 {
                query.schedule_gc();
            }
            let _ = tx.send(result);
        });

        shared
    }

    /// The in-flight shared future, if any.
    pub(crate) fn fetch_future(&self) -> Option<SharedFetch> {
        self.in_flight.lock().as_ref().map(|f| f.future.clone())
    }

    /// Signal cancellation to the in-flight retryer, if any.
    pub fn cancel(&self, options: CancelOptions) {
        if let Some(in_flight) = self.in_flight.lock().as_ref() {
            tracing::debug!(query = %self.hash, "cancelling in-flight fetch");
            in_flight.retryer.cancel(options);
        }
    }

    /// Resume a paused in-flight retryer.
    pub(crate) fn continue_retry(&self) {
        if let Some(in_flight) = self.in_flight.lock().as_ref() {
            in_flight.retryer.continue_execution();
        }
    }

    pub(crate) fn on_focus(self: &Arc<Self>) {
        self.continue_retry();
        if let Some(observer) = self
            .live_observers()
            .into_iter()
            .find(|o| o.should_refetch_on_focus())
        {
            observer.trigger_refetch();
        }
    }

    pub(crate) fn on_online(self: &Arc<Self>) {
        self.continue_retry();
        if let Some(observer) = self
            .live_observers()
            .into_iter()
            .find(|o| o.should_refetch_on_reconnect())
        {
            observer.trigger_refetch();
        }
    }

    /// Replace `data` directly, bypassing the fetch path.
    pub fn set_data(self: &Arc<Self>, data: Value, updated_at: Option<i64>) {
        let equal = {
            let state = self.state.lock();
            let options = self.options.lock();
            match (&state.data, &options.is_data_equal) {
                (Some(old), Some(eq)) => eq(old, &data),
                _ => false,
            }
        };
        {
            let mut state = self.state.lock();
            if !equal {
                state.data = Some(data);
            }
            state.data_updated_at = updated_at.unwrap_or_else(now_millis);
            state.error = None;
            state.is_invalidated = false;
            state.status = QueryStatus::Success;
        }
        self.notify_observers(false);
    }

    /// Mark stale on demand; orthogonal to status.
    pub fn invalidate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.is_invalidated {
                return;
            }
            state.is_invalidated = true;
        }
        self.notify_observers(false);
    }

    /// Return to the never-fetched state.
    pub fn reset(self: &Arc<Self>) {
        self.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
        *self.state.lock() = self.initial_state.clone();
        self.notify_observers(false);
    }

    /// Overwrite state from a hydrated snapshot. Applied only when strictly
    /// newer than the current state; stale snapshots are dropped.
    pub(crate) fn set_state(self: &Arc<Self>, state: QueryState) -> bool {
        {
            let mut current = self.state.lock();
            if state.updated_at() <= current.updated_at() {
                return false;
            }
            *current = state;
        }
        self.notify_observers(false);
        true
    }

    fn dispatch_fetch_start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.is_fetching = true;
            state.fetch_failure_count = 0;
            if state.data.is_none() {
                state.status = QueryStatus::Loading;
            }
        }
        self.notify_observers(false);
    }

    fn dispatch_failed_attempt(self: &Arc<Self>, failure_count: u32, error: &QueryError) {
        tracing::debug!(query = %self.hash, failure_count, %error, "fetch attempt failed");
        self.state.lock().fetch_failure_count = failure_count;
        self.notify_observers(false);
    }

    fn dispatch_fetch_success(self: &Arc<Self>, value: Value) {
        let equal = {
            let state = self.state.lock();
            let options = self.options.lock();
            match (&state.data, &options.is_data_equal) {
                (Some(old), Some(eq)) => eq(old, &value),
                _ => false,
            }
        };
        {
            let mut state = self.state.lock();
            if !equal {
                state.data = Some(value);
            }
            state.data_updated_at = now_millis();
            state.error = None;
            state.fetch_failure_count = 0;
            state.is_fetching = false;
            state.is_invalidated = false;
            state.status = QueryStatus::Success;
        }
        *self.revert_state.lock() = None;
        self.notify_observers(false);
    }

    fn dispatch_fetch_error(self: &Arc<Self>, error: QueryError) {
        let silent = matches!(error, QueryError::Cancelled { silent: true, .. });
        tracing::debug!(query = %self.hash, %error, "fetch settled with error");
        {
            let mut state = self.state.lock();
            state.error = Some(error);
            state.error_updated_at = now_millis();
            state.is_fetching = false;
            state.status = QueryStatus::Error;
        }
        *self.revert_state.lock() = None;
        self.notify_observers(silent);
    }

    fn dispatch_revert(self: &Arc<Self>, silent: bool) {
        let previous = self.revert_state.lock().take();
        match previous {
            Some(previous) => *self.state.lock() = previous,
            None => self.state.lock().is_fetching = false,
        }
        self.notify_observers(silent);
    }

    fn notify_observers(self: &Arc<Self>, silent: bool) {
        if silent {
            return;
        }
        for observer in self.live_observers() {
            observer.on_query_update();
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.notify_updated(self);
        }
    }

    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        self.abort_gc();
        let cache_time = self.options.lock().cache_time();
        if cache_time == NEVER {
            return;
        }
        let query = self.clone();
        let handle = try_spawn(async move {
            tokio::time::sleep(cache_time).await;
            query.try_remove();
        });
        *self.gc_task.lock() = handle;
    }

    fn try_remove(self: &Arc<Self>) {
        if self.observer_count() > 0 || self.state.lock().is_fetching {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            tracing::debug!(query = %self.hash, "retention elapsed, removing query");
            cache.remove(self);
        }
    }

    /// Cancel timers and the in-flight fetch. Called by the cache on removal.
    pub(crate) fn destroy(&self) {
        self.abort_gc();
        self.cancel(CancelOptions {
            revert: false,
            silent: true,
        });
    }

    fn abort_gc(&self) {
        if let Some(handle) = self.gc_task.lock().take() {
            handle.abort();
        }
    }
}
