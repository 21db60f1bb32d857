//! Query Observation
//!
//! A [`QueryObserver`] bridges one consumer to one query: it derives a
//! result view from query state, decides when that view is worth a
//! notification, and drives automatic refetching (mount, focus, reconnect,
//! interval, stale expiry).

pub mod queries;

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::client::QueryClient;
use crate::focus::focus_manager;
use crate::notify::notify_manager;
use crate::query::{
    DataEqualFn, QueryFunction, QueryOptions, Query, NEVER,
};
use crate::retry::{QueryError, RetryDelay, RetryPolicy};
use crate::types::{now_millis, try_spawn, QueryKey, QueryObserverId, QueryStatus};

pub use queries::QueriesObserver;

/// Projection applied to raw query data before it reaches the consumer.
pub type SelectFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

type ResultListener = Arc<dyn Fn(QueryObserverResult) + Send + Sync>;

/// When an observer refetches in response to mount/focus/reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefetchPolicy {
    /// Refetch unconditionally
    Always,
    /// Refetch when the query is stale
    IfStale,
    /// Never refetch for this trigger
    Never,
}

impl Default for RefetchPolicy {
    fn default() -> Self {
        Self::IfStale
    }
}

impl From<bool> for RefetchPolicy {
    fn from(value: bool) -> Self {
        if value {
            Self::IfStale
        } else {
            Self::Never
        }
    }
}

/// Fields of the result view, used by the notification allow-list and by
/// tracked results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultField {
    Data,
    Error,
    Status,
    IsFetching,
    IsLoading,
    IsSuccess,
    IsError,
    IsIdle,
    IsStale,
    IsPreviousData,
    DataUpdatedAt,
    ErrorUpdatedAt,
    FailureCount,
}

/// Which result changes reach the subscriber.
#[derive(Clone, Debug)]
pub enum NotifyOnChangeProps {
    /// Any change notifies
    All,
    /// Only changes to the listed fields notify
    List(Vec<ResultField>),
    /// Only changes to fields the consumer has read through
    /// [`QueryObserver::tracked_result`] notify
    Tracked,
}

impl Default for NotifyOnChangeProps {
    fn default() -> Self {
        Self::All
    }
}

/// Options for one observer of one query. Unset fields fall back to client
/// defaults, then to crate defaults.
#[derive(Clone, Default)]
pub struct QueryObserverOptions {
    pub key: QueryKey,
    pub query_fn: Option<QueryFunction>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub initial_data: Option<Value>,
    pub initial_data_updated_at: Option<i64>,
    pub is_data_equal: Option<DataEqualFn>,
    pub enabled: Option<bool>,
    pub refetch_on_mount: Option<RefetchPolicy>,
    pub refetch_on_window_focus: Option<RefetchPolicy>,
    pub refetch_on_reconnect: Option<RefetchPolicy>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub keep_previous_data: Option<bool>,
    pub select: Option<SelectFn>,
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
}

impl QueryObserverOptions {
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
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

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_refetch_on_mount(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    pub fn with_refetch_on_window_focus(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_window_focus = Some(policy);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, policy: RefetchPolicy) -> Self {
        self.refetch_on_reconnect = Some(policy);
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.refetch_interval_in_background = Some(in_background);
        self
    }

    pub fn keep_previous_data(mut self) -> Self {
        self.keep_previous_data = Some(true);
        self
    }

    pub fn with_select(mut self, select: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.select = Some(Arc::new(select));
        self
    }

    pub fn with_notify_on_change_props(mut self, props: NotifyOnChangeProps) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub(crate) fn stale_time_or_default(&self) -> Duration {
        self.stale_time.unwrap_or(Duration::ZERO)
    }

    pub(crate) fn refetch_on_mount_or_default(&self) -> RefetchPolicy {
        self.refetch_on_mount.unwrap_or_default()
    }

    pub(crate) fn refetch_on_window_focus_or_default(&self) -> RefetchPolicy {
        self.refetch_on_window_focus.unwrap_or_default()
    }

    pub(crate) fn refetch_on_reconnect_or_default(&self) -> RefetchPolicy {
        self.refetch_on_reconnect.unwrap_or_default()
    }

    pub(crate) fn keeps_previous_data(&self) -> bool {
        self.keep_previous_data.unwrap_or(false)
    }

    pub(crate) fn refetches_in_background(&self) -> bool {
        self.refetch_interval_in_background.unwrap_or(false)
    }

    pub(crate) fn notify_props(&self) -> NotifyOnChangeProps {
        self.notify_on_change_props.clone().unwrap_or_default()
    }

    /// The subset handed to the query itself.
    pub(crate) fn query_options(&self) -> QueryOptions {
        QueryOptions {
            query_fn: self.query_fn.clone(),
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            is_data_equal: self.is_data_equal.clone(),
        }
    }

    /// [`query_options`](Self::query_options) with the retry settings
    /// resolved to this observer's effective policy, so a fetch it triggers
    /// runs under its own policy rather than whatever a previous caller
    /// merged into the query.
    pub(crate) fn fetch_options(&self) -> QueryOptions {
        let mut options = self.query_options();
        options.retry = Some(self.retry.clone().unwrap_or_default());
        options.retry_delay = Some(self.retry_delay.clone().unwrap_or_default());
        options
    }

    /// Fill unset fields from `defaults` (its key is ignored).
    pub fn merge_defaults(&mut self, defaults: &QueryObserverOptions) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = defaults.$field.clone();
                }
            };
        }
        fill!(query_fn);
        fill!(retry);
        fill!(retry_delay);
        fill!(stale_time);
        fill!(cache_time);
        fill!(is_data_equal);
        fill!(enabled);
        fill!(refetch_on_mount);
        fill!(refetch_on_window_focus);
        fill!(refetch_on_reconnect);
        fill!(refetch_interval);
        fill!(refetch_interval_in_background);
        fill!(keep_previous_data);
        fill!(select);
        fill!(notify_on_change_props);
    }
}

/// The view an observer derives from query state for its consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryObserverResult {
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub is_fetching: bool,
    pub is_loading: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_idle: bool,
    pub is_stale: bool,
    pub is_previous_data: bool,
    pub data_updated_at: i64,
    pub error_updated_at: i64,
    pub failure_count: u32,
}

impl QueryObserverResult {
    fn field_changed(&self, other: &Self, field: ResultField) -> bool {
        match field {
            ResultField::Data => self.data != other.data,
            ResultField::Error => self.error != other.error,
            ResultField::Status => self.status != other.status,
            ResultField::IsFetching => self.is_fetching != other.is_fetching,
            ResultField::IsLoading => self.is_loading != other.is_loading,
            ResultField::IsSuccess => self.is_success != other.is_success,
            ResultField::IsError => self.is_error != other.is_error,
            ResultField::IsIdle => self.is_idle != other.is_idle,
            ResultField::IsStale => self.is_stale != other.is_stale,
            ResultField::IsPreviousData => self.is_previous_data != other.is_previous_data,
            ResultField::DataUpdatedAt => self.data_updated_at != other.data_updated_at,
            ResultField::ErrorUpdatedAt => self.error_updated_at != other.error_updated_at,
            ResultField::FailureCount => self.failure_count != other.failure_count,
        }
    }

    /// Typed view over `data`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// A result wrapper whose accessors record which fields the consumer reads;
/// with [`NotifyOnChangeProps::Tracked`] only those fields trigger
/// notifications.
pub struct TrackedResult {
    result: QueryObserverResult,
    tracked: Arc<Mutex<HashSet<ResultField>>>,
}

macro_rules! tracked_getter {
    ($name:ident, $field:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> &$ty {
            self.tracked.lock().insert(ResultField::$variant);
            &self.result.$field
        }
    };
}

impl TrackedResult {
    tracked_getter!(data, data, Data, Option<Value>);
    tracked_getter!(error, error, Error, Option<QueryError>);
    tracked_getter!(status, status, Status, QueryStatus);
    tracked_getter!(is_fetching, is_fetching, IsFetching, bool);
    tracked_getter!(is_loading, is_loading, IsLoading, bool);
    tracked_getter!(is_success, is_success, IsSuccess, bool);
    tracked_getter!(is_error, is_error, IsError, bool);
    tracked_getter!(is_idle, is_idle, IsIdle, bool);
    tracked_getter!(is_stale, is_stale, IsStale, bool);
    tracked_getter!(is_previous_data, is_previous_data, IsPreviousData, bool);
    tracked_getter!(data_updated_at, data_updated_at, DataUpdatedAt, i64);
    tracked_getter!(error_updated_at, error_updated_at, ErrorUpdatedAt, i64);
    tracked_getter!(failure_count, failure_count, FailureCount, u32);
}

pub(crate) struct ObserverInner {
    id: QueryObserverId,
    client: QueryClient,
    query: Mutex<Arc<Query>>,
    options: Mutex<QueryObserverOptions>,
    result: Mutex<QueryObserverResult>,
    listeners: Mutex<Vec<(u64, ResultListener)>>,
    next_listener_id: AtomicU64,
    /// Data of the previously observed query, kept for `keep_previous_data`
    previous_data: Mutex<Option<Value>>,
    /// `(raw, selected)` so `select` reruns only when the raw payload changes
    select_cache: Mutex<Option<(Value, Value)>>,
    tracked: Arc<Mutex<HashSet<ResultField>>>,
    stale_task: Mutex<Option<JoinHandle<()>>>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverInner {
    pub(crate) fn id(&self) -> QueryObserverId {
        self.id
    }

    pub(crate) fn enabled(&self) -> bool {
        self.options.lock().is_enabled()
    }

    /// A query state change happened; coalesce the recompute through the
    /// notify manager so one batch yields one notification.
    pub(crate) fn on_query_update(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        notify_manager().schedule_keyed(self.id.0, move || {
            if let Some(observer) = weak.upgrade() {
                observer.update_result();
            }
        });
    }

    pub(crate) fn should_refetch_on_focus(&self) -> bool {
        let options = self.options.lock().clone();
        self.should_refetch(options.refetch_on_window_focus_or_default(), &options)
    }

    pub(crate) fn should_refetch_on_reconnect(&self) -> bool {
        let options = self.options.lock().clone();
        self.should_refetch(options.refetch_on_reconnect_or_default(), &options)
    }

    fn should_refetch(&self, policy: RefetchPolicy, options: &QueryObserverOptions) -> bool {
        if !options.is_enabled() {
            return false;
        }
        match policy {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => self
                .query
                .lock()
                .clone()
                .is_stale_by_time(options.stale_time_or_default()),
            RefetchPolicy::Never => false,
        }
    }

    pub(crate) fn trigger_refetch(self: &Arc<Self>) {
        let query = self.query.lock().clone();
        let options = self.options.lock().fetch_options();
        let _ = query.fetch(Some(options));
    }

    fn compute_result(&self) -> QueryObserverResult {
        let query = self.query.lock().clone();
        let state = query.state();
        let options = self.options.lock().clone();

        let mut data = state.data.clone();
        let mut status = state.status;
        let mut is_previous_data = false;

        if data.is_none() && options.keeps_previous_data() && state.is_fetching {
            if let Some(previous) = self.previous_data.lock().clone() {
                data = Some(previous);
                status = QueryStatus::Success;
                is_previous_data = true;
            }
        }

        if let (Some(raw), Some(select)) = (&data, &options.select) {
            data = Some(self.apply_select(raw, select));
        }

        QueryObserverResult {
            data,
            error: state.error.clone(),
            status,
            is_fetching: state.is_fetching,
            is_loading: status == QueryStatus::Loading,
            is_success: status == QueryStatus::Success,
            is_error: status == QueryStatus::Error,
            is_idle: status == QueryStatus::Idle,
            is_stale: query.is_stale_by_time(options.stale_time_or_default()),
            is_previous_data,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
        }
    }

    fn apply_select(&self, raw: &Value, select: &SelectFn) -> Value {
        let mut cache = self.select_cache.lock();
        if let Some((cached_raw, selected)) = cache.as_ref() {
            if cached_raw == raw {
                return selected.clone();
            }
        }
        let selected = select(raw);
        *cache = Some((raw.clone(), selected.clone()));
        selected
    }

    /// Recompute the view and notify listeners when it changed in a way the
    /// notification policy cares about.
    fn update_result(self: &Arc<Self>) {
        let new_result = self.compute_result();
        let (old_result, changed) = {
            let mut result = self.result.lock();
            let old = result.clone();
            let changed = old != new_result;
            *result = new_result.clone();
            (old, changed)
        };
        if !changed {
            return;
        }
        self.refresh_stale_timer(&new_result);
        if !self.should_notify(&old_result, &new_result) {
            return;
        }
        let listeners: Vec<ResultListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            let result = new_result.clone();
            if catch_unwind(AssertUnwindSafe(move || listener(result))).is_err() {
                tracing::error!("observer listener panicked");
            }
        }
    }

    fn should_notify(&self, old: &QueryObserverResult, new: &QueryObserverResult) -> bool {
        let props = self.options.lock().notify_props();
        let fields: Vec<ResultField> = match props {
            NotifyOnChangeProps::All => return true,
            NotifyOnChangeProps::List(fields) => fields,
            NotifyOnChangeProps::Tracked => self.tracked.lock().iter().copied().collect(),
        };
        fields.iter().any(|field| old.field_changed(new, *field))
    }

    fn attach(self: &Arc<Self>) {
        let query = self.query.lock().clone();
        query.add_observer(self);
        self.evaluate_mount_fetch();
        self.refresh_stale_timer(&self.result.lock().clone());
        self.refresh_interval_timer();
    }

    fn detach(self: &Arc<Self>) {
        self.abort_timers();
        let query = self.query.lock().clone();
        query.remove_observer(self.id);
    }

    /// The mount policy: disabled observers never fetch; otherwise fetch
    /// when the query has no data, unconditionally for `Always`, or when
    /// stale for `IfStale`.
    fn evaluate_mount_fetch(self: &Arc<Self>) {
        let options = self.options.lock().clone();
        if !options.is_enabled() {
            return;
        }
        let query = self.query.lock().clone();
        let state = query.state();
        let should = state.data.is_none()
            || match options.refetch_on_mount_or_default() {
                RefetchPolicy::Always => true,
                RefetchPolicy::IfStale => {
                    query.is_stale_by_time(options.stale_time_or_default())
                }
                RefetchPolicy::Never => false,
            };
        if should {
            let _ = query.fetch(Some(options.fetch_options()));
        }
    }

    /// Arrange a timer that re-derives the view when the stale window
    /// elapses. Notify-only; refetching stays with focus/interval triggers.
    fn refresh_stale_timer(self: &Arc<Self>, result: &QueryObserverResult) {
        if let Some(handle) = self.stale_task.lock().take() {
            handle.abort();
        }
        if self.listeners.lock().is_empty() {
            return;
        }
        let stale_time = self.options.lock().stale_time_or_default();
        if stale_time == Duration::ZERO || stale_time == NEVER {
            return;
        }
        if result.is_stale || result.data_updated_at == 0 {
            return;
        }
        let deadline = result.data_updated_at + stale_time.as_millis() as i64;
        let delay = (deadline - now_millis()).max(0) as u64 + 1;
        let weak = Arc::downgrade(self);
        let handle = try_spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(observer) = weak.upgrade() {
                observer.update_result();
            }
        });
        *self.stale_task.lock() = handle;
    }

    /// Arrange the periodic refetch timer, suppressed in background unless
    /// opted in.
    fn refresh_interval_timer(self: &Arc<Self>) {
        if let Some(handle) = self.interval_task.lock().take() {
            handle.abort();
        }
        let options = self.options.lock().clone();
        let interval = match options.refetch_interval {
            Some(interval) if options.is_enabled() && !interval.is_zero() => interval,
            _ => return,
        };
        let in_background = options.refetches_in_background();
        let weak = Arc::downgrade(self);
        let handle = try_spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let observer = match weak.upgrade() {
                    Some(observer) => observer,
                    None => break,
                };
                if !in_background && !focus_manager().is_focused() {
                    continue;
                }
                observer.trigger_refetch();
            }
        });
        *self.interval_task.lock() = handle;
    }

    fn abort_timers(&self) {
        if let Some(handle) = self.stale_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.interval_task.lock().take() {
            handle.abort();
        }
    }
}

/// Subscription from one consumer to one query.
///
/// Dropping the observer detaches it from its query; an unobserved query
/// starts its retention countdown.
pub struct QueryObserver {
    inner: Arc<ObserverInner>,
}

impl QueryObserver {
    pub fn new(client: &QueryClient, options: QueryObserverOptions) -> Self {
        let options = client.defaulted_observer_options(options);
        let query = client
            .cache()
            .build(options.key.clone(), options.query_options(), None);
        let inner = Arc::new(ObserverInner {
            id: QueryObserverId::new(),
            client: client.clone(),
            query: Mutex::new(query),
            options: Mutex::new(options),
            result: Mutex::new(QueryObserverResult {
                data: None,
                error: None,
                status: QueryStatus::Idle,
                is_fetching: false,
                is_loading: false,
                is_success: false,
                is_error: false,
                is_idle: true,
                is_stale: true,
                is_previous_data: false,
                data_updated_at: 0,
                error_updated_at: 0,
                failure_count: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            previous_data: Mutex::new(None),
            select_cache: Mutex::new(None),
            tracked: Arc::new(Mutex::new(HashSet::new())),
            stale_task: Mutex::new(None),
            interval_task: Mutex::new(None),
        });
        *inner.result.lock() = inner.compute_result();
        Self { inner }
    }

    /// Register a listener. The first listener attaches the observer to its
    /// query (cancelling retention) and evaluates the mount fetch policy.
    /// Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, listener: impl Fn(QueryObserverResult) + Send + Sync + 'static) -> u64 {
        let (id, first) = {
            let mut listeners = self.inner.listeners.lock();
            let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
            listeners.push((id, Arc::new(listener)));
            (id, listeners.len() == 1)
        };
        if first {
            self.inner.attach();
        }
        id
    }

    /// Remove a listener. When the last one goes, the observer detaches and
    /// the query may begin its retention countdown.
    pub fn unsubscribe(&self, id: u64) {
        let empty = {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|(i, _)| *i != id);
            listeners.is_empty()
        };
        if empty {
            self.inner.detach();
        }
    }

    /// The latest derived view, synchronously.
    pub fn get_current_result(&self) -> QueryObserverResult {
        let result = self.inner.compute_result();
        *self.inner.result.lock() = result.clone();
        result
    }

    /// The latest view, with field reads recorded for
    /// [`NotifyOnChangeProps::Tracked`].
    pub fn tracked_result(&self) -> TrackedResult {
        TrackedResult {
            result: self.get_current_result(),
            tracked: self.inner.tracked.clone(),
        }
    }

    /// Refetch the observed query and return the settled view.
    pub async fn refetch(&self) -> QueryObserverResult {
        let query = self.inner.query.lock().clone();
        let options = self.inner.options.lock().fetch_options();
        let _ = query.fetch(Some(options)).await;
        self.get_current_result()
    }

    /// Remove the observed query from the cache.
    pub fn remove(&self) {
        let query = self.inner.query.lock().clone();
        self.inner.client.cache().remove(&query);
    }

    /// Replace the observer's options, switching queries when the key
    /// changed and re-evaluating the refetch policy.
    pub fn set_options(&self, options: QueryObserverOptions) {
        let options = self.inner.client.defaulted_observer_options(options);
        let attached = !self.inner.listeners.lock().is_empty();
        let old_query = self.inner.query.lock().clone();

        if options.key.hash() != old_query.hash() {
            // Keep the old payload around for keep_previous_data.
            if let Some(data) = old_query.state().data {
                *self.inner.previous_data.lock() = Some(data);
            }
            let new_query = self.inner.client.cache().build(
                options.key.clone(),
                options.query_options(),
                None,
            );
            *self.inner.options.lock() = options;
            *self.inner.query.lock() = new_query.clone();
            *self.inner.select_cache.lock() = None;
            if attached {
                old_query.remove_observer(self.inner.id);
                new_query.add_observer(&self.inner);
                self.inner.evaluate_mount_fetch();
            }
        } else {
            old_query.set_options(options.query_options());
            *self.inner.options.lock() = options;
            if attached {
                self.inner.evaluate_mount_fetch();
            }
        }

        if attached {
            self.inner.refresh_interval_timer();
        }
        self.inner.update_result();
    }

    /// Detach from the query and drop all listeners.
    pub fn destroy(&self) {
        self.inner.listeners.lock().clear();
        self.inner.detach();
    }

    pub(crate) fn query_hash(&self) -> String {
        self.inner.query.lock().hash().to_owned()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.destroy();
    }
}
