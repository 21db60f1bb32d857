//! Query Client
//!
//! The consumer-facing facade: aggregates the query and mutation caches,
//! applies option defaults, and exposes the fetch/prefetch/invalidate/
//! cancel/watch/mutate operations. Typed payloads cross the serde boundary
//! here; everything deeper works on `serde_json::Value`.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{QueryCache, QueryFilters};
use crate::focus::{focus_manager, online_manager};
use crate::mutation::{
    MutationCache, MutationFunction, MutationObserver, MutationOptions,
};
use crate::notify::notify_manager;
use crate::observer::{QueriesObserver, QueryObserver, QueryObserverOptions};
use crate::query::{QueryFunction, QueryOptions, QueryState, SharedFetch};
use crate::retry::{CancelOptions, QueryError, RetryPolicy};
use crate::types::{try_spawn, QueryKey};

/// Lift a typed async closure into the type-erased query function shape.
pub fn query_fn<T, F, Fut>(f: F) -> QueryFunction
where
    T: Serialize,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = f();
        async move {
            let value = fut.await?;
            serde_json::to_value(value).map_err(|e| QueryError::Serialization(e.to_string()))
        }
        .boxed()
    })
}

/// Lift a typed async closure into the type-erased mutation function shape.
pub fn mutation_fn<TVars, TData, F, Fut>(f: F) -> MutationFunction
where
    TVars: DeserializeOwned,
    TData: Serialize,
    F: Fn(TVars) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TData, QueryError>> + Send + 'static,
{
    Arc::new(move |variables: Value| {
        let variables = match serde_json::from_value::<TVars>(variables) {
            Ok(variables) => variables,
            Err(e) => {
                let error = QueryError::Deserialization(e.to_string());
                return futures::future::ready(Err(error)).boxed();
            }
        };
        let fut = f(variables);
        async move {
            let value = fut.await?;
            serde_json::to_value(value).map_err(|e| QueryError::Serialization(e.to_string()))
        }
        .boxed()
    })
}

/// Client-wide option defaults.
#[derive(Clone, Default)]
pub struct QueryClientConfig {
    /// Defaults merged into every observer's / fetch call's options
    pub default_query_options: QueryObserverOptions,
    /// Defaults merged into every mutation's options
    pub default_mutation_options: MutationOptions,
}

/// Controls whether `invalidate_queries` refetches matching active queries.
#[derive(Clone, Copy, Debug)]
pub struct InvalidateOptions {
    pub refetch_active: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            refetch_active: true,
        }
    }
}

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    defaults: RwLock<QueryClientConfig>,
    query_defaults: Mutex<Vec<(QueryKey, QueryObserverOptions)>>,
    mutation_defaults: Mutex<Vec<(QueryKey, MutationOptions)>>,
    mount_subscriptions: Mutex<Option<(u64, u64)>>,
}

/// The main query client
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Create a new query client
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    /// Create a new query client with custom defaults
    pub fn with_config(config: QueryClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::new(),
                mutation_cache: MutationCache::new(),
                defaults: RwLock::new(config),
                query_defaults: Mutex::new(Vec::new()),
                mutation_defaults: Mutex::new(Vec::new()),
                mount_subscriptions: Mutex::new(None),
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// Register with the focus/online bus so transitions revalidate this
    /// client's queries and resume its paused mutations. Idempotent.
    pub fn mount(&self) {
        let mut subscriptions = self.inner.mount_subscriptions.lock();
        if subscriptions.is_some() {
            return;
        }
        let focus_client = self.clone();
        let focus_id = focus_manager().subscribe(move |focused| {
            if focused {
                focus_client.on_bus_event(true);
            }
        });
        let online_client = self.clone();
        let online_id = online_manager().subscribe(move |online| {
            if online {
                online_client.on_bus_event(false);
            }
        });
        *subscriptions = Some((focus_id, online_id));
    }

    /// Deregister from the focus/online bus. Idempotent.
    pub fn unmount(&self) {
        if let Some((focus_id, online_id)) = self.inner.mount_subscriptions.lock().take() {
            focus_manager().unsubscribe(focus_id);
            online_manager().unsubscribe(online_id);
        }
    }

    fn on_bus_event(&self, focus: bool) {
        let client = self.clone();
        try_spawn(async move {
            client.resume_paused_mutations().await;
        });
        if focus {
            self.inner.query_cache.on_focus();
        } else {
            self.inner.query_cache.on_online();
        }
    }

    /// Fetch (or return fresh cached) data for a key, deserialized to `T`.
    ///
    /// `retry` defaults to [`RetryPolicy::Never`] here: explicit fetches
    /// must not hang through a backoff schedule.
    pub async fn fetch_query_data<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        f: F,
        options: QueryOptions,
    ) -> Result<T, QueryError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let value = self
            .fetch_query_value(key.into(), Some(query_fn(f)), options)
            .await?;
        serde_json::from_value(value).map_err(|e| QueryError::Deserialization(e.to_string()))
    }

    /// Like [`fetch_query_data`](Self::fetch_query_data) but swallows the
    /// outcome; used to warm the cache.
    pub async fn prefetch_query<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        f: F,
        options: QueryOptions,
    ) where
        T: Serialize,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        if let Err(error) = self
            .fetch_query_value(key.into(), Some(query_fn(f)), options)
            .await
        {
            tracing::debug!(%error, "prefetch settled with error");
        }
    }

    /// Untyped fetch path shared by the typed entry points.
    pub async fn fetch_query_value(
        &self,
        key: QueryKey,
        query_fn: Option<QueryFunction>,
        mut options: QueryOptions,
    ) -> Result<Value, QueryError> {
        if options.query_fn.is_none() {
            options.query_fn = query_fn;
        }
        if let Some(defaults) = self.get_query_defaults(&key) {
            options.merge_defaults(&defaults.query_options());
        }
        options.merge_defaults(
            &self
                .inner
                .defaults
                .read()
                .default_query_options
                .query_options(),
        );
        if options.query_fn.is_none() {
            return Err(QueryError::MissingQueryFn);
        }
        if options.retry.is_none() {
            options.retry = Some(RetryPolicy::Never);
        }

        let stale_time = options.stale_time();
        let query = self.inner.query_cache.build(key, options, None);
        if let Some(data) = query.state().data {
            if !query.is_stale_by_time(stale_time) {
                return Ok(data);
            }
        }
        query.fetch(None).await
    }

    /// Cached data for a key, deserialized to `T`. Absent or undecodable
    /// data yields `None`.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: impl Into<QueryKey>) -> Option<T> {
        let key = key.into();
        let query = self.inner.query_cache.get(&key.hash())?;
        let data = query.state().data?;
        match serde_json::from_value(data) {
            Ok(data) => Some(data),
            Err(error) => {
                tracing::warn!(%error, "cached data did not deserialize to the requested type");
                None
            }
        }
    }

    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        let key = key.into();
        self.inner
            .query_cache
            .get(&key.hash())
            .map(|query| query.state())
    }

    /// Write data for a key directly, creating the entry when absent.
    pub fn set_query_data<T: Serialize>(
        &self,
        key: impl Into<QueryKey>,
        data: T,
    ) -> Result<(), QueryError> {
        let value =
            serde_json::to_value(data).map_err(|e| QueryError::Serialization(e.to_string()))?;
        let query = self
            .inner
            .query_cache
            .build(key, QueryOptions::default(), None);
        query.set_data(value, None);
        Ok(())
    }

    /// Update data for a key through a function of the current value.
    pub fn set_query_data_with<T>(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<T>) -> T,
    ) -> Result<(), QueryError>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = key.into();
        let current = self.get_query_data(key.clone());
        self.set_query_data(key, updater(current))
    }

    /// Mark matching queries stale and refetch the active ones.
    pub async fn invalidate_queries(&self, filters: QueryFilters) {
        self.invalidate_queries_with(filters, InvalidateOptions::default())
            .await;
    }

    pub async fn invalidate_queries_with(
        &self,
        filters: QueryFilters,
        options: InvalidateOptions,
    ) {
        let refetches: Vec<SharedFetch> = notify_manager().batch(|| {
            let queries = self.inner.query_cache.find_all(&filters);
            let mut refetches = Vec::new();
            for query in &queries {
                query.invalidate();
                if options.refetch_active && query.is_active() {
                    refetches.push(query.fetch(None));
                }
            }
            refetches
        });
        for refetch in refetches {
            let _ = refetch.await;
        }
    }

    /// Refetch matching queries regardless of staleness.
    pub async fn refetch_queries(&self, filters: QueryFilters) {
        let refetches: Vec<SharedFetch> = notify_manager().batch(|| {
            self.inner
                .query_cache
                .find_all(&filters)
                .iter()
                .map(|query| query.fetch(None))
                .collect()
        });
        for refetch in refetches {
            let _ = refetch.await;
        }
    }

    /// Cancel in-flight fetches for matching queries and wait for them to
    /// settle. Reverts to the pre-fetch state by default.
    pub async fn cancel_queries(&self, filters: QueryFilters) {
        self.cancel_queries_with(filters, CancelOptions::default())
            .await;
    }

    pub async fn cancel_queries_with(&self, filters: QueryFilters, options: CancelOptions) {
        let pending: Vec<SharedFetch> = {
            let queries = self.inner.query_cache.find_all(&filters);
            queries
                .iter()
                .filter_map(|query| {
                    let future = query.fetch_future();
                    query.cancel(options);
                    future
                })
                .collect()
        };
        for settled in pending {
            let _ = settled.await;
        }
    }

    pub fn remove_queries(&self, filters: QueryFilters) {
        notify_manager().batch(|| {
            for query in self.inner.query_cache.find_all(&filters) {
                self.inner.query_cache.remove(&query);
            }
        });
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: QueryFilters) -> usize {
        self.inner.query_cache.find_all(&filters.fetching(true)).len()
    }

    /// Create an observer for one query.
    pub fn watch_query(&self, options: QueryObserverOptions) -> QueryObserver {
        QueryObserver::new(self, options)
    }

    /// Create a fan-out observer over an ordered list of queries.
    pub fn watch_queries(&self, queries: Vec<QueryObserverOptions>) -> QueriesObserver {
        QueriesObserver::new(self, queries)
    }

    /// Create an observer for mutations built from these options.
    pub fn watch_mutation(&self, options: MutationOptions) -> MutationObserver {
        let options = self.defaulted_mutation_options(options);
        MutationObserver::with_cache(self.inner.mutation_cache.clone(), options)
    }

    /// Build and execute a mutation, returning its settled result.
    pub async fn mutate<TData, TVars>(
        &self,
        options: MutationOptions,
        variables: TVars,
    ) -> Result<TData, QueryError>
    where
        TData: DeserializeOwned,
        TVars: Serialize,
    {
        let options = self.defaulted_mutation_options(options);
        let variables = serde_json::to_value(variables)
            .map_err(|e| QueryError::Serialization(e.to_string()))?;
        let mutation = self.inner.mutation_cache.build(options);
        let value = mutation.execute(variables).await?;
        serde_json::from_value(value).map_err(|e| QueryError::Deserialization(e.to_string()))
    }

    /// Re-run mutations paused by offline state, oldest first.
    pub async fn resume_paused_mutations(&self) {
        self.inner.mutation_cache.resume_paused_mutations().await;
    }

    pub fn set_default_options(&self, config: QueryClientConfig) {
        *self.inner.defaults.write() = config;
    }

    /// Install defaults for queries whose key starts with `key`. Replaces a
    /// previous entry for the same key.
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryObserverOptions) {
        let key = key.into();
        let mut defaults = self.inner.query_defaults.lock();
        if let Some(entry) = defaults.iter_mut().find(|(k, _)| k.hash() == key.hash()) {
            entry.1 = options;
        } else {
            defaults.push((key, options));
        }
    }

    /// The first registered query defaults whose key partially matches.
    pub fn get_query_defaults(&self, key: &QueryKey) -> Option<QueryObserverOptions> {
        self.inner
            .query_defaults
            .lock()
            .iter()
            .find(|(candidate, _)| candidate.partial_match(key))
            .map(|(_, options)| options.clone())
    }

    /// Install defaults for mutations whose key starts with `key`.
    pub fn set_mutation_defaults(&self, key: impl Into<QueryKey>, options: MutationOptions) {
        let key = key.into();
        let mut defaults = self.inner.mutation_defaults.lock();
        if let Some(entry) = defaults.iter_mut().find(|(k, _)| k.hash() == key.hash()) {
            entry.1 = options;
        } else {
            defaults.push((key, options));
        }
    }

    /// The first registered mutation defaults whose key partially matches.
    pub fn get_mutation_defaults(&self, key: &QueryKey) -> Option<MutationOptions> {
        self.inner
            .mutation_defaults
            .lock()
            .iter()
            .find(|(candidate, _)| candidate.partial_match(key))
            .map(|(_, options)| options.clone())
    }

    /// Drop all cached queries and mutations.
    pub fn clear(&self) {
        notify_manager().batch(|| {
            self.inner.query_cache.clear();
            self.inner.mutation_cache.clear();
        });
    }

    pub(crate) fn defaulted_observer_options(
        &self,
        mut options: QueryObserverOptions,
    ) -> QueryObserverOptions {
        if let Some(key_defaults) = self.get_query_defaults(&options.key) {
            options.merge_defaults(&key_defaults);
        }
        options.merge_defaults(&self.inner.defaults.read().default_query_options);
        options
    }

    pub(crate) fn defaulted_mutation_options(&self, mut options: MutationOptions) -> MutationOptions {
        if let Some(key) = options.mutation_key.clone() {
            if let Some(key_defaults) = self.get_mutation_defaults(&key) {
                options.merge_defaults(&key_defaults);
            }
        }
        options.merge_defaults(&self.inner.defaults.read().default_mutation_options);
        options
    }
}
