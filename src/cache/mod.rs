//! Query Cache
//!
//! The keyed store of [`Query`] entries: lifecycle (build, find, remove,
//! clear), cache-level event subscriptions, and the focus/online delegation
//! that drives revalidation of mounted clients.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::notify::notify_manager;
use crate::query::{Query, QueryOptions, QueryState};
use crate::types::QueryKey;

/// Cache lifecycle events delivered to [`QueryCache::subscribe`] listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryCacheEvent {
    Added,
    Removed,
    Updated,
}

type CacheListener = Arc<dyn Fn(QueryCacheEvent, &Arc<Query>) + Send + Sync>;

/// Filters selecting a subset of cached queries. All set fields must match.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match against the query key: exact (by hash) or array-prefix partial
    pub key: Option<QueryKey>,
    pub exact: bool,
    /// Queries with at least one enabled observer (or none, when `false`)
    pub active: Option<bool>,
    pub stale: Option<bool>,
    pub fetching: Option<bool>,
    pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl QueryFilters {
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

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Query) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.key {
            let key_matches = if self.exact {
                query.hash() == key.hash()
            } else {
                key.partial_match(query.key())
            };
            if !key_matches {
                return false;
            }
        }
        if let Some(active) = self.active {
            if query.is_active() != active {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetching) = self.fetching {
            if query.is_fetching() != fetching {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

pub(crate) struct QueryCacheInner {
    queries: Mutex<HashMap<String, Arc<Query>>>,
    listeners: Mutex<Vec<(u64, CacheListener)>>,
    next_listener_id: AtomicU64,
}

impl QueryCacheInner {
    fn new() -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut queries = self.queries.lock();
            match queries.get(query.hash()) {
                Some(existing) if Arc::ptr_eq(existing, query) => {
                    queries.remove(query.hash());
                    true
                }
                _ => false,
            }
        };
        if removed {
            query.destroy();
            self.emit(QueryCacheEvent::Removed, query);
        }
    }

    pub(crate) fn notify_updated(&self, query: &Arc<Query>) {
        self.emit(QueryCacheEvent::Updated, query);
    }

    fn emit(&self, event: QueryCacheEvent, query: &Arc<Query>) {
        let listeners: Vec<CacheListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let query = query.clone();
        notify_manager().schedule(move || {
            for listener in &listeners {
                listener(event, &query);
            }
        });
    }
}

/// Keyed store mapping canonical key hashes to [`Query`] entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<QueryCacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueryCacheInner::new()),
        }
    }

    /// Get the query for this key, creating it when absent.
    ///
    /// An existing query absorbs the given options but is otherwise
    /// untouched; a new query is inserted and `Added` is emitted.
    pub fn build(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Arc<Query> {
        let key = key.into();
        let hash = key.hash();
        let (query, created) = {
            let mut queries = self.inner.queries.lock();
            match queries.entry(hash) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let query = Query::new(
                        Arc::downgrade(&self.inner),
                        key,
                        entry.key().clone(),
                        options.clone(),
                        state,
                    );
                    entry.insert(query.clone());
                    (query, true)
                }
            }
        };
        if created {
            tracing::debug!(query = %query.hash(), "query added to cache");
            self.inner.emit(QueryCacheEvent::Added, &query);
        } else {
            query.set_options(options);
        }
        query
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Query>> {
        self.inner.queries.lock().get(hash).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.inner.queries.lock().values().cloned().collect()
    }

    /// First query matching the key exactly plus any extra filters.
    pub fn find(&self, key: impl Into<QueryKey>, mut filters: QueryFilters) -> Option<Arc<Query>> {
        filters.key = Some(key.into());
        filters.exact = true;
        self.find_all(&filters).into_iter().next()
    }

    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect()
    }

    pub fn remove(&self, query: &Arc<Query>) {
        self.inner.remove(query);
    }

    pub fn clear(&self) {
        let queries: Vec<Arc<Query>> = {
            let mut map = self.inner.queries.lock();
            map.drain().map(|(_, q)| q).collect()
        };
        notify_manager().batch(|| {
            for query in &queries {
                query.destroy();
                self.inner.emit(QueryCacheEvent::Removed, query);
            }
        });
    }

    /// Subscribe to cache lifecycle events. Returns an id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        listener: impl Fn(QueryCacheEvent, &Arc<Query>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.listeners.lock().retain(|(i, _)| *i != id);
    }

    /// The window regained focus: resume paused retries and let interested
    /// observers refetch.
    pub fn on_focus(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// The network came back: resume paused retries and let interested
    /// observers refetch.
    pub fn on_online(&self) {
        notify_manager().batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queries.lock().is_empty()
    }
}
