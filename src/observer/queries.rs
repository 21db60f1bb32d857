//! Fan-out observation over an ordered list of queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::notify::notify_manager;
use crate::types::QueryObserverId;

use super::{QueryObserver, QueryObserverOptions, QueryObserverResult};

type ListListener = Arc<dyn Fn(Vec<QueryObserverResult>) + Send + Sync>;

struct Slot {
    observer: QueryObserver,
    subscription: Option<u64>,
}

struct QueriesObserverInner {
    id: QueryObserverId,
    client: QueryClient,
    slots: Mutex<Vec<Slot>>,
    listeners: Mutex<Vec<(u64, ListListener)>>,
    next_listener_id: AtomicU64,
}

impl QueriesObserverInner {
    fn current_results(&self) -> Vec<QueryObserverResult> {
        self.slots
            .lock()
            .iter()
            .map(|slot| slot.observer.get_current_result())
            .collect()
    }

    /// One combined result list per batch: child updates coalesce on the
    /// list observer's own key.
    fn schedule_emit(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        notify_manager().schedule_keyed(self.id.0, move || {
            if let Some(inner) = weak.upgrade() {
                inner.emit();
            }
        });
    }

    fn emit(&self) {
        let results = self.current_results();
        let listeners: Vec<ListListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(results.clone());
        }
    }

    fn subscribe_slot(self: &Arc<Self>, slot: &mut Slot) {
        let weak = Arc::downgrade(self);
        let id = slot.observer.subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_emit();
            }
        });
        slot.subscription = Some(id);
    }
}

/// Observes an ordered list of queries and emits one combined result list
/// per change batch. On options updates, child observers are diffed by
/// query hash: matching ones are reused, removed ones destroyed, added ones
/// created.
pub struct QueriesObserver {
    inner: Arc<QueriesObserverInner>,
}

impl QueriesObserver {
    pub fn new(client: &QueryClient, queries: Vec<QueryObserverOptions>) -> Self {
        let observer = Self {
            inner: Arc::new(QueriesObserverInner {
                id: QueryObserverId::new(),
                client: client.clone(),
                slots: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        };
        observer.set_queries(queries);
        observer
    }

    /// Replace the observed list, reusing child observers whose query hash
    /// is unchanged.
    pub fn set_queries(&self, queries: Vec<QueryObserverOptions>) {
        let subscribed = !self.inner.listeners.lock().is_empty();
        let mut old_slots: Vec<Slot> = std::mem::take(&mut *self.inner.slots.lock());

        // Batched so child subscriptions flush only after the slot list is
        // in place.
        notify_manager().batch(|| {
            let mut new_slots = Vec::with_capacity(queries.len());
            for options in queries {
                let hash = options.key.hash();
                let reused = old_slots
                    .iter()
                    .position(|slot| slot.observer.query_hash() == hash);
                match reused {
                    Some(index) => {
                        let slot = old_slots.remove(index);
                        slot.observer.set_options(options);
                        new_slots.push(slot);
                    }
                    None => {
                        let mut slot = Slot {
                            observer: QueryObserver::new(&self.inner.client, options),
                            subscription: None,
                        };
                        if subscribed {
                            self.inner.subscribe_slot(&mut slot);
                        }
                        new_slots.push(slot);
                    }
                }
            }
            // Anything left in old_slots was removed; dropping the observer
            // detaches it.
            drop(old_slots);

            *self.inner.slots.lock() = new_slots;
            if subscribed {
                self.inner.schedule_emit();
            }
        });
    }

    /// Register a listener for the combined result list. Returns an id for
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        listener: impl Fn(Vec<QueryObserverResult>) + Send + Sync + 'static,
    ) -> u64 {
        let (id, first) = {
            let mut listeners = self.inner.listeners.lock();
            let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
            listeners.push((id, Arc::new(listener)));
            (id, listeners.len() == 1)
        };
        if first {
            // Batched so a synchronous child notification cannot re-enter
            // the slot list while it is borrowed.
            notify_manager().batch(|| {
                let mut slots = self.inner.slots.lock();
                for slot in slots.iter_mut() {
                    if slot.subscription.is_none() {
                        self.inner.subscribe_slot(slot);
                    }
                }
            });
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        let empty = {
            let mut listeners = self.inner.listeners.lock();
            listeners.retain(|(i, _)| *i != id);
            listeners.is_empty()
        };
        if empty {
            let mut slots = self.inner.slots.lock();
            for slot in slots.iter_mut() {
                if let Some(sub) = slot.subscription.take() {
                    slot.observer.unsubscribe(sub);
                }
            }
        }
    }

    /// The latest combined views, synchronously.
    pub fn get_current_result(&self) -> Vec<QueryObserverResult> {
        self.inner.current_results()
    }

    pub fn destroy(&self) {
        self.inner.listeners.lock().clear();
        let mut slots = self.inner.slots.lock();
        for slot in slots.drain(..) {
            slot.observer.destroy();
        }
    }
}

impl Drop for QueriesObserver {
    fn drop(&mut self) {
        self.destroy();
    }
}
