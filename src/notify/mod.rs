//! Coalesced Notification Scheduling
//!
//! A process-wide scheduler that batches observer callbacks so that many
//! state changes in one logical step yield one round of notifications.
//!
//! A batch is scoped to the thread that opened it: state changes made on
//! that thread while the batch is open flush together when the outermost
//! batch closes, in enqueue order. A task scheduled with no open batch on
//! its thread runs synchronously.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

type Task = Box<dyn FnOnce() + Send>;
type BatchNotifyFn = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Returns the process-wide notify manager.
pub fn notify_manager() -> &'static NotifyManager {
    static MANAGER: OnceLock<NotifyManager> = OnceLock::new();
    MANAGER.get_or_init(NotifyManager::new)
}

struct QueueEntry {
    key: Option<u64>,
    task: Task,
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    queue: Vec<QueueEntry>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = RefCell::new(BatchState::default());
}

/// Coalesces scheduled callbacks into batches.
///
/// Tasks scheduled with a key replace a pending task carrying the same key,
/// keeping its original queue position; observers use this so a flurry of
/// state changes produces a single notification that sees the final state.
pub struct NotifyManager {
    batch_notify_fn: RwLock<Option<BatchNotifyFn>>,
}

impl NotifyManager {
    fn new() -> Self {
        Self {
            batch_notify_fn: RwLock::new(None),
        }
    }

    /// Run `f` inside a batch; all tasks scheduled during `f` flush after it
    /// returns. Nested batches share the outermost flush.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        BATCH.with(|state| state.borrow_mut().depth += 1);
        let guard = BatchGuard { manager: self };
        let result = f();
        drop(guard);
        result
    }

    /// Schedule a task. Runs synchronously when no batch is open on this
    /// thread.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.enqueue(None, Box::new(task));
    }

    /// Schedule a task coalesced by `key`: a pending task with the same key
    /// is replaced in place.
    pub(crate) fn schedule_keyed(&self, key: u64, task: impl FnOnce() + Send + 'static) {
        self.enqueue(Some(key), Box::new(task));
    }

    /// Lift a callback so every invocation goes through [`schedule`].
    ///
    /// [`schedule`]: Self::schedule
    pub fn batch_calls<T: Send + 'static>(
        &'static self,
        f: impl Fn(T) + Send + Sync + 'static,
    ) -> impl Fn(T) {
        let f = Arc::new(f);
        move |value: T| {
            let f = f.clone();
            self.schedule(move || f(value));
        }
    }

    /// Install an outer wrapper invoked around each flush. UI bindings use
    /// this to wrap notifications in a render transaction.
    pub fn set_batch_notify_fn(&self, wrapper: impl Fn(&mut dyn FnMut()) + Send + Sync + 'static) {
        *self.batch_notify_fn.write() = Some(Arc::new(wrapper));
    }

    fn enqueue(&self, key: Option<u64>, task: Task) {
        let mut task = Some(task);
        let deferred = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            if state.depth == 0 {
                return false;
            }
            if let Some(key) = key {
                if let Some(entry) = state.queue.iter_mut().find(|e| e.key == Some(key)) {
                    entry.task = task.take().unwrap();
                    return true;
                }
            }
            state.queue.push(QueueEntry {
                key,
                task: task.take().unwrap(),
            });
            true
        });
        if !deferred {
            self.run_all(vec![QueueEntry {
                key,
                task: task.unwrap(),
            }]);
        }
    }

    fn flush(&self) {
        let tasks = BATCH.with(|state| {
            let mut state = state.borrow_mut();
            if state.depth > 0 {
                return Vec::new();
            }
            std::mem::take(&mut state.queue)
        });
        if !tasks.is_empty() {
            self.run_all(tasks);
        }
    }

    fn run_all(&self, mut tasks: Vec<QueueEntry>) {
        let wrapper = self.batch_notify_fn.read().clone();
        let mut run = move || {
            for entry in tasks.drain(..) {
                if catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                    tracing::error!("notification callback panicked");
                }
            }
        };
        match wrapper {
            Some(wrapper) => wrapper(&mut run),
            None => run(),
        }
    }
}

struct BatchGuard<'a> {
    manager: &'a NotifyManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        BATCH.with(|state| state.borrow_mut().depth -= 1);
        self.manager.flush();
    }
}
