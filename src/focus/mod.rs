//! Focus and Online Tracking
//!
//! Process-wide signals that drive revalidation: window focus and network
//! connectivity. The host wires its platform event sources in through
//! [`FocusManager::set_event_listener`] / [`OnlineManager::set_event_listener`];
//! mounted clients subscribe and refetch stale queries on transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::watch;

type BusListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Returns the process-wide focus manager.
pub fn focus_manager() -> &'static FocusManager {
    static MANAGER: OnceLock<FocusManager> = OnceLock::new();
    MANAGER.get_or_init(FocusManager::new)
}

/// Returns the process-wide online manager.
pub fn online_manager() -> &'static OnlineManager {
    static MANAGER: OnceLock<OnlineManager> = OnceLock::new();
    MANAGER.get_or_init(OnlineManager::new)
}

/// True when the window is visible and the network is reachable. Paused
/// retries wait for this to flip back on.
pub fn is_visible_and_online() -> bool {
    focus_manager().is_focused() && online_manager().is_online()
}

struct Bus {
    state: watch::Sender<bool>,
    listeners: Mutex<Vec<(u64, BusListener)>>,
    next_listener_id: AtomicU64,
}

impl Bus {
    fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn get(&self) -> bool {
        *self.state.borrow()
    }

    fn set(&self, value: bool) {
        let changed = self.state.send_replace(value) != value;
        if changed {
            let listeners: Vec<BusListener> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| l.clone())
                .collect();
            for listener in listeners {
                listener(value);
            }
        }
    }

    fn subscribe(&self, listener: BusListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(i, _)| *i != id);
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Tracks window visibility. Defaults to focused until the host reports
/// otherwise.
pub struct FocusManager {
    bus: Bus,
}

impl FocusManager {
    fn new() -> Self {
        Self { bus: Bus::new() }
    }

    pub fn is_focused(&self) -> bool {
        self.bus.get()
    }

    /// Report a visibility transition. Hosts call this from their platform
    /// listener; tests call it directly.
    pub fn set_focused(&self, focused: bool) {
        self.bus.set(focused);
    }

    /// Hand the host a callback to invoke on platform visibility events.
    pub fn set_event_listener(&'static self, init: impl FnOnce(Arc<dyn Fn(bool) + Send + Sync>)) {
        init(Arc::new(move |focused| self.set_focused(focused)));
    }

    /// Subscribe to focus transitions. Returns an id for [`unsubscribe`].
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        self.bus.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<bool> {
        self.bus.watch()
    }
}

/// Tracks network connectivity. Defaults to online until the host reports
/// otherwise.
pub struct OnlineManager {
    bus: Bus,
}

impl OnlineManager {
    fn new() -> Self {
        Self { bus: Bus::new() }
    }

    pub fn is_online(&self) -> bool {
        self.bus.get()
    }

    pub fn set_online(&self, online: bool) {
        self.bus.set(online);
    }

    /// Hand the host a callback to invoke on platform connectivity events.
    pub fn set_event_listener(&'static self, init: impl FnOnce(Arc<dyn Fn(bool) + Send + Sync>)) {
        init(Arc::new(move |online| self.set_online(online)));
    }

    /// Subscribe to connectivity transitions. Returns an id for [`unsubscribe`].
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        self.bus.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<bool> {
        self.bus.watch()
    }
}
