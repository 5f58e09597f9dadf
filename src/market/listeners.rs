use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

/// Set of callbacks for one topic. Fan-out runs over a snapshot of the set,
/// outside the lock, so a callback may register or detach listeners itself.
pub struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn register(self: &Arc<Self>, listener: Listener<T>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        let weak: Weak<Self> = Arc::downgrade(self);
        let registry: Weak<dyn Detach> = weak;
        ListenerHandle { id, registry }
    }

    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Detach for ListenerRegistry<T> {
    fn detach(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}

/// Returned by every `on_*` registration. Dropping the handle keeps the
/// listener attached; call [`ListenerHandle::unsubscribe`] to detach it.
pub struct ListenerHandle {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl ListenerHandle {
    /// Returns `false` when the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.detach(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}
