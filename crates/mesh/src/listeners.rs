//! Delivery of admitted inbound broadcasts to application callbacks

use shared::EmergencyBroadcast;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub type BroadcastListener = Arc<dyn Fn(&EmergencyBroadcast) + Send + Sync>;

type Observers = RwLock<Vec<(u64, BroadcastListener)>>;

// Listener lists hold plain data; a panicking callback cannot corrupt them
fn read(observers: &Observers) -> RwLockReadGuard<'_, Vec<(u64, BroadcastListener)>> {
    observers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(observers: &Observers) -> RwLockWriteGuard<'_, Vec<(u64, BroadcastListener)>> {
    observers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One primary listener slot plus any number of observers
#[derive(Default)]
pub struct ListenerRegistry {
    primary: RwLock<Option<BroadcastListener>>,
    observers: Arc<Observers>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary listener, replacing any previous one
    pub fn set_primary(&self, listener: BroadcastListener) {
        let mut slot = self.primary.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(listener);
    }

    /// Add an observer; it stays registered until the returned handle is dropped
    pub fn subscribe(&self, listener: BroadcastListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        write(&self.observers).push((id, listener));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        read(&self.observers).len()
    }

    /// Invoke the primary listener, then every observer
    pub fn notify(&self, broadcast: &EmergencyBroadcast) {
        let primary = self
            .primary
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(listener) = primary {
            listener(broadcast);
        }

        // Snapshot so callbacks may subscribe or unsubscribe
        let observers: Vec<BroadcastListener> =
            read(&self.observers).iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in observers {
            listener(broadcast);
        }
    }
}

/// Observer registration handle
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            write(&observers).retain(|(id, _)| *id != self.id);
        }
    }
}
