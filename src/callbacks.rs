use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use crate::types::DeviceState;

/// State-change callback
pub type StateCallback = Arc<dyn Fn(&DeviceState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, StateCallback)>>,
}

/// Ordered set of state-change subscribers
///
/// Firing works on a snapshot of the registered callbacks, so a callback may
/// unregister itself or any other callback while it runs.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    inner: Arc<Registry>,
}

impl CallbackRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback; it stays registered until the handle is unregistered
    pub fn register(&self, callback: StateCallback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push((id, callback));

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every callback registered at the moment of the call
    pub fn fire(&self, state: &DeviceState) {
        let snapshot: Vec<StateCallback> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(state);
        }
    }

    /// Number of registered callbacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Check if no callback is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by callback registration
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unregister`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove the callback; repeated calls are no-ops
    pub fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(count: &Arc<AtomicUsize>) -> StateCallback {
        let count = Arc::clone(count);
        Arc::new(move |_: &DeviceState| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_and_fire() {
        let registry = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let subscription = registry.register(counter(&count));

        registry.fire(&DeviceState::default());
        registry.fire(&DeviceState::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        subscription.unregister();
        subscription.unregister();
        registry.fire(&DeviceState::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_self_unregister_during_fire() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));

        registry.register(counter(&first));

        let own_handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let subscription = registry.register({
            let own_handle = Arc::clone(&own_handle);
            let second_calls = Arc::clone(&second_calls);
            Arc::new(move |_: &DeviceState| {
                second_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = own_handle.lock().as_ref() {
                    handle.unregister();
                }
            })
        });
        *own_handle.lock() = Some(subscription);

        registry.register(counter(&third));

        registry.fire(&DeviceState::default());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);

        registry.fire(&DeviceState::default());
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_other_during_fire() {
        let registry = CallbackRegistry::new();
        let later = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        registry.register({
            let victim = Arc::clone(&victim);
            Arc::new(move |_: &DeviceState| {
                if let Some(handle) = victim.lock().take() {
                    handle.unregister();
                }
            })
        });
        *victim.lock() = Some(registry.register(counter(&later)));

        // Removed mid-firing, but it was part of this firing's snapshot
        registry.fire(&DeviceState::default());
        assert_eq!(later.load(Ordering::SeqCst), 1);

        registry.fire(&DeviceState::default());
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = CallbackRegistry::new();
        let subscription = registry.register(Arc::new(|_: &DeviceState| {}));
        drop(registry);
        subscription.unregister();
    }
}
