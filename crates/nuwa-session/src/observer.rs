//! Listener registry with RAII subscription handles

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Ordered list of listeners for events of type `E`
pub struct Observers<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register `listener`. It stays registered while the returned
    /// handle is alive.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Invoke every listener in subscription order. The registry lock is
    /// not held while listeners run, so they may subscribe or unsubscribe.
    pub fn notify(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the source
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_drop_unsubscribes() {
        let observers = Observers::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = observers.subscribe(move |n| {
            counter.fetch_add(*n as usize, Ordering::SeqCst);
        });
        observers.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(sub);
        observers.notify(&5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe_and_detach() {
        let observers = Observers::<()>::new();
        observers.subscribe(|_| {}).detach();
        let sub = observers.subscribe(|_| {});
        assert_eq!(observers.len(), 2);

        sub.unsubscribe();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_notify() {
        let observers = Arc::new(Observers::<()>::new());
        let inner = observers.clone();
        observers
            .subscribe(move |_| inner.subscribe(|_| {}).detach())
            .detach();

        observers.notify(&());
        assert_eq!(observers.len(), 2);
    }
}
