//! Thread-safe observer list.
//!
//! Handlers are copied out of the lock before they run, so a handler may
//! subscribe or unsubscribe (itself or others) while an event is being
//! broadcast without deadlocking or skipping unrelated handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner<T> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: AtomicU64,
}

/// A broadcast event with any number of handlers.
pub struct Event<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler. It stays registered until [`Event::unsubscribe`].
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .expect("event lock poisoned")
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that is removed when the returned guard drops.
    pub fn subscribe_scoped<F>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.subscribe(handler);
        Subscription {
            event: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        remove_handler(&self.inner, id)
    }

    /// Invoke every handler registered at the time of the call.
    pub fn broadcast(&self, value: &T) {
        let handlers: Vec<Handler<T>> = {
            let guard = self.inner.handlers.lock().expect("event lock poisoned");
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(value);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().expect("event lock poisoned").len()
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

fn remove_handler<T>(inner: &Inner<T>, id: SubscriptionId) -> bool {
    let mut handlers = inner.handlers.lock().expect("event lock poisoned");
    let before = handlers.len();
    handlers.retain(|(existing, _)| *existing != id);
    handlers.len() != before
}

/// Unsubscribes its handler on drop.
pub struct Subscription<T> {
    event: Weak<Inner<T>>,
    id: SubscriptionId,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.event.upgrade() {
            remove_handler(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_broadcast_reaches_all_handlers() {
        let event = Event::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            event.subscribe(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        event.broadcast(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let event = Event::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = event.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        event.broadcast(&());
        assert!(event.unsubscribe(id));
        assert!(!event.unsubscribe(id));
        event.broadcast(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_removing_itself_during_broadcast() {
        let event = Arc::new(Event::<()>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let ev = Arc::downgrade(&event);
        let slot = own_id.clone();
        let id = event.subscribe(move |_| {
            if let (Some(ev), Some(id)) = (ev.upgrade(), *slot.lock().unwrap()) {
                ev.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);

        let h = hits.clone();
        event.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        event.broadcast(&());
        event.broadcast(&());

        // The unrelated handler saw both broadcasts.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(event.handler_count(), 1);
    }

    #[test]
    fn test_scoped_subscription_removed_on_drop() {
        let event = Event::<u8>::new();
        {
            let _guard = event.subscribe_scoped(|_| {});
            assert_eq!(event.handler_count(), 1);
        }
        assert_eq!(event.handler_count(), 0);
    }
}
