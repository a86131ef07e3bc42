//! Reactive value primitive
//!
//! A `ReactiveStore` holds one value and a list of subscriber callbacks.
//! Setting the value notifies every subscriber in subscription order. When
//! the last subscriber detaches, the store runs its release hook once, which
//! is how backends learn that a live view is no longer needed.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ReleaseHook = Box<dyn FnOnce() + Send>;

struct Inner<T> {
    value: RwLock<T>,
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
    release: Mutex<Option<ReleaseHook>>,
}

/// A single mutable value with a subscriber list
pub struct ReactiveStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ReactiveStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReactiveStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveStore")
            .field("value", &*self.inner.value.read())
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl<T> ReactiveStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                release: Mutex::new(None),
            }),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replace the value and notify subscribers
    ///
    /// Callbacks run after every lock is released, so a callback may read
    /// or set this store again.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value.clone();
        let callbacks: Vec<Callback<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&value);
        }
    }

    /// Register a callback for future values
    ///
    /// The callback is not invoked with the current value; use `get` for
    /// that.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                let now_empty = {
                    let mut subs = inner.subscribers.lock();
                    let before = subs.len();
                    subs.retain(|(sub_id, _)| *sub_id != id);
                    before != subs.len() && subs.is_empty()
                };
                if now_empty {
                    let hook = inner.release.lock().take();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
            }
        })
    }

    /// Install the hook run when the last subscriber detaches
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.release.lock() = Some(Box::new(hook));
    }

    /// Whether the release hook has already run (or none was installed)
    pub fn is_released(&self) -> bool {
        self.inner.release.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn downgrade(&self) -> WeakReactiveStore<T> {
        WeakReactiveStore {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning reference to a `ReactiveStore`
pub struct WeakReactiveStore<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakReactiveStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakReactiveStore<T> {
    pub fn upgrade(&self) -> Option<ReactiveStore<T>> {
        self.inner.upgrade().map(|inner| ReactiveStore { inner })
    }
}

/// Detaches a subscriber when called
///
/// Dropping an `Unsubscribe` without calling it leaves the subscription in
/// place.
#[must_use = "dropping an Unsubscribe leaves the subscription active"]
pub struct Unsubscribe {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(action: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// An unsubscribe that does nothing
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn call(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.action.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_set_notifies_subscribers() {
        let store = ReactiveStore::new(1i64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _unsub = store.subscribe(move |v| seen_clone.lock().push(*v));
        store.set(2);
        store.set(3);

        assert_eq!(*seen.lock(), vec![2, 3]);
        assert_eq!(store.get(), 3);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = ReactiveStore::new(0u32);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let unsub = store.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        store.set(1);
        unsub.call();
        store.set(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_release_runs_when_last_subscriber_leaves() {
        let store = ReactiveStore::new("v".to_string());
        let released = Arc::new(AtomicUsize::new(0));
        let released_clone = released.clone();
        store.on_release(move || {
            released_clone.fetch_add(1, Ordering::SeqCst);
        });

        let a = store.subscribe(|_| {});
        let b = store.subscribe(|_| {});

        a.call();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(!store.is_released());

        b.call();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(store.is_released());
    }

    #[test]
    fn test_callback_may_reenter_store() {
        let store = ReactiveStore::new(0i32);
        let inner = store.clone();
        let observed = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();

        let _unsub = store.subscribe(move |_| {
            *observed_clone.lock() = Some(inner.get());
        });
        store.set(5);

        assert_eq!(*observed.lock(), Some(5));
    }

    #[test]
    fn test_weak_reference_does_not_keep_store_alive() {
        let store = ReactiveStore::new(1u8);
        let weak = store.downgrade();
        assert!(weak.upgrade().is_some());
        drop(store);
        assert!(weak.upgrade().is_none());
    }
}
