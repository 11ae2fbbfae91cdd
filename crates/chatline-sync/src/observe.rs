use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ObserverSet<E> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<E>>,
}

/// Explicit publish/subscribe registry. Callbacks are invoked in subscription
/// order, once per `notify`, in the order `notify` is called.
pub struct Observers<E> {
    inner: Arc<Mutex<ObserverSet<E>>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObserverSet {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut set = lock(&self.inner);
            let id = set.next_id;
            set.next_id += 1;
            set.callbacks.insert(id, Arc::new(callback));
            id
        };
        let weak: Weak<Mutex<ObserverSet<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).callbacks.remove(&id);
                }
            })),
        }
    }

    pub fn notify(&self, event: &E) {
        // Snapshot first so a callback may subscribe or unsubscribe without
        // deadlocking on the registry.
        let callbacks: Vec<Callback<E>> = lock(&self.inner).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`; dropping it detaches the callback.
#[must_use = "dropping a Subscription detaches the callback immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
