//! Change subscriptions over the engine's change hook.
//!
//! `ObservableStore` opens the engine with a hook that fans every committed
//! put and delete out to the registered observers. Observers are called
//! synchronously on the writing thread, after the engine released its
//! locks, so an observer may read the store it is watching.

use std::path::Path;
use std::sync::{Arc, Weak};

use caskstore_core::{CaskStore, Change, ChangeHook, Config};
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::Codec;
use crate::error::{TypedError, TypedResult};
use crate::store::TypedStore;

pub trait Observer: Send + Sync {
    fn on_change(&self, change: &Change);

    /// Called once when the store closes.
    fn on_closed(&self) {}
}

impl<F> Observer for F
where
    F: Fn(&Change) + Send + Sync,
{
    fn on_change(&self, change: &Change) {
        self(change)
    }
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    observers: Vec<(u64, Arc<dyn Observer>)>,
    closed: bool,
}

impl Hub {
    fn snapshot(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }
}

/// Registration handle; the observer stays registered while it lives.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    hub: Option<Weak<Mutex<Hub>>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(hub) = self.hub.take().and_then(|w| w.upgrade()) {
            hub.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Engine handle whose mutations are published to observers.
pub struct ObservableStore {
    engine: Arc<CaskStore>,
    hub: Arc<Mutex<Hub>>,
}

impl ObservableStore {
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> TypedResult<Self> {
        let hub = Arc::new(Mutex::new(Hub::default()));
        let publish = Arc::clone(&hub);
        let hook: ChangeHook = Arc::new(move |change: &Change| {
            // call outside the hub lock so observers may (un)subscribe
            let observers = publish.lock().snapshot();
            for observer in observers {
                observer.on_change(change);
            }
        });
        let engine = CaskStore::open_with_hook(path, config, hook)?;
        Ok(Self {
            engine: Arc::new(engine),
            hub,
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> TypedResult<Subscription> {
        let mut hub = self.hub.lock();
        if hub.closed {
            return Err(TypedError::Closed);
        }
        hub.next_id += 1;
        let id = hub.next_id;
        hub.observers.push((id, observer));
        debug!(id, observers = hub.observers.len(), "observer subscribed");
        Ok(Subscription {
            id,
            hub: Some(Arc::downgrade(&self.hub)),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.lock().observers.len()
    }

    pub fn engine(&self) -> &Arc<CaskStore> {
        &self.engine
    }

    /// Typed view over the same engine; its writes are published too.
    pub fn typed<K, V, KC, VC>(&self) -> TypedStore<K, V, KC, VC>
    where
        KC: Codec<K>,
        VC: Codec<V>,
    {
        TypedStore::new(Arc::clone(&self.engine))
    }

    /// Tell every observer the store is closing, drop them, then close the
    /// engine. Later calls do nothing.
    pub fn close(&self) -> TypedResult<()> {
        let observers = {
            let mut hub = self.hub.lock();
            if hub.closed {
                return Ok(());
            }
            hub.closed = true;
            let observers = hub.snapshot();
            hub.observers.clear();
            observers
        };
        debug!(observers = observers.len(), "closing observable store");
        for observer in &observers {
            observer.on_closed();
        }
        Ok(self.engine.close()?)
    }

    pub fn is_closed(&self) -> bool {
        self.hub.lock().closed
    }
}

impl Drop for ObservableStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "error closing observable store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caskstore_core::ChangeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Counter {
        changes: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Observer for Counter {
        fn on_change(&self, _change: &Change) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_unsubscribes() {
        let dir = TempDir::new().unwrap();
        let store = ObservableStore::open(dir.path(), Config::default()).unwrap();
        let counter = Arc::new(Counter::default());

        let sub = store.subscribe(counter.clone()).unwrap();
        store.engine().put(b"k", b"v").unwrap();
        drop(sub);
        store.engine().put(b"k", b"w").unwrap();

        assert_eq!(counter.changes.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_close_notifies_once() {
        let dir = TempDir::new().unwrap();
        let store = ObservableStore::open(dir.path(), Config::default()).unwrap();
        let counter = Arc::new(Counter::default());
        let _sub = store.subscribe(counter.clone()).unwrap();

        store.close().unwrap();
        store.close().unwrap();
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(store.subscribe(counter.clone()), Err(TypedError::Closed)));
        assert!(store.engine().is_closed());
    }

    #[test]
    fn test_closure_observer() {
        let dir = TempDir::new().unwrap();
        let store = ObservableStore::open(dir.path(), Config::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store
            .subscribe(Arc::new(move |c: &Change| sink.lock().push(c.kind)))
            .unwrap();

        store.engine().put(b"a", b"1").unwrap();
        store.engine().delete(b"a").unwrap();
        assert_eq!(*seen.lock(), vec![ChangeKind::Add, ChangeKind::Delete]);
    }
}
