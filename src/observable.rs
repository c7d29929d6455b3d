//! Versioned snapshot container with change notification.
//!
//! Readers take a cheap `Arc` snapshot synchronously; subscribers get a
//! `watch::Receiver` that is marked changed on every publish. Dropping the
//! receiver unsubscribes.

use std::sync::Arc;

use tokio::sync::watch;

/// One published value together with its monotonically increasing version.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

/// Versioned container for a value that changes over time.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<Snapshot<T>>,
}

impl<T> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(Snapshot {
            version: 0,
            value: Arc::new(value),
        });
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.tx.borrow().value)
    }

    /// Current version. Starts at 0 and increments on each publish.
    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Current value with its version.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_modify(|snapshot| {
            snapshot.version += 1;
            snapshot.value = Arc::new(value);
        });
    }

    /// Publish only when the new value differs from the current one.
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.tx.send_if_modified(|snapshot| {
            if *snapshot.value == value {
                return false;
            }
            snapshot.version += 1;
            snapshot.value = Arc::new(value);
            true
        })
    }

    /// Receive every subsequent publish.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.tx.subscribe()
    }
}

impl<T: Clone> Observable<T> {
    /// Copy-on-write update of the current value.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(|snapshot| {
            let mut next = (*snapshot.value).clone();
            f(&mut next);
            snapshot.version += 1;
            snapshot.value = Arc::new(next);
        });
    }
}

impl<T: Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
