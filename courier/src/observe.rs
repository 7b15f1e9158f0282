//! Synchronous observer registry.
//!
//! Observers are invoked on the notifying thread, in registration order,
//! with no buffering. The registry lock is not held while observers run,
//! so an observer may register or remove observers (or read state) from
//! inside its callback.

use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned when registering an observer; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    next_id: u64,
    entries: Vec<(ObserverId, Callback<E>)>,
}

/// A list of callbacks interested in events of type `E`.
pub struct Observers<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }
}

impl<E> Observers<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`; it is invoked for every subsequent event.
    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ObserverId {
        let mut inner = self.inner.lock();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered observer. Unknown ids are ignored.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry, _)| *entry != id);
        inner.entries.len() != before
    }

    /// Invoke every registered observer with `event`.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
