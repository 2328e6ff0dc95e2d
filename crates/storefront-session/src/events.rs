//! Keyed synchronous listener registry.
//!
//! `Emitter` backs both the process-wide token bus and each real-time
//! manager's local event map. Listeners run synchronously, in registration
//! order, on the emitting task. A panicking listener is logged and skipped so
//! the remaining listeners of the same emit still run.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::error;

/// Handle returned by [`Emitter::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Registry<K, A> {
    listeners: HashMap<K, Vec<(ListenerId, Listener<A>)>>,
}

/// Clone is cheap: clones share one registry.
pub struct Emitter<K, A> {
    registry: Arc<Mutex<Registry<K, A>>>,
    next_id: Arc<AtomicU64>,
}

impl<K, A> Clone for Emitter<K, A> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K, A> Default for Emitter<K, A>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A> Emitter<K, A>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                listeners: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<K, A>> {
        // A listener never runs under this lock, so poisoning can only come
        // from a panic inside a plain Vec operation; the data is still usable.
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a listener for `key`.
    pub fn on<F>(&self, key: K, listener: F) -> ListenerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .listeners
            .entry(key)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, key: &K, id: ListenerId) {
        let mut registry = self.lock();
        if let Some(list) = registry.listeners.get_mut(key) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                registry.listeners.remove(key);
            }
        }
    }

    /// Invoke every listener registered for `key` at the time of the call.
    pub fn emit(&self, key: &K, args: &A) {
        // Snapshot so listeners may call on/off re-entrantly.
        let snapshot: Vec<Listener<A>> = match self.lock().listeners.get(key) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(args))).is_err() {
                error!(event = ?key, "Listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.lock().listeners.get(key).map(Vec::len).unwrap_or(0)
    }

    /// Drop every listener for every key.
    pub fn clear(&self) {
        self.lock().listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Emitter<&'static str, u32>) {
        (Arc::new(Mutex::new(Vec::new())), Emitter::new())
    }

    #[test]
    fn test_emit_runs_listeners_in_registration_order() {
        let (log, emitter) = recorder();
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            emitter.on("tick", move |n: &u32| log.lock().unwrap().push(format!("{name}:{n}")));
        }

        emitter.emit(&"tick", &7);

        assert_eq!(*log.lock().unwrap(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let (log, emitter) = recorder();
        emitter.on("tick", |_: &u32| panic!("listener failure"));
        let sink = Arc::clone(&log);
        emitter.on("tick", move |_: &u32| sink.lock().unwrap().push("ran".into()));

        emitter.emit(&"tick", &1);

        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }

    #[test]
    fn test_off_removes_only_that_listener() {
        let (log, emitter) = recorder();
        let sink = Arc::clone(&log);
        let removed = emitter.on("tick", move |_: &u32| sink.lock().unwrap().push("a".into()));
        let sink = Arc::clone(&log);
        emitter.on("tick", move |_: &u32| sink.lock().unwrap().push("b".into()));

        emitter.off(&"tick", removed);
        emitter.emit(&"tick", &1);

        assert_eq!(*log.lock().unwrap(), vec!["b"]);
        assert_eq!(emitter.listener_count(&"tick"), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let (log, emitter) = recorder();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let inner = emitter.clone();
        let inner_slot = Arc::clone(&slot);
        let sink = Arc::clone(&log);
        let id = emitter.on("tick", move |_: &u32| {
            sink.lock().unwrap().push("once".into());
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner.off(&"tick", id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        emitter.emit(&"tick", &1);
        emitter.emit(&"tick", &2);

        assert_eq!(*log.lock().unwrap(), vec!["once"]);
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        emitter.emit(&"nobody", &0);
        assert_eq!(emitter.listener_count(&"nobody"), 0);
    }
}
