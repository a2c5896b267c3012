//! Handle registry
//!
//! The native callback can only carry a plain integer. The registry maps
//! that integer back to a typed, reference-counted target. A handle is live
//! from `add` until `delete`; after that every lookup misses, and a caller
//! that resolved the target earlier still holds a valid `Arc`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque token passed across the native callback boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Concurrent handle -> target table
///
/// Internally synchronized; callers never take an external lock.
pub struct Registry<T> {
    entries: DashMap<u64, Arc<T>>,
    /// Next candidate handle (0 is never issued)
    next: AtomicU64,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Store `target` under a fresh handle
    pub fn add(&self, target: Arc<T>) -> Handle {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            match self.entries.entry(raw) {
                Entry::Vacant(slot) => {
                    slot.insert(target);
                    return Handle(raw);
                }
                // Only reachable after the counter wrapped.
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Resolve a handle; `None` once it has been deleted
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.get(&handle.0).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a handle. Returns false if it was not present.
    pub fn delete(&self, handle: Handle) -> bool {
        self.entries.remove(&handle.0).is_some()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_add_get_delete() {
        let registry = Registry::new();
        let handle = registry.add(Arc::new("stream"));

        assert_eq!(registry.get(handle).as_deref(), Some(&"stream"));
        assert!(registry.delete(handle));
        assert!(registry.get(handle).is_none());

        // Deleting twice is a no-op
        assert!(!registry.delete(handle));
        assert!(registry.get(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zero_is_never_issued() {
        let registry = Registry::new();
        let handle = registry.add(Arc::new(1u8));
        assert_ne!(handle.as_raw(), 0);
        assert!(registry.get(Handle::from_raw(0)).is_none());
    }

    #[test]
    fn test_target_outlives_delete_for_holders() {
        let registry = Registry::new();
        let handle = registry.add(Arc::new(String::from("batch target")));

        let held = registry.get(handle).unwrap();
        registry.delete(handle);

        assert_eq!(held.as_str(), "batch target");
        assert!(registry.get(handle).is_none());
    }

    #[test]
    fn test_concurrent_adds_are_unique() {
        let registry = Arc::new(Registry::new());

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..500)
                        .map(|i| registry.add(Arc::new((worker, i))))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for handle in worker.join().unwrap() {
                assert!(seen.insert(handle), "handle {} issued twice", handle);
            }
        }
        assert_eq!(registry.len(), 4000);
    }

    #[test]
    fn test_concurrent_get_during_delete() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..1000usize).map(|i| registry.add(Arc::new(i))).collect();

        let reader = {
            let registry = Arc::clone(&registry);
            let handles = handles.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    for (i, handle) in handles.iter().enumerate() {
                        if let Some(value) = registry.get(*handle) {
                            assert_eq!(*value, i);
                        }
                    }
                }
            })
        };

        for handle in &handles {
            registry.delete(*handle);
        }
        reader.join().unwrap();

        assert!(handles.iter().all(|h| registry.get(*h).is_none()));
    }
}
