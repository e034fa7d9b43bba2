//! Reference-counted registry of shared objects
//!
//! Objects are created on first acquisition of their key and closed when the
//! last lease is released. Creation and closing both happen under the
//! registry lock, so a concurrent acquirer either reuses the live object or
//! waits and creates a fresh one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Object that can be shared through a [`Registry`]
pub trait Shared: Send + Sync {
    /// Release all resources; called once when the last lease drops
    fn close(&self);
}

struct Entry<V> {
    value: Arc<V>,
    refs: usize,
}

/// Keyed registry handing out [`Lease`]s
pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Registry {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Lease the object for `key`, creating it with `create` if absent
    pub fn acquire<E, F>(self: &Arc<Self>, key: K, create: F) -> Result<Lease<K, V>, E>
    where
        F: FnOnce(&K) -> Result<Arc<V>, E>,
    {
        let mut entries = self.entries.lock();
        let value = match entries.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                entry.value.clone()
            }
            None => {
                let value = create(&key)?;
                debug!("Registered {}", key);
                entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        refs: 1,
                    },
                );
                value
            }
        };

        Ok(Lease {
            registry: self.clone(),
            key,
            value,
        })
    }

    /// Live object for `key`, without taking a lease
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    pub fn ref_count(&self, key: &K) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    fn retain(&self, key: &K) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.refs += 1;
        }
    }

    fn release(&self, key: &K) {
        let mut entries = self.entries.lock();
        let last = match entries.get_mut(key) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => return,
        };
        if last {
            if let Some(entry) = entries.remove(key) {
                entry.value.close();
                debug!("Unregistered {}", key);
            }
        }
    }
}

/// Counted handle on a registry object; dropping it releases the reference
pub struct Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    registry: Arc<Registry<K, V>>,
    key: K,
    value: Arc<V>,
}

impl<K, V> Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    /// Release explicitly; same as dropping
    pub fn release(self) {}
}

impl<K, V> Deref for Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V> Clone for Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    fn clone(&self) -> Self {
        self.registry.retain(&self.key);
        Lease {
            registry: self.registry.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

impl<K, V> Drop for Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl<K, V> fmt::Debug for Lease<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
    V: Shared,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease({})", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Tracked {
        closed: AtomicUsize,
    }

    impl Shared for Tracked {
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create(_: &String) -> Result<Arc<Tracked>, ()> {
        Ok(Arc::new(Tracked::default()))
    }

    #[test]
    fn test_shared_until_last_release() {
        let registry: Arc<Registry<String, Tracked>> = Registry::new();
        let key = "relay".to_string();

        let a = registry.acquire(key.clone(), create).unwrap();
        let b = registry.acquire(key.clone(), create).unwrap();
        assert!(Arc::ptr_eq(a.value(), b.value()));
        assert_eq!(registry.ref_count(&key), 2);

        let tracked = a.value().clone();
        drop(a);
        assert_eq!(tracked.closed.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);

        b.release();
        assert_eq!(tracked.closed.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(registry.get(&key).is_none());
    }

    #[test]
    fn test_reacquire_after_close_creates_fresh() {
        let registry: Arc<Registry<String, Tracked>> = Registry::new();
        let first = registry.acquire("k".to_string(), create).unwrap();
        let old = first.value().clone();
        drop(first);

        let second = registry.acquire("k".to_string(), create).unwrap();
        assert!(!Arc::ptr_eq(&old, second.value()));
        assert_eq!(second.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clone_counts() {
        let registry: Arc<Registry<String, Tracked>> = Registry::new();
        let lease = registry.acquire("k".to_string(), create).unwrap();
        let copy = lease.clone();
        assert_eq!(registry.ref_count(&"k".to_string()), 2);
        drop(lease);
        assert_eq!(copy.closed.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_create_failure_registers_nothing() {
        let registry: Arc<Registry<String, Tracked>> = Registry::new();
        let result = registry.acquire("k".to_string(), |_| Err::<Arc<Tracked>, _>("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_acquire_shares_one() {
        let registry: Arc<Registry<String, Tracked>> = Registry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let anchor = registry.acquire("k".to_string(), create).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let created = created.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let lease = registry
                            .acquire("k".to_string(), |_| {
                                created.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, ()>(Arc::new(Tracked::default()))
                            })
                            .unwrap();
                        drop(lease);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(registry.ref_count(&"k".to_string()), 1);
        assert_eq!(anchor.closed.load(Ordering::SeqCst), 0);
    }
}
