//! Concurrent keyed storage.
//!
//! The connection manager and the router keep their tables behind the
//! [`Store`] trait so the backing map can be swapped without touching
//! either. [`DashStore`] is the default sharded implementation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A concurrent map keyed by `i32`.
pub trait Store<V>: Send + Sync {
    /// Clone out the value for `key`.
    fn get(&self, key: i32) -> Option<V>;

    /// Insert or overwrite, returning the previous value.
    fn set(&self, key: i32, value: V) -> Option<V>;

    /// Insert only if `key` is vacant. Returns `false` when occupied.
    fn try_insert(&self, key: i32, value: V) -> bool;

    /// Remove `key`, returning the removed value.
    fn del(&self, key: i32) -> Option<V>;

    fn exists(&self, key: i32) -> bool;

    /// Visit entries until `f` returns `false`.
    ///
    /// `f` must not mutate the store it is iterating.
    fn range(&self, f: &mut dyn FnMut(i32, &V) -> bool);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`Store`] backed by a sharded `DashMap`.
pub struct DashStore<V> {
    map: DashMap<i32, V>,
}

impl<V> DashStore<V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<V> Default for DashStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Store<V> for DashStore<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: i32) -> Option<V> {
        self.map.get(&key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: i32, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    fn try_insert(&self, key: i32, value: V) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    fn del(&self, key: i32) -> Option<V> {
        self.map.remove(&key).map(|(_, value)| value)
    }

    fn exists(&self, key: i32) -> bool {
        self.map.contains_key(&key)
    }

    fn range(&self, f: &mut dyn FnMut(i32, &V) -> bool) {
        for entry in self.map.iter() {
            if !f(*entry.key(), entry.value()) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
