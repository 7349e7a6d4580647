//! Key-partitioned state stores.
//!
//! Sessions and rate-limit windows live behind [`KeyedStore`] so production
//! wiring can pick the in-process [`MemoryStore`] or an external cache while
//! the component contracts stay the same. Locking is at the map level; entry
//! mutation through [`KeyedStore::modify`] is atomic per key.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

pub trait KeyedStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    /// Remove a key, returns true if it existed.
    fn delete(&self, key: &str) -> bool;

    /// Atomically read-modify-write one key.
    ///
    /// The closure sees `None` for an absent key; leaving `None` in the slot
    /// deletes the entry.
    fn modify(&self, key: &str, f: &mut dyn FnMut(&mut Option<V>));

    /// Drop every entry for which `keep` returns false. Returns the number removed.
    fn sweep(&self, keep: &dyn Fn(&V) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store backed by a sharded concurrent map.
#[derive(Debug)]
pub struct MemoryStore<V> {
    map: DashMap<String, V>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeyedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: V) {
        self.map.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    fn modify(&self, key: &str, f: &mut dyn FnMut(&mut Option<V>)) {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                f(&mut slot);
                match slot {
                    Some(value) => *occupied.get_mut() = value,
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                f(&mut slot);
                if let Some(value) = slot {
                    vacant.insert(value);
                }
            }
        }
    }

    fn sweep(&self, keep: &dyn Fn(&V) -> bool) -> usize {
        let mut removed = 0;
        self.map.retain(|_, value| {
            let retained = keep(value);
            if !retained {
                removed += 1;
            }
            retained
        });
        removed
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
