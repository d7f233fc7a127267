//! A cache of loaded objects keyed by file name, based on LRU eviction.
//!
//! Each entry is in one of three states:
//!
//! - `Loading`: one thread is reading the object from disk. Other threads
//!   asking for the same name wait for it instead of reading the file again.
//! - `Resident`: loaded and unpinned. Resident entries are ordered by last
//!   use, and the least recently used are evicted beyond the capacity.
//! - `Pinned`: loaded and held by at least one owner. Pinned entries are
//!   never evicted and do not count against the capacity; releasing the last
//!   pin makes the entry resident again.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::{Condvar, Mutex, MutexGuard};

use metrics::counter;
use tracing::trace;

use crate::metrics::{NODE_CACHE_HIT, NODE_CACHE_LOAD_FAILED, NODE_CACHE_MISS};

enum Slot<V> {
    Loading,
    Resident {
        value: V,
        /// Serial number for LRU purposes.
        serial: u64,
    },
    Pinned {
        value: V,
        refs: usize,
    },
}

struct CacheInner<V> {
    slots: HashMap<String, Slot<V>>,

    /// Map from LRU serial number to name, for resident entries only. The
    /// element with the smallest serial number was least recently used.
    lru: BTreeMap<u64, String>,

    /// Serial number to use the next time we touch an entry.
    next_serial: u64,

    /// Maximum number of resident entries.
    capacity: usize,
}

impl<V: Clone> CacheInner<V> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            lru: BTreeMap::new(),
            next_serial: 0,
            capacity,
        }
    }

    #[allow(dead_code)]
    fn check_invariants(&self) {
        let mut resident = 0;
        for (name, slot) in self.slots.iter() {
            match slot {
                Slot::Resident { serial, .. } => {
                    assert_eq!(self.lru.get(serial), Some(name));
                    resident += 1;
                }
                Slot::Pinned { refs, .. } => assert!(*refs > 0),
                Slot::Loading => (),
            }
        }
        assert_eq!(resident, self.lru.len());
        assert!(self.lru.len() <= self.capacity);
    }

    fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants()
    }

    fn take_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Returns the loaded value for `name`, marking it used and optionally
    /// pinning it. Returns `None` if it is absent or still loading.
    fn get(&mut self, name: &str, pin: bool) -> Option<V> {
        let slot = self.slots.get_mut(name)?;
        match slot {
            Slot::Loading => None,
            Slot::Pinned { value, refs } => {
                if pin {
                    *refs += 1;
                }
                Some(value.clone())
            }
            Slot::Resident { value, serial } => {
                let value = value.clone();
                self.lru.remove(&*serial);
                if pin {
                    *slot = Slot::Pinned {
                        value: value.clone(),
                        refs: 1,
                    };
                } else {
                    *serial = self.next_serial;
                    self.next_serial += 1;
                    self.lru.insert(*serial, name.to_string());
                }
                Some(value)
            }
        }
    }

    /// Stores a freshly loaded value, returning whatever had to be evicted.
    fn publish(&mut self, name: &str, value: V, pin: bool) -> Vec<V> {
        if pin {
            self.slots
                .insert(name.to_string(), Slot::Pinned { value, refs: 1 });
            self.debug_check_invariants();
            Vec::new()
        } else {
            self.make_resident(name, value)
        }
    }

    fn make_resident(&mut self, name: &str, value: V) -> Vec<V> {
        let serial = self.take_serial();
        self.slots
            .insert(name.to_string(), Slot::Resident { value, serial });
        self.lru.insert(serial, name.to_string());
        self.evict()
    }

    fn evict(&mut self) -> Vec<V> {
        let mut evicted = Vec::new();
        while self.lru.len() > self.capacity {
            let Some((_serial, name)) = self.lru.pop_first() else {
                break;
            };
            if let Some(Slot::Resident { value, .. }) = self.slots.remove(&name) {
                trace!("evicted {name}");
                evicted.push(value);
            }
        }
        self.debug_check_invariants();
        evicted
    }
}

/// Clears a `Loading` slot if its loader panics.
struct LoadGuard<'a, V: Clone> {
    cache: &'a NodeCache<V>,
    name: &'a str,
    armed: bool,
}

impl<V: Clone> Drop for LoadGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.cache.lock();
            if matches!(inner.slots.get(self.name), Some(Slot::Loading)) {
                inner.slots.remove(self.name);
            }
            self.cache.loaded.notify_all();
        }
    }
}

/// A cache of values of type `V` keyed by file name.
pub struct NodeCache<V> {
    /// Label for metrics and logs.
    label: &'static str,
    inner: Mutex<CacheInner<V>>,
    /// Signalled whenever a load finishes, successfully or not.
    loaded: Condvar,
}

impl<V> Debug for NodeCache<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("label", &self.label)
            .finish()
    }
}

impl<V: Clone> NodeCache<V> {
    /// Creates a cache that keeps up to `capacity` unpinned entries.
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            inner: Mutex::new(CacheInner::new(capacity)),
            loaded: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap()
    }

    /// Returns the value for `name`, calling `loader` to build it if it is
    /// not cached. Concurrent callers for the same name share one call of
    /// `loader`. If that call fails, its caller gets the error and each
    /// waiter retries on its own.
    pub fn get_or_load<E>(
        &self,
        name: &str,
        loader: impl FnOnce(&str) -> Result<V, E>,
    ) -> Result<V, E> {
        self.load(name, false, loader)
    }

    /// Like [NodeCache::get_or_load], and also pins the entry, as
    /// [NodeCache::acquire_ref] would, in the same step.
    pub fn acquire<E>(
        &self,
        name: &str,
        loader: impl FnOnce(&str) -> Result<V, E>,
    ) -> Result<V, E> {
        self.load(name, true, loader)
    }

    fn load<E>(
        &self,
        name: &str,
        pin: bool,
        loader: impl FnOnce(&str) -> Result<V, E>,
    ) -> Result<V, E> {
        let mut inner = self.lock();
        loop {
            let loading = match inner.slots.get(name) {
                Some(Slot::Loading) => true,
                Some(_) => false,
                None => break,
            };
            if loading {
                inner = self.loaded.wait(inner).unwrap();
            } else if let Some(value) = inner.get(name, pin) {
                counter!(NODE_CACHE_HIT, "cache" => self.label).increment(1);
                return Ok(value);
            }
        }
        counter!(NODE_CACHE_MISS, "cache" => self.label).increment(1);
        inner.slots.insert(name.to_string(), Slot::Loading);
        drop(inner);

        let mut guard = LoadGuard {
            cache: self,
            name,
            armed: true,
        };
        trace!("{}: loading {name}", self.label);
        let result = loader(name);
        guard.armed = false;

        let mut inner = self.lock();
        match result {
            Ok(value) => {
                if matches!(inner.slots.get(name), Some(Slot::Loading)) {
                    let evicted = inner.publish(name, value.clone(), pin);
                    self.loaded.notify_all();
                    drop(inner);
                    drop(evicted);
                    Ok(value)
                } else {
                    // Registered by someone else while we were loading; theirs
                    // is the live copy.
                    let existing = inner.get(name, pin).unwrap_or(value);
                    self.loaded.notify_all();
                    Ok(existing)
                }
            }
            Err(error) => {
                counter!(NODE_CACHE_LOAD_FAILED, "cache" => self.label).increment(1);
                if matches!(inner.slots.get(name), Some(Slot::Loading)) {
                    inner.slots.remove(name);
                }
                self.loaded.notify_all();
                Err(error)
            }
        }
    }

    /// Pins the loaded entry for `name`. Returns false if there is no such
    /// entry.
    pub fn acquire_ref(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let found = inner.get(name, true).is_some();
        inner.debug_check_invariants();
        found
    }

    /// Releases one pin on `name`. The last release makes the entry eligible
    /// for eviction. Returns false if the entry is gone, which happens when
    /// it was removed while pinned.
    pub fn release_ref(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let unpinned = match inner.slots.get_mut(name) {
            Some(Slot::Pinned { refs, value }) => {
                *refs -= 1;
                if *refs > 0 {
                    return true;
                }
                value.clone()
            }
            Some(Slot::Resident { .. }) => {
                debug_assert!(false, "{}: release of unpinned {name}", self.label);
                return true;
            }
            Some(Slot::Loading) | None => return false,
        };
        let evicted = inner.make_resident(name, unpinned);
        drop(inner);
        drop(evicted);
        true
    }

    /// Inserts `value` for `name`, pinned once, replacing any entry.
    pub fn register(&self, name: &str, value: V) {
        let mut inner = self.lock();
        if let Some(Slot::Resident { serial, .. }) = inner.slots.get(name) {
            let serial = *serial;
            inner.lru.remove(&serial);
        }
        let old = inner
            .slots
            .insert(name.to_string(), Slot::Pinned { value, refs: 1 });
        inner.debug_check_invariants();
        drop(inner);
        drop(old);
    }

    /// Drops the entry for `name`, pinned or not, and returns its value. An
    /// entry that is still loading is left alone.
    pub fn remove(&self, name: &str) -> Option<V> {
        let mut inner = self.lock();
        let value = match inner.slots.remove(name)? {
            Slot::Loading => {
                inner.slots.insert(name.to_string(), Slot::Loading);
                return None;
            }
            Slot::Resident { value, serial } => {
                inner.lru.remove(&serial);
                value
            }
            Slot::Pinned { value, .. } => value,
        };
        inner.debug_check_invariants();
        Some(value)
    }

    /// Returns the value for `name` if it is loaded, without marking it used.
    pub fn peek(&self, name: &str) -> Option<V> {
        match self.lock().slots.get(name)? {
            Slot::Resident { value, .. } | Slot::Pinned { value, .. } => Some(value.clone()),
            Slot::Loading => None,
        }
    }

    /// Number of pins on `name`.
    pub fn refs(&self, name: &str) -> usize {
        match self.lock().slots.get(name) {
            Some(Slot::Pinned { refs, .. }) => *refs,
            _ => 0,
        }
    }

    /// Number of loaded entries, pinned or not.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| !matches!(slot, Slot::Loading))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of unpinned entries.
    pub fn resident_len(&self) -> usize {
        self.lock().lru.len()
    }

    /// Drops every loaded entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let slots = std::mem::take(&mut inner.slots);
        inner.lru.clear();
        drop(inner);
        drop(slots);
    }
}
