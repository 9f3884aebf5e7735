//! Fixed-capacity open-addressed map from kernel thread id to per-thread state.
//!
//! Every slot pairs an atomic key with a value that is allocated up front and
//! reused. Slots are claimed and released by compare-and-swap on the key, so
//! lookups from the signal handler never lock or allocate.

use std::sync::atomic::{AtomicU64, Ordering};

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;

struct Slot<V> {
    key: AtomicU64,
    value: V,
}

/// Open-addressed table with linear probing and no resizing.
///
/// Keys must be nonzero and not `u64::MAX`; kernel thread ids always are.
/// A removed slot becomes a tombstone so probe chains stay intact, and can be
/// claimed again by a later insert.
pub struct ThreadTable<V> {
    slots: Box<[Slot<V>]>,
}

impl<V: Default> ThreadTable<V> {
    /// Creates a table with `capacity` slots, each holding `V::default()`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                value: V::default(),
            })
            .collect();
        Self { slots }
    }
}

impl<V> ThreadTable<V> {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn probe(&self, key: u64) -> impl Iterator<Item = &Slot<V>> {
        let start = (key % self.slots.len() as u64) as usize;
        self.slots[start..].iter().chain(self.slots[..start].iter())
    }

    /// Claims a slot for `key` and returns its value, or returns the value
    /// already registered under `key`. Returns `None` when the table is full.
    ///
    /// Callers must not insert the same key from two threads at once; in
    /// practice each thread only inserts its own id.
    pub fn insert(&self, key: u64) -> Option<&V> {
        debug_assert!(key != EMPTY && key != TOMBSTONE);
        if let Some(existing) = self.find(key) {
            return Some(existing);
        }

        for slot in self.probe(key) {
            let mut current = slot.key.load(Ordering::Acquire);
            while current == EMPTY || current == TOMBSTONE {
                match slot
                    .key
                    .compare_exchange(current, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return Some(&slot.value),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Value registered under `key`.
    pub fn find(&self, key: u64) -> Option<&V> {
        for slot in self.probe(key) {
            match slot.key.load(Ordering::Acquire) {
                EMPTY => return None,
                k if k == key => return Some(&slot.value),
                _ => {}
            }
        }
        None
    }

    /// Releases the slot held by `key`. Returns false if it was not present.
    pub fn remove(&self, key: u64) -> bool {
        for slot in self.probe(key) {
            match slot.key.load(Ordering::Acquire) {
                EMPTY => return false,
                k if k == key => {
                    return slot
                        .key
                        .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                _ => {}
            }
        }
        false
    }

    /// Live entries.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.slots.iter().filter_map(|slot| {
            let key = slot.key.load(Ordering::Acquire);
            (key != EMPTY && key != TOMBSTONE).then_some((key, &slot.value))
        })
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
