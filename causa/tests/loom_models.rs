//! Loom models of the lock-free structures shared with signal handlers.
//!
//! Each model mirrors the production algorithm with loom atomics and a tiny
//! capacity so every interleaving can be explored.
//!
//! Run with: cargo test --test loom_models --release

use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;

/// Key array of the thread table.
struct Table {
    keys: [AtomicU64; 2],
}

impl Table {
    fn new() -> Self {
        Self {
            keys: [AtomicU64::new(EMPTY), AtomicU64::new(EMPTY)],
        }
    }

    fn insert(&self, key: u64) -> Option<usize> {
        let len = self.keys.len();
        let start = (key % len as u64) as usize;
        for i in 0..len {
            let idx = (start + i) % len;
            let mut current = self.keys[idx].load(Ordering::Acquire);
            while current == EMPTY || current == TOMBSTONE {
                match self.keys[idx].compare_exchange(
                    current,
                    key,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(idx),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    fn remove(&self, idx: usize, key: u64) -> bool {
        self.keys[idx]
            .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[test]
fn concurrent_inserts_claim_distinct_slots() {
    loom::model(|| {
        let table = Arc::new(Table::new());
        let other = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.insert(2))
        };
        let mine = table.insert(3);
        let theirs = other.join().unwrap();

        let (mine, theirs) = (mine.unwrap(), theirs.unwrap());
        assert_ne!(mine, theirs);
        assert_eq!(table.keys[mine].load(Ordering::Relaxed), 3);
        assert_eq!(table.keys[theirs].load(Ordering::Relaxed), 2);
    });
}

#[test]
fn released_slot_is_reclaimed_exactly_once() {
    loom::model(|| {
        let table = Arc::new(Table::new());
        let a = table.insert(2).unwrap();
        table.insert(3).unwrap();

        let remover = {
            let table = Arc::clone(&table);
            thread::spawn(move || assert!(table.remove(a, 2)))
        };
        let claimed = table.insert(4);
        remover.join().unwrap();

        // either the insert saw the tombstone, or the table was still full
        match claimed {
            Some(idx) => assert_eq!(idx, a),
            None => assert_eq!(table.keys[a].load(Ordering::Relaxed), TOMBSTONE),
        }
    });
}

/// Single-producer ring with a try-locked consumer side.
struct Ring {
    slots: [AtomicUsize; 2],
    head: AtomicUsize,
    tail: AtomicUsize,
    draining: AtomicBool,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: [AtomicUsize::new(0), AtomicUsize::new(0)],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    fn push(&self, value: usize) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.slots.len() {
            return false;
        }
        self.slots[head % self.slots.len()].store(value, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    fn drain(&self, out: &mut Vec<usize>) {
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let mut read = tail;
        while read != head {
            out.push(self.slots[read % self.slots.len()].load(Ordering::Relaxed));
            read = read.wrapping_add(1);
        }
        self.tail.store(head, Ordering::Release);
        self.draining.store(false, Ordering::Release);
    }
}

#[test]
fn ring_never_loses_or_duplicates_accepted_samples() {
    loom::model(|| {
        let ring = Arc::new(Ring::new());
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || (1..=3).filter(|&v| ring.push(v)).collect::<Vec<_>>())
        };

        let mut seen = Vec::new();
        ring.drain(&mut seen);
        let accepted = producer.join().unwrap();
        ring.drain(&mut seen);

        assert_eq!(seen, accepted);
    });
}
