//! Per-thread profiler state.
//!
//! Each profiled thread owns one [`ThreadState`] slot in the thread table. The
//! slot is reused after the thread exits, so every field is atomic or behind a
//! lock that the signal handler never takes.

use crate::sampler::{SampleRing, Sampler};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Delay bookkeeping, sample buffer and sampler handle for one thread.
#[derive(Default)]
pub struct ThreadState {
    /// Set while the thread runs profiler code; samples arriving then are dropped.
    in_use: AtomicBool,
    /// Delay this thread has paid or been charged, in nanoseconds.
    pub(crate) local_delay: AtomicU64,
    /// Global delay observed just before a blocking call.
    pub(crate) pre_block_delay: AtomicU64,
    /// Signals handled since the thread began sampling.
    pub(crate) signals: AtomicU32,
    pub(crate) ring: SampleRing,
    stack_low: AtomicUsize,
    stack_high: AtomicUsize,
    pub(crate) sampler: spin::Mutex<Option<Box<dyn Sampler>>>,
}

impl ThreadState {
    /// Prepares a (possibly reused) slot for a newly registered thread.
    pub(crate) fn reset(&self, initial_delay: u64, stack: (usize, usize)) {
        self.local_delay.store(initial_delay, Ordering::Relaxed);
        self.pre_block_delay.store(0, Ordering::Relaxed);
        self.signals.store(0, Ordering::Relaxed);
        self.stack_low.store(stack.0, Ordering::Relaxed);
        self.stack_high.store(stack.1, Ordering::Relaxed);
        self.ring.clear();
        self.in_use.store(false, Ordering::Release);
    }

    /// Marks the thread as inside profiler code until the guard drops.
    /// Returns `None` if it already is.
    pub(crate) fn try_enter(&self) -> Option<InUse<'_>> {
        self.in_use
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| InUse { flag: &self.in_use })
    }

    #[must_use]
    pub fn local_delay(&self) -> u64 {
        self.local_delay.load(Ordering::Relaxed)
    }

    pub(crate) fn stack_bounds(&self) -> (usize, usize) {
        (
            self.stack_low.load(Ordering::Relaxed),
            self.stack_high.load(Ordering::Relaxed),
        )
    }
}

/// Clears the re-entry flag on drop.
pub(crate) struct InUse<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
