//! Profiled thread spawning.
//!
//! [`spawn`] mirrors `std::thread::spawn`, but the child starts with its
//! parent's local delay, samples while it runs, and reconciles its delay one
//! last time before exiting. Joining through the returned handle credits the
//! time spent waiting.

use crate::sync::{self, SyncOp};
use std::cell::Cell;
use std::io;

thread_local! {
    static UNPROFILED_SPAWN: Cell<bool> = const { Cell::new(false) };
}

/// True while the calling thread is creating a thread that must not be
/// registered by the `pthread_create` interposer.
#[cfg_attr(not(feature = "preload"), allow(dead_code))]
pub(crate) fn spawning_unprofiled() -> bool {
    UNPROFILED_SPAWN.with(Cell::get)
}

fn without_registration<T>(f: impl FnOnce() -> T) -> T {
    UNPROFILED_SPAWN.with(|flag| flag.set(true));
    let result = f();
    UNPROFILED_SPAWN.with(|flag| flag.set(false));
    result
}

/// Spawns a named thread that is never sampled or delayed.
pub(crate) fn spawn_unprofiled<F>(name: &str, f: F) -> io::Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let builder = std::thread::Builder::new().name(name.to_string());
    without_registration(|| builder.spawn(f))
}

/// Owned permission to join a thread started by [`spawn`].
#[derive(Debug)]
pub struct JoinHandle<T> {
    inner: std::thread::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Waits for the thread to finish.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the thread panicked.
    pub fn join(self) -> std::thread::Result<T> {
        let inner = self.inner;
        if cfg!(feature = "preload") {
            // pthread_join is already interposed
            inner.join()
        } else {
            sync::intercept(SyncOp::Join, move || inner.join(), |_| true)
        }
    }

    #[must_use]
    pub fn thread(&self) -> &std::thread::Thread {
        self.inner.thread()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

struct Registration;

impl Registration {
    fn begin(inherited: Option<u64>) -> Self {
        if let Some(profiler) = crate::instance() {
            profiler.begin_sampling(inherited);
        }
        Self
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(profiler) = crate::instance() {
            profiler.end_sampling();
        }
    }
}

/// Spawns a profiled thread.
///
/// # Panics
///
/// Panics if the OS fails to create the thread, like `std::thread::spawn`.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let inherited = crate::instance().and_then(|p| p.current_local_delay());
    let inner = without_registration(|| {
        std::thread::spawn(move || {
            let _registration = Registration::begin(inherited);
            f()
        })
    });
    JoinHandle { inner }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_join_return_the_value() {
        let handle = spawn(|| 6 * 7);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn unprofiled_flag_is_scoped() {
        assert!(!spawning_unprofiled());
        without_registration(|| assert!(spawning_unprofiled()));
        assert!(!spawning_unprofiled());
    }

    #[test]
    fn panics_propagate_through_join() {
        let handle = spawn(|| panic!("boom"));
        assert!(handle.join().is_err());
    }
}
