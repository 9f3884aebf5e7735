//! Clocks, per-thread interval timers and measured sleeps.
//!
//! All profiler time is `u64` nanoseconds on `CLOCK_MONOTONIC`. Every function
//! here is async-signal-safe: catch-up waits run inside the `SIGPROF` handler.

use libc::{c_int, clockid_t, itimerspec, pid_t, sigevent, sigval, timer_t, timespec, SIGEV_THREAD_ID};
use std::mem::MaybeUninit;
use std::ptr;
use std::time::Duration;
use thiserror::Error;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Errors from creating or arming an interval timer.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("failed to create timer: {0}")]
    Create(#[source] std::io::Error),
    #[error("failed to set timer: {0}")]
    SetTime(#[source] std::io::Error),
}

/// A periodic timer whose expirations are delivered as a signal to one thread.
///
/// Uses `timer_create` with `SIGEV_THREAD_ID`. The timer is deleted on drop.
pub(crate) struct Interval {
    timer_id: timer_t,
}

// SAFETY: timer_t is an opaque kernel handle; timer_settime and timer_delete
// may be called from any thread.
unsafe impl Send for Interval {}

impl Interval {
    /// Creates a disarmed timer on `clock` that signals `thread_id` with `signal`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses to create the timer.
    pub(crate) fn new(clock: clockid_t, thread_id: pid_t, signal: c_int) -> Result<Self, TimerError> {
        // SAFETY: sigevent is plain data; zero is a valid initial state.
        let mut sev: sigevent = unsafe { MaybeUninit::zeroed().assume_init() };
        sev.sigev_notify = SIGEV_THREAD_ID;
        sev.sigev_signo = signal;
        sev.sigev_value = sigval {
            sival_ptr: ptr::null_mut(),
        };
        sev.sigev_notify_thread_id = thread_id;

        let mut timer_id: timer_t = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        let result = unsafe { libc::timer_create(clock, &raw mut sev, &raw mut timer_id) };
        if result == -1 {
            return Err(TimerError::Create(std::io::Error::last_os_error()));
        }

        Ok(Self { timer_id })
    }

    /// Arms the timer to fire every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if `timer_settime` fails.
    pub(crate) fn start(&self, interval: Duration) -> Result<(), TimerError> {
        let ts = duration_to_timespec(interval);
        self.set(itimerspec {
            it_interval: ts,
            it_value: ts,
        })
    }

    /// Disarms the timer.
    ///
    /// # Errors
    ///
    /// Returns an error if `timer_settime` fails.
    pub(crate) fn stop(&self) -> Result<(), TimerError> {
        let zero = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        self.set(itimerspec {
            it_interval: zero,
            it_value: zero,
        })
    }

    fn set(&self, its: itimerspec) -> Result<(), TimerError> {
        // SAFETY: timer_id came from a successful timer_create.
        let result = unsafe { libc::timer_settime(self.timer_id, 0, &raw const its, ptr::null_mut()) };
        if result == -1 {
            return Err(TimerError::SetTime(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        // SAFETY: timer_id came from a successful timer_create and is deleted once.
        unsafe {
            libc::timer_delete(self.timer_id);
        }
    }
}

fn duration_to_timespec(duration: Duration) -> timespec {
    timespec {
        tv_sec: duration.as_secs().cast_signed(),
        tv_nsec: i64::from(duration.subsec_nanos()),
    }
}

fn nanos_to_timespec(nanos: u64) -> timespec {
    duration_to_timespec(Duration::from_nanos(nanos))
}

/// Current `CLOCK_MONOTONIC` time in nanoseconds.
#[must_use]
pub fn now() -> u64 {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into a valid timespec.
    let result = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
    if result != 0 {
        return 0;
    }

    #[allow(clippy::cast_sign_loss)]
    let nanos = (ts.tv_sec as u64)
        .saturating_mul(NANOS_PER_SEC)
        .saturating_add(ts.tv_nsec as u64);
    nanos
}

/// Sleeps for `nanos`, restarting with the remaining time when a signal
/// interrupts the sleep.
pub(crate) fn nanosleep(nanos: u64) {
    let mut request = nanos_to_timespec(nanos);
    let mut remaining = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    loop {
        // SAFETY: both pointers are valid timespecs.
        let result = unsafe { libc::nanosleep(&raw const request, &raw mut remaining) };
        if result == 0 {
            return;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
        request = remaining;
    }
}

/// Sleeps for at least `nanos` and returns the time that actually elapsed.
pub fn wait(nanos: u64) -> u64 {
    if nanos == 0 {
        return 0;
    }
    let start = now();
    nanosleep(nanos);
    now().saturating_sub(start)
}
