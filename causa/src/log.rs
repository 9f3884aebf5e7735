//! Diagnostics for the profiler runtime.
//!
//! Messages go straight to file descriptor 2 through `libc-print`. Nothing here
//! allocates or touches the `std::io` stderr lock, so these macros are safe to
//! use from interposed pthread wrappers and from the controller thread while
//! application threads hold arbitrary locks.

use core::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enables or disables `info!` output.
pub(crate) fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub(crate) fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Logs a message only when `CAUSA_VERBOSE=1`.
macro_rules! info {
    ($($arg:tt)*) => {
        if $crate::log::verbose() {
            ::libc_print::libc_eprintln!("[causa] {}", format_args!($($arg)*));
        }
    };
}

/// Logs a recoverable problem. Profiling continues.
macro_rules! warning {
    ($($arg:tt)*) => {
        ::libc_print::libc_eprintln!("[causa] warning: {}", format_args!($($arg)*))
    };
}

/// Logs a setup failure and aborts the process.
#[cfg_attr(not(feature = "preload"), allow(unused_macros))]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::libc_print::libc_eprintln!("[causa] fatal: {}", format_args!($($arg)*));
        ::std::process::abort()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_toggles() {
        set_verbose(true);
        assert!(verbose());
        info!("visible at {}", 1);
        set_verbose(false);
        assert!(!verbose());
        info!("hidden");
        warning!("warnings always print: {}", "ok");
    }
}
