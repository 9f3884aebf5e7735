//! C-compatible API for progress points.
//!
//! # Usage from C
//!
//! ```c
//! extern void causa_progress(const char *name);
//!
//! void process_request(void) {
//!     // ... do work ...
//!     causa_progress("request_done");
//! }
//! ```
//!
//! Hot call sites should fetch the counter once and bump it directly:
//!
//! ```c
//! static uint64_t *done;
//! if (!done) done = causa_get_counter(CAUSA_THROUGHPUT, "request_done");
//! if (done) __atomic_add_fetch(done, 1, __ATOMIC_RELAXED);
//! ```
//!
//! Every function is thread-safe and does nothing before the profiler starts.

use libc::{c_char, c_int};
use std::ffi::CStr;
use std::sync::atomic::AtomicU64;

/// `kind` for a throughput point counter.
pub const CAUSA_THROUGHPUT: c_int = 1;
/// `kind` for a latency point's arrival counter.
pub const CAUSA_BEGIN: c_int = 2;
/// `kind` for a latency point's departure counter.
pub const CAUSA_END: c_int = 3;

/// Borrows a C string as UTF-8, rejecting null pointers and invalid text.
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string.
unsafe fn name_from_c<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    // SAFETY: the caller guarantees a null-terminated string.
    unsafe { CStr::from_ptr(name) }.to_str().ok()
}

fn counter(kind: c_int, name: &str) -> Option<*const AtomicU64> {
    let points = crate::instance()?.progress();
    match kind {
        CAUSA_THROUGHPUT => points.throughput(name).map(|p| p.cell().as_ptr()),
        CAUSA_BEGIN => points.latency(name).map(|p| p.begin_cell().as_ptr()),
        CAUSA_END => points.latency(name).map(|p| p.end_cell().as_ptr()),
        _ => None,
    }
}

/// Returns the 64-bit counter behind a progress point, creating the point if
/// needed. The pointer stays valid for the life of the process.
///
/// Returns null for an unknown `kind`, an invalid name, a full registry, or
/// when the profiler is not running.
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn causa_get_counter(kind: c_int, name: *const c_char) -> *const AtomicU64 {
    // SAFETY: forwarded from the caller.
    let Some(name) = (unsafe { name_from_c(name) }) else {
        return std::ptr::null();
    };
    counter(kind, name).unwrap_or(std::ptr::null())
}

fn visit(kind: c_int, name: *const c_char) {
    // SAFETY: the extern wrappers pass their caller's pointer through.
    let Some(name) = (unsafe { name_from_c(name) }) else {
        return;
    };
    let Some(points) = crate::instance().map(|p| p.progress()) else {
        return;
    };
    match kind {
        CAUSA_THROUGHPUT => {
            if let Some(point) = points.throughput(name) {
                point.visit(1);
            }
        }
        CAUSA_BEGIN => {
            if let Some(point) = points.latency(name) {
                point.visit_begin(1);
            }
        }
        _ => {
            if let Some(point) = points.latency(name) {
                point.visit_end(1);
            }
        }
    }
}

/// Records one visit to a throughput point.
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn causa_progress(name: *const c_char) {
    visit(CAUSA_THROUGHPUT, name);
}

/// Records an arrival at a latency point.
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn causa_begin(name: *const c_char) {
    visit(CAUSA_BEGIN, name);
}

/// Records a departure from a latency point.
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn causa_end(name: *const c_char) {
    visit(CAUSA_END, name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_invalid_names_are_rejected() {
        assert!(unsafe { name_from_c(std::ptr::null()) }.is_none());
        let bad = [0xffu8 as c_char, 0];
        assert!(unsafe { name_from_c(bad.as_ptr()) }.is_none());
        let good = c"requests";
        assert_eq!(unsafe { name_from_c(good.as_ptr()) }, Some("requests"));
    }

    #[test]
    fn null_name_gives_null_counter() {
        let ptr = unsafe { causa_get_counter(CAUSA_THROUGHPUT, std::ptr::null()) };
        assert!(ptr.is_null());
        unsafe {
            causa_progress(std::ptr::null());
            causa_begin(std::ptr::null());
            causa_end(std::ptr::null());
        }
    }

    #[test]
    fn unknown_kind_gives_null_counter() {
        let ptr = unsafe { causa_get_counter(42, c"x".as_ptr()) };
        assert!(ptr.is_null());
    }
}
