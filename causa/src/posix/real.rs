//! Lazy resolution of the real libc functions behind our interposers.
//!
//! Lock-free and safe to use from a signal handler once resolved. A lookup
//! that re-enters itself (because `dlsym` called something we interpose)
//! gets `None` instead of recursing.

use core::ffi::c_void;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Marks a lookup in progress. Never a valid function address.
const RESOLVING: *mut c_void = ptr::without_provenance_mut(1);

/// A function pointer of type `F` looked up with `dlsym(RTLD_NEXT)` on first
/// use. Intended for `static` items.
pub(super) struct RealFn<F> {
    ptr: AtomicPtr<c_void>,
    _marker: PhantomData<F>,
}

// SAFETY: only an AtomicPtr is shared; function addresses are valid on any thread.
unsafe impl<F> Sync for RealFn<F> {}

impl<F: Copy> RealFn<F> {
    pub(super) const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// The next definition of `symbol` after this library, or `None` if
    /// there is none or the lookup is already underway.
    ///
    /// # Safety
    ///
    /// `symbol` must be null-terminated and `F` must be a function pointer
    /// type matching the symbol's real signature.
    #[inline]
    pub(super) unsafe fn get(&self, symbol: &[u8]) -> Option<F> {
        debug_assert_eq!(symbol.last(), Some(&0));
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
        let current = self.ptr.load(Ordering::Acquire);
        if current == RESOLVING {
            None
        } else if current.is_null() {
            unsafe { self.resolve(symbol) }
        } else {
            // SAFETY: F is a pointer-sized function pointer per the contract.
            Some(unsafe { mem::transmute_copy(&current) })
        }
    }

    #[cold]
    unsafe fn resolve(&self, symbol: &[u8]) -> Option<F> {
        if let Err(current) =
            self.ptr
                .compare_exchange(ptr::null_mut(), RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        {
            return if current == RESOLVING {
                None
            } else {
                // SAFETY: as in get.
                Some(unsafe { mem::transmute_copy(&current) })
            };
        }

        // SAFETY: symbol is null-terminated per the contract.
        let real = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr().cast()) };
        self.ptr.store(real, Ordering::Release);
        if real.is_null() {
            None
        } else {
            // SAFETY: as in get.
            Some(unsafe { mem::transmute_copy(&real) })
        }
    }
}
