//! pthread interposers.
//!
//! Each wrapper forwards to the next definition of the symbol and applies the
//! delay hooks of its [`SyncOp`]. Thread creation additionally carries the
//! parent's local delay into the child and profiles the child for its
//! lifetime.

use super::real::RealFn;
use crate::sync::{self, SyncOp};
use libc::{
    c_int, c_void, pthread_attr_t, pthread_barrier_t, pthread_cond_t, pthread_mutex_t,
    pthread_rwlock_t, pthread_t, timespec,
};

/// Defines an interposer returning a pthread status code, where zero means
/// success.
macro_rules! interpose {
    ($($op:ident fn $name:ident($($arg:ident: $ty:ty),*);)*) => {$(
        /// # Safety
        ///
        /// Same contract as the libc function of the same name.
        #[no_mangle]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> c_int {
            static REAL: RealFn<unsafe extern "C" fn($($ty),*) -> c_int> = RealFn::new();
            let Some(real) = (unsafe { REAL.get(concat!(stringify!($name), "\0").as_bytes()) })
            else {
                return libc::ENOSYS;
            };
            sync::intercept(SyncOp::$op, || unsafe { real($($arg),*) }, |&rc| rc == 0)
        }
    )*};
}

interpose! {
    Lock fn pthread_mutex_lock(mutex: *mut pthread_mutex_t);
    TryLock fn pthread_mutex_trylock(mutex: *mut pthread_mutex_t);
    Unlock fn pthread_mutex_unlock(mutex: *mut pthread_mutex_t);

    Wait fn pthread_cond_wait(cond: *mut pthread_cond_t, mutex: *mut pthread_mutex_t);
    TimedWait fn pthread_cond_timedwait(
        cond: *mut pthread_cond_t,
        mutex: *mut pthread_mutex_t,
        abstime: *const timespec
    );
    Signal fn pthread_cond_signal(cond: *mut pthread_cond_t);
    Broadcast fn pthread_cond_broadcast(cond: *mut pthread_cond_t);

    Lock fn pthread_rwlock_rdlock(lock: *mut pthread_rwlock_t);
    Lock fn pthread_rwlock_wrlock(lock: *mut pthread_rwlock_t);
    TryLock fn pthread_rwlock_tryrdlock(lock: *mut pthread_rwlock_t);
    TryLock fn pthread_rwlock_trywrlock(lock: *mut pthread_rwlock_t);
    TryLock fn pthread_rwlock_timedrdlock(lock: *mut pthread_rwlock_t, abstime: *const timespec);
    TryLock fn pthread_rwlock_timedwrlock(lock: *mut pthread_rwlock_t, abstime: *const timespec);
    Unlock fn pthread_rwlock_unlock(lock: *mut pthread_rwlock_t);

    Barrier fn pthread_barrier_wait(barrier: *mut pthread_barrier_t);

    Join fn pthread_join(thread: pthread_t, retval: *mut *mut c_void);
    TryJoin fn pthread_tryjoin_np(thread: pthread_t, retval: *mut *mut c_void);
    TryJoin fn pthread_timedjoin_np(
        thread: pthread_t,
        retval: *mut *mut c_void,
        abstime: *const timespec
    );
}

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// What a new thread needs before running the caller's start routine.
struct Trampoline {
    start: StartRoutine,
    arg: *mut c_void,
    inherited: Option<u64>,
}

extern "C" fn run_profiled(raw: *mut c_void) -> *mut c_void {
    // SAFETY: raw was produced by Box::into_raw in pthread_create and is
    // consumed exactly once, here.
    let Trampoline {
        start,
        arg,
        inherited,
    } = *unsafe { Box::from_raw(raw.cast::<Trampoline>()) };

    let profiler = crate::instance();
    if let Some(p) = profiler {
        p.begin_sampling(inherited);
    }
    let result = start(arg);
    if let Some(p) = profiler {
        p.end_sampling();
    }
    result
}

/// Creates a thread that starts with the creator's local delay and is
/// sampled until its start routine returns.
///
/// # Safety
///
/// Same contract as `pthread_create`.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    static REAL: RealFn<
        unsafe extern "C" fn(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int,
    > = RealFn::new();
    let Some(real) = (unsafe { REAL.get(b"pthread_create\0") }) else {
        return libc::EAGAIN;
    };

    let Some(profiler) = crate::instance() else {
        return unsafe { real(thread, attr, start, arg) };
    };
    if crate::thread::spawning_unprofiled() {
        return unsafe { real(thread, attr, start, arg) };
    }

    let trampoline = Box::into_raw(Box::new(Trampoline {
        start,
        arg,
        inherited: profiler.current_local_delay(),
    }));
    let rc = unsafe { real(thread, attr, run_profiled, trampoline.cast()) };
    if rc != 0 {
        // SAFETY: the thread was not created, so the box is still ours.
        drop(unsafe { Box::from_raw(trampoline) });
    }
    rc
}

/// Stops profiling the calling thread before it exits.
///
/// # Safety
///
/// Same contract as `pthread_exit`.
#[no_mangle]
pub unsafe extern "C" fn pthread_exit(retval: *mut c_void) -> ! {
    static REAL: RealFn<unsafe extern "C" fn(*mut c_void) -> !> = RealFn::new();
    if let Some(profiler) = crate::instance() {
        profiler.end_sampling();
    }
    match unsafe { REAL.get(b"pthread_exit\0") } {
        Some(real) => unsafe { real(retval) },
        None => fatal!("pthread_exit is not available"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    extern "C" fn answer(arg: *mut c_void) -> *mut c_void {
        arg.cast::<u8>().wrapping_add(42).cast()
    }

    #[test]
    fn created_threads_run_their_routine() {
        let mut thread: pthread_t = 0;
        let rc = unsafe { pthread_create(&mut thread, ptr::null(), answer, ptr::null_mut()) };
        assert_eq!(rc, 0);
        let mut out: *mut c_void = ptr::null_mut();
        assert_eq!(unsafe { pthread_join(thread, &mut out) }, 0);
        assert_eq!(out as usize, 42);
    }

    #[test]
    fn mutex_wrappers_forward() {
        let mut mutex = libc::PTHREAD_MUTEX_INITIALIZER;
        unsafe {
            assert_eq!(pthread_mutex_lock(&mut mutex), 0);
            assert_eq!(pthread_mutex_trylock(&mut mutex), libc::EBUSY);
            assert_eq!(pthread_mutex_unlock(&mut mutex), 0);
            assert_eq!(pthread_mutex_trylock(&mut mutex), 0);
            assert_eq!(pthread_mutex_unlock(&mut mutex), 0);
        }
    }
}
