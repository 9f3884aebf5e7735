//! Signal interposers.
//!
//! The program may not replace the `SIGPROF` handler, block `SIGPROF`, or
//! wait for it. Requests that would do so succeed without touching
//! `SIGPROF`. Signal waits credit blocked time when the signal was sent by
//! this process, and sending a signal to this process catches up first.

use super::real::RealFn;
use crate::sync::{self, SyncOp};
use libc::{c_int, pid_t, pthread_t, sighandler_t, siginfo_t, sigset_t, sigval, timespec};
use std::mem::MaybeUninit;

fn set_errno(code: c_int) {
    // SAFETY: errno is thread-local.
    unsafe { *libc::__errno_location() = code };
}

/// A copy of `set` without `SIGPROF`.
///
/// # Safety
///
/// `set` must point to an initialised signal set.
unsafe fn without_sigprof(set: *const sigset_t) -> sigset_t {
    let mut copy = unsafe { *set };
    unsafe { libc::sigdelset(&mut copy, libc::SIGPROF) };
    copy
}

/// Whether `act` installs something other than our sample handler.
unsafe fn replaces_sample_handler(act: *const libc::sigaction) -> bool {
    !act.is_null() && unsafe { (*act).sa_sigaction } != crate::sampler::handler_address()
}

/// Ignores attempts to replace the `SIGPROF` handler.
///
/// # Safety
///
/// Same contract as `sigaction`.
#[no_mangle]
pub unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    static REAL: RealFn<
        unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int,
    > = RealFn::new();

    if signum == libc::SIGPROF && unsafe { replaces_sample_handler(act) } {
        if !oldact.is_null() {
            unsafe { *oldact = std::mem::zeroed() };
        }
        return 0;
    }
    match unsafe { REAL.get(b"sigaction\0") } {
        Some(real) => unsafe { real(signum, act, oldact) },
        None => {
            set_errno(libc::ENOSYS);
            -1
        }
    }
}

/// Ignores attempts to replace the `SIGPROF` handler.
///
/// # Safety
///
/// Same contract as `signal`.
#[no_mangle]
pub unsafe extern "C" fn signal(signum: c_int, handler: sighandler_t) -> sighandler_t {
    static REAL: RealFn<unsafe extern "C" fn(c_int, sighandler_t) -> sighandler_t> =
        RealFn::new();

    if signum == libc::SIGPROF {
        return libc::SIG_DFL;
    }
    match unsafe { REAL.get(b"signal\0") } {
        Some(real) => unsafe { real(signum, handler) },
        None => {
            set_errno(libc::ENOSYS);
            libc::SIG_ERR
        }
    }
}

type MaskFn = unsafe extern "C" fn(c_int, *const sigset_t, *mut sigset_t) -> c_int;

/// Calls a mask function with `SIGPROF` removed from any set being blocked.
unsafe fn mask(real: MaskFn, how: c_int, set: *const sigset_t, oldset: *mut sigset_t) -> c_int {
    if set.is_null() || how == libc::SIG_UNBLOCK {
        return unsafe { real(how, set, oldset) };
    }
    let allowed = unsafe { without_sigprof(set) };
    unsafe { real(how, &allowed, oldset) }
}

/// Never blocks `SIGPROF`.
///
/// # Safety
///
/// Same contract as `sigprocmask`.
#[no_mangle]
pub unsafe extern "C" fn sigprocmask(how: c_int, set: *const sigset_t, oldset: *mut sigset_t) -> c_int {
    static REAL: RealFn<MaskFn> = RealFn::new();
    match unsafe { REAL.get(b"sigprocmask\0") } {
        Some(real) => unsafe { mask(real, how, set, oldset) },
        None => {
            set_errno(libc::ENOSYS);
            -1
        }
    }
}

/// Never blocks `SIGPROF`.
///
/// # Safety
///
/// Same contract as `pthread_sigmask`.
#[no_mangle]
pub unsafe extern "C" fn pthread_sigmask(
    how: c_int,
    set: *const sigset_t,
    oldset: *mut sigset_t,
) -> c_int {
    static REAL: RealFn<MaskFn> = RealFn::new();
    match unsafe { REAL.get(b"pthread_sigmask\0") } {
        Some(real) => unsafe { mask(real, how, set, oldset) },
        None => libc::ENOSYS,
    }
}

/// Waits for a signal other than `SIGPROF`.
///
/// # Safety
///
/// Same contract as `sigwait`.
#[no_mangle]
pub unsafe extern "C" fn sigwait(set: *const sigset_t, sig: *mut c_int) -> c_int {
    static REAL: RealFn<unsafe extern "C" fn(*const sigset_t, *mut c_int) -> c_int> =
        RealFn::new();
    let Some(real) = (unsafe { REAL.get(b"sigwait\0") }) else {
        return libc::ENOSYS;
    };
    let allowed = unsafe { without_sigprof(set) };
    // sigwait does not report the sender; any delivered signal counts
    sync::intercept(SyncOp::SignalWait, || unsafe { real(&allowed, sig) }, |&rc| rc == 0)
}

/// True if a signal wait returned a signal sent by this process.
fn sent_by_us(rc: c_int, info: &MaybeUninit<siginfo_t>) -> bool {
    // SAFETY: the kernel fills info whenever the wait returns a signal.
    rc > 0 && unsafe { info.assume_init_ref().si_pid() } == unsafe { libc::getpid() }
}

/// Waits for a signal other than `SIGPROF`.
///
/// # Safety
///
/// Same contract as `sigwaitinfo`.
#[no_mangle]
pub unsafe extern "C" fn sigwaitinfo(set: *const sigset_t, info: *mut siginfo_t) -> c_int {
    unsafe { sigtimedwait(set, info, std::ptr::null()) }
}

/// Waits, with a timeout, for a signal other than `SIGPROF`.
///
/// # Safety
///
/// Same contract as `sigtimedwait`.
#[no_mangle]
pub unsafe extern "C" fn sigtimedwait(
    set: *const sigset_t,
    info: *mut siginfo_t,
    timeout: *const timespec,
) -> c_int {
    static REAL: RealFn<
        unsafe extern "C" fn(*const sigset_t, *mut siginfo_t, *const timespec) -> c_int,
    > = RealFn::new();
    let Some(real) = (unsafe { REAL.get(b"sigtimedwait\0") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    let allowed = unsafe { without_sigprof(set) };
    let mut local = MaybeUninit::<siginfo_t>::zeroed();
    let out = local.as_mut_ptr();
    let rc = sync::intercept(
        SyncOp::SignalWait,
        || unsafe { real(&allowed, out, timeout) },
        |&rc| sent_by_us(rc, &local),
    );
    if rc > 0 && !info.is_null() {
        unsafe { info.write(local.assume_init()) };
    }
    rc
}

/// Sends a signal, catching up first when the target is this process.
///
/// # Safety
///
/// Same contract as `kill`.
#[no_mangle]
pub unsafe extern "C" fn kill(pid: pid_t, sig: c_int) -> c_int {
    static REAL: RealFn<unsafe extern "C" fn(pid_t, c_int) -> c_int> = RealFn::new();
    let Some(real) = (unsafe { REAL.get(b"kill\0") }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };
    if pid == unsafe { libc::getpid() } {
        sync::intercept(SyncOp::Wake, || unsafe { real(pid, sig) }, |_| false)
    } else {
        unsafe { real(pid, sig) }
    }
}

/// Signals a thread of this process after catching up.
///
/// # Safety
///
/// Same contract as `pthread_kill`.
#[no_mangle]
pub unsafe extern "C" fn pthread_kill(thread: pthread_t, sig: c_int) -> c_int {
    static REAL: RealFn<unsafe extern "C" fn(pthread_t, c_int) -> c_int> = RealFn::new();
    match unsafe { REAL.get(b"pthread_kill\0") } {
        Some(real) => sync::intercept(SyncOp::Wake, || unsafe { real(thread, sig) }, |_| false),
        None => libc::ENOSYS,
    }
}

/// Queues a signal to a thread of this process after catching up.
///
/// # Safety
///
/// Same contract as `pthread_sigqueue`.
#[no_mangle]
pub unsafe extern "C" fn pthread_sigqueue(thread: pthread_t, sig: c_int, value: sigval) -> c_int {
    static REAL: RealFn<unsafe extern "C" fn(pthread_t, c_int, sigval) -> c_int> = RealFn::new();
    match unsafe { REAL.get(b"pthread_sigqueue\0") } {
        Some(real) => {
            sync::intercept(SyncOp::Wake, || unsafe { real(thread, sig, value) }, |_| false)
        }
        None => libc::ENOSYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_set() -> sigset_t {
        let mut set = MaybeUninit::<sigset_t>::uninit();
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            set.assume_init()
        }
    }

    #[test]
    fn sigprof_is_removed_from_blocked_sets() {
        let mut set = empty_set();
        unsafe {
            libc::sigaddset(&mut set, libc::SIGPROF);
            libc::sigaddset(&mut set, libc::SIGUSR1);
            let allowed = without_sigprof(&set);
            assert_eq!(libc::sigismember(&allowed, libc::SIGPROF), 0);
            assert_eq!(libc::sigismember(&allowed, libc::SIGUSR1), 1);
        }
    }

    #[test]
    fn blocking_sigprof_leaves_it_unblocked() {
        let mut block = empty_set();
        let mut old = empty_set();
        unsafe {
            libc::sigaddset(&mut block, libc::SIGPROF);
            assert_eq!(pthread_sigmask(libc::SIG_BLOCK, &block, std::ptr::null_mut()), 0);
            assert_eq!(pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut old), 0);
            assert_eq!(libc::sigismember(&old, libc::SIGPROF), 0);
        }
    }

    #[test]
    fn foreign_sigprof_handlers_are_ignored() {
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = libc::SIG_IGN;
        assert!(unsafe { replaces_sample_handler(&act) });
        act.sa_sigaction = crate::sampler::handler_address();
        assert!(!unsafe { replaces_sample_handler(&act) });
        assert!(!unsafe { replaces_sample_handler(std::ptr::null()) });
    }
}
