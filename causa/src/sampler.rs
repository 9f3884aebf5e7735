//! Signal-driven sampling of running threads.
//!
//! Each profiled thread owns a POSIX timer on its own CPU-time clock that
//! raises `SIGPROF` at the sample period. The handler captures the interrupted
//! instruction pointer plus a short frame-pointer call chain and pushes it into
//! the thread's [`SampleRing`]. The controller thread drains the rings and does
//! the line resolution, so nothing in the handler allocates or locks.

use crate::timer::{Interval, TimerError};
use libc::{c_int, c_void, pid_t, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Samples buffered per thread between controller drains.
pub const RING_CAPACITY: usize = 32;

/// Return addresses kept per sample.
pub const MAX_CALLCHAIN: usize = 4;

/// Errors from setting up sampling.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error("failed to install SIGPROF handler: {0}")]
    Handler(#[source] nix::errno::Errno),
}

/// One sample: the interrupted instruction pointer and the innermost return
/// addresses of its call chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub ip: usize,
    callchain: [usize; MAX_CALLCHAIN],
    depth: u8,
}

impl Sample {
    #[must_use]
    pub const fn new(ip: usize) -> Self {
        Self {
            ip,
            callchain: [0; MAX_CALLCHAIN],
            depth: 0,
        }
    }

    /// Appends a return address. Returns false once the chain is full.
    pub fn push_return(&mut self, addr: usize) -> bool {
        let depth = usize::from(self.depth);
        if depth == MAX_CALLCHAIN {
            return false;
        }
        self.callchain[depth] = addr;
        self.depth += 1;
        true
    }

    #[must_use]
    pub fn callchain(&self) -> &[usize] {
        &self.callchain[..usize::from(self.depth)]
    }
}

#[derive(Default)]
struct Entry {
    ip: AtomicUsize,
    callchain: [AtomicUsize; MAX_CALLCHAIN],
    depth: AtomicU8,
}

/// Single-producer ring of samples.
///
/// The producer is the owning thread's signal handler, which the thread's
/// re-entry flag keeps to one writer. Consumers (the controller, or the thread
/// itself on exit) serialize through a try-lock and skip the drain if another
/// consumer holds it. A full ring drops new samples.
pub struct SampleRing {
    entries: [Entry; RING_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
    draining: AtomicBool,
    dropped: AtomicU64,
}

impl Default for SampleRing {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| Entry::default()),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }
}

impl SampleRing {
    /// Appends a sample. Async-signal-safe.
    pub fn push(&self, sample: &Sample) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= RING_CAPACITY {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let entry = &self.entries[head % RING_CAPACITY];
        entry.ip.store(sample.ip, Ordering::Relaxed);
        for (slot, addr) in entry.callchain.iter().zip(sample.callchain) {
            slot.store(addr, Ordering::Relaxed);
        }
        entry.depth.store(sample.depth, Ordering::Relaxed);

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Hands every buffered sample to `f` and returns how many there were.
    /// Returns 0 without blocking if another consumer is draining.
    pub fn drain(&self, mut f: impl FnMut(&Sample)) -> usize {
        if self.draining.swap(true, Ordering::Acquire) {
            return 0;
        }

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let mut read = tail;
        while read != head {
            let entry = &self.entries[read % RING_CAPACITY];
            let mut sample = Sample::new(entry.ip.load(Ordering::Relaxed));
            let depth = usize::from(entry.depth.load(Ordering::Relaxed)).min(MAX_CALLCHAIN);
            for slot in &entry.callchain[..depth] {
                sample.push_return(slot.load(Ordering::Relaxed));
            }
            f(&sample);
            read = read.wrapping_add(1);
        }
        self.tail.store(head, Ordering::Release);

        self.draining.store(false, Ordering::Release);
        head.wrapping_sub(tail)
    }

    /// Discards buffered samples, waiting out any drain in progress.
    pub fn clear(&self) {
        while self
            .draining
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.tail.store(self.head.load(Ordering::Acquire), Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
        self.draining.store(false, Ordering::Release);
    }

    /// Samples lost to a full ring.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A source of periodic sampling signals for one thread.
pub trait Sampler: Send {
    /// Begins delivering samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying timer cannot be armed.
    fn start(&mut self) -> Result<(), SamplerError>;

    /// Stops delivering samples. Dropping the sampler releases it.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying timer cannot be disarmed.
    fn stop(&mut self) -> Result<(), SamplerError>;
}

/// Samples a thread with `SIGPROF` from a timer on its CPU-time clock.
pub struct SignalSampler {
    interval: Interval,
    period: Duration,
}

impl SignalSampler {
    /// Creates a disarmed sampler for kernel thread `tid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer cannot be created.
    pub fn new(tid: pid_t, period: Duration) -> Result<Self, SamplerError> {
        let interval = Interval::new(libc::CLOCK_THREAD_CPUTIME_ID, tid, libc::SIGPROF)?;
        Ok(Self { interval, period })
    }
}

impl Sampler for SignalSampler {
    fn start(&mut self) -> Result<(), SamplerError> {
        self.interval.start(self.period)?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SamplerError> {
        self.interval.stop()?;
        Ok(())
    }
}

extern "C" fn on_sample(_signal: c_int, _info: *mut siginfo_t, context: *mut c_void) {
    // SAFETY: __errno_location always returns the calling thread's errno.
    let errno = unsafe { *libc::__errno_location() };
    if let Some(profiler) = crate::instance() {
        profiler.sample_signal(context);
    }
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = errno };
}

/// Address of the `SIGPROF` handler, so interposed `sigaction` can recognise it.
#[cfg_attr(not(feature = "preload"), allow(dead_code))]
pub(crate) fn handler_address() -> usize {
    on_sample as *const () as usize
}

/// Installs the process-wide `SIGPROF` handler.
///
/// # Errors
///
/// Returns an error if `sigaction` fails.
pub fn install_handler() -> Result<(), SamplerError> {
    let action = SigAction::new(
        SigHandler::SigAction(on_sample),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: on_sample only touches atomics and the current thread's ring.
    unsafe { sigaction(Signal::SIGPROF, &action) }.map_err(SamplerError::Handler)?;
    Ok(())
}

/// Kernel id of the calling thread.
#[must_use]
pub fn current_tid() -> pid_t {
    // SAFETY: gettid has no preconditions.
    #[allow(clippy::cast_possible_truncation)]
    let tid = unsafe { libc::syscall(libc::SYS_gettid) as pid_t };
    tid
}

/// Address range `[low, high)` of the calling thread's stack, or `(0, 0)` if
/// it cannot be determined.
#[must_use]
pub fn stack_bounds() -> (usize, usize) {
    // SAFETY: attr is initialised by pthread_getattr_np before use and
    // destroyed afterwards.
    unsafe {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_attr_t>::uninit();
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return (0, 0);
        }
        let mut attr = attr.assume_init();
        let mut addr: *mut c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let result = libc::pthread_attr_getstack(&raw const attr, &raw mut addr, &raw mut size);
        libc::pthread_attr_destroy(&raw mut attr);
        if result != 0 {
            return (0, 0);
        }
        (addr as usize, addr as usize + size)
    }
}

/// Builds a sample from a signal context: the program counter, then return
/// addresses found by following saved frame pointers inside `stack`.
///
/// # Safety
///
/// `context` must be the `ucontext_t` passed to an `SA_SIGINFO` handler.
pub(crate) unsafe fn capture(context: *const c_void, stack: (usize, usize)) -> Sample {
    let Some((ip, mut fp)) = registers(context) else {
        return Sample::default();
    };
    let mut sample = Sample::new(ip);

    let (low, high) = stack;
    let word = std::mem::size_of::<usize>();
    while fp >= low && fp.saturating_add(2 * word) <= high && fp % word == 0 {
        // SAFETY: fp lies inside this thread's stack.
        let (next, ret) = unsafe {
            let frame = fp as *const usize;
            (frame.read(), frame.add(1).read())
        };
        if ret == 0 || !sample.push_return(ret) || next <= fp {
            break;
        }
        fp = next;
    }
    sample
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
unsafe fn registers(context: *const c_void) -> Option<(usize, usize)> {
    if context.is_null() {
        return None;
    }
    // SAFETY: the caller passes a valid ucontext_t.
    let gregs = unsafe { &(*context.cast::<libc::ucontext_t>()).uc_mcontext.gregs };
    Some((
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RBP as usize] as usize,
    ))
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
#[allow(clippy::cast_possible_truncation)]
unsafe fn registers(context: *const c_void) -> Option<(usize, usize)> {
    if context.is_null() {
        return None;
    }
    // SAFETY: the caller passes a valid ucontext_t.
    let mcontext = unsafe { &(*context.cast::<libc::ucontext_t>()).uc_mcontext };
    Some((mcontext.pc as usize, mcontext.regs[29] as usize))
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn registers(_context: *const c_void) -> Option<(usize, usize)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_callchain_is_bounded() {
        let mut sample = Sample::new(1);
        for addr in 10..20 {
            sample.push_return(addr);
        }
        assert_eq!(sample.callchain(), &[10, 11, 12, 13]);
    }

    #[test]
    fn ring_preserves_order_and_contents() {
        let ring = SampleRing::default();
        let mut first = Sample::new(0x10);
        first.push_return(0x20);
        let second = Sample::new(0x30);

        assert!(ring.push(&first));
        assert!(ring.push(&second));

        let mut seen = Vec::new();
        assert_eq!(ring.drain(|s| seen.push(*s)), 2);
        assert_eq!(seen, vec![first, second]);
        assert_eq!(ring.drain(|_| panic!("ring should be empty")), 0);
    }

    #[test]
    fn full_ring_drops_new_samples() {
        let ring = SampleRing::default();
        for ip in 0..RING_CAPACITY {
            assert!(ring.push(&Sample::new(ip)));
        }
        assert!(!ring.push(&Sample::new(999)));
        assert_eq!(ring.dropped(), 1);

        let mut ips = Vec::new();
        ring.drain(|s| ips.push(s.ip));
        assert_eq!(ips, (0..RING_CAPACITY).collect::<Vec<_>>());

        // space is available again after a drain
        assert!(ring.push(&Sample::new(1000)));
    }

    #[test]
    fn ring_wraps_around() {
        let ring = SampleRing::default();
        let mut total = 0;
        for round in 0..5 {
            for i in 0..20 {
                ring.push(&Sample::new(round * 100 + i));
            }
            total += ring.drain(|_| {});
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn clear_discards_pending_samples() {
        let ring = SampleRing::default();
        ring.push(&Sample::new(1));
        ring.clear();
        assert_eq!(ring.drain(|_| {}), 0);
    }

    #[test]
    fn concurrent_drain_is_skipped() {
        let ring = SampleRing::default();
        ring.push(&Sample::new(1));
        ring.draining.store(true, Ordering::Relaxed);
        assert_eq!(ring.drain(|_| {}), 0);
        ring.draining.store(false, Ordering::Relaxed);
        assert_eq!(ring.drain(|_| {}), 1);
    }

    #[test]
    fn stack_bounds_contain_a_local() {
        let local = 0u64;
        let addr = &raw const local as usize;
        let (low, high) = stack_bounds();
        assert!(low <= addr && addr < high, "{low:#x} <= {addr:#x} < {high:#x}");
    }

    #[test]
    fn installed_handler_is_recognisable() {
        install_handler().unwrap();
        let mut current = std::mem::MaybeUninit::<libc::sigaction>::uninit();
        // SAFETY: a null new action only queries the current one.
        let rc = unsafe { libc::sigaction(libc::SIGPROF, std::ptr::null(), current.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // SAFETY: sigaction filled it in.
        let current = unsafe { current.assume_init() };
        assert_eq!(current.sa_sigaction, handler_address());
        assert_ne!(current.sa_flags & libc::SA_SIGINFO, 0);
    }

    #[test]
    fn null_context_yields_empty_sample() {
        let sample = unsafe { capture(std::ptr::null(), (0, 0)) };
        assert_eq!(sample.ip, 0);
        assert!(sample.callchain().is_empty());
    }
}
