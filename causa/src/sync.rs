//! Delay accounting around blocking and waking operations.
//!
//! A thread that blocks is not executing, so the delay inserted while it
//! waits must not be charged to it again when it wakes. A thread that wakes
//! another must first pay what it owes, or the woken thread would inherit a
//! watermark that is too low. Every interceptable operation is tagged with a
//! [`SyncOp`] whose [`hooks`](SyncOp::hooks) say which of these rules apply.

use crate::experiment::Profiler;
use crate::per_thread::ThreadState;

/// Operations that block, wake another thread, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// Mutex or rwlock acquisition that may block.
    Lock,
    /// Non-blocking or timed lock acquisition.
    TryLock,
    /// Mutex or rwlock release.
    Unlock,
    /// Condition variable wait.
    Wait,
    /// Condition variable wait with a timeout.
    TimedWait,
    /// Condition variable signal.
    Signal,
    /// Condition variable broadcast.
    Broadcast,
    /// Thread join.
    Join,
    /// Non-blocking or timed thread join.
    TryJoin,
    /// Barrier wait.
    Barrier,
    /// Waiting for a signal; only signals from this process credit the wait.
    SignalWait,
    /// Sending a signal to this process or one of its threads.
    Wake,
}

/// When blocked time is credited back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credit {
    /// The operation never blocks.
    Never,
    /// The operation always ends because another thread acted.
    Always,
    /// Only a successful return means another thread acted.
    OnSuccess,
}

/// Hooks applied around one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hooks {
    /// Pay outstanding delay before the call.
    pub catch_up: bool,
    pub credit: Credit,
}

impl SyncOp {
    #[must_use]
    pub const fn hooks(self) -> Hooks {
        let (catch_up, credit) = match self {
            Self::Lock | Self::Wait | Self::Join => (false, Credit::Always),
            Self::TryLock | Self::TimedWait | Self::TryJoin | Self::SignalWait => {
                (false, Credit::OnSuccess)
            }
            Self::Unlock | Self::Signal | Self::Broadcast | Self::Wake => (true, Credit::Never),
            Self::Barrier => (true, Credit::Always),
        };
        Hooks { catch_up, credit }
    }
}

impl Profiler {
    /// Runs `call` on behalf of the thread owning `state`, applying the
    /// hooks for `op`. `succeeded` decides credit for [`Credit::OnSuccess`].
    pub fn intercept<R>(
        &self,
        state: &ThreadState,
        op: SyncOp,
        call: impl FnOnce() -> R,
        succeeded: impl FnOnce(&R) -> bool,
    ) -> R {
        let hooks = op.hooks();
        if hooks.catch_up {
            self.catch_up(state);
        }
        if hooks.credit == Credit::Never {
            return call();
        }

        self.pre_block(state);
        let result = call();
        let skip = match hooks.credit {
            Credit::Always => true,
            Credit::OnSuccess => succeeded(&result),
            Credit::Never => false,
        };
        self.post_block(state, skip);
        result
    }
}

/// Runs a blocking or waking operation with the delay hooks for `op`.
///
/// Outside a profiled thread this is just `call()`. Use it to wrap custom
/// blocking primitives so time spent blocked is not double-charged:
///
/// ```ignore
/// let item = causa::sync::intercept(SyncOp::Wait, || rx.recv(), |r| r.is_ok());
/// ```
pub fn intercept<R>(
    op: SyncOp,
    call: impl FnOnce() -> R,
    succeeded: impl FnOnce(&R) -> bool,
) -> R {
    let Some(profiler) = crate::instance() else {
        return call();
    };
    match profiler.current_state() {
        Some(state) => profiler.intercept(state, op, call, succeeded),
        None => call(),
    }
}
