//! The profiler context and the virtual-delay protocol.
//!
//! A [`Profiler`] owns everything shared between application threads and the
//! controller: the source map, the progress points, the thread table and the
//! delay counters. Application threads only ever touch atomics on it. The
//! experiment loop itself lives in [`crate::runner::Engine`].
//!
//! # Delays
//!
//! While an experiment is running, every sample of the selected line charges
//! the sampled thread `delay_size` nanoseconds of local delay. Each thread
//! periodically reconciles its local delay with the global watermark: a thread
//! that is ahead raises the watermark, a thread that is behind sleeps off the
//! difference. The net effect is that everything except the selected line runs
//! slower, which is the same as the selected line running faster.

use crate::config::{Config, EngineConfig};
use crate::per_thread::ThreadState;
use crate::progress_point::{ProgressRegistry, ThroughputPoint};
use crate::runner::Engine;
use crate::sampler::{self, Sample, SignalSampler, Sampler};
use crate::source_map::{LineId, SourceMap};
use crate::thread_table::ThreadTable;
use crate::{timer, StartupError};
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Name of the throughput point used in end-to-end mode.
pub const END_TO_END_POINT: &str = "end-to-end";

/// Shared profiler state.
pub struct Profiler {
    engine: EngineConfig,
    source_map: SourceMap,
    points: ProgressRegistry,
    threads: ThreadTable<ThreadState>,

    /// Delay every thread must have paid by now, in nanoseconds.
    global_delay: AtomicU64,
    /// Delay charged per sample of the selected line.
    delay_size: AtomicU64,
    experiment_active: AtomicBool,
    /// Global delay when the current experiment began.
    round_start_delay: AtomicU64,
    /// Selected line plus one; zero when no experiment is running.
    selected_line: AtomicUsize,
    /// Proposed line for the next experiment plus one; zero when unset.
    next_line: AtomicUsize,

    running: AtomicBool,
    shutdown_done: AtomicBool,
    signals_installed: AtomicBool,
    controller: spin::Mutex<Option<JoinHandle<()>>>,
    end_to_end: Option<Arc<ThroughputPoint>>,
    start_time: u64,
}

impl Profiler {
    /// Builds a profiler over `source_map`. Throughput points named in the
    /// configuration are registered immediately.
    #[must_use]
    pub fn new(config: &Config, source_map: SourceMap) -> Self {
        let points = ProgressRegistry::new(config.engine.point_capacity);
        for name in &config.progress_points {
            let _ = points.throughput(name);
        }
        let end_to_end = if config.end_to_end {
            points.throughput(END_TO_END_POINT)
        } else {
            None
        };

        Self {
            engine: config.engine,
            source_map,
            points,
            threads: ThreadTable::new(config.engine.thread_capacity),
            global_delay: AtomicU64::new(0),
            delay_size: AtomicU64::new(0),
            experiment_active: AtomicBool::new(false),
            round_start_delay: AtomicU64::new(0),
            selected_line: AtomicUsize::new(0),
            next_line: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            shutdown_done: AtomicBool::new(false),
            signals_installed: AtomicBool::new(false),
            controller: spin::Mutex::new(None),
            end_to_end,
            start_time: timer::now(),
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    #[must_use]
    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressRegistry {
        &self.points
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadTable<ThreadState> {
        &self.threads
    }

    #[must_use]
    pub fn global_delay(&self) -> u64 {
        self.global_delay.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_experiment_active(&self) -> bool {
        self.experiment_active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Lets newly registered threads arm a `SIGPROF` sampler.
    pub(crate) fn enable_signals(&self) {
        self.signals_installed.store(true, Ordering::Release);
    }

    // ---- thread lifecycle ----

    /// Registers kernel thread `tid` with the given starting local delay.
    /// Returns `None` (with a warning) when the thread table is full.
    pub fn register_thread(&self, tid: u64, initial_delay: u64) -> Option<&ThreadState> {
        let Some(state) = self.threads.insert(tid) else {
            warning!("thread table is full; thread {} will not be profiled", tid);
            return None;
        };
        state.reset(initial_delay, (0, 0));
        Some(state)
    }

    /// Removes `tid` from the thread table after a final reconciliation.
    pub fn unregister_thread(&self, tid: u64) {
        let Some(state) = self.threads.find(tid) else {
            return;
        };
        state.ring.drain(|sample| self.process_sample(state, sample));
        if let Some(_guard) = state.try_enter() {
            self.add_delays(state);
        }
        self.threads.remove(tid);
    }

    /// Starts profiling the calling thread.
    ///
    /// `inherited` is the creating thread's local delay; threads with no
    /// profiled parent start at the current global delay.
    pub fn begin_sampling(&self, inherited: Option<u64>) -> bool {
        let tid = sampler::current_tid();
        let initial = inherited.unwrap_or_else(|| self.global_delay());
        let Some(state) = self.threads.insert(tid_key(tid)) else {
            warning!("thread table is full; thread {} will not be profiled", tid);
            return false;
        };
        state.reset(initial, sampler::stack_bounds());

        if self.signals_installed.load(Ordering::Acquire) {
            let period = Duration::from_nanos(self.engine.sample_period);
            let started = SignalSampler::new(tid, period).and_then(|mut s| {
                s.start()?;
                Ok(s)
            });
            match started {
                Ok(s) => *state.sampler.lock() = Some(Box::new(s)),
                Err(e) => warning!("failed to start sampling thread {}: {}", tid, e),
            }
        }
        true
    }

    /// Stops profiling the calling thread.
    pub fn end_sampling(&self) {
        let key = tid_key(sampler::current_tid());
        let Some(state) = self.threads.find(key) else {
            return;
        };
        if let Some(mut s) = state.sampler.lock().take() {
            if let Err(e) = s.stop() {
                warning!("failed to stop sampler: {}", e);
            }
        }
        self.unregister_thread(key);
    }

    /// State of the calling thread, if it is profiled.
    #[must_use]
    pub fn current_state(&self) -> Option<&ThreadState> {
        self.threads.find(tid_key(sampler::current_tid()))
    }

    /// Local delay of the calling thread, if it is profiled.
    #[must_use]
    pub fn current_local_delay(&self) -> Option<u64> {
        self.current_state().map(ThreadState::local_delay)
    }

    // ---- sampling ----

    /// Body of the `SIGPROF` handler.
    pub(crate) fn sample_signal(&self, context: *mut libc::c_void) {
        let Some(state) = self.current_state() else {
            return;
        };
        let Some(_guard) = state.try_enter() else {
            return;
        };

        // SAFETY: context is the ucontext_t handed to the SA_SIGINFO handler.
        let sample = unsafe { sampler::capture(context, state.stack_bounds()) };
        if sample.ip != 0 {
            state.ring.push(&sample);
        }

        let signals = state.signals.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if signals % self.engine.sample_batch_size.max(1) == 0 {
            self.add_delays(state);
        }
    }

    /// Attributes one sample taken on the thread owning `state`.
    ///
    /// Samples in the selected line charge that thread `delay_size`, up to
    /// the per-experiment cap. Outside an experiment, the first sampled line
    /// becomes the candidate for the next one.
    pub fn process_sample(&self, state: &ThreadState, sample: &Sample) {
        let Some(id) = self.source_map.resolve(sample) else {
            return;
        };
        if let Some(line) = self.source_map.line(id) {
            line.add_sample();
        }

        if self.experiment_active.load(Ordering::Acquire) {
            if self.selected_line.load(Ordering::Acquire) == id + 1 {
                self.charge(state, self.delay_size.load(Ordering::Relaxed));
            }
        } else {
            let _ = self
                .next_line
                .compare_exchange(0, id + 1, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    /// Adds `amount` to a thread's local delay without passing the
    /// per-experiment cap.
    pub(crate) fn charge(&self, state: &ThreadState, amount: u64) {
        let cap = self.delay_cap();
        let _ = state
            .local_delay
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |local| {
                (local < cap).then(|| local.saturating_add(amount).min(cap))
            });
    }

    fn delay_cap(&self) -> u64 {
        self.round_start_delay
            .load(Ordering::Acquire)
            .saturating_add(self.engine.max_delay_per_experiment)
    }

    /// Drains every thread's sample ring. Returns the number of samples seen.
    pub fn drain_samples(&self) -> usize {
        self.threads
            .iter()
            .map(|(_, state)| state.ring.drain(|sample| self.process_sample(state, sample)))
            .sum()
    }

    // ---- delay protocol ----

    /// Reconciles a thread's local delay with the global watermark.
    ///
    /// The caller must hold the thread's re-entry guard.
    pub(crate) fn add_delays(&self, state: &ThreadState) {
        let global = self.global_delay.load(Ordering::Acquire);
        if !self.experiment_active.load(Ordering::Acquire) {
            state.local_delay.store(global, Ordering::Relaxed);
            return;
        }

        let local = state.local_delay.load(Ordering::Acquire);
        if local > global {
            self.global_delay.fetch_max(local, Ordering::AcqRel);
        } else if local < global {
            let debt = global - local;
            let elapsed = timer::wait(debt);
            let overshoot = elapsed.saturating_sub(debt);

            // Overshoot only counts when the debt belongs to this experiment.
            let round_start = self.round_start_delay.load(Ordering::Acquire);
            let credit = if local >= round_start {
                overshoot.min(self.delay_cap().saturating_sub(global))
            } else {
                0
            };
            state.local_delay.fetch_add(debt + credit, Ordering::AcqRel);
        }
    }

    /// Pays any outstanding delay before the calling thread wakes another.
    pub fn catch_up(&self, state: &ThreadState) {
        if !self.experiment_active.load(Ordering::Acquire) {
            return;
        }
        if let Some(_guard) = state.try_enter() {
            self.add_delays(state);
        }
    }

    /// Records the global delay before a potentially blocking call.
    pub fn pre_block(&self, state: &ThreadState) {
        state
            .pre_block_delay
            .store(self.global_delay.load(Ordering::Acquire), Ordering::Relaxed);
    }

    /// Credits the delay inserted while the thread was blocked, if another
    /// thread woke it. A timed-out wait gets no credit.
    pub fn post_block(&self, state: &ThreadState, skip_delays: bool) {
        if !skip_delays {
            return;
        }
        let Some(_guard) = state.try_enter() else {
            return;
        };
        let before = state.pre_block_delay.load(Ordering::Relaxed);
        let advanced = self.global_delay.load(Ordering::Acquire).saturating_sub(before);
        state.local_delay.fetch_add(advanced, Ordering::AcqRel);
    }

    // ---- experiment control, driven by the engine ----

    pub(crate) fn take_next_line(&self) -> Option<LineId> {
        self.next_line.swap(0, Ordering::AcqRel).checked_sub(1)
    }

    /// Starts charging samples of `line` with `delay_size`. Returns the global
    /// delay at the start of the experiment.
    pub(crate) fn begin_experiment(&self, line: LineId, delay_size: u64) -> u64 {
        let start = self.global_delay();
        self.delay_size.store(delay_size, Ordering::Relaxed);
        self.round_start_delay.store(start, Ordering::Release);
        self.selected_line.store(line + 1, Ordering::Release);
        self.experiment_active.store(true, Ordering::Release);
        start
    }

    /// Raises the global delay directly, so every thread pays `amount`.
    pub(crate) fn insert_global_delay(&self, amount: u64) {
        self.global_delay.fetch_add(amount, Ordering::AcqRel);
    }

    /// Stops the experiment. Returns the global delay at its end.
    pub(crate) fn end_experiment(&self) -> u64 {
        self.experiment_active.store(false, Ordering::Release);
        self.selected_line.store(0, Ordering::Release);
        self.global_delay()
    }

    // ---- process lifecycle ----

    /// Opens the experiment log and spawns the controller thread.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be opened or the thread cannot be created.
    pub fn start(self: &Arc<Self>, config: &Config) -> Result<(), StartupError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.output)
            .map_err(|source| StartupError::OutputOpen {
                path: config.output.clone(),
                source,
            })?;

        let engine = Engine::new(Arc::clone(self), BufWriter::new(file), config);
        let handle = crate::thread::spawn_unprofiled("causa-controller", move || {
            let _ = engine.run();
        })
        .map_err(StartupError::Controller)?;

        *self.controller.lock() = Some(handle);
        info!("controller started, logging to {}", config.output.display());
        Ok(())
    }

    /// Stops the experiment loop and waits for the controller to write the
    /// final records. Only the first call has any effect.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(point) = &self.end_to_end {
            point.visit(1);
        }
        self.running.store(false, Ordering::Release);

        let handle = self.controller.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warning!("controller thread panicked");
            }
        }
    }
}

/// Thread table key for a kernel thread id.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn tid_key(tid: libc::pid_t) -> u64 {
    tid as u64
}
