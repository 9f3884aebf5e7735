//! The experiment loop.
//!
//! The [`Engine`] runs on the controller thread. Each round it:
//! 1. Picks a line (fixed, or the latest line proposed by sampling)
//! 2. Picks a delay size (fixed, or drawn with a bias toward zero)
//! 3. Snapshots every progress point and activates the experiment
//! 4. Waits, draining sample rings as it goes. With arrival speedup on, it
//!    also inserts a drawn share of every sample period as global delay
//! 5. Deactivates the experiment and logs the outcome
//!
//! Experiment length adapts so each round sees enough progress-point visits.

use crate::config::Config;
use crate::experiment::Profiler;
use crate::progress_point::{calibrate_visit_overhead, Snapshot};
use crate::source_map::LineId;
use crate::timer;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::Arc;

/// Experiments between `runtime`/`samples` flushes.
const SAMPLE_LOG_INTERVAL: u64 = 32;

/// State captured when an experiment starts.
#[derive(Debug)]
pub struct Round {
    line: LineId,
    delay_size: u64,
    start_time: u64,
    start_delay: u64,
    start_samples: u64,
    /// Percent of each sample period inserted as global delay.
    arrival_speedup: u64,
    points: Snapshot,
}

impl Round {
    #[must_use]
    pub fn arrival_speedup(&self) -> u64 {
        self.arrival_speedup
    }
}

/// Outcome of one experiment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExperimentRecord {
    pub line: LineId,
    /// Delay size as a fraction of the sample period.
    pub speedup: f64,
    /// Delay size in nanoseconds.
    pub delay_size: u64,
    /// Wall-clock length of the experiment.
    pub wall_time: u64,
    /// Global delay inserted during the experiment.
    pub delays: u64,
    /// Wall-clock length minus inserted delay.
    pub duration: u64,
    pub selected_samples: u64,
    /// Arrival speedup as a fraction, when arrival speedup is enabled.
    pub arrival_speedup: Option<f64>,
    /// Smallest progress-point delta, if any point exists.
    pub min_delta: Option<u64>,
}

/// Controller-side experiment state machine.
pub struct Engine<W: Write> {
    profiler: Arc<Profiler>,
    out: W,
    rng: SmallRng,
    experiment_length: u64,
    fixed_line: Option<LineId>,
    fixed_delay: Option<u64>,
    end_to_end: bool,
    arrival_speedup: bool,
    experiments: u64,
}

impl<W: Write> Engine<W> {
    /// Creates an engine that logs to `out`.
    ///
    /// An unknown fixed line is reported and ignored.
    pub fn new(profiler: Arc<Profiler>, out: W, config: &Config) -> Self {
        let fixed_line = config.fixed_line.as_deref().and_then(|name| {
            let line = profiler.source_map().find_line_by_name(name);
            if line.is_none() {
                warning!("fixed line {} not found; selecting lines by sampling", name);
            }
            line
        });

        Self {
            experiment_length: profiler.engine_config().experiment_min_time,
            fixed_delay: config.fixed_delay_size(),
            end_to_end: config.end_to_end,
            arrival_speedup: config.arrival_speedup,
            rng: SmallRng::from_entropy(),
            experiments: 0,
            fixed_line,
            profiler,
            out,
        }
    }

    /// Replaces the random source, for reproducible delay draws.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    #[must_use]
    pub fn experiment_length(&self) -> u64 {
        self.experiment_length
    }

    /// Runs experiments until the profiler shuts down, then writes the final
    /// records and returns the log sink.
    pub fn run(mut self) -> W {
        self.log_startup();

        if !self.end_to_end {
            self.wait_for_points();
        }

        while self.profiler.is_running() {
            let Some(line) = self.select_line() else {
                break;
            };
            let delay = self.choose_delay();
            let round = self.begin_round(line, delay);

            let length = if self.end_to_end {
                u64::MAX
            } else {
                self.experiment_length
            };
            self.hold_round(&round, length);

            let record = self.finish_round(round);
            self.adapt_length(record.min_delta);

            self.experiments += 1;
            if self.experiments % SAMPLE_LOG_INTERVAL == 0 {
                self.log_samples();
            }

            if self.end_to_end {
                break;
            }
            self.idle(self.profiler.engine_config().cooloff);
        }

        self.log_shutdown();
        self.out
    }

    fn log_startup(&mut self) {
        let overhead = calibrate_visit_overhead();
        let period = self.profiler.engine_config().sample_period;
        self.emit(format_args!("startup\ttime={}", timer::now()));
        self.emit(format_args!(
            "info\tsample-period={period}\tcounter-overhead={overhead}"
        ));
        self.flush();
    }

    fn log_shutdown(&mut self) {
        self.profiler.drain_samples();
        self.log_samples();
        self.emit(format_args!("shutdown\ttime={}", timer::now()));
        self.flush();
    }

    /// Idles until a progress point exists or the profiler shuts down.
    pub fn wait_for_points(&mut self) {
        let cooloff = self.profiler.engine_config().cooloff;
        while self.profiler.is_running() && self.profiler.progress().is_empty() {
            self.idle(cooloff);
        }
    }

    /// The line for the next experiment. Without a fixed line this waits for
    /// sampling to propose one; returns `None` if shutdown comes first.
    pub fn select_line(&mut self) -> Option<LineId> {
        if let Some(line) = self.fixed_line {
            return Some(line);
        }
        let batch = self.profiler.engine_config().batch_period();
        loop {
            self.profiler.drain_samples();
            if let Some(line) = self.profiler.take_next_line() {
                return Some(line);
            }
            if !self.profiler.is_running() {
                return None;
            }
            timer::nanosleep(batch);
        }
    }

    /// Delay size for the next experiment.
    ///
    /// Draws from `zero_speedup_weight + speedup_divisions` equally likely
    /// outcomes: the first `zero_speedup_weight` mean no delay, the rest map
    /// to evenly spaced fractions of the sample period.
    pub fn choose_delay(&mut self) -> u64 {
        if let Some(delay) = self.fixed_delay {
            return delay;
        }
        let period = self.profiler.engine_config().sample_period;
        self.draw_speedup(period)
    }

    /// Arrival speedup percent for the next experiment, drawn like the delay
    /// size. Zero when arrival speedup is off.
    pub fn choose_arrival_speedup(&mut self) -> u64 {
        if self.arrival_speedup {
            self.draw_speedup(100)
        } else {
            0
        }
    }

    /// Draws zero or one of the evenly spaced fractions of `scale`.
    fn draw_speedup(&mut self, scale: u64) -> u64 {
        let engine = self.profiler.engine_config();
        let weight = engine.zero_speedup_weight;
        let divisions = engine.speedup_divisions.max(1);
        let r = self.rng.gen_range(0..=weight + divisions);
        if r <= weight {
            0
        } else {
            (r - weight) * scale / divisions
        }
    }

    /// Snapshots the points and activates an experiment on `line`.
    pub fn begin_round(&mut self, line: LineId, delay_size: u64) -> Round {
        let arrival_speedup = self.choose_arrival_speedup();
        let points = self.profiler.progress().save();
        let start_samples = self.line_samples(line);
        let start_delay = self.profiler.begin_experiment(line, delay_size);
        let start_time = timer::now();

        let selected = self.line_name(line);
        if delay_size == 0 {
            self.emit(format_args!("start-baseline\ttime={start_time}\tselected={selected}"));
        } else {
            self.emit(format_args!(
                "start-speedup\ttime={start_time}\tselected={selected}\tdelay-size={delay_size}"
            ));
        }

        Round {
            line,
            delay_size,
            start_time,
            start_delay,
            start_samples,
            arrival_speedup,
            points,
        }
    }

    /// Keeps `round` running for `length` nanoseconds or until shutdown.
    ///
    /// With a nonzero arrival speedup the controller wakes every sample
    /// period and inserts that percentage of the elapsed time as global
    /// delay.
    pub fn hold_round(&mut self, round: &Round, length: u64) {
        if round.arrival_speedup == 0 {
            self.idle(length);
            return;
        }
        let period = self.profiler.engine_config().sample_period.max(1);
        let mut elapsed = 0u64;
        while elapsed < length && self.profiler.is_running() {
            let slept = timer::wait(period);
            self.profiler
                .insert_global_delay(slept * round.arrival_speedup / 100);
            elapsed = elapsed.saturating_add(slept);
            self.profiler.drain_samples();
        }
        self.profiler.drain_samples();
    }

    /// Ends the experiment and logs its outcome.
    pub fn finish_round(&mut self, round: Round) -> ExperimentRecord {
        let end_delay = self.profiler.end_experiment();
        let end_time = timer::now();
        self.profiler.drain_samples();

        let wall_time = end_time.saturating_sub(round.start_time);
        let delays = end_delay.saturating_sub(round.start_delay);
        let duration = wall_time.saturating_sub(delays);
        let selected_samples = self.line_samples(round.line).saturating_sub(round.start_samples);

        #[allow(clippy::cast_precision_loss)]
        let speedup = round.delay_size as f64 / self.profiler.engine_config().sample_period as f64;

        let tag = if round.delay_size == 0 { "baseline" } else { "speedup" };
        self.emit(format_args!("end-{tag}\ttime={end_time}\tdelays={delays}"));
        let selected = self.line_name(round.line);
        #[allow(clippy::cast_precision_loss)]
        let arrival_speedup = self
            .arrival_speedup
            .then(|| round.arrival_speedup as f64 / 100.0);
        if let Some(arrival) = arrival_speedup {
            self.emit(format_args!(
                "experiment\tselected={selected}\tspeedup={speedup:.2}\tduration={duration}\tselected-samples={selected_samples}\tarrival-speedup={arrival:.2}"
            ));
        } else {
            self.emit(format_args!(
                "experiment\tselected={selected}\tspeedup={speedup:.2}\tduration={duration}\tselected-samples={selected_samples}"
            ));
        }
        for point in &round.points.throughput {
            self.emit(format_args!("{point}"));
        }
        for point in &round.points.latency {
            self.emit(format_args!("{point}"));
        }
        self.flush();

        info!(
            "experiment on {} at {:.2}: {} points, min delta {:?}",
            selected,
            speedup,
            round.points.throughput.len() + round.points.latency.len(),
            round.points.min_delta()
        );

        ExperimentRecord {
            line: round.line,
            speedup,
            delay_size: round.delay_size,
            wall_time,
            delays,
            duration,
            selected_samples,
            arrival_speedup,
            min_delta: round.points.min_delta(),
        }
    }

    /// Doubles the experiment length when progress points moved too little,
    /// halves it when they moved plenty.
    pub fn adapt_length(&mut self, min_delta: Option<u64>) {
        let Some(delta) = min_delta else {
            return;
        };
        let engine = self.profiler.engine_config();
        if delta < engine.target_delta {
            self.experiment_length = (self.experiment_length * 2).min(engine.experiment_max_time);
        } else if delta > engine.target_delta * 2
            && self.experiment_length >= engine.experiment_min_time * 2
        {
            self.experiment_length /= 2;
        }
    }

    /// Sleeps for up to `length` nanoseconds in batch-period steps, draining
    /// samples after each step. Returns early on shutdown.
    pub fn idle(&mut self, length: u64) {
        let batch = self.profiler.engine_config().batch_period().max(1);
        let deadline = timer::now().saturating_add(length);
        while self.profiler.is_running() {
            self.profiler.drain_samples();
            let now = timer::now();
            if now >= deadline {
                break;
            }
            timer::nanosleep(batch.min(deadline - now));
        }
        self.profiler.drain_samples();
    }

    /// Writes the process runtime so far, then every line's sample count.
    fn log_samples(&mut self) {
        let runtime = timer::now().saturating_sub(self.profiler.start_time());
        self.emit(format_args!("runtime\ttime={runtime}"));
        let map = Arc::clone(&self.profiler);
        for (_, line) in map.source_map().lines() {
            let count = line.samples();
            if count > 0 {
                self.emit(format_args!("samples\tlocation={line}\tcount={count}"));
            }
        }
        self.flush();
    }

    fn line_samples(&self, line: LineId) -> u64 {
        self.profiler
            .source_map()
            .line(line)
            .map_or(0, crate::source_map::Line::samples)
    }

    fn line_name(&self, line: LineId) -> String {
        self.profiler
            .source_map()
            .line(line)
            .map_or_else(|| format!("<line {line}>"), ToString::to_string)
    }

    fn emit(&mut self, record: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{record}") {
            warning!("failed to write profile record: {}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            warning!("failed to flush profile: {}", e);
        }
    }
}
