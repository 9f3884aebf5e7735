//! Progress points: named counters the application bumps to report useful work.
//!
//! A throughput point counts completed units of work. A latency point counts
//! arrivals (`begin`) and departures (`end`) separately so the number of
//! operations in flight can be derived. Points are created on first lookup,
//! live as long as the registry, and are only ever read as a delta since a
//! [saved](ThroughputPoint::save) snapshot.

use crate::timer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic visit counter with a stable address.
///
/// The layout is a single `u64` so C callers can increment it in place.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CounterCell {
    count: AtomicU64,
}

impl CounterCell {
    #[inline]
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn as_ptr(&self) -> *const AtomicU64 {
        &raw const self.count
    }
}

/// Counts completed units of work.
#[derive(Debug)]
pub struct ThroughputPoint {
    name: String,
    visits: CounterCell,
}

impl ThroughputPoint {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visits: CounterCell::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records `n` visits.
    #[inline]
    pub fn visit(&self, n: u64) {
        self.visits.add(n);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.visits.get()
    }

    pub(crate) fn cell(&self) -> &CounterCell {
        &self.visits
    }

    /// Snapshots the current count.
    #[must_use]
    pub fn save(self: &Arc<Self>) -> SavedThroughput {
        SavedThroughput {
            start: self.count(),
            point: Arc::clone(self),
        }
    }
}

/// Counts arrivals and departures of a paired operation.
#[derive(Debug)]
pub struct LatencyPoint {
    name: String,
    begins: CounterCell,
    ends: CounterCell,
}

impl LatencyPoint {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            begins: CounterCell::default(),
            ends: CounterCell::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn visit_begin(&self, n: u64) {
        self.begins.add(n);
    }

    #[inline]
    pub fn visit_end(&self, n: u64) {
        self.ends.add(n);
    }

    #[must_use]
    pub fn begin_count(&self) -> u64 {
        self.begins.get()
    }

    #[must_use]
    pub fn end_count(&self) -> u64 {
        self.ends.get()
    }

    pub(crate) fn begin_cell(&self) -> &CounterCell {
        &self.begins
    }

    pub(crate) fn end_cell(&self) -> &CounterCell {
        &self.ends
    }

    #[must_use]
    pub fn save(self: &Arc<Self>) -> SavedLatency {
        SavedLatency {
            begin_start: self.begin_count(),
            end_start: self.end_count(),
            point: Arc::clone(self),
        }
    }
}

/// Throughput count at the start of an experiment.
#[derive(Debug)]
pub struct SavedThroughput {
    point: Arc<ThroughputPoint>,
    start: u64,
}

impl SavedThroughput {
    /// Visits since the snapshot.
    #[must_use]
    pub fn delta(&self) -> u64 {
        self.point.count().wrapping_sub(self.start)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.point.name()
    }
}

impl fmt::Display for SavedThroughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throughput-point\tname={}\tdelta={}", self.name(), self.delta())
    }
}

/// Latency counts at the start of an experiment.
#[derive(Debug)]
pub struct SavedLatency {
    point: Arc<LatencyPoint>,
    begin_start: u64,
    end_start: u64,
}

impl SavedLatency {
    #[must_use]
    pub fn begin_delta(&self) -> u64 {
        self.point.begin_count().wrapping_sub(self.begin_start)
    }

    #[must_use]
    pub fn end_delta(&self) -> u64 {
        self.point.end_count().wrapping_sub(self.end_start)
    }

    /// Operations in flight at the end of the experiment: total arrivals
    /// minus total departures, as a signed value since departures may lead.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn difference(&self) -> i64 {
        self.point.begin_count().wrapping_sub(self.point.end_count()) as i64
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.point.name()
    }
}

impl fmt::Display for SavedLatency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "latency-point\tname={}\tarrivals={}\tdepartures={}\tdifference={}",
            self.name(),
            self.begin_delta(),
            self.end_delta(),
            self.difference()
        )
    }
}

/// Snapshots of every registered point, taken together.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub throughput: Vec<SavedThroughput>,
    pub latency: Vec<SavedLatency>,
}

impl Snapshot {
    /// The smallest delta across all points, or `None` if there are no points.
    #[must_use]
    pub fn min_delta(&self) -> Option<u64> {
        let throughput = self.throughput.iter().map(SavedThroughput::delta);
        let latency = self
            .latency
            .iter()
            .flat_map(|s| [s.begin_delta(), s.end_delta()]);
        throughput.chain(latency).min()
    }
}

/// Name-keyed store of progress points.
///
/// Insertions happen once per name; hot-path callers cache the returned `Arc`
/// (see [`Counter`]), so a spinlock around the maps is enough.
#[derive(Debug)]
pub struct ProgressRegistry {
    throughput: spin::Mutex<BTreeMap<String, Arc<ThroughputPoint>>>,
    latency: spin::Mutex<BTreeMap<String, Arc<LatencyPoint>>>,
    capacity: usize,
}

impl ProgressRegistry {
    /// Creates a registry holding at most `capacity` points of each kind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            throughput: spin::Mutex::new(BTreeMap::new()),
            latency: spin::Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Returns the throughput point called `name`, creating it if needed.
    ///
    /// Returns `None` with a warning when the registry is full.
    pub fn throughput(&self, name: &str) -> Option<Arc<ThroughputPoint>> {
        let mut points = self.throughput.lock();
        if let Some(point) = points.get(name) {
            return Some(Arc::clone(point));
        }
        if points.len() >= self.capacity {
            drop(points);
            warning!("progress point limit reached; ignoring throughput point {}", name);
            return None;
        }
        let point = Arc::new(ThroughputPoint::new(name));
        points.insert(name.to_string(), Arc::clone(&point));
        Some(point)
    }

    /// Returns the latency point called `name`, creating it if needed.
    ///
    /// Returns `None` with a warning when the registry is full.
    pub fn latency(&self, name: &str) -> Option<Arc<LatencyPoint>> {
        let mut points = self.latency.lock();
        if let Some(point) = points.get(name) {
            return Some(Arc::clone(point));
        }
        if points.len() >= self.capacity {
            drop(points);
            warning!("progress point limit reached; ignoring latency point {}", name);
            return None;
        }
        let point = Arc::new(LatencyPoint::new(name));
        points.insert(name.to_string(), Arc::clone(&point));
        Some(point)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.throughput.lock().is_empty() && self.latency.lock().is_empty()
    }

    /// Snapshots every registered point.
    #[must_use]
    pub fn save(&self) -> Snapshot {
        let throughput = self.throughput.lock().values().map(ThroughputPoint::save).collect();
        let latency = self.latency.lock().values().map(LatencyPoint::save).collect();
        Snapshot { throughput, latency }
    }
}

/// Measures the cost of one throughput visit in nanoseconds.
pub(crate) fn calibrate_visit_overhead() -> u64 {
    const ROUNDS: u64 = 100_000;
    let point = ThroughputPoint::new("calibration");
    let start = timer::now();
    for _ in 0..ROUNDS {
        point.visit(std::hint::black_box(1));
    }
    timer::now().saturating_sub(start) / ROUNDS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterKind {
    Throughput,
    Begin,
    End,
}

#[derive(Debug)]
enum CounterTarget {
    Throughput(Arc<ThroughputPoint>),
    Latency(Arc<LatencyPoint>),
}

/// A call-site handle used by the instrumentation macros.
///
/// The point is looked up in the installed profiler on first use and cached.
/// Visits before the profiler is installed are dropped and not cached, so
/// a call site that runs before `causa::init` starts counting afterwards.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    kind: CounterKind,
    target: spin::Once<Option<CounterTarget>>,
}

impl Counter {
    #[must_use]
    pub const fn throughput(name: &'static str) -> Self {
        Self::new(name, CounterKind::Throughput)
    }

    #[must_use]
    pub const fn begin(name: &'static str) -> Self {
        Self::new(name, CounterKind::Begin)
    }

    #[must_use]
    pub const fn end(name: &'static str) -> Self {
        Self::new(name, CounterKind::End)
    }

    const fn new(name: &'static str, kind: CounterKind) -> Self {
        Self {
            name,
            kind,
            target: spin::Once::new(),
        }
    }

    /// Records one visit of this counter's kind.
    #[inline]
    pub fn visit(&self) {
        let Some(target) = self.target() else {
            return;
        };
        match (target, self.kind) {
            (CounterTarget::Throughput(point), _) => point.visit(1),
            (CounterTarget::Latency(point), CounterKind::Begin) => point.visit_begin(1),
            (CounterTarget::Latency(point), _) => point.visit_end(1),
        }
    }

    fn target(&self) -> Option<&CounterTarget> {
        if let Some(cached) = self.target.get() {
            return cached.as_ref();
        }
        let profiler = crate::instance()?;
        self.target
            .call_once(|| match self.kind {
                CounterKind::Throughput => profiler
                    .progress()
                    .throughput(self.name)
                    .map(CounterTarget::Throughput),
                CounterKind::Begin | CounterKind::End => profiler
                    .progress()
                    .latency(self.name)
                    .map(CounterTarget::Latency),
            })
            .as_ref()
    }
}

/// Visits an end counter when dropped. Created by [`scope!`](crate::scope).
#[derive(Debug)]
pub struct ScopeGuard {
    end: &'static Counter,
}

impl ScopeGuard {
    #[must_use]
    pub fn new(end: &'static Counter) -> Self {
        Self { end }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.end.visit();
    }
}

/// Records a visit to a throughput point.
///
/// Without a name the point is named after the call site (`file:line`).
/// Names must be string literals or `&'static str` constants.
///
/// ```ignore
/// causa::progress!("request_done");
/// causa::progress!();
/// ```
#[macro_export]
macro_rules! progress {
    () => {
        $crate::progress!(concat!(file!(), ":", line!()))
    };
    ($name:expr) => {{
        static COUNTER: $crate::progress_point::Counter =
            $crate::progress_point::Counter::throughput($name);
        COUNTER.visit();
    }};
}

/// Records an arrival at a latency point.
#[macro_export]
macro_rules! begin {
    ($name:expr) => {{
        static COUNTER: $crate::progress_point::Counter =
            $crate::progress_point::Counter::begin($name);
        COUNTER.visit();
    }};
}

/// Records a departure from a latency point.
#[macro_export]
macro_rules! end {
    ($name:expr) => {{
        static COUNTER: $crate::progress_point::Counter =
            $crate::progress_point::Counter::end($name);
        COUNTER.visit();
    }};
}

/// Records an arrival now and the matching departure when the enclosing
/// scope ends.
#[macro_export]
macro_rules! scope {
    ($name:expr) => {
        $crate::begin!($name);
        let _causa_scope = {
            static COUNTER: $crate::progress_point::Counter =
                $crate::progress_point::Counter::end($name);
            $crate::progress_point::ScopeGuard::new(&COUNTER)
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_delta_counts_visits_since_save() {
        let point = Arc::new(ThroughputPoint::new("work"));
        point.visit(3);
        let saved = point.save();
        assert_eq!(saved.delta(), 0);
        point.visit(1);
        point.visit(4);
        assert_eq!(saved.delta(), 5);
        assert_eq!(saved.to_string(), "throughput-point\tname=work\tdelta=5");
    }

    #[test]
    fn latency_tracks_arrivals_and_departures() {
        let point = Arc::new(LatencyPoint::new("request"));
        point.visit_begin(2);
        point.visit_end(1);
        let saved = point.save();
        point.visit_begin(5);
        point.visit_end(3);

        assert_eq!(saved.begin_delta(), 5);
        assert_eq!(saved.end_delta(), 3);
        // 7 arrivals, 4 departures in total
        assert_eq!(saved.difference(), 3);
        assert_eq!(
            saved.to_string(),
            "latency-point\tname=request\tarrivals=5\tdepartures=3\tdifference=3"
        );
    }

    #[test]
    fn registry_returns_same_point_for_same_name() {
        let registry = ProgressRegistry::new(8);
        let a = registry.throughput("x").unwrap();
        let b = registry.throughput("x").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!registry.is_empty());
    }

    #[test]
    fn registry_refuses_points_beyond_capacity() {
        let registry = ProgressRegistry::new(2);
        assert!(registry.throughput("a").is_some());
        assert!(registry.throughput("b").is_some());
        assert!(registry.throughput("c").is_none());
        // existing names still resolve
        assert!(registry.throughput("a").is_some());
        // the latency map has its own budget
        assert!(registry.latency("c").is_some());
    }

    #[test]
    fn snapshot_min_delta_covers_both_kinds() {
        let registry = ProgressRegistry::new(8);
        let t = registry.throughput("t").unwrap();
        let l = registry.latency("l").unwrap();
        assert_eq!(registry.save().min_delta(), Some(0));

        let snapshot = registry.save();
        t.visit(10);
        l.visit_begin(4);
        l.visit_end(2);
        assert_eq!(snapshot.min_delta(), Some(2));
    }

    #[test]
    fn empty_snapshot_has_no_min_delta() {
        assert_eq!(ProgressRegistry::new(4).save().min_delta(), None);
    }

    #[test]
    fn counter_without_profiler_is_a_no_op() {
        static COUNTER: Counter = Counter::throughput("nobody-home");
        COUNTER.visit();
        if crate::instance().is_none() {
            assert!(COUNTER.target.get().is_none());
        }
    }

    #[test]
    fn visit_overhead_is_small() {
        assert!(calibrate_visit_overhead() < 1_000);
    }
}
