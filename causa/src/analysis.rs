//! Offline analysis of experiment logs.
//!
//! Parses the tab-separated log written by the controller, aggregates every
//! experiment by (selected line, progress point, speedup), converts each
//! aggregate into a *progress speedup* relative to the zero-speedup baseline,
//! and fits a line through the results. The output is a [`Report`] that
//! `cargo causa report` prints as text, JSON or CSV.
//!
//! # Schema Versioning
//!
//! JSON reports carry [`SCHEMA_VERSION`]; bump it on breaking changes.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// Current schema version for JSON reports.
pub const SCHEMA_VERSION: u32 = 1;

/// Fewest visits (or arrivals) an aggregate needs to be trusted.
pub const MIN_DELTA: u64 = 5;

/// Errors from parsing an experiment log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: missing field `{field}` in {record} record")]
    MissingField {
        line: usize,
        record: String,
        field: &'static str,
    },
    #[error("line {line}: invalid value {value:?} for `{field}`")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: {record} record appears before any experiment")]
    OrphanPoint { line: usize, record: String },
}

/// A latency point measurement within one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRecord {
    pub name: String,
    pub arrivals: u64,
    pub departures: u64,
    pub difference: i64,
}

/// One `experiment` record and the point records that follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub selected: String,
    pub speedup: f64,
    pub duration: u64,
    pub selected_samples: u64,
    pub throughput: Vec<(String, u64)>,
    pub latency: Vec<LatencyRecord>,
}

/// Everything recovered from a log. Logs may hold several appended runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub experiments: Vec<ExperimentRecord>,
    /// Latest cumulative sample count per line.
    pub samples: BTreeMap<String, u64>,
    /// Runtime of every run added together, in nanoseconds. A run's runtime
    /// is the largest of its `runtime` records.
    pub runtime: u64,
    pub runs: usize,
}

struct Fields<'a> {
    line: usize,
    record: &'a str,
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn parse(line: usize, text: &'a str) -> Self {
        let mut parts = text.split('\t');
        let record = parts.next().unwrap_or_default();
        let pairs = parts.filter_map(|p| p.split_once('=')).collect();
        Self { line, record, pairs }
    }

    fn str(&self, field: &'static str) -> Result<&'a str, ParseError> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == field)
            .map(|(_, v)| *v)
            .ok_or_else(|| ParseError::MissingField {
                line: self.line,
                record: self.record.to_string(),
                field,
            })
    }

    fn num<T: std::str::FromStr>(&self, field: &'static str) -> Result<T, ParseError> {
        let raw = self.str(field)?;
        raw.trim().parse().map_err(|_| ParseError::InvalidNumber {
            line: self.line,
            field,
            value: raw.to_string(),
        })
    }
}

/// Parses a complete experiment log. Unknown record types are skipped.
///
/// # Errors
///
/// Returns an error for malformed `experiment`, point, `samples` or
/// `runtime` records.
pub fn parse_log(text: &str) -> Result<Profile, ParseError> {
    let mut profile = Profile::default();
    let mut run_runtime = 0u64;

    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let fields = Fields::parse(idx + 1, raw);
        match fields.record {
            "startup" => {
                profile.runtime = profile.runtime.saturating_add(run_runtime);
                run_runtime = 0;
                profile.runs += 1;
            }
            "experiment" => profile.experiments.push(ExperimentRecord {
                selected: fields.str("selected")?.to_string(),
                speedup: fields.num("speedup")?,
                duration: fields.num("duration")?,
                selected_samples: fields.num("selected-samples").unwrap_or(0),
                throughput: Vec::new(),
                latency: Vec::new(),
            }),
            "throughput-point" | "progress-point" => {
                let name = fields.str("name")?.to_string();
                let delta = fields.num("delta")?;
                current(&mut profile, &fields)?.throughput.push((name, delta));
            }
            "latency-point" => {
                let record = LatencyRecord {
                    name: fields.str("name")?.to_string(),
                    arrivals: fields.num("arrivals")?,
                    departures: fields.num("departures")?,
                    difference: fields.num("difference")?,
                };
                current(&mut profile, &fields)?.latency.push(record);
            }
            "samples" => {
                let location = fields.str("location")?.to_string();
                let count: u64 = fields.num("count")?;
                let entry = profile.samples.entry(location).or_default();
                *entry = (*entry).max(count);
            }
            "runtime" => run_runtime = run_runtime.max(fields.num("time")?),
            _ => {}
        }
    }

    profile.runtime = profile.runtime.saturating_add(run_runtime);
    Ok(profile)
}

fn current<'p>(
    profile: &'p mut Profile,
    fields: &Fields<'_>,
) -> Result<&'p mut ExperimentRecord, ParseError> {
    profile
        .experiments
        .last_mut()
        .ok_or_else(|| ParseError::OrphanPoint {
            line: fields.line,
            record: fields.record.to_string(),
        })
}

/// Aggregated measurements for one (line, point, speedup) cell.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Aggregate {
    Throughput { delta: u64, duration: u64 },
    Latency { arrivals: u64, departures: u64, difference: f64, duration: u64 },
}

impl Aggregate {
    fn has_enough_data(&self) -> bool {
        match *self {
            Self::Throughput { delta, .. } => delta >= MIN_DELTA,
            Self::Latency { arrivals, .. } => arrivals >= MIN_DELTA,
        }
    }

    /// Period between visits for throughput, mean latency (Little's law)
    /// for latency. Lower is better for both.
    #[allow(clippy::cast_precision_loss)]
    fn value(&self) -> Option<f64> {
        let value = match *self {
            Self::Throughput { delta, duration } => duration as f64 / delta as f64,
            Self::Latency {
                arrivals,
                difference,
                duration,
                ..
            } => {
                let rate = arrivals as f64 / duration as f64;
                difference / rate
            }
        };
        value.is_finite().then_some(value)
    }
}

/// Speedup in hundredths of a percent, used as an exact map key.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn speedup_key(speedup: f64) -> u32 {
    (speedup.max(0.0) * 10_000.0).round() as u32
}

type Cells = BTreeMap<String, BTreeMap<String, BTreeMap<u32, Aggregate>>>;

#[allow(clippy::cast_precision_loss)]
fn aggregate(profile: &Profile) -> Cells {
    let mut cells: Cells = BTreeMap::new();

    for exp in &profile.experiments {
        let by_point = cells.entry(exp.selected.clone()).or_default();
        let key = speedup_key(exp.speedup);

        for (name, delta) in &exp.throughput {
            let cell = by_point
                .entry(name.clone())
                .or_default()
                .entry(key)
                .or_insert(Aggregate::Throughput { delta: 0, duration: 0 });
            if let Aggregate::Throughput { delta: d, duration } = cell {
                *d = d.saturating_add(*delta);
                *duration = duration.saturating_add(exp.duration);
            }
        }

        for point in &exp.latency {
            let cell = by_point
                .entry(point.name.clone())
                .or_default()
                .entry(key)
                .or_insert(Aggregate::Latency {
                    arrivals: 0,
                    departures: 0,
                    difference: 0.0,
                    duration: 0,
                });
            if let Aggregate::Latency {
                arrivals,
                departures,
                difference,
                duration,
            } = cell
            {
                *arrivals = arrivals.saturating_add(point.arrivals);
                *departures = departures.saturating_add(point.departures);
                // duration-weighted running mean of the in-flight count
                if *duration == 0 {
                    *difference = point.difference as f64;
                } else {
                    let total = duration.saturating_add(exp.duration) as f64;
                    *difference *= *duration as f64 / total;
                    *difference += point.difference as f64 * exp.duration as f64 / total;
                }
                *duration = duration.saturating_add(exp.duration);
            }
        }
    }

    cells
}

/// Progress speedup observed at one line speedup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub speedup: f64,
    pub progress_speedup: f64,
}

/// Results from linear regression analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionResult {
    /// Progress speedup gained per unit of line speedup.
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination (R²). Ranges from 0 to 1.
    pub r_squared: f64,
    /// Standard error of the slope estimate.
    pub slope_std_error: f64,
    /// Lower bound of 95% confidence interval for slope.
    pub slope_ci_lower: f64,
    /// Upper bound of 95% confidence interval for slope.
    pub slope_ci_upper: f64,
    pub n: usize,
}

impl RegressionResult {
    /// Returns true if the 95% confidence interval excludes zero.
    #[must_use]
    pub fn is_significant(&self) -> bool {
        (self.slope_ci_lower > 0.0 && self.slope_ci_upper > 0.0)
            || (self.slope_ci_lower < 0.0 && self.slope_ci_upper < 0.0)
    }

    /// Returns true if the regression fit is good (R² > 0.7).
    #[must_use]
    pub fn has_good_fit(&self) -> bool {
        self.r_squared > 0.7
    }
}

/// Least-squares fit of progress speedup on line speedup.
///
/// Returns `None` with fewer than 3 points or when every speedup is equal.
#[must_use]
pub fn linear_regression(measurements: &[Measurement]) -> Option<RegressionResult> {
    let n = measurements.len();
    if n < 3 {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let n_f64 = n as f64;

    let mean_x = measurements.iter().map(|m| m.speedup).sum::<f64>() / n_f64;
    let mean_y = measurements.iter().map(|m| m.progress_speedup).sum::<f64>() / n_f64;

    let mut sum_sq_x = 0.0;
    let mut sum_sq_y = 0.0;
    let mut sum_cross = 0.0;
    for m in measurements {
        let dx = m.speedup - mean_x;
        let dy = m.progress_speedup - mean_y;
        sum_sq_x += dx * dx;
        sum_sq_y += dy * dy;
        sum_cross += dx * dy;
    }

    if sum_sq_x.abs() < f64::EPSILON {
        return None;
    }

    let slope = sum_cross / sum_sq_x;
    let intercept = mean_y - slope * mean_x;

    let r_squared = if sum_sq_y.abs() < f64::EPSILON {
        1.0
    } else {
        (slope * slope * sum_sq_x / sum_sq_y).min(1.0)
    };

    let resid_sum_sq: f64 = measurements
        .iter()
        .map(|m| {
            let residual = m.progress_speedup - (intercept + slope * m.speedup);
            residual * residual
        })
        .sum();

    let s = (resid_sum_sq / (n_f64 - 2.0)).sqrt();
    let slope_std_error = s / sum_sq_x.sqrt();
    let margin = t_critical_value_95(n - 2) * slope_std_error;

    Some(RegressionResult {
        slope,
        intercept,
        r_squared,
        slope_std_error,
        slope_ci_lower: slope - margin,
        slope_ci_upper: slope + margin,
        n,
    })
}

/// Two-tailed 95% critical value of Student's t distribution.
fn t_critical_value_95(df: usize) -> f64 {
    match df {
        0 => f64::INFINITY,
        1 => 12.706,
        2 => 4.303,
        3 => 3.182,
        4 => 2.776,
        5 => 2.571,
        6 => 2.447,
        7 => 2.365,
        8 => 2.306,
        9 => 2.262,
        10 => 2.228,
        11 => 2.201,
        12 => 2.179,
        13 => 2.160,
        14 => 2.145,
        15 => 2.131,
        16 => 2.120,
        17 => 2.110,
        18 => 2.101,
        19 => 2.093,
        20 => 2.086,
        21..=25 => 2.060,
        26..=30 => 2.042,
        31..=40 => 2.021,
        41..=60 => 2.000,
        61..=120 => 1.980,
        _ => 1.960,
    }
}

/// Largest trapezoid area under the speedup curve, divided by the speedup it
/// was measured up to. Measurements must be sorted by speedup.
#[must_use]
pub fn max_normalized_area(measurements: &[Measurement]) -> f64 {
    let mut area = 0.0;
    let mut best = 0.0_f64;
    for pair in measurements.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        area += (prev.progress_speedup + cur.progress_speedup) / 2.0 * (cur.speedup - prev.speedup);
        if cur.speedup > 0.0 {
            best = best.max(area / cur.speedup);
        }
    }
    best
}

/// Causal impact of one line on one progress point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointImpact {
    pub point: String,
    pub measurements: Vec<Measurement>,
    pub area: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regression: Option<RegressionResult>,
}

/// Causal impact of one line across all progress points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineImpact {
    pub line: String,
    pub points: Vec<PointImpact>,
}

impl LineImpact {
    /// Best normalized area across points.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.points.iter().map(|p| p.area).fold(0.0, f64::max)
    }

    /// Steepest fitted slope across points.
    #[must_use]
    pub fn slope(&self) -> f64 {
        self.points
            .iter()
            .filter_map(|p| p.regression.map(|r| r.slope))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Computes per-line causal impacts, ranked by area then slope.
///
/// A point contributes to a line only with a usable baseline and at least
/// `min_points` distinct speedups. Lines with no contributing point are left
/// out.
#[must_use]
pub fn analyze(profile: &Profile, min_points: usize) -> Vec<LineImpact> {
    let mut impacts: Vec<LineImpact> = aggregate(profile)
        .into_iter()
        .filter_map(|(line, by_point)| {
            let points: Vec<PointImpact> = by_point
                .into_iter()
                .filter_map(|(point, by_speedup)| point_impact(point, &by_speedup, min_points))
                .collect();
            (!points.is_empty()).then_some(LineImpact { line, points })
        })
        .collect();

    impacts.sort_by(|a, b| {
        b.area()
            .total_cmp(&a.area())
            .then_with(|| b.slope().total_cmp(&a.slope()))
            .then_with(|| a.line.cmp(&b.line))
    });
    impacts
}

#[allow(clippy::cast_precision_loss)]
fn point_impact(
    point: String,
    by_speedup: &BTreeMap<u32, Aggregate>,
    min_points: usize,
) -> Option<PointImpact> {
    let baseline = by_speedup.get(&0).filter(|b| b.has_enough_data())?;
    let baseline_value = baseline.value().filter(|v| *v != 0.0)?;

    let measurements: Vec<Measurement> = by_speedup
        .iter()
        .filter(|(_, cell)| cell.has_enough_data())
        .filter_map(|(key, cell)| {
            let value = cell.value()?;
            let progress_speedup = (baseline_value - value) / baseline_value;
            (-1.0..=2.0).contains(&progress_speedup).then_some(Measurement {
                speedup: f64::from(*key) / 10_000.0,
                progress_speedup,
            })
        })
        .collect();

    if measurements.len() < min_points.max(1) {
        return None;
    }

    Some(PointImpact {
        point,
        area: max_normalized_area(&measurements),
        regression: linear_regression(&measurements),
        measurements,
    })
}

/// Cumulative samples for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleCount {
    pub location: String,
    pub count: u64,
}

/// Complete analysis output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub schema_version: u32,
    pub profiler: &'static str,
    pub profiler_version: &'static str,
    pub runs: usize,
    pub experiments: usize,
    pub runtime_ns: u64,
    pub impacts: Vec<LineImpact>,
    /// Most-sampled lines first.
    pub samples: Vec<SampleCount>,
}

impl Report {
    /// Analyzes `profile`, keeping at most `top_samples` sample counts.
    #[must_use]
    pub fn new(profile: &Profile, min_points: usize, top_samples: usize) -> Self {
        let mut samples: Vec<SampleCount> = profile
            .samples
            .iter()
            .map(|(location, count)| SampleCount {
                location: location.clone(),
                count: *count,
            })
            .collect();
        samples.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.location.cmp(&b.location)));
        samples.truncate(top_samples);

        Self {
            schema_version: SCHEMA_VERSION,
            profiler: "causa",
            profiler_version: env!("CARGO_PKG_VERSION"),
            runs: profile.runs,
            experiments: profile.experiments.len(),
            runtime_ns: profile.runtime,
            impacts: analyze(profile, min_points),
            samples,
        }
    }

    /// Human-readable summary.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Causal Profile ===");
        let _ = writeln!(
            out,
            "{} experiments over {} run(s), {:.2}s of runtime\n",
            self.experiments,
            self.runs,
            nanos_to_secs(self.runtime_ns)
        );

        if self.impacts.is_empty() {
            let _ = writeln!(out, "No line has enough data yet.");
            let _ = writeln!(
                out,
                "Make sure a progress point is visited and the program runs for a few seconds."
            );
        }

        for (rank, impact) in self.impacts.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", rank + 1, impact.line);
            for point in &impact.points {
                let _ = write!(out, "     {:<24} area={:+.3}", point.point, point.area);
                if let Some(reg) = point.regression {
                    let _ = write!(
                        out,
                        "  slope={:+.3} [{:+.3}, {:+.3}] r2={:.2}{}",
                        reg.slope,
                        reg.slope_ci_lower,
                        reg.slope_ci_upper,
                        reg.r_squared,
                        if reg.is_significant() { " *" } else { "" }
                    );
                }
                let _ = writeln!(out);
            }
        }

        if !self.samples.is_empty() {
            let _ = writeln!(out, "\nMost sampled lines:");
            for s in &self.samples {
                let _ = writeln!(out, "  {:>8}  {}", s.count, s.location);
            }
        }
        out
    }

    /// One row per (line, point, speedup) measurement.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("line,point,speedup,progress_speedup,area,slope\n");
        for impact in &self.impacts {
            for point in &impact.points {
                let slope = point
                    .regression
                    .map(|r| r.slope.to_string())
                    .unwrap_or_default();
                for m in &point.measurements {
                    let _ = writeln!(
                        out,
                        "{},{},{},{},{},{}",
                        csv_field(&impact.line),
                        csv_field(&point.point),
                        m.speedup,
                        m.progress_speedup,
                        point.area,
                        slope
                    );
                }
            }
        }
        out
    }
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_secs(nanos: u64) -> f64 {
    nanos as f64 / 1e9
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment(selected: &str, speedup: f64, duration: u64, delta: u64) -> String {
        format!(
            "experiment\tselected={selected}\tspeedup={speedup:.2}\tduration={duration}\tselected-samples=3\n\
             throughput-point\tname=work\tdelta={delta}\n"
        )
    }

    fn m(speedup: f64, progress_speedup: f64) -> Measurement {
        Measurement {
            speedup,
            progress_speedup,
        }
    }

    #[test]
    fn parses_all_record_kinds() {
        let log = "startup\ttime=1\n\
                   info\tsample-period=1000000\tcounter-overhead=3\n\
                   start-speedup\ttime=5\tselected=a.rs:1\tdelay-size=500000\n\
                   end-speedup\ttime=9\tdelays=10\n\
                   experiment\tselected=a.rs:1\tspeedup=0.50\tduration=1000\tselected-samples=7\n\
                   throughput-point\tname=ops\tdelta=12\n\
                   latency-point\tname=req\tarrivals=8\tdepartures=6\tdifference=2\n\
                   samples\tlocation=a.rs:1\tcount=4\n\
                   samples\tlocation=a.rs:1\tcount=9\n\
                   runtime\ttime=2000\n\
                   shutdown\ttime=2001\n";
        let profile = parse_log(log).unwrap();

        assert_eq!(profile.runs, 1);
        assert_eq!(profile.runtime, 2000);
        assert_eq!(profile.samples.get("a.rs:1"), Some(&9));
        assert_eq!(profile.experiments.len(), 1);
        let exp = &profile.experiments[0];
        assert_eq!(exp.selected, "a.rs:1");
        assert!((exp.speedup - 0.5).abs() < f64::EPSILON);
        assert_eq!(exp.selected_samples, 7);
        assert_eq!(exp.throughput, vec![("ops".to_string(), 12)]);
        assert_eq!(
            exp.latency,
            vec![LatencyRecord {
                name: "req".into(),
                arrivals: 8,
                departures: 6,
                difference: 2
            }]
        );
    }

    #[test]
    fn runtime_takes_the_latest_record_of_each_run() {
        let log = "startup\ttime=1\n\
                   runtime\ttime=500\n\
                   runtime\ttime=900\n\
                   shutdown\ttime=901\n\
                   startup\ttime=2\n\
                   runtime\ttime=100\n";
        let profile = parse_log(log).unwrap();
        assert_eq!(profile.runs, 2);
        assert_eq!(profile.runtime, 1_000);
    }

    #[test]
    fn huge_values_saturate_instead_of_overflowing() {
        let max = u64::MAX;
        let log = format!(
            "startup\ttime=1\nruntime\ttime={max}\n\
             startup\ttime=2\nruntime\ttime={max}\n\
             {}{}",
            experiment("a.rs:1", 0.0, max, max),
            experiment("a.rs:1", 0.0, max, max),
        );
        let profile = parse_log(&log).unwrap();
        assert_eq!(profile.runtime, max);

        let cells = aggregate(&profile);
        assert_eq!(
            cells["a.rs:1"]["work"][&0u32],
            Aggregate::Throughput {
                delta: max,
                duration: max
            }
        );
    }

    #[test]
    fn point_before_experiment_is_an_error() {
        let err = parse_log("throughput-point\tname=x\tdelta=1\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::OrphanPoint {
                line: 1,
                record: "throughput-point".into()
            }
        );
    }

    #[test]
    fn bad_numbers_report_their_line() {
        let err = parse_log("startup\ttime=0\nexperiment\tselected=a\tspeedup=x\tduration=1\n")
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                line: 2,
                field: "speedup",
                value: "x".into()
            }
        );
    }

    #[test]
    fn throughput_progress_speedup_follows_period() {
        // baseline: 100 visits per 1000ns; at 50% speedup: 125 visits per 1000ns
        let log = [
            experiment("a.rs:1", 0.0, 1000, 100),
            experiment("a.rs:1", 0.5, 1000, 125),
        ]
        .concat();
        let impacts = analyze(&parse_log(&log).unwrap(), 2);

        assert_eq!(impacts.len(), 1);
        let point = &impacts[0].points[0];
        assert_eq!(point.point, "work");
        assert_eq!(point.measurements.len(), 2);
        // period 10 -> 8 is a 20% progress speedup
        assert!((point.measurements[1].progress_speedup - 0.2).abs() < 1e-9);
        assert!(point.regression.is_none());
    }

    #[test]
    fn aggregates_repeated_speedups() {
        let log = [
            experiment("a.rs:1", 0.0, 500, 50),
            experiment("a.rs:1", 0.0, 500, 50),
            experiment("a.rs:1", 0.25, 1000, 100),
        ]
        .concat();
        let impacts = analyze(&parse_log(&log).unwrap(), 2);
        let point = &impacts[0].points[0];
        assert!((point.measurements[0].progress_speedup).abs() < 1e-9);
        assert!((point.measurements[1].progress_speedup).abs() < 1e-9);
    }

    #[test]
    fn sparse_and_baseline_free_points_are_dropped() {
        let log = [
            experiment("a.rs:1", 0.0, 1000, 3),
            experiment("a.rs:1", 0.5, 1000, 100),
            experiment("b.rs:2", 0.5, 1000, 100),
        ]
        .concat();
        assert!(analyze(&parse_log(&log).unwrap(), 1).is_empty());
    }

    #[test]
    fn latency_is_minimized() {
        // baseline: 10 arrivals over 1000ns with 2 in flight -> latency 200
        // sped up: 10 arrivals over 1000ns with 1 in flight -> latency 100
        let log = "experiment\tselected=a.rs:1\tspeedup=0.00\tduration=1000\n\
                   latency-point\tname=req\tarrivals=10\tdepartures=8\tdifference=2\n\
                   experiment\tselected=a.rs:1\tspeedup=0.40\tduration=1000\n\
                   latency-point\tname=req\tarrivals=10\tdepartures=9\tdifference=1\n";
        let impacts = analyze(&parse_log(log).unwrap(), 2);
        let measurement = impacts[0].points[0].measurements[1];
        assert!((measurement.progress_speedup - 0.5).abs() < 1e-9);
    }

    #[test]
    fn latency_difference_is_duration_weighted() {
        let log = "experiment\tselected=a\tspeedup=0.00\tduration=1000\n\
                   latency-point\tname=req\tarrivals=10\tdepartures=8\tdifference=2\n\
                   experiment\tselected=a\tspeedup=0.00\tduration=3000\n\
                   latency-point\tname=req\tarrivals=30\tdepartures=26\tdifference=6\n";
        let cells = aggregate(&parse_log(log).unwrap());
        let cell = cells["a"]["req"][&0];
        let Aggregate::Latency { difference, duration, arrivals, .. } = cell else {
            panic!("expected latency aggregate");
        };
        assert_eq!(duration, 4000);
        assert_eq!(arrivals, 40);
        assert!((difference - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ranks_by_area() {
        let mut log = String::new();
        for (speedup, fast, slow) in [(0.0, 100, 100), (0.25, 125, 101), (0.5, 150, 100)] {
            log += &experiment("fast.rs:1", speedup, 1000, fast);
            log += &experiment("slow.rs:1", speedup, 1000, slow);
        }
        let impacts = analyze(&parse_log(&log).unwrap(), 3);
        assert_eq!(impacts.len(), 2);
        assert_eq!(impacts[0].line, "fast.rs:1");
        assert!(impacts[0].slope() > impacts[1].slope());
    }

    #[test]
    fn normalized_area_of_straight_line() {
        let area = max_normalized_area(&[m(0.0, 0.0), m(0.5, 0.25), m(1.0, 0.5)]);
        assert!((area - 0.25).abs() < 1e-9);
        assert!(max_normalized_area(&[m(0.0, 0.0)]).abs() < f64::EPSILON);
    }

    #[test]
    fn regression_needs_three_points() {
        assert!(linear_regression(&[m(0.0, 0.0), m(1.0, 0.5)]).is_none());
        assert!(linear_regression(&[m(0.0, 0.0), m(0.5, 0.25), m(1.0, 0.5)]).is_some());
    }

    #[test]
    fn regression_rejects_identical_speedups() {
        assert!(linear_regression(&[m(0.5, 0.0), m(0.5, 0.1), m(0.5, 0.2)]).is_none());
    }

    #[test]
    fn significant_positive_slope() {
        let reg = linear_regression(&[
            m(0.0, 0.0),
            m(0.25, 0.12),
            m(0.5, 0.25),
            m(0.75, 0.37),
            m(1.0, 0.5),
        ])
        .unwrap();
        assert!(reg.slope > 0.0);
        assert!(reg.is_significant());
        assert!(reg.has_good_fit());
    }

    #[test]
    fn flat_data_has_zero_slope() {
        let reg = linear_regression(&[m(0.0, 0.1), m(0.5, 0.1), m(1.0, 0.1)]).unwrap();
        assert!(reg.slope.abs() < 1e-9);
        assert!((reg.r_squared - 1.0).abs() < 1e-9);
    }

    #[test]
    fn t_critical_decreases_with_df() {
        assert!(t_critical_value_95(5) > t_critical_value_95(10));
        assert!(t_critical_value_95(10) > t_critical_value_95(20));
        assert!(t_critical_value_95(20) > t_critical_value_95(100));
    }

    #[test]
    fn report_renders_every_format() {
        let mut log = String::from("startup\ttime=0\n");
        for (speedup, delta) in [(0.0, 100), (0.25, 110), (0.5, 125)] {
            log += &experiment("src/main.rs:7", speedup, 1000, delta);
        }
        log += "samples\tlocation=src/main.rs:7\tcount=40\nruntime\ttime=3000000000\n";
        let report = Report::new(&parse_log(&log).unwrap(), 3, 10);

        assert_eq!(report.schema_version, SCHEMA_VERSION);
        assert_eq!(report.experiments, 3);
        assert_eq!(report.impacts.len(), 1);

        let text = report.to_text();
        assert!(text.contains("1. src/main.rs:7"));
        assert!(text.contains("40  src/main.rs:7"));

        let csv = report.to_csv();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.starts_with("line,point,speedup"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["impacts"][0]["line"], "src/main.rs:7");
        assert_eq!(json["impacts"][0]["points"][0]["measurements"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn csv_quotes_awkward_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
