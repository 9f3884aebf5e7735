//! Profiler configuration.
//!
//! Everything is read once from `CAUSA_*` environment variables at startup.
//! Embedders and tests build a [`Config`] directly instead.

use std::path::PathBuf;
use thiserror::Error;

/// Default experiment log path.
pub const DEFAULT_OUTPUT: &str = "profile.causa";

/// Scope pattern that names the main executable.
pub const MAIN_BINARY: &str = "MAIN";

/// Errors from parsing configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `CAUSA_FIXED_SPEEDUP` was not an integer in `0..=100`.
    #[error("fixed speedup must be an integer between 0 and 100, got {0:?}")]
    InvalidSpeedup(String),
    /// `CAUSA_SAMPLE_PERIOD_US` was not a positive integer.
    #[error("sample period must be a positive number of microseconds, got {0:?}")]
    InvalidPeriod(String),
}

/// Tuning for the experiment engine. All times are nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval between samples of a running thread.
    pub sample_period: u64,
    /// Signals per thread between delay reconciliations; also sets how often
    /// the controller drains sample rings.
    pub sample_batch_size: u32,
    /// Number of evenly spaced nonzero speedups.
    pub speedup_divisions: u64,
    /// Weight given to the zero-speedup outcome when drawing a delay size.
    pub zero_speedup_weight: u64,
    /// Shortest (and initial) experiment.
    pub experiment_min_time: u64,
    /// Longest experiment the adaptive length may reach.
    pub experiment_max_time: u64,
    /// Pause between experiments.
    pub cooloff: u64,
    /// Smallest progress-point delta an experiment should observe.
    pub target_delta: u64,
    /// Most delay one thread may be charged within a single experiment.
    pub max_delay_per_experiment: u64,
    /// Number of slots in the thread table.
    pub thread_capacity: usize,
    /// Number of distinct progress points of each kind.
    pub point_capacity: usize,
}

impl EngineConfig {
    /// Derives every period-relative constant from `sample_period`.
    #[must_use]
    pub const fn with_sample_period(sample_period: u64) -> Self {
        let batch = 10;
        let min_time = sample_period * batch * 50;
        Self {
            sample_period,
            sample_batch_size: batch as u32,
            speedup_divisions: 20,
            zero_speedup_weight: 7,
            experiment_min_time: min_time,
            experiment_max_time: min_time * 64,
            cooloff: sample_period * batch,
            target_delta: 5,
            max_delay_per_experiment: 2_000_000_000,
            thread_capacity: 1024,
            point_capacity: 1024,
        }
    }

    /// Time between controller drains of the sample rings.
    #[must_use]
    pub const fn batch_period(&self) -> u64 {
        self.sample_period * self.sample_batch_size as u64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_sample_period(1_000_000)
    }
}

/// Process-level profiler options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Experiment log destination, opened for append.
    pub output: PathBuf,
    /// Patterns over mapped object paths; [`MAIN_BINARY`] names the executable.
    pub binary_scope: Vec<String>,
    /// Patterns over source file paths.
    pub source_scope: Vec<String>,
    /// Throughput points registered at startup.
    pub progress_points: Vec<String>,
    /// `file:line` used for every experiment instead of sampled selection.
    pub fixed_line: Option<String>,
    /// Percent of the sample period used as the delay size for every experiment.
    pub fixed_speedup: Option<u8>,
    /// Run one experiment spanning the whole process.
    pub end_to_end: bool,
    /// Each experiment also draws a speedup for arrivals and inserts that
    /// share of every sample period as global delay.
    pub arrival_speedup: bool,
    pub verbose: bool,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            binary_scope: vec![MAIN_BINARY.to_string()],
            source_scope: vec!["%".to_string()],
            progress_points: Vec::new(),
            fixed_line: None,
            fixed_speedup: None,
            end_to_end: false,
            arrival_speedup: false,
            verbose: false,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Reads the `CAUSA_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric option cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric option cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(output) = lookup("CAUSA_OUTPUT").filter(|v| !v.is_empty()) {
            config.output = PathBuf::from(output);
        }
        if let Some(scope) = lookup("CAUSA_BINARY_SCOPE") {
            config.binary_scope = split_patterns(&scope);
        }
        if let Some(scope) = lookup("CAUSA_SOURCE_SCOPE") {
            config.source_scope = split_patterns(&scope);
        }
        if let Some(points) = lookup("CAUSA_PROGRESS_POINTS") {
            config.progress_points = split_patterns(&points);
        }
        config.fixed_line = lookup("CAUSA_FIXED_LINE").filter(|v| !v.is_empty());

        if let Some(raw) = lookup("CAUSA_FIXED_SPEEDUP").filter(|v| !v.is_empty()) {
            let pct = raw
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| ConfigError::InvalidSpeedup(raw.clone()))?;
            config.fixed_speedup = Some(pct);
        }

        config.end_to_end = lookup("CAUSA_END_TO_END").is_some_and(|v| v == "1");
        config.arrival_speedup = lookup("CAUSA_ARRIVAL_SPEEDUP").is_some_and(|v| v == "1");
        config.verbose = lookup("CAUSA_VERBOSE").is_some_and(|v| v == "1");

        if let Some(raw) = lookup("CAUSA_SAMPLE_PERIOD_US").filter(|v| !v.is_empty()) {
            let micros = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| ConfigError::InvalidPeriod(raw.clone()))?;
            config.engine = EngineConfig::with_sample_period(micros * 1000);
        }

        Ok(config)
    }

    /// Delay size for the configured fixed speedup, if any.
    #[must_use]
    pub fn fixed_delay_size(&self) -> Option<u64> {
        self.fixed_speedup
            .map(|pct| self.engine.sample_period * u64::from(pct) / 100)
    }
}

/// Splits a tab-separated pattern list, dropping empty entries.
fn split_patterns(raw: &str) -> Vec<String> {
    raw.split('\t')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Matches `text` against a pattern where `%` and `*` match any run of
/// characters. A pattern without wildcards must match exactly.
#[must_use]
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let (mut p, mut t) = (0, 0);
    // Position of the last wildcard and the text index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'%' || pattern[p] == b'*') {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((wp, wt)) = backtrack {
            p = wp + 1;
            t = wt + 1;
            backtrack = Some((wp, wt + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'%' || c == b'*')
}

/// Returns true if `text` matches any of `patterns`.
#[must_use]
pub fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|p| wildcard_match(p, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.engine.sample_period, 1_000_000);
        assert_eq!(config.engine.experiment_min_time, 500_000_000);
        assert_eq!(config.engine.cooloff, 10_000_000);
    }

    #[test]
    fn reads_all_options() {
        let config = Config::from_lookup(lookup(&[
            ("CAUSA_OUTPUT", "/tmp/out.causa"),
            ("CAUSA_BINARY_SCOPE", "MAIN\t%libfoo%"),
            ("CAUSA_SOURCE_SCOPE", "%/src/%"),
            ("CAUSA_PROGRESS_POINTS", "requests\tbatches"),
            ("CAUSA_FIXED_LINE", "main.rs:12"),
            ("CAUSA_FIXED_SPEEDUP", "25"),
            ("CAUSA_END_TO_END", "1"),
            ("CAUSA_ARRIVAL_SPEEDUP", "1"),
            ("CAUSA_SAMPLE_PERIOD_US", "500"),
        ]))
        .unwrap();

        assert_eq!(config.output, PathBuf::from("/tmp/out.causa"));
        assert_eq!(config.binary_scope, vec!["MAIN", "%libfoo%"]);
        assert_eq!(config.source_scope, vec!["%/src/%"]);
        assert_eq!(config.progress_points, vec!["requests", "batches"]);
        assert_eq!(config.fixed_line.as_deref(), Some("main.rs:12"));
        assert_eq!(config.fixed_speedup, Some(25));
        assert!(config.end_to_end);
        assert!(config.arrival_speedup);
        assert_eq!(config.engine.sample_period, 500_000);
        assert_eq!(config.fixed_delay_size(), Some(125_000));
    }

    #[test]
    fn rejects_out_of_range_speedup() {
        let err = Config::from_lookup(lookup(&[("CAUSA_FIXED_SPEEDUP", "150")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidSpeedup("150".to_string()));
    }

    #[test]
    fn rejects_zero_period() {
        let err = Config::from_lookup(lookup(&[("CAUSA_SAMPLE_PERIOD_US", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPeriod("0".to_string()));
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("%", ""));
        assert!(wildcard_match("%", "/anything/at/all.rs"));
        assert!(wildcard_match("%/src/%", "/home/me/proj/src/main.rs"));
        assert!(!wildcard_match("%/src/%", "/home/me/proj/benches/main.rs"));
        assert!(wildcard_match("*.rs", "lib.rs"));
        assert!(!wildcard_match("*.rs", "lib.c"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
        assert!(wildcard_match("a%b%c", "axxbyyc"));
        assert!(!wildcard_match("a%b%c", "axxbyy"));
    }
}
