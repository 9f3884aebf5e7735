//! Mapping from instruction addresses to source lines.
//!
//! The map is built once at startup (see [`crate::loader`]) and never changes
//! afterwards, so lookups from the controller thread need no locking. Each
//! [`Line`] carries a relaxed sample counter.

use crate::sampler::Sample;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Index of a line within its [`SourceMap`].
pub type LineId = usize;

/// Source files under this prefix belong to the profiler itself.
const INTERNAL_PREFIX: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/");

/// A source line that samples can be attributed to.
#[derive(Debug)]
pub struct Line {
    file: Arc<str>,
    line: u32,
    samples: AtomicU64,
    internal: bool,
}

impl Line {
    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// True if the line is part of the profiler's own code.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn add_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: usize,
    end: usize,
    line: LineId,
}

/// Immutable address-range table over a set of lines.
#[derive(Debug, Default)]
pub struct SourceMap {
    lines: Vec<Line>,
    ranges: Vec<Range>,
    names: HashMap<(Arc<str>, u32), LineId>,
}

impl SourceMap {
    /// Line containing `addr`, if any.
    #[must_use]
    pub fn find_line(&self, addr: usize) -> Option<LineId> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr < range.end).then_some(range.line)
    }

    #[must_use]
    pub fn line(&self, id: LineId) -> Option<&Line> {
        self.lines.get(id)
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineId, &Line)> {
        self.lines.iter().enumerate()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Looks up a line by `file:line`.
    ///
    /// The file may be the full recorded path or any suffix of it that starts
    /// at a path component, so `src/main.rs:10` finds `/work/app/src/main.rs:10`.
    #[must_use]
    pub fn find_line_by_name(&self, name: &str) -> Option<LineId> {
        let (file, line) = name.rsplit_once(':')?;
        let line: u32 = line.trim().parse().ok()?;

        if let Some(id) = self.names.get(&(Arc::from(file), line)) {
            return Some(*id);
        }

        self.names
            .iter()
            .filter(|((path, l), _)| *l == line && is_path_suffix(path, file))
            .map(|(_, id)| *id)
            .min()
    }

    /// Attributes a sample to a line.
    ///
    /// The sampled instruction pointer wins if it resolves to a line outside
    /// the profiler. Otherwise the call chain is walked, resolving each return
    /// address one byte back so it falls inside the calling instruction.
    #[must_use]
    pub fn resolve(&self, sample: &Sample) -> Option<LineId> {
        if let Some(id) = self.find_line(sample.ip) {
            if !self.lines[id].internal {
                return Some(id);
            }
        }

        sample
            .callchain()
            .iter()
            .filter(|ret| **ret != 0)
            .filter_map(|ret| self.find_line(ret - 1))
            .find(|id| !self.lines[*id].internal)
    }
}

fn is_path_suffix(path: &str, suffix: &str) -> bool {
    path.strip_suffix(suffix)
        .is_some_and(|head| head.is_empty() || head.ends_with('/'))
}

/// Accumulates address ranges and builds a [`SourceMap`].
#[derive(Debug, Default)]
pub struct SourceMapBuilder {
    lines: Vec<Line>,
    ranges: Vec<Range>,
    names: HashMap<(Arc<str>, u32), LineId>,
}

impl SourceMapBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `[start, end)` holds code from `file:line`.
    pub fn add_range(&mut self, start: usize, end: usize, file: &str, line: u32) {
        let internal = file.starts_with(INTERNAL_PREFIX);
        self.push(start, end, file, line, internal);
    }

    /// Like [`add_range`](Self::add_range) but marks the line as internal.
    pub fn add_internal_range(&mut self, start: usize, end: usize, file: &str, line: u32) {
        self.push(start, end, file, line, true);
    }

    fn push(&mut self, start: usize, end: usize, file: &str, line: u32, internal: bool) {
        if end <= start {
            return;
        }
        let id = self.line_id(file, line, internal);
        self.ranges.push(Range { start, end, line: id });
    }

    fn line_id(&mut self, file: &str, line: u32, internal: bool) -> LineId {
        let key = (Arc::<str>::from(file), line);
        if let Some(id) = self.names.get(&key) {
            return *id;
        }
        let id = self.lines.len();
        self.lines.push(Line {
            file: Arc::clone(&key.0),
            line,
            samples: AtomicU64::new(0),
            internal,
        });
        self.names.insert(key, id);
        id
    }

    /// Sorts the ranges and clips overlaps so every address maps to at most
    /// one line. Earlier-starting ranges keep the overlapping part.
    #[must_use]
    pub fn build(mut self) -> SourceMap {
        self.ranges.sort_by_key(|r| (r.start, r.end));

        let mut ranges: Vec<Range> = Vec::with_capacity(self.ranges.len());
        for mut range in self.ranges {
            if let Some(prev) = ranges.last() {
                if range.start < prev.end {
                    range.start = prev.end;
                }
            }
            if range.start < range.end {
                ranges.push(range);
            }
        }

        SourceMap {
            lines: self.lines,
            ranges,
            names: self.names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ip: usize, chain: &[usize]) -> Sample {
        let mut sample = Sample::new(ip);
        for ret in chain {
            sample.push_return(*ret);
        }
        sample
    }

    fn map() -> SourceMap {
        let mut builder = SourceMapBuilder::new();
        builder.add_range(0x1000, 0x1010, "/app/src/main.rs", 10);
        builder.add_range(0x1010, 0x1020, "/app/src/main.rs", 11);
        builder.add_range(0x1020, 0x1030, "/app/src/main.rs", 10);
        builder.add_range(0x2000, 0x2100, "/app/src/worker.rs", 5);
        builder.add_internal_range(0x3000, 0x3100, "/deps/causa/src/progress_point.rs", 400);
        builder.build()
    }

    #[test]
    fn finds_lines_by_address() {
        let map = map();
        assert_eq!(map.len(), 4);
        let ten = map.find_line(0x1000).unwrap();
        assert_eq!(map.find_line(0x100f), Some(ten));
        assert_eq!(map.find_line(0x1025), Some(ten));
        assert_eq!(map.line(ten).unwrap().to_string(), "/app/src/main.rs:10");
        assert_ne!(map.find_line(0x1010), Some(ten));
        assert_eq!(map.find_line(0x0fff), None);
        assert_eq!(map.find_line(0x1030), None);
        assert_eq!(map.find_line(0x2100), None);
    }

    #[test]
    fn overlapping_ranges_are_clipped() {
        let mut builder = SourceMapBuilder::new();
        builder.add_range(0x100, 0x200, "a.rs", 1);
        builder.add_range(0x180, 0x280, "b.rs", 2);
        let map = builder.build();
        let a = map.find_line(0x1ff).unwrap();
        let b = map.find_line(0x200).unwrap();
        assert_eq!(map.line(a).unwrap().file(), "a.rs");
        assert_eq!(map.line(b).unwrap().file(), "b.rs");
    }

    #[test]
    fn finds_lines_by_name_and_suffix() {
        let map = map();
        let full = map.find_line_by_name("/app/src/worker.rs:5").unwrap();
        assert_eq!(map.find_line_by_name("src/worker.rs:5"), Some(full));
        assert_eq!(map.find_line_by_name("worker.rs:5"), Some(full));
        assert_eq!(map.find_line_by_name("orker.rs:5"), None);
        assert_eq!(map.find_line_by_name("worker.rs:6"), None);
        assert_eq!(map.find_line_by_name("worker.rs"), None);
    }

    #[test]
    fn resolve_prefers_ip_then_walks_callchain() {
        let map = map();
        let main = map.find_line(0x1000).unwrap();
        let worker = map.find_line(0x2000).unwrap();

        assert_eq!(map.resolve(&sample(0x2050, &[0x1001])), Some(worker));
        // unresolved ip falls back to the caller
        assert_eq!(map.resolve(&sample(0x9000, &[0x1001])), Some(main));
        // internal ip is skipped
        assert_eq!(map.resolve(&sample(0x3050, &[0x2001])), Some(worker));
        // a return address at the start of a range belongs to the previous instruction
        assert_eq!(map.resolve(&sample(0x9000, &[0x2000])), None);
        assert_eq!(map.resolve(&sample(0x9000, &[])), None);
    }

    #[test]
    fn lines_count_samples() {
        let map = map();
        let line = map.line(0).unwrap();
        line.add_sample();
        line.add_sample();
        assert_eq!(line.samples(), 2);
        assert!(!line.is_internal());
    }

    #[test]
    fn own_sources_are_internal() {
        let mut builder = SourceMapBuilder::new();
        builder.add_range(0x10, 0x20, &format!("{INTERNAL_PREFIX}lib.rs"), 1);
        let map = builder.build();
        assert!(map.line(0).unwrap().is_internal());
    }
}
