//! Builds the [`SourceMap`] from the objects mapped into this process.
//!
//! Executable mappings are read from `/proc/self/maps`, filtered by binary
//! scope, and their DWARF line tables are walked with `addr2line`. Only rows
//! whose source file is in scope become lines.

use crate::config::{matches_any, Config, MAIN_BINARY};
use crate::source_map::{SourceMap, SourceMapBuilder};
use addr2line::object::{self, Object, ObjectKind, ObjectSection, ObjectSegment, SectionKind};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading debug information.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read /proc/self/maps: {0}")]
    Maps(#[source] std::io::Error),
    #[error("failed to map {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Object {
        path: PathBuf,
        #[source]
        source: object::Error,
    },
    #[error("failed to read debug info in {path}: {source}")]
    Dwarf {
        path: PathBuf,
        #[source]
        source: addr2line::gimli::Error,
    },
}

/// An object file mapped executable into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedObject {
    pub path: PathBuf,
    /// Lowest address mapped at file offset zero.
    pub base: usize,
}

/// Extracts executable file-backed objects from `/proc/<pid>/maps` text.
#[must_use]
pub fn parse_maps(text: &str) -> Vec<MappedObject> {
    #[derive(Default)]
    struct Entry {
        executable: bool,
        base: Option<usize>,
    }

    let mut objects: BTreeMap<&str, Entry> = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms), Some(offset), Some(_dev), Some(_inode), Some(path)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let Some(start) = range
            .split_once('-')
            .and_then(|(s, _)| usize::from_str_radix(s, 16).ok())
        else {
            continue;
        };

        let entry = objects.entry(path).or_default();
        entry.executable |= perms.contains('x');
        if u64::from_str_radix(offset, 16) == Ok(0) {
            entry.base = Some(entry.base.map_or(start, |b| b.min(start)));
        }
    }

    objects
        .into_iter()
        .filter(|(_, e)| e.executable)
        .filter_map(|(path, e)| {
            e.base.map(|base| MappedObject {
                path: PathBuf::from(path),
                base,
            })
        })
        .collect()
}

/// True if `path` is selected by the binary scope patterns.
fn in_binary_scope(patterns: &[String], path: &Path, main: Option<&Path>) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == MAIN_BINARY {
            main == Some(path)
        } else {
            crate::config::wildcard_match(pattern, &path.to_string_lossy())
        }
    })
}

/// Loads line tables for every in-scope object of the current process.
///
/// Objects that fail to load are skipped with a warning.
///
/// # Errors
///
/// Returns an error only if the process mappings cannot be read.
pub fn load(config: &Config) -> Result<SourceMap, LoadError> {
    let maps = std::fs::read_to_string("/proc/self/maps").map_err(LoadError::Maps)?;
    let main = std::fs::read_link("/proc/self/exe").ok();

    let mut builder = SourceMapBuilder::new();
    for object in parse_maps(&maps) {
        if !in_binary_scope(&config.binary_scope, &object.path, main.as_deref()) {
            continue;
        }
        match load_object(&object, &config.source_scope, &mut builder) {
            Ok(rows) => info!("loaded {} line rows from {}", rows, object.path.display()),
            Err(e) => warning!("{}", e),
        }
    }

    let map = builder.build();
    if map.is_empty() {
        warning!("no source lines in scope; experiments will never start");
    }
    Ok(map)
}

/// Adds the in-scope line rows of one object to `builder`. Returns the number
/// of rows added.
///
/// # Errors
///
/// Returns an error if the object cannot be mapped or parsed.
pub fn load_object(
    object: &MappedObject,
    source_scope: &[String],
    builder: &mut SourceMapBuilder,
) -> Result<usize, LoadError> {
    let path = &object.path;
    let file = File::open(path).map_err(|source| LoadError::Open {
        path: path.clone(),
        source,
    })?;
    // SAFETY: the mapping is read-only and dropped before returning. A
    // concurrent truncation of a loaded object would already crash the process.
    let data = unsafe { Mmap::map(&file) }.map_err(|source| LoadError::Open {
        path: path.clone(),
        source,
    })?;
    let parsed = object::File::parse(&*data).map_err(|source| LoadError::Object {
        path: path.clone(),
        source,
    })?;

    let bias = if parsed.kind() == ObjectKind::Dynamic {
        let lowest = parsed.segments().map(|s| s.address()).min().unwrap_or(0);
        #[allow(clippy::cast_possible_truncation)]
        let lowest = lowest as usize;
        object.base.wrapping_sub(lowest)
    } else {
        0
    };

    let context = addr2line::Context::new(&parsed).map_err(|source| LoadError::Dwarf {
        path: path.clone(),
        source,
    })?;

    let mut rows = 0;
    for section in parsed.sections().filter(|s| s.kind() == SectionKind::Text) {
        let start = section.address();
        let end = start + section.size();
        let Ok(locations) = context.find_location_range(start, end) else {
            continue;
        };
        for (addr, len, location) in locations {
            let (Some(file), Some(line)) = (location.file, location.line) else {
                continue;
            };
            if !matches_any(source_scope, file) {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let lo = (addr as usize).wrapping_add(bias);
            #[allow(clippy::cast_possible_truncation)]
            builder.add_range(lo, lo + len as usize, file, line);
            rows += 1;
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c8a00000-55d0c8a05000 r--p 00000000 fd:01 1234 /usr/bin/app
55d0c8a05000-55d0c8a20000 r-xp 00005000 fd:01 1234 /usr/bin/app
55d0c8a20000-55d0c8a28000 r--p 00020000 fd:01 1234 /usr/bin/app
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2d200000-7f1e2d228000 r--p 00000000 fd:01 99 /usr/lib/libc.so.6
7f1e2d228000-7f1e2d3bd000 r-xp 00028000 fd:01 99 /usr/lib/libc.so.6
7f1e2d500000-7f1e2d501000 r--p 00000000 fd:01 77 /usr/share/locale/data
7ffd5a1c2000-7ffd5a1e3000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn parses_executable_objects_with_their_base() {
        let objects = parse_maps(MAPS);
        assert_eq!(
            objects,
            vec![
                MappedObject {
                    path: "/usr/bin/app".into(),
                    base: 0x55d0_c8a0_0000
                },
                MappedObject {
                    path: "/usr/lib/libc.so.6".into(),
                    base: 0x7f1e_2d20_0000
                },
            ]
        );
    }

    #[test]
    fn binary_scope_understands_main() {
        let main = Path::new("/usr/bin/app");
        let scope = vec![MAIN_BINARY.to_string()];
        assert!(in_binary_scope(&scope, main, Some(main)));
        assert!(!in_binary_scope(&scope, Path::new("/usr/lib/libc.so.6"), Some(main)));

        let scope = vec!["%libc%".to_string()];
        assert!(in_binary_scope(&scope, Path::new("/usr/lib/libc.so.6"), Some(main)));
        assert!(!in_binary_scope(&scope, main, Some(main)));
    }

    #[test]
    fn loads_this_test_binary() {
        let config = Config {
            source_scope: vec![concat!(env!("CARGO_MANIFEST_DIR"), "/%").to_string()],
            ..Config::default()
        };
        let map = load(&config).unwrap();
        // test binaries are built with debug info
        assert!(!map.is_empty());
        assert!(map.lines().all(|(_, l)| l.file().starts_with(env!("CARGO_MANIFEST_DIR"))));
    }
}
