//! Address-to-source-line mapping built from DWARF debug info
//!
//! At startup the map walks `/proc/self/maps`, loads the debug info of every
//! executable mapping whose source files fall inside the configured scope,
//! and interns one [`Line`] per `(file, line)` pair together with the address
//! ranges that compile to it. The result is immutable for the lifetime of
//! the process, so instruction-pointer lookups from signal context are a
//! plain binary search with no allocation and no DWARF access.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use object::{Object, ObjectKind, ObjectSection};
use tracing::{debug, warn};

/// A logical source location, identified by `(file, line)`
///
/// Lines are created once during map construction and live for the process.
/// The sample count accumulates across all threads and all rounds.
pub struct Line {
    file: String,
    line: u32,
    index: usize,
    samples: AtomicU64,
}

impl Line {
    /// Source file path as recorded in the debug info
    pub fn file(&self) -> &str {
        &self.file
    }

    /// One-based line number
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Stable position of this line in its owning [`LineMap`]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cumulative number of samples that resolved to this line
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Record one more sample on this line
    pub fn add_sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("file", &self.file)
            .field("line", &self.line)
            .field("samples", &self.samples())
            .finish()
    }
}

/// Address interval resolving to one interned line
struct Interval {
    start: u64,
    end: u64,
    line: u32,
}

/// Immutable inventory of in-scope source lines and their address ranges
pub struct LineMap {
    lines: Vec<Arc<Line>>,
    intervals: Vec<Interval>,
}

impl LineMap {
    /// Build the map for the current process
    ///
    /// `scope` bounds which debug-info entries are admitted: a line is kept
    /// only if its source path sits under one of the scope directories.
    /// Modules that fail to parse are skipped with a warning; an empty map is
    /// legal (no rounds will ever open).
    pub fn build(scope: &[PathBuf]) -> Result<LineMap> {
        let maps =
            fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;
        let mut builder = MapBuilder::new(scope);

        for module in parse_maps(&maps) {
            if let Err(e) = builder.add_module(&module.path, module.base, &module.exec_ranges) {
                debug!(module = %module.path.display(), error = %e, "skipping module");
            }
        }

        let map = builder.finish();
        if map.lines.is_empty() {
            warn!("No source lines found in scope; no experiments will run");
        }
        Ok(map)
    }

    /// Resolve an instruction pointer to its containing line
    ///
    /// Allocation-free; safe to call from the sample handler.
    pub fn find_ip(&self, ip: u64) -> Option<&Arc<Line>> {
        let idx = self.intervals.partition_point(|iv| iv.start <= ip);
        let iv = self.intervals.get(idx.checked_sub(1)?)?;
        if ip < iv.end {
            Some(&self.lines[iv.line as usize])
        } else {
            None
        }
    }

    /// Resolve a textual `"file:line"` name to its line
    ///
    /// The file component matches on full path or path suffix, so both
    /// `main.rs:10` and `src/main.rs:10` address the same entry.
    pub fn find_name(&self, name: &str) -> Option<&Arc<Line>> {
        let (file, line) = name.rsplit_once(':')?;
        let line: u32 = line.parse().ok()?;
        self.lines
            .iter()
            .find(|l| l.line == line && paths_match(&l.file, file))
    }

    /// Line at a stable index (panics on an index not produced by this map)
    pub fn line(&self, index: usize) -> &Arc<Line> {
        &self.lines[index]
    }

    /// Number of interned lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True when no in-scope lines were found
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Suffix match on path-component boundaries, in either direction
fn paths_match(stored: &str, given: &str) -> bool {
    stored == given
        || stored
            .strip_suffix(given)
            .is_some_and(|rest| rest.ends_with('/'))
        || given
            .strip_suffix(stored)
            .is_some_and(|rest| rest.ends_with('/'))
}

/// One file-backed module from `/proc/self/maps`
struct ModuleMapping {
    path: PathBuf,
    /// Lowest mapped address of the module, used as the load bias for
    /// position-independent objects
    base: u64,
    /// Executable segments as runtime `[start, end)` ranges
    exec_ranges: Vec<(u64, u64)>,
}

/// Parse the maps pseudo-file into per-module mappings
///
/// Lines look like `start-end perms offset dev inode pathname`. Anonymous
/// and pseudo mappings (`[heap]`, `[vdso]`, ...) carry no debug info and are
/// dropped.
fn parse_maps(content: &str) -> Vec<ModuleMapping> {
    let mut modules: HashMap<PathBuf, ModuleMapping> = HashMap::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(range), Some(perms)) = (parts.next(), parts.next()) else {
            continue;
        };
        // offset, dev, inode
        let path = match parts.nth(3) {
            Some(p) if p.starts_with('/') => PathBuf::from(p),
            _ => continue,
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
        ) else {
            continue;
        };

        let module = modules.entry(path.clone()).or_insert(ModuleMapping {
            path,
            base: start,
            exec_ranges: Vec::new(),
        });
        module.base = module.base.min(start);
        if perms.contains('x') {
            module.exec_ranges.push((start, end));
        }
    }

    modules.into_values().filter(|m| !m.exec_ranges.is_empty()).collect()
}

/// Accumulates interned lines and address intervals during construction
struct MapBuilder {
    scope: Vec<PathBuf>,
    lines: Vec<Arc<Line>>,
    by_key: HashMap<(String, u32), u32>,
    intervals: Vec<Interval>,
}

impl MapBuilder {
    fn new(scope: &[PathBuf]) -> Self {
        // Canonicalize scope dirs so they compare against the absolute paths
        // DWARF line tables produce
        let scope = scope
            .iter()
            .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
            .collect();
        MapBuilder {
            scope,
            lines: Vec::new(),
            by_key: HashMap::new(),
            intervals: Vec::new(),
        }
    }

    /// Load one module's debug info and intern every in-scope line row
    ///
    /// `base` is the module's lowest mapped address; `ranges` are the
    /// runtime executable ranges to walk.
    fn add_module(&mut self, path: &Path, base: u64, ranges: &[(u64, u64)]) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open module: {}", path.display()))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map module")?;
        let object = object::File::parse(&*mmap).context("Failed to parse object file")?;

        // Position-independent objects are linked at zero and relocated to
        // their mapped base; fixed-address executables need no adjustment
        let bias = match object.kind() {
            ObjectKind::Dynamic => base,
            _ => 0,
        };

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section =
            |id: gimli::SectionId| -> Result<gimli::EndianRcSlice<gimli::RunTimeEndian>> {
                let data = object
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[]));
                let bytes: std::rc::Rc<[u8]> = std::rc::Rc::from(data.into_owned());
                Ok(gimli::EndianRcSlice::new(bytes, endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section).context("Failed to load DWARF sections")?;
        let ctx =
            addr2line::Context::from_dwarf(dwarf).context("Failed to create DWARF context")?;

        for &(start, end) in ranges {
            let rows = match ctx.find_location_range(start - bias, end - bias) {
                Ok(rows) => rows,
                Err(_) => continue,
            };
            for (row_start, row_len, location) in rows {
                let (Some(file), Some(line)) = (location.file, location.line) else {
                    continue;
                };
                if line == 0 || !self.in_scope(file) {
                    continue;
                }
                let index = self.intern(file, line);
                self.intervals.push(Interval {
                    start: bias + row_start,
                    end: bias + row_start + row_len,
                    line: index,
                });
            }
        }
        Ok(())
    }

    fn in_scope(&self, file: &str) -> bool {
        self.scope
            .iter()
            .any(|dir| Path::new(file).starts_with(dir))
    }

    fn intern(&mut self, file: &str, line: u32) -> u32 {
        if let Some(&index) = self.by_key.get(&(file.to_string(), line)) {
            return index;
        }
        let index = self.lines.len() as u32;
        self.lines.push(Arc::new(Line {
            file: file.to_string(),
            line,
            index: index as usize,
            samples: AtomicU64::new(0),
        }));
        self.by_key.insert((file.to_string(), line), index);
        index
    }

    fn finish(mut self) -> LineMap {
        self.intervals.sort_by_key(|iv| iv.start);
        LineMap {
            lines: self.lines,
            intervals: self.intervals,
        }
    }
}

/// Construct a map from pre-resolved parts, bypassing DWARF loading
///
/// Test seam shared with the engine's unit tests.
#[cfg(test)]
pub(crate) fn map_from_parts(
    lines: Vec<(&str, u32)>,
    intervals: Vec<(u64, u64, u32)>,
) -> LineMap {
    let lines: Vec<Arc<Line>> = lines
        .into_iter()
        .enumerate()
        .map(|(index, (file, line))| {
            Arc::new(Line {
                file: file.to_string(),
                line,
                index,
                samples: AtomicU64::new(0),
            })
        })
        .collect();
    let mut intervals: Vec<Interval> = intervals
        .into_iter()
        .map(|(start, end, line)| Interval { start, end, line })
        .collect();
    intervals.sort_by_key(|iv| iv.start);
    LineMap { lines, intervals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn compile_test_binary() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let src_file = temp_dir.path().join("workload.rs");
        let bin_file = temp_dir.path().join("workload_bin");

        fs::write(
            &src_file,
            r#"
fn busy(n: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..n {
        acc = acc.wrapping_add(i * i);
    }
    acc
}

fn main() {
    println!("{}", busy(1000));
}
"#,
        )
        .unwrap();

        Command::new("rustc")
            .arg(&src_file)
            .arg("-o")
            .arg(&bin_file)
            .arg("-g")
            .status()
            .unwrap();

        (temp_dir, bin_file)
    }

    #[test]
    fn test_build_from_compiled_binary() {
        let (temp_dir, bin_file) = compile_test_binary();
        let mut builder = MapBuilder::new(&[temp_dir.path().to_path_buf()]);
        builder
            .add_module(&bin_file, 0, &[(0, u64::MAX)])
            .expect("module with debug info should load");
        let map = builder.finish();

        assert!(!map.is_empty(), "compiled binary should contribute lines");
        // Every interned line belongs to the scoped source file
        for line in &map.lines {
            assert!(line.file().ends_with("workload.rs"), "{}", line.file());
        }
    }

    #[test]
    fn test_scope_excludes_everything_when_disjoint() {
        let (_temp_dir, bin_file) = compile_test_binary();
        let mut builder = MapBuilder::new(&[PathBuf::from("/nonexistent/scope")]);
        builder.add_module(&bin_file, 0, &[(0, u64::MAX)]).unwrap();
        let map = builder.finish();
        assert!(map.is_empty());
    }

    #[test]
    fn test_find_ip_hits_interned_interval() {
        let (temp_dir, bin_file) = compile_test_binary();
        let mut builder = MapBuilder::new(&[temp_dir.path().to_path_buf()]);
        builder.add_module(&bin_file, 0, &[(0, u64::MAX)]).unwrap();
        let map = builder.finish();

        let iv = &map.intervals[0];
        let expected = map.lines[iv.line as usize].index();
        let hit = map.find_ip(iv.start).expect("interval start must resolve");
        assert_eq!(hit.index(), expected);
    }

    #[test]
    fn test_find_ip_misses() {
        let map = map_from_parts(
            vec![("src/a.rs", 10)],
            vec![(0x1000, 0x1040, 0)],
        );
        assert!(map.find_ip(0).is_none());
        assert!(map.find_ip(0xfff).is_none());
        assert!(map.find_ip(0x1040).is_none());
        assert!(map.find_ip(0x1000).is_some());
        assert!(map.find_ip(0x103f).is_some());
    }

    #[test]
    fn test_find_name_suffix_matching() {
        let map = map_from_parts(
            vec![("/work/src/main.rs", 42), ("/work/src/lib.rs", 7)],
            vec![],
        );
        assert!(map.find_name("main.rs:42").is_some());
        assert!(map.find_name("src/main.rs:42").is_some());
        assert!(map.find_name("/work/src/main.rs:42").is_some());
        assert!(map.find_name("main.rs:41").is_none());
        assert!(map.find_name("other.rs:42").is_none());
        // Component boundary: "ain.rs" is not a path suffix of "main.rs"
        assert!(map.find_name("ain.rs:42").is_none());
        assert!(map.find_name("not-a-name").is_none());
        assert!(map.find_name("main.rs:notanumber").is_none());
    }

    #[test]
    fn test_line_sample_count() {
        let map = map_from_parts(vec![("a.rs", 1)], vec![]);
        let line = map.line(0);
        assert_eq!(line.samples(), 0);
        line.add_sample();
        line.add_sample();
        assert_eq!(line.samples(), 2);
        assert_eq!(format!("{line}"), "a.rs:1");
    }

    #[test]
    fn test_parse_maps_groups_modules() {
        let content = "\
55f000000000-55f000001000 r--p 00000000 08:01 123 /usr/bin/app
55f000001000-55f000005000 r-xp 00001000 08:01 123 /usr/bin/app
7f0000000000-7f0000002000 r-xp 00000000 08:01 456 /usr/lib/libc.so.6
7f0000010000-7f0000011000 rw-p 00000000 00:00 0
7ffd00000000-7ffd00001000 r-xp 00000000 00:00 0 [vdso]
";
        let mut modules = parse_maps(content);
        modules.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(modules.len(), 2);

        let app = &modules[0];
        assert_eq!(app.path, PathBuf::from("/usr/bin/app"));
        assert_eq!(app.base, 0x55f0_0000_0000);
        assert_eq!(app.exec_ranges, vec![(0x55f0_0000_1000, 0x55f0_0000_5000)]);

        let libc_mod = &modules[1];
        assert_eq!(libc_mod.base, 0x7f00_0000_0000);
    }

    #[test]
    fn test_parse_maps_skips_non_exec_modules() {
        let content = "55f000000000-55f000001000 r--p 00000000 08:01 123 /usr/share/data.bin\n";
        assert!(parse_maps(content).is_empty());
    }

    #[test]
    fn test_add_module_rejects_missing_file() {
        let mut builder = MapBuilder::new(&[]);
        let result = builder.add_module(Path::new("/nonexistent/binary"), 0, &[(0, 100)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_paths_match_directions() {
        assert!(paths_match("/a/b/c.rs", "c.rs"));
        assert!(paths_match("/a/b/c.rs", "b/c.rs"));
        assert!(paths_match("c.rs", "/a/b/c.rs"));
        assert!(!paths_match("/a/b/c.rs", "bc.rs"));
        assert!(!paths_match("/a/b/c.rs", "d.rs"));
    }
}
