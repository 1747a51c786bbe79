//! Workload descriptions: input sources, per-thread modifiers, regions of
//! interest, and trace-directory enumeration.

use std::io;
use std::path::{Path, PathBuf};

use crate::reader::RecordReader;
use crate::record::TraceRecord;

/// Serial schedule files start with this prefix (the suffix varies with the
/// compressor used).
pub const SERIAL_SCHEDULE_PREFIX: &str = "serial_schedule";
/// Recorded per-cpu schedule archive.
pub const CPU_SCHEDULE_FILENAME: &str = "cpu_schedule.bin";
/// Auxiliary files a trace directory may carry alongside the thread shards.
pub const MODULE_LIST_FILENAME: &str = "modules.log";
pub const FUNCTION_LIST_FILENAME: &str = "funclist.log";
pub const ENCODING_FILENAME: &str = "encodings.bin";

/// A contiguous instruction range of one input, 1-based and inclusive of
/// `start`, exclusive of nothing: `stop == 0` means end-of-trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstrRange {
    pub start_instruction: u64,
    pub stop_instruction: u64,
}

impl InstrRange {
    pub fn new(start_instruction: u64, stop_instruction: u64) -> Self {
        Self {
            start_instruction,
            stop_instruction,
        }
    }
}

/// A wall-clock time range, in the trace's timestamp units.
/// `stop_timestamp == 0` means end-of-trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start_timestamp: u64,
    pub stop_timestamp: u64,
}

/// Scheduling adjustments for a subset of a workload's threads.
///
/// An empty `tids` list applies the modifier to every thread of the workload
/// that no earlier modifier touched.
#[derive(Clone, Debug, Default)]
pub struct ThreadModifiers {
    pub tids: Vec<i64>,
    /// Larger runs first. Default 0.
    pub priority: i32,
    /// Output ordinals this thread may run on; empty = any.
    pub output_binding: Vec<usize>,
    /// Ordered, non-overlapping regions with a >=1-instruction gap between
    /// them; see [`InstrRange`].
    pub regions_of_interest: Vec<InstrRange>,
}

impl ThreadModifiers {
    pub fn with_regions(regions_of_interest: Vec<InstrRange>) -> Self {
        Self {
            regions_of_interest,
            ..Default::default()
        }
    }
}

/// One explicit reader-backed input of a workload.
pub struct ReaderSpec<R: TraceRecord> {
    pub reader: Box<dyn RecordReader<R>>,
    pub tid: i64,
}

/// Where a workload's inputs come from.
pub enum WorkloadSource<R: TraceRecord> {
    /// A trace directory (one shard file per thread) or a single shard file.
    /// Requires a reader factory at init.
    Path(PathBuf),
    /// Pre-constructed readers, e.g. in-memory ones for tests.
    Readers(Vec<ReaderSpec<R>>),
}

/// One traced workload: a set of thread-shard inputs plus scheduling
/// modifiers.
pub struct WorkloadSpec<R: TraceRecord> {
    pub source: WorkloadSource<R>,
    /// Only schedule these tids. Mutually exclusive with `only_shards`.
    pub only_threads: Vec<i64>,
    /// Only schedule these shard ordinals (position in sorted file order).
    pub only_shards: Vec<usize>,
    pub thread_modifiers: Vec<ThreadModifiers>,
    /// Time ranges converted to per-thread instruction ROIs at init using
    /// the as-traced schedule. Mutually exclusive with per-thread
    /// `regions_of_interest`.
    pub times_of_interest: Vec<TimeRange>,
}

impl<R: TraceRecord> WorkloadSpec<R> {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: WorkloadSource::Path(path.into()),
            only_threads: Vec::new(),
            only_shards: Vec::new(),
            thread_modifiers: Vec::new(),
            times_of_interest: Vec::new(),
        }
    }

    pub fn from_readers(readers: Vec<ReaderSpec<R>>) -> Self {
        Self {
            source: WorkloadSource::Readers(readers),
            only_threads: Vec::new(),
            only_shards: Vec::new(),
            thread_modifiers: Vec::new(),
            times_of_interest: Vec::new(),
        }
    }

    pub fn with_modifiers(mut self, modifiers: Vec<ThreadModifiers>) -> Self {
        self.thread_modifiers = modifiers;
        self
    }
}

/// True for directory entries that are not thread-shard inputs.
fn is_auxiliary_file(name: &str) -> bool {
    name == "."
        || name == ".."
        || name.starts_with(SERIAL_SCHEDULE_PREFIX)
        || name == CPU_SCHEDULE_FILENAME
        || name == MODULE_LIST_FILENAME
        || name == FUNCTION_LIST_FILENAME
        || name == ENCODING_FILENAME
}

/// Lists the input shard files under a workload directory, excluding the
/// auxiliary schedule/module/function/encoding files, sorted by name.
///
/// Sorting gives reliable shard ordinals for `only_shards`; trace writers
/// zero-pad numbers embedded in shard names so a plain sort keeps numeric
/// order.
pub fn list_trace_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_auxiliary_file(&name) {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auxiliary_files_are_excluded() {
        assert!(is_auxiliary_file("serial_schedule.gz"));
        assert!(is_auxiliary_file(CPU_SCHEDULE_FILENAME));
        assert!(is_auxiliary_file(MODULE_LIST_FILENAME));
        assert!(is_auxiliary_file(FUNCTION_LIST_FILENAME));
        assert!(is_auxiliary_file(ENCODING_FILENAME));
        assert!(!is_auxiliary_file("app.1234.trace"));
    }
}
