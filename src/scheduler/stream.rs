//! Caller-facing per-output stream.
//!
//! One stream per output, one driving thread per stream. The stream tracks
//! its own delivered-record and instruction counts (synthetic records do
//! not count) and latches header values from markers as they pass, so they
//! can be queried mid-run without touching the inputs. Header queries made
//! before the first marker arrives fall through to the current input's
//! reader.

use std::sync::Arc;

use crate::record::{MarkerKind, TraceRecord};
use crate::scheduler::core::SchedulerImpl;
use crate::scheduler::output::SchedStat;
use crate::scheduler::status::{NextRecord, Status};

pub struct OutputStream<R: TraceRecord> {
    sched: Arc<SchedulerImpl<R>>,
    ordinal: usize,
    /// Lockstep mode: cycle ordinals 0..max on each call.
    max_ordinal: Option<usize>,
    ref_count: u64,
    instr_count: u64,
    last_timestamp: u64,
    first_timestamp: u64,
    version: u64,
    filetype: u64,
    cache_line_size: u64,
    chunk_instr_count: u64,
    page_size: u64,
    prev_record: R,
}

impl<R: TraceRecord> OutputStream<R> {
    pub(crate) fn new(
        sched: Arc<SchedulerImpl<R>>,
        ordinal: usize,
        max_ordinal: Option<usize>,
    ) -> Self {
        Self {
            sched,
            ordinal,
            max_ordinal,
            ref_count: 0,
            instr_count: 0,
            last_timestamp: 0,
            first_timestamp: 0,
            version: 0,
            filetype: 0,
            cache_line_size: 0,
            chunk_instr_count: 0,
            page_size: 0,
            prev_record: R::invalid(),
        }
    }

    /// Pulls the next scheduled record without a caller time (the engine
    /// stamps wall-clock time; fine for instruction quanta).
    pub fn next_record(&mut self) -> NextRecord<R> {
        self.next_record_at(0)
    }

    /// Pulls the next scheduled record at the given simulated time.
    pub fn next_record_at(&mut self, cur_time: u64) -> NextRecord<R> {
        if let Some(max) = self.max_ordinal {
            self.ordinal += 1;
            if self.ordinal >= max {
                self.ordinal = 0;
            }
        }
        match self.sched.next_record(self.ordinal, cur_time) {
            Ok(record) => {
                if !self.sched.record_is_synthetic(self.ordinal) {
                    self.ref_count += 1;
                }
                if record.is_instr_boundary(&self.prev_record) {
                    self.instr_count += 1;
                }
                if let Some((kind, value)) = record.marker() {
                    match kind {
                        MarkerKind::Timestamp => {
                            self.last_timestamp = value;
                            if self.first_timestamp == 0 {
                                self.first_timestamp = value;
                            }
                        }
                        MarkerKind::Version => self.version = value,
                        MarkerKind::Filetype => self.filetype = value,
                        MarkerKind::CacheLineSize => self.cache_line_size = value,
                        MarkerKind::ChunkInstrCount => self.chunk_instr_count = value,
                        MarkerKind::PageSize => self.page_size = value,
                        _ => {}
                    }
                }
                self.prev_record = record.clone();
                NextRecord::Record(record)
            }
            Err(status) => status.into(),
        }
    }

    /// Pushes the just-returned record back so the next call returns it
    /// again. `last_timestamp` is deliberately not rolled back. Errors with
    /// `Invalid` when there is no last record or speculation is active, and
    /// `NotImplemented` for schemas without boundary re-derivation.
    pub fn unread_last_record(&mut self) -> Result<(), Status> {
        let record = self.sched.unread_last_record(self.ordinal)?;
        if !self.sched.record_is_synthetic(self.ordinal) {
            self.ref_count = self.ref_count.saturating_sub(1);
        }
        if record.is_instr() {
            self.instr_count = self.instr_count.saturating_sub(1);
        }
        // The pre-previous record is gone; an immediate re-read re-derives
        // the boundary from the restored record itself.
        self.prev_record = R::invalid();
        Ok(())
    }

    pub fn start_speculation(&mut self, pc: u64, queue_current_record: bool) -> Result<(), Status> {
        self.sched
            .start_speculation(self.ordinal, pc, queue_current_record)
    }

    pub fn stop_speculation(&mut self) -> Result<(), Status> {
        self.sched.stop_speculation(self.ordinal)
    }

    /// Deactivates or reactivates this output (dynamic mapping only). A
    /// deactivated output's input is released to the other outputs.
    pub fn set_active(&mut self, active: bool) -> Result<(), Status> {
        self.sched.set_output_active(self.ordinal, active)
    }

    // -------------------------------------------------------------
    // Ordinals and identity
    // -------------------------------------------------------------

    pub fn output_ordinal(&self) -> usize {
        self.ordinal
    }

    /// Records delivered through this stream, excluding synthetic ones.
    pub fn record_ordinal(&self) -> u64 {
        self.ref_count
    }

    /// Instructions delivered through this stream.
    pub fn instruction_ordinal(&self) -> u64 {
        self.instr_count
    }

    /// Ordinal of the current input, if one is assigned.
    pub fn input_ordinal(&self) -> Option<usize> {
        self.sched.input_ordinal(self.ordinal)
    }

    /// Shard index for analysis tools; input-or-output ordinal depending on
    /// the ordinal options.
    pub fn shard_index(&self) -> usize {
        self.sched.shard_index(self.ordinal)
    }

    pub fn workload_ordinal(&self) -> Option<usize> {
        self.sched.workload_ordinal(self.ordinal)
    }

    pub fn tid(&self) -> i64 {
        self.sched.tid(self.ordinal)
    }

    pub fn pid(&self) -> i64 {
        self.sched.pid(self.ordinal)
    }

    /// Simulated cpu id: the as-traced cpu when replaying a traced
    /// schedule, the output ordinal otherwise.
    pub fn cpuid(&self) -> u64 {
        self.sched.output_cpuid(self.ordinal)
    }

    /// Name of the current input's source, for diagnostics.
    pub fn input_name(&self) -> String {
        self.sched.input_name(self.ordinal)
    }

    /// Record ordinal within the current input stream.
    pub fn input_record_ordinal(&self) -> u64 {
        self.sched.input_record_ordinal(self.ordinal)
    }

    /// Instruction ordinal within the current input stream.
    pub fn input_instruction_ordinal(&self) -> u64 {
        self.sched.input_instr_ordinal(self.ordinal)
    }

    // -------------------------------------------------------------
    // Header values
    // -------------------------------------------------------------

    pub fn last_timestamp(&self) -> u64 {
        if self.last_timestamp != 0 {
            self.last_timestamp
        } else {
            self.sched.input_last_timestamp(self.ordinal)
        }
    }

    pub fn first_timestamp(&self) -> u64 {
        if self.first_timestamp != 0 {
            self.first_timestamp
        } else {
            self.sched.input_first_timestamp(self.ordinal)
        }
    }

    pub fn version(&self) -> u64 {
        if self.version != 0 {
            self.version
        } else {
            self.sched.input_version(self.ordinal)
        }
    }

    pub fn filetype(&self) -> u64 {
        if self.filetype != 0 {
            self.filetype
        } else {
            self.sched.input_filetype(self.ordinal)
        }
    }

    pub fn cache_line_size(&self) -> u64 {
        if self.cache_line_size != 0 {
            self.cache_line_size
        } else {
            self.sched.input_cache_line_size(self.ordinal)
        }
    }

    pub fn chunk_instr_count(&self) -> u64 {
        if self.chunk_instr_count != 0 {
            self.chunk_instr_count
        } else {
            self.sched.input_chunk_instr_count(self.ordinal)
        }
    }

    pub fn page_size(&self) -> u64 {
        if self.page_size != 0 {
            self.page_size
        } else {
            self.sched.input_page_size(self.ordinal)
        }
    }

    // -------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------

    /// True when the last record was fabricated by the scheduler (switch
    /// sequences, window markers, synthetic exits) rather than read from a
    /// trace.
    pub fn is_record_synthetic(&self) -> bool {
        self.sched.record_is_synthetic(self.ordinal)
    }

    /// True when the last record came from kernel tracing.
    pub fn is_record_kernel(&self) -> bool {
        self.sched.record_is_kernel(self.ordinal)
    }

    /// Per-output scheduling statistic.
    pub fn schedule_stat(&self, stat: SchedStat) -> u64 {
        self.sched.statistic(self.ordinal, stat)
    }
}
