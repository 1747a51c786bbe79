//! Per-input state: one traced thread shard and everything the scheduler
//! tracks about it.
//!
//! Each input is wrapped in its own mutex by the engine; all fields here are
//! guarded by that lock. The reader is exclusively owned by its input, so
//! reader calls also happen under the input lock, except `init`, which may
//! block and is called with care (see `core`).

use std::collections::VecDeque;

use crate::reader::{ReadError, RecordReader};
use crate::record::TraceRecord;
use crate::workload::InstrRange;

/// Tid value marking a combined (multi-thread single-file) stream.
pub const INVALID_TID: i64 = 0;

pub(crate) struct InputState<R: TraceRecord> {
    /// Stable ordinal into the scheduler's input table.
    pub index: usize,
    /// Owning workload ordinal; switches crossing workloads inject the
    /// process-switch sequence instead of the thread-switch one.
    pub workload: usize,
    pub tid: i64,
    pub pid: i64,
    /// Tid of the last record delivered; used for combined streams where
    /// the shard-level tid is meaningless.
    pub last_record_tid: i64,

    pub reader: Box<dyn RecordReader<R>>,
    /// Buffered records, front = next to deliver. Holds at most one
    /// instruction record, and only at the front: the candidate that was
    /// read speculatively and pushed back on a switch.
    pub queue: VecDeque<R>,

    pub regions_of_interest: Vec<InstrRange>,
    pub cur_region: usize,
    pub in_cur_region: bool,
    pub has_modifier: bool,

    /// Output ordinals this input may run on; empty = any.
    pub binding: Vec<usize>,
    pub priority: i32,
    /// Per-workload minimum first timestamp; timestamp-ordered inputs sort
    /// by `next_timestamp - base_timestamp`.
    pub base_timestamp: u64,
    pub order_by_timestamp: bool,
    pub next_timestamp: u64,

    pub processing_syscall: bool,
    pub processing_maybe_blocking_syscall: bool,
    pub pre_syscall_timestamp: u64,
    /// Timeout argument of the in-progress syscall; cleared at the next
    /// instruction boundary.
    pub syscall_timeout_arg: u64,

    /// Pending direct-switch target; consumed at most once.
    pub switch_to_input: Option<usize>,

    pub instrs_in_quantum: u64,
    pub time_spent_in_quantum: u64,
    pub prev_time_in_quantum: u64,

    /// Remaining modeled block interval in caller time units; a blocked
    /// input stays in the ready queue.
    pub blocked_time: u64,
    pub blocked_start_time: u64,
    /// Removed from dispatch until an explicit resume (or the
    /// hang-avoidance flush).
    pub unscheduled: bool,
    /// The next unschedule request is a no-op (a resume arrived first, or a
    /// direct switch missed this input while it was running).
    pub skip_next_unscheduled: bool,
    /// Last output this input ran on, for migration counting.
    pub prev_output: Option<usize>,

    pub at_eof: bool,
    /// Reader init is deferred to first use; it may block.
    pub needs_init: bool,
    /// False right after init or a skip, when the reader already sits on
    /// the record to deliver; true once we must advance before reading.
    pub needs_advance: bool,
    /// Re-check ROI position when the next record is processed.
    pub needs_roi: bool,
    /// Instructions consumed by init-time readahead, not yet delivered;
    /// the exposed instruction count subtracts these.
    pub instrs_pre_read: u64,
    /// The record being processed came from the queue, not the reader.
    pub cur_from_queue: bool,
    /// The segment being closed ends on an instruction that was read but
    /// not delivered; the exclusive stop ordinal needs +1.
    pub switching_pre_instruction: bool,
}

impl<R: TraceRecord> InputState<R> {
    pub fn new(index: usize, workload: usize, tid: i64, reader: Box<dyn RecordReader<R>>) -> Self {
        Self {
            index,
            workload,
            tid,
            pid: 0,
            last_record_tid: tid,
            reader,
            queue: VecDeque::new(),
            regions_of_interest: Vec::new(),
            cur_region: 0,
            in_cur_region: false,
            has_modifier: false,
            binding: Vec::new(),
            priority: 0,
            base_timestamp: 0,
            order_by_timestamp: false,
            next_timestamp: 0,
            processing_syscall: false,
            processing_maybe_blocking_syscall: false,
            pre_syscall_timestamp: 0,
            syscall_timeout_arg: 0,
            switch_to_input: None,
            instrs_in_quantum: 0,
            time_spent_in_quantum: 0,
            prev_time_in_quantum: 0,
            blocked_time: 0,
            blocked_start_time: 0,
            unscheduled: false,
            skip_next_unscheduled: false,
            prev_output: None,
            at_eof: false,
            needs_init: true,
            needs_advance: false,
            needs_roi: true,
            instrs_pre_read: 0,
            cur_from_queue: false,
            switching_pre_instruction: false,
        }
    }

    /// Exposed instruction count: what the consumer has been shown, net of
    /// init-time readahead.
    pub fn instr_ordinal(&self) -> u64 {
        let reader_cur = self.reader.instruction_ordinal();
        debug_assert!(reader_cur >= self.instrs_pre_read);
        reader_cur.saturating_sub(self.instrs_pre_read)
    }

    /// Whether this input may run on `output`.
    pub fn binding_allows(&self, output: usize) -> bool {
        self.binding.is_empty() || self.binding.contains(&output)
    }

    /// Single shard file holding records of multiple threads.
    pub fn is_combined_stream(&self) -> bool {
        self.tid == INVALID_TID
    }

    /// Runs the blocking reader init if still pending.
    pub fn ensure_init(&mut self) -> Result<(), ReadError> {
        if self.needs_init {
            self.reader.init()?;
            self.needs_init = false;
        }
        Ok(())
    }

    /// True once the reader is exhausted (post-init).
    pub fn reader_exhausted(&self) -> bool {
        self.reader.at_end()
    }

    /// Drops all buffered records ahead of a skip.
    ///
    /// The queue holds no instructions beyond the front candidate (else the
    /// reader's instruction ordinal would be wrong), so dropping it is safe
    /// when skipping ahead in the stream.
    pub fn clear_queue(&mut self) {
        let mut first = true;
        while let Some(record) = self.queue.pop_front() {
            debug_assert!(first || (!record.is_instr() && !record.is_encoding()));
            let _ = record;
            first = false;
        }
    }

    /// Timestamp-delta key for the priority queues.
    pub fn queue_timestamp_delta(&self) -> u64 {
        if self.order_by_timestamp {
            self.reader
                .last_timestamp()
                .saturating_sub(self.base_timestamp)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::VecReader;
    use crate::record::MemrefRecord;

    fn input_with(records: Vec<MemrefRecord>) -> InputState<MemrefRecord> {
        InputState::new(0, 0, 1, Box::new(VecReader::new(records)))
    }

    #[test]
    fn instr_ordinal_subtracts_pre_read() {
        let mut input = input_with(vec![
            MemrefRecord::Instr {
                tid: 1,
                pid: 1,
                pc: 0x10,
                size: 4,
            },
            MemrefRecord::Instr {
                tid: 1,
                pid: 1,
                pc: 0x14,
                size: 4,
            },
        ]);
        input.ensure_init().unwrap();
        input.reader.advance();
        assert_eq!(input.instr_ordinal(), 2);
        input.instrs_pre_read = 1;
        assert_eq!(input.instr_ordinal(), 1);
    }

    #[test]
    fn binding_empty_allows_all() {
        let mut input = input_with(Vec::new());
        assert!(input.binding_allows(3));
        input.binding = vec![1, 2];
        assert!(input.binding_allows(2));
        assert!(!input.binding_allows(0));
    }
}
