//! Per-output state: one simulated core.
//!
//! Each output is driven by exactly one caller thread. Its mutable state
//! lives in [`OutputCore`] behind a mutex that only the owning thread locks
//! for long stretches; the few fields other outputs must observe (the replay
//! cursor, the active flag) sit outside as atomics so cross-output peeks
//! never take another output's lock.

use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::Mutex;

use crate::record::TraceRecord;
use crate::scheduler::segments::ScheduleSegment;
use crate::speculator::Speculator;

/// Scheduling statistics kept per output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedStat {
    /// Switched from one input directly to another.
    SwitchInputToInput,
    SwitchInputToIdle,
    SwitchIdleToInput,
    /// Dispatch decided to keep the same input.
    SwitchNop,
    QuantumPreempts,
    DirectSwitchAttempts,
    DirectSwitchSuccesses,
    /// Chosen input last ran on a different output.
    Migrations,
}

pub(crate) const STAT_COUNT: usize = 8;

impl SchedStat {
    pub(crate) fn index(self) -> usize {
        match self {
            SchedStat::SwitchInputToInput => 0,
            SchedStat::SwitchInputToIdle => 1,
            SchedStat::SwitchIdleToInput => 2,
            SchedStat::SwitchNop => 3,
            SchedStat::QuantumPreempts => 4,
            SchedStat::DirectSwitchAttempts => 5,
            SchedStat::DirectSwitchSuccesses => 6,
            SchedStat::Migrations => 7,
        }
    }

    pub(crate) fn all() -> [SchedStat; STAT_COUNT] {
        [
            SchedStat::SwitchInputToInput,
            SchedStat::SwitchInputToIdle,
            SchedStat::SwitchIdleToInput,
            SchedStat::SwitchNop,
            SchedStat::QuantumPreempts,
            SchedStat::DirectSwitchAttempts,
            SchedStat::DirectSwitchSuccesses,
            SchedStat::Migrations,
        ]
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            SchedStat::SwitchInputToInput => "switch input->input",
            SchedStat::SwitchInputToIdle => "switch input->idle",
            SchedStat::SwitchIdleToInput => "switch idle->input",
            SchedStat::SwitchNop => "switch nop",
            SchedStat::QuantumPreempts => "quantum preempts",
            SchedStat::DirectSwitchAttempts => "direct switch attempts",
            SchedStat::DirectSwitchSuccesses => "direct switch successes",
            SchedStat::Migrations => "migrations",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Stats([u64; STAT_COUNT]);

impl Stats {
    pub fn bump(&mut self, stat: SchedStat) {
        self.0[stat.index()] += 1;
    }

    pub fn get(&self, stat: SchedStat) -> u64 {
        self.0[stat.index()]
    }
}

/// Mutable per-output state, guarded by the slot mutex.
pub(crate) struct OutputCore<R: TraceRecord> {
    pub cur_input: Option<usize>,
    pub prev_input: Option<usize>,
    /// Parked until re-dispatch (replay idle, blocked queue, inactive).
    pub waiting: bool,
    pub wait_start_time: u64,
    pub at_eof: bool,
    /// Caller time from the latest `next_record`.
    pub cur_time: u64,

    pub in_kernel_code: bool,
    pub in_context_switch_code: bool,
    /// The switch-end marker was seen; clearing `in_context_switch_code`
    /// waits for the next record so the marker itself still counts as
    /// inside the sequence.
    pub hit_switch_code_end: bool,

    /// Resume-point stack; non-empty while speculating.
    pub speculation_stack: Vec<u64>,
    pub speculate_pc: u64,
    pub prev_speculate_pc: u64,
    pub speculator: Speculator<R>,

    /// Recorded segments when a record stream is attached.
    pub record: Vec<ScheduleSegment>,

    /// Static input list for the consistent-output mode.
    pub assigned_inputs: Vec<usize>,
    pub assigned_cursor: usize,

    pub stats: Stats,
    pub last_record: R,
    /// Instructions delivered by this output; gates switch-sequence
    /// injection (no injection before the first instruction).
    pub delivered_instrs: u64,
    /// Cpu id from the as-traced schedule, when replaying one.
    pub as_traced_cpuid: Option<u64>,
}

impl<R: TraceRecord> OutputCore<R> {
    pub fn new(speculator: Speculator<R>) -> Self {
        Self {
            cur_input: None,
            prev_input: None,
            waiting: false,
            wait_start_time: 0,
            at_eof: false,
            cur_time: 0,
            in_kernel_code: false,
            in_context_switch_code: false,
            hit_switch_code_end: false,
            speculation_stack: Vec::new(),
            speculate_pc: 0,
            prev_speculate_pc: 0,
            speculator,
            record: Vec::new(),
            assigned_inputs: Vec::new(),
            assigned_cursor: 0,
            stats: Stats::default(),
            last_record: R::invalid(),
            delivered_instrs: 0,
            as_traced_cpuid: None,
        }
    }
}

/// One output slot: the locked core plus the lock-free cross-output view.
pub(crate) struct OutputSlot<R: TraceRecord> {
    pub core: Mutex<OutputCore<R>>,
    /// Replay segments; immutable once init finishes.
    pub replay: Vec<ScheduleSegment>,
    /// Index of the replay segment being executed; -1 before the first.
    /// Atomic so sibling outputs can check timestamp ordering without
    /// taking this output's lock.
    pub record_index: AtomicI64,
    pub active: AtomicBool,
}

impl<R: TraceRecord> OutputSlot<R> {
    pub fn new(speculator: Speculator<R>) -> Self {
        Self {
            core: Mutex::new(OutputCore::new(speculator)),
            replay: Vec::new(),
            record_index: AtomicI64::new(-1),
            active: AtomicBool::new(true),
        }
    }
}
