//! Multi-output trace scheduler with recordable, replayable schedules.
//!
//! The scheduler multiplexes a set of recorded per-thread instruction
//! traces ("inputs") onto a fixed set of simulated cores ("outputs"),
//! producing for each output the record sequence those threads would have
//! seen had they been scheduled on that core under the chosen policy.
//!
//! - Five mapping modes: dynamic dispatch with quanta and blocking, static
//!   assignment, serial timestamp ordering, replay of a prior run, replay
//!   of the schedule observed at trace time.
//! - Blocking-syscall modeling from the timestamps bracketing each call.
//! - Marker-driven direct thread switches, unschedule/reschedule requests.
//! - Regions of interest with transparent skipping and window markers.
//! - Bit-exact schedule recording for later deterministic replay.
//!
//! High-level flow (one output, one `next_record` call):
//! 1) Replay idle/wait bookkeeping, speculation short-circuit.
//! 2) Drain the input's queue, else advance its reader.
//! 3) Process markers (syscalls, switches, kernel sequences) and quanta.
//! 4) Re-dispatch when the input blocks, yields, or exhausts its quantum.
//! 5) Apply region-of-interest skips.
//!
//! Trace decoding is external: anything implementing
//! [`reader::RecordReader`] can feed the scheduler, and both the memref and
//! raw-entry record schemas are supported behind [`record::TraceRecord`].

pub mod reader;
pub mod record;
pub mod scheduler;
pub mod speculator;
pub mod workload;

pub use reader::{ReadError, ReaderFactory, RecordReader, VecReader};
pub use record::{MarkerKind, MemrefRecord, RawEntryRecord, SwitchKind, TraceRecord};
pub use scheduler::{
    DepsMode, InitError, MappingMode, NextRecord, OutputStream, QuantumUnit, SchedStat, Scheduler,
    SchedulerIo, SchedulerOptions, Status,
};
pub use workload::{InstrRange, ReaderSpec, ThreadModifiers, TimeRange, WorkloadSpec};
