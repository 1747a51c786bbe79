//! Record abstraction over the two trace schemas.
//!
//! The scheduler moves records around without caring which concrete schema
//! they come from. Two schemas exist:
//!
//! - **Memref** ([`MemrefRecord`]): the high-level schema where every record
//!   carries its tid/pid. Header records have been folded into markers by the
//!   decoder, so there are no bare headers in the stream.
//! - **Raw entry** ([`RawEntryRecord`]): the low-level schema where tid/pid
//!   exist only on dedicated header records. On a context switch the
//!   scheduler must re-inject those headers so a downstream consumer sees the
//!   new thread context ([`TraceRecord::switch_context_records`]).
//!
//! All scheduler code is generic over [`TraceRecord`] rather than matching on
//! a concrete schema.

/// Marker kinds the scheduler understands.
///
/// Values it does not act on still flow through unchanged via `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// Wall-clock microseconds at trace buffer flush.
    Timestamp,
    /// Trace format version.
    Version,
    /// Trace file type bits.
    Filetype,
    CacheLineSize,
    ChunkInstrCount,
    PageSize,
    /// System call entry (value = syscall number).
    Syscall,
    /// System call that may block (value = syscall number).
    MaybeBlockingSyscall,
    /// The thread voluntarily descheduled itself.
    SyscallUnschedule,
    /// The thread requested a specific target be made runnable (value = tid).
    SyscallSchedule,
    /// Timeout argument of the in-progress syscall, in microseconds.
    SyscallArgTimeout,
    /// Kernel handed off directly to a specific thread (value = tid).
    DirectThreadSwitch,
    /// Start of an injected kernel context-switch sequence (value = switch kind).
    ContextSwitchStart,
    /// End of an injected kernel context-switch sequence (value = switch kind).
    ContextSwitchEnd,
    SyscallTraceStart,
    SyscallTraceEnd,
    /// Region-of-interest separator (value = region ordinal).
    WindowId,
    /// Branch target address; glued to the following instruction.
    BranchTarget,
    /// Any marker the scheduler does not interpret.
    Other(u16),
}

/// Kind of context-switch sequence to inject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SwitchKind {
    /// Switch between threads of the same process.
    Thread,
    /// Switch crossing a process boundary.
    Process,
}

impl SwitchKind {
    pub fn from_marker_value(value: u64) -> Option<SwitchKind> {
        match value {
            1 => Some(SwitchKind::Process),
            2 => Some(SwitchKind::Thread),
            _ => None,
        }
    }

    pub fn marker_value(self) -> u64 {
        match self {
            SwitchKind::Process => 1,
            SwitchKind::Thread => 2,
        }
    }
}

/// Minimum trace version with timestamps bracketing every syscall.
///
/// Older traces get the simplified blocking model: every maybe-blocking
/// syscall is treated as blocking.
pub const VERSION_FREQUENT_TIMESTAMPS: u64 = 6;

/// Capability set the scheduler needs from a record, independent of schema.
///
/// Implementations are plain value types; the scheduler clones records freely
/// when queueing them.
pub trait TraceRecord: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// True for instruction-fetch records.
    fn is_instr(&self) -> bool;

    /// True for standalone encoding records (raw schema only).
    fn is_encoding(&self) -> bool;

    /// Marker kind and value, if this is a marker.
    fn marker(&self) -> Option<(MarkerKind, u64)>;

    /// Timestamp value, if this is a timestamp marker.
    fn timestamp(&self) -> Option<u64> {
        match self.marker() {
            Some((MarkerKind::Timestamp, v)) => Some(v),
            _ => None,
        }
    }

    /// True when this record starts a new instruction, given the record that
    /// preceded it in the same stream.
    ///
    /// For the raw schema, encodings and branch-target markers are glued to
    /// the instruction they precede, so the boundary is the first pre-instr
    /// record of the group.
    fn is_instr_boundary(&self, prev: &Self) -> bool;

    /// True for non-marker header records (raw schema only).
    fn is_non_marker_header(&self) -> bool;

    fn is_invalid(&self) -> bool;

    /// Thread id, where the schema carries one on this record.
    fn tid(&self) -> Option<i64>;

    /// Process id, where the schema carries one on this record.
    fn pid(&self) -> Option<i64>;

    /// Retag the record with a new tid, where the schema carries one.
    fn set_tid(&mut self, tid: i64);

    /// Synthetic region separator inserted after an ROI skip.
    fn window_marker(tid: i64, region: u64) -> Self;

    /// Synthetic thread exit inserted when an ROI ends an input early.
    fn thread_exit(tid: i64) -> Self;

    /// Sentinel record; [`TraceRecord::is_invalid`] returns true for it.
    fn invalid() -> Self;

    /// Synthetic instruction fabricated by the speculator.
    fn speculated_instr(tid: i64, pc: u64, size: u16) -> Self;

    /// Header records to re-inject at a context switch so a consumer sees
    /// the incoming thread context. Empty for schemas that carry tid/pid on
    /// every record.
    fn switch_context_records(tid: i64, pid: i64) -> Vec<Self>;

    /// Whether `unread_last_record` is supported for this schema.
    ///
    /// The raw schema cannot re-derive instruction boundaries after an
    /// unread (the pre-previous record is gone), so it opts out.
    const UNREAD_SUPPORTED: bool;
}

/// High-level schema: tid/pid on every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemrefRecord {
    Instr {
        tid: i64,
        pid: i64,
        pc: u64,
        size: u16,
    },
    Marker {
        tid: i64,
        pid: i64,
        kind: MarkerKind,
        value: u64,
    },
    ThreadEnter {
        tid: i64,
        pid: i64,
    },
    ThreadExit {
        tid: i64,
        pid: i64,
    },
    Invalid,
}

impl MemrefRecord {
    /// Timestamp marker shorthand used widely in tests.
    pub fn timestamp_marker(tid: i64, value: u64) -> Self {
        MemrefRecord::Marker {
            tid,
            pid: 0,
            kind: MarkerKind::Timestamp,
            value,
        }
    }
}

impl TraceRecord for MemrefRecord {
    fn is_instr(&self) -> bool {
        matches!(self, MemrefRecord::Instr { .. })
    }

    fn is_encoding(&self) -> bool {
        // Encoding bytes live inside instruction records in this schema.
        false
    }

    fn marker(&self) -> Option<(MarkerKind, u64)> {
        match self {
            MemrefRecord::Marker { kind, value, .. } => Some((*kind, *value)),
            _ => None,
        }
    }

    fn is_instr_boundary(&self, _prev: &Self) -> bool {
        self.is_instr()
    }

    fn is_non_marker_header(&self) -> bool {
        // Headers are folded into markers by the decoder for this schema.
        false
    }

    fn is_invalid(&self) -> bool {
        matches!(self, MemrefRecord::Invalid)
    }

    fn tid(&self) -> Option<i64> {
        match self {
            MemrefRecord::Instr { tid, .. }
            | MemrefRecord::Marker { tid, .. }
            | MemrefRecord::ThreadEnter { tid, .. }
            | MemrefRecord::ThreadExit { tid, .. } => Some(*tid),
            MemrefRecord::Invalid => None,
        }
    }

    fn pid(&self) -> Option<i64> {
        match self {
            MemrefRecord::Instr { pid, .. }
            | MemrefRecord::Marker { pid, .. }
            | MemrefRecord::ThreadEnter { pid, .. }
            | MemrefRecord::ThreadExit { pid, .. } => Some(*pid),
            MemrefRecord::Invalid => None,
        }
    }

    fn set_tid(&mut self, new_tid: i64) {
        match self {
            MemrefRecord::Instr { tid, .. }
            | MemrefRecord::Marker { tid, .. }
            | MemrefRecord::ThreadEnter { tid, .. }
            | MemrefRecord::ThreadExit { tid, .. } => *tid = new_tid,
            MemrefRecord::Invalid => {}
        }
    }

    fn window_marker(tid: i64, region: u64) -> Self {
        MemrefRecord::Marker {
            tid,
            pid: 0,
            kind: MarkerKind::WindowId,
            value: region,
        }
    }

    fn thread_exit(tid: i64) -> Self {
        MemrefRecord::ThreadExit { tid, pid: 0 }
    }

    fn invalid() -> Self {
        MemrefRecord::Invalid
    }

    fn speculated_instr(tid: i64, pc: u64, size: u16) -> Self {
        MemrefRecord::Instr {
            tid,
            pid: 0,
            pc,
            size,
        }
    }

    fn switch_context_records(_tid: i64, _pid: i64) -> Vec<Self> {
        // Every record carries a tid already.
        Vec::new()
    }

    const UNREAD_SUPPORTED: bool = true;
}

/// Low-level schema: tid/pid only on dedicated header records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawEntryRecord {
    /// File header (value = version).
    Header { version: u64 },
    /// Thread context header.
    ThreadHeader { tid: i64 },
    /// Process context header.
    PidHeader { pid: i64 },
    Instr { pc: u64, size: u16 },
    /// Standalone instruction encoding bytes; precedes its instruction.
    Encoding { len: u16 },
    Marker { kind: MarkerKind, value: u64 },
    ThreadExit { tid: i64 },
    Invalid,
}

fn raw_is_pre_instr(record: &RawEntryRecord) -> bool {
    match record {
        RawEntryRecord::Encoding { .. } => true,
        RawEntryRecord::Marker { kind, .. } => *kind == MarkerKind::BranchTarget,
        _ => false,
    }
}

impl TraceRecord for RawEntryRecord {
    fn is_instr(&self) -> bool {
        matches!(self, RawEntryRecord::Instr { .. })
    }

    fn is_encoding(&self) -> bool {
        matches!(self, RawEntryRecord::Encoding { .. })
    }

    fn marker(&self) -> Option<(MarkerKind, u64)> {
        match self {
            RawEntryRecord::Marker { kind, value } => Some((*kind, *value)),
            _ => None,
        }
    }

    fn is_instr_boundary(&self, prev: &Self) -> bool {
        // Don't split an encoding or branch-target marker from its
        // instruction: the boundary is the first pre-instr record.
        (self.is_instr() || raw_is_pre_instr(self)) && !raw_is_pre_instr(prev)
    }

    fn is_non_marker_header(&self) -> bool {
        matches!(
            self,
            RawEntryRecord::Header { .. }
                | RawEntryRecord::ThreadHeader { .. }
                | RawEntryRecord::PidHeader { .. }
        )
    }

    fn is_invalid(&self) -> bool {
        matches!(self, RawEntryRecord::Invalid)
    }

    fn tid(&self) -> Option<i64> {
        match self {
            RawEntryRecord::ThreadHeader { tid } => Some(*tid),
            _ => None,
        }
    }

    fn pid(&self) -> Option<i64> {
        match self {
            RawEntryRecord::PidHeader { pid } => Some(*pid),
            _ => None,
        }
    }

    fn set_tid(&mut self, new_tid: i64) {
        if let RawEntryRecord::ThreadHeader { tid } = self {
            *tid = new_tid;
        }
    }

    fn window_marker(_tid: i64, region: u64) -> Self {
        RawEntryRecord::Marker {
            kind: MarkerKind::WindowId,
            value: region,
        }
    }

    fn thread_exit(tid: i64) -> Self {
        RawEntryRecord::ThreadExit { tid }
    }

    fn invalid() -> Self {
        RawEntryRecord::Invalid
    }

    fn speculated_instr(_tid: i64, pc: u64, size: u16) -> Self {
        RawEntryRecord::Instr { pc, size }
    }

    fn switch_context_records(tid: i64, pid: i64) -> Vec<Self> {
        // A downstream reader needs explicit tid,pid records to see the new
        // context. Callers push these to the queue front in reverse.
        vec![
            RawEntryRecord::ThreadHeader { tid },
            RawEntryRecord::PidHeader { pid },
        ]
    }

    const UNREAD_SUPPORTED: bool = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memref_boundary_ignores_prev() {
        let i = MemrefRecord::Instr {
            tid: 1,
            pid: 1,
            pc: 0x1000,
            size: 4,
        };
        let m = MemrefRecord::timestamp_marker(1, 5);
        assert!(i.is_instr_boundary(&m));
        assert!(i.is_instr_boundary(&i));
        assert!(!m.is_instr_boundary(&i));
    }

    #[test]
    fn raw_boundary_glues_encoding_to_instr() {
        let enc = RawEntryRecord::Encoding { len: 4 };
        let instr = RawEntryRecord::Instr { pc: 0x1000, size: 4 };
        let ts = RawEntryRecord::Marker {
            kind: MarkerKind::Timestamp,
            value: 7,
        };
        // The encoding opens the boundary; the instr after it does not.
        assert!(enc.is_instr_boundary(&ts));
        assert!(!instr.is_instr_boundary(&enc));
        assert!(instr.is_instr_boundary(&ts));
    }

    #[test]
    fn raw_switch_context_records_carry_ids() {
        let recs = RawEntryRecord::switch_context_records(42, 7);
        assert_eq!(recs[0].tid(), Some(42));
        assert_eq!(recs[1].pid(), Some(7));
        assert!(MemrefRecord::switch_context_records(42, 7).is_empty());
    }

    #[test]
    fn retag_thread_header() {
        let mut r = RawEntryRecord::ThreadHeader { tid: 1 };
        r.set_tid(9);
        assert_eq!(r.tid(), Some(9));
    }
}
