//! Record producer contract and the in-memory reference reader.
//!
//! Concrete trace decoders and decompressors live outside this crate; the
//! scheduler only sees the [`RecordReader`] trait. The contract mirrors a
//! streaming decoder: construction is cheap, [`RecordReader::init`] may block
//! (e.g. an IPC reader waiting for its producer), and advancing may block for
//! streaming sources. The scheduler therefore calls `init` lazily, right
//! before the first record is needed, and never holds unrelated locks across
//! reader calls.
//!
//! [`VecReader`] is the reference implementation over an in-memory record
//! vector. It powers the unit and integration tests and is useful for
//! synthetic workloads.

use std::path::Path;

use crate::record::{MarkerKind, TraceRecord};

/// Error from opening or initializing a reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadError(pub String);

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reader error: {}", self.0)
    }
}

impl std::error::Error for ReadError {}

/// Lazy, stateful producer of trace records.
///
/// After a successful [`init`](Self::init) the reader is positioned on its
/// first record (or at end for an empty stream). [`advance`](Self::advance)
/// moves to the next record. [`current`](Self::current) is only meaningful
/// while [`at_end`](Self::at_end) is false.
pub trait RecordReader<R: TraceRecord>: Send {
    /// Position on the first record. May block waiting for producer data.
    fn init(&mut self) -> Result<(), ReadError>;

    /// True when the stream is exhausted (or `init` has not been called).
    fn at_end(&self) -> bool;

    /// Move to the next record. No-op at end.
    fn advance(&mut self);

    /// The record at the current position.
    fn current(&self) -> R;

    /// Skip ahead over `count` instructions, so the next instruction
    /// delivered is `instruction_ordinal() + count + 1` at call time.
    /// Intervening non-instruction records are dropped; header values seen
    /// while scanning are still latched.
    fn skip_instructions(&mut self, count: u64);

    /// Number of records delivered so far, including the current one.
    fn record_ordinal(&self) -> u64;

    /// Number of instruction records delivered so far, including the current
    /// one if it is an instruction.
    fn instruction_ordinal(&self) -> u64;

    /// Most recent timestamp marker value seen, 0 if none.
    fn last_timestamp(&self) -> u64;

    /// First timestamp marker value seen, 0 if none.
    fn first_timestamp(&self) -> u64;

    fn version(&self) -> u64;
    fn filetype(&self) -> u64;
    fn cache_line_size(&self) -> u64;
    fn chunk_instr_count(&self) -> u64;
    fn page_size(&self) -> u64;

    /// True when the current record was synthesized by the producer rather
    /// than recorded from execution.
    fn is_record_synthetic(&self) -> bool {
        false
    }

    /// True when the current record comes from kernel-space tracing.
    fn is_record_kernel(&self) -> bool {
        false
    }

    /// Identifier for diagnostics (typically the source path).
    fn stream_name(&self) -> String {
        String::new()
    }
}

/// Opens readers from trace paths.
///
/// Supplied by the embedding application, which knows its on-disk formats.
pub trait ReaderFactory<R: TraceRecord>: Send {
    fn open(&self, path: &Path) -> Result<Box<dyn RecordReader<R>>, ReadError>;
}

/// In-memory reader over a prebuilt record vector.
///
/// Header values (version, filetype, cache line size, chunk instruction
/// count, page size) are latched from marker records as they pass the
/// cursor. Unlike an on-disk decoder it does not re-synthesize a timestamp
/// after [`skip_instructions`](RecordReader::skip_instructions); the latched
/// `last_timestamp` still reflects skipped-over timestamps.
pub struct VecReader<R> {
    records: Vec<R>,
    /// None until `init`; then index of the current record.
    pos: Option<usize>,
    record_ord: u64,
    instr_ord: u64,
    first_timestamp: u64,
    last_timestamp: u64,
    version: u64,
    filetype: u64,
    cache_line_size: u64,
    chunk_instr_count: u64,
    page_size: u64,
    name: String,
}

impl<R: TraceRecord> VecReader<R> {
    pub fn new(records: Vec<R>) -> Self {
        Self::named(records, String::new())
    }

    pub fn named(records: Vec<R>, name: String) -> Self {
        Self {
            records,
            pos: None,
            record_ord: 0,
            instr_ord: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            version: 0,
            filetype: 0,
            cache_line_size: 0,
            chunk_instr_count: 0,
            page_size: 0,
            name,
        }
    }

    fn latch(&mut self, idx: usize) {
        let rec = &self.records[idx];
        self.record_ord += 1;
        if rec.is_instr() {
            self.instr_ord += 1;
        }
        if let Some((kind, value)) = rec.marker() {
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
    }
}

impl<R: TraceRecord> RecordReader<R> for VecReader<R> {
    fn init(&mut self) -> Result<(), ReadError> {
        if self.pos.is_none() && !self.records.is_empty() {
            self.pos = Some(0);
            self.latch(0);
        }
        Ok(())
    }

    fn at_end(&self) -> bool {
        match self.pos {
            None => true,
            Some(p) => p >= self.records.len(),
        }
    }

    fn advance(&mut self) {
        if let Some(p) = self.pos {
            if p < self.records.len() {
                let next = p + 1;
                self.pos = Some(next);
                if next < self.records.len() {
                    self.latch(next);
                }
            }
        }
    }

    fn current(&self) -> R {
        match self.pos {
            Some(p) if p < self.records.len() => self.records[p].clone(),
            _ => R::invalid(),
        }
    }

    fn skip_instructions(&mut self, count: u64) {
        let target = self.instr_ord.saturating_add(count).saturating_add(1);
        while !self.at_end() && self.instr_ord < target {
            // Peek whether advancing lands on the target instruction; if so
            // we stop positioned on it.
            self.advance();
            if self.instr_ord >= target {
                break;
            }
        }
    }

    fn record_ordinal(&self) -> u64 {
        self.record_ord
    }

    fn instruction_ordinal(&self) -> u64 {
        self.instr_ord
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn filetype(&self) -> u64 {
        self.filetype
    }

    fn cache_line_size(&self) -> u64 {
        self.cache_line_size
    }

    fn chunk_instr_count(&self) -> u64 {
        self.chunk_instr_count
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn stream_name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemrefRecord;

    fn instr(pc: u64) -> MemrefRecord {
        MemrefRecord::Instr {
            tid: 1,
            pid: 1,
            pc,
            size: 4,
        }
    }

    fn reader_with_n_instrs(n: u64) -> VecReader<MemrefRecord> {
        let mut recs = vec![MemrefRecord::timestamp_marker(1, 100)];
        for i in 0..n {
            recs.push(instr(0x1000 + 4 * i));
        }
        VecReader::new(recs)
    }

    #[test]
    fn ordinals_track_position() {
        let mut r = reader_with_n_instrs(3);
        r.init().unwrap();
        assert_eq!(r.record_ordinal(), 1);
        assert_eq!(r.instruction_ordinal(), 0);
        assert_eq!(r.last_timestamp(), 100);
        r.advance();
        assert_eq!(r.instruction_ordinal(), 1);
        r.advance();
        r.advance();
        assert_eq!(r.instruction_ordinal(), 3);
        assert!(!r.at_end());
        r.advance();
        assert!(r.at_end());
    }

    #[test]
    fn skip_lands_on_target_instruction() {
        let mut r = reader_with_n_instrs(10);
        r.init().unwrap();
        // Next instruction delivered should be #0+2+1 = 3.
        r.skip_instructions(2);
        assert_eq!(r.instruction_ordinal(), 3);
        assert!(r.current().is_instr());
    }

    #[test]
    fn skip_past_end_hits_eof() {
        let mut r = reader_with_n_instrs(3);
        r.init().unwrap();
        r.skip_instructions(100);
        assert!(r.at_end());
    }

    #[test]
    fn empty_reader_is_at_end_after_init() {
        let mut r = VecReader::<MemrefRecord>::new(Vec::new());
        r.init().unwrap();
        assert!(r.at_end());
        assert!(r.current().is_invalid());
    }
}
