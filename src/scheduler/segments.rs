//! Schedule segment wire format and the component archive that stores it.
//!
//! A recorded schedule is one component per output, named `output.%04d`,
//! each holding a flat array of fixed-size segments:
//!
//! ```text
//! segment := { type: u32, pad: u32, key: u64, value: u64,
//!              stop_instruction: u64, timestamp: u64 }     // 40 bytes LE
//! ```
//!
//! The first segment of every component is a `Version` with
//! `key == SCHEDULE_VERSION_CURRENT`; the last is a `Footer`. The layout is
//! bit-exact across runs so recorded files diff cleanly.
//!
//! The as-traced cpu schedule uses a smaller entry, grouped by cpu with one
//! component per cpu:
//!
//! ```text
//! entry := { thread: u64, cpu: u32, start_instruction: u64,
//!            timestamp: u64 }                              // 28 bytes LE
//! ```
//!
//! The archive container is deliberately simple: a magic header, then per
//! component a length-prefixed name and a length-prefixed gzip payload.
//! Readers iterate components in file order and reads continue across
//! component boundaries, which is what sequential whole-archive consumers
//! (the as-traced ingest, the replay checker) rely on.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::scheduler::status::InitError;

/// Current recorded-schedule format version.
pub const SCHEDULE_VERSION_CURRENT: u64 = 2;

/// Encoded size of one [`ScheduleSegment`].
pub const SEGMENT_BYTES: usize = 40;
/// Encoded size of one [`TracedEntry`].
pub const TRACED_ENTRY_BYTES: usize = 28;

const ARCHIVE_MAGIC: &[u8; 8] = b"TMUXARC1";

/// Segment discriminant; numeric values are part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentType {
    /// Format version; `key` holds the version number.
    Version,
    /// Run this input (`key`) from `value` (start instruction) up to the
    /// exclusive `stop_instruction`.
    Default,
    /// Skip this input from `value` to `stop_instruction`.
    Skip,
    /// Inject a synthetic thread exit for this input (ROI ended it early).
    SyntheticEnd,
    /// The output sat idle for `value` (idle duration) time units.
    Idle,
    /// End of component.
    Footer,
}

impl SegmentType {
    fn to_wire(self) -> u32 {
        match self {
            SegmentType::Version => 0,
            SegmentType::Default => 1,
            SegmentType::Skip => 2,
            SegmentType::SyntheticEnd => 3,
            SegmentType::Idle => 4,
            SegmentType::Footer => 5,
        }
    }

    fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(SegmentType::Version),
            1 => Some(SegmentType::Default),
            2 => Some(SegmentType::Skip),
            3 => Some(SegmentType::SyntheticEnd),
            4 => Some(SegmentType::Idle),
            5 => Some(SegmentType::Footer),
            _ => None,
        }
    }
}

/// One span of a recorded per-output schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleSegment {
    pub seg_type: SegmentType,
    /// Input ordinal, or the version number for `Version` segments.
    pub key: u64,
    /// Start instruction, or the idle duration for `Idle` segments.
    pub value: u64,
    /// Exclusive stop instruction; `u64::MAX` for to-end spans.
    pub stop_instruction: u64,
    /// Wall-clock microseconds when the segment opened.
    pub timestamp: u64,
}

impl ScheduleSegment {
    pub fn new(seg_type: SegmentType, key: u64, value: u64, stop: u64, timestamp: u64) -> Self {
        Self {
            seg_type,
            key,
            value,
            stop_instruction: stop,
            timestamp,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.seg_type.to_wire().to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.stop_instruction.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn decode(buf: &[u8; SEGMENT_BYTES]) -> Result<Self, InitError> {
        let wire = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let seg_type = SegmentType::from_wire(wire)
            .ok_or_else(|| InitError::invalid_parameter(format!("bad segment type {wire}")))?;
        Ok(Self {
            seg_type,
            key: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            value: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            stop_instruction: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }
}

/// One as-traced schedule entry: this thread started running on this cpu at
/// this instruction count, at this timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracedEntry {
    pub thread: u64,
    pub cpu: u32,
    pub start_instruction: u64,
    pub timestamp: u64,
}

impl TracedEntry {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.thread.to_le_bytes());
        out.extend_from_slice(&self.cpu.to_le_bytes());
        out.extend_from_slice(&self.start_instruction.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn decode(buf: &[u8; TRACED_ENTRY_BYTES]) -> Self {
        Self {
            thread: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            cpu: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            start_instruction: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        }
    }
}

/// Component name for an output's schedule: `output.0000`, `output.0001`, ...
pub fn output_component_name(output: usize) -> String {
    format!("output.{output:04}")
}

/// Writes named components to an archive stream.
pub trait ComponentWrite: Send {
    /// Finalizes the current component (if any) and starts a new one.
    fn open_component(&mut self, name: &str) -> io::Result<()>;
    /// Appends to the current component.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Finalizes the last component and flushes the container.
    fn finish(&mut self) -> io::Result<()>;
}

/// Reads components from an archive stream.
///
/// After [`open_component`](Self::open_component), reads start at that
/// component and continue across component boundaries; a fresh reader is
/// positioned at the first component.
pub trait ComponentRead: Send {
    /// Seeks to the named component. `Ok(false)` when absent.
    fn open_component(&mut self, name: &str) -> io::Result<bool>;
    /// Reads up to `buf.len()` bytes. `Ok(0)` only at end of archive.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Reads exactly `buf.len()` bytes, or nothing.
///
/// `Ok(false)` at a clean end of archive; a partial record is corruption
/// and errors out.
pub fn read_exact_or_end(
    reader: &mut dyn ComponentRead,
    buf: &mut [u8],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record at end of archive",
            ));
        }
        filled += n;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Container implementation
// ---------------------------------------------------------------------------

struct PendingComponent {
    name: String,
    payload: Vec<u8>,
}

/// Archive writer over any `Write` sink. Components are buffered in memory
/// and gzip-compressed on finalize; schedule payloads are small.
pub struct ArchiveWriter<W: Write + Send> {
    sink: W,
    wrote_magic: bool,
    pending: Option<PendingComponent>,
}

impl<W: Write + Send> ArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            wrote_magic: false,
            pending: None,
        }
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if !self.wrote_magic {
            self.sink.write_all(ARCHIVE_MAGIC)?;
            self.wrote_magic = true;
        }
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&pending.payload)?;
        let compressed = encoder.finish()?;
        let name = pending.name.as_bytes();
        self.sink
            .write_all(&u16::try_from(name.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "component name too long")
            })?
            .to_le_bytes())?;
        self.sink.write_all(name)?;
        self.sink
            .write_all(&(compressed.len() as u64).to_le_bytes())?;
        self.sink.write_all(&compressed)?;
        Ok(())
    }
}

impl<W: Write + Send> ComponentWrite for ArchiveWriter<W> {
    fn open_component(&mut self, name: &str) -> io::Result<()> {
        self.flush_pending()?;
        self.pending = Some(PendingComponent {
            name: name.to_string(),
            payload: Vec::new(),
        });
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.pending {
            Some(pending) => {
                pending.payload.extend_from_slice(data);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write before open_component",
            )),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.sink.flush()
    }
}

/// Fully parsed archive held in memory for reading.
pub struct ArchiveReader {
    components: Vec<PendingComponent>,
    component: usize,
    offset: usize,
}

impl ArchiveReader {
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < ARCHIVE_MAGIC.len() || &bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a schedule archive",
            ));
        }
        let mut components = Vec::new();
        let mut pos = ARCHIVE_MAGIC.len();
        while pos < bytes.len() {
            let take = |n: usize, pos: &mut usize| -> io::Result<&[u8]> {
                if *pos + n > bytes.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated archive",
                    ));
                }
                let slice = &bytes[*pos..*pos + n];
                *pos += n;
                Ok(slice)
            };
            let name_len = u16::from_le_bytes(take(2, &mut pos)?.try_into().unwrap()) as usize;
            let name = String::from_utf8_lossy(take(name_len, &mut pos)?).into_owned();
            let payload_len =
                u64::from_le_bytes(take(8, &mut pos)?.try_into().unwrap()) as usize;
            let compressed = take(payload_len, &mut pos)?;
            let mut payload = Vec::new();
            GzDecoder::new(compressed).read_to_end(&mut payload)?;
            components.push(PendingComponent { name, payload });
        }
        Ok(Self {
            components,
            component: 0,
            offset: 0,
        })
    }

    pub fn open_path(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|c| c.name.as_str())
    }
}

impl ComponentRead for ArchiveReader {
    fn open_component(&mut self, name: &str) -> io::Result<bool> {
        match self.components.iter().position(|c| c.name == name) {
            Some(idx) => {
                self.component = idx;
                self.offset = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.component < self.components.len() {
            let payload = &self.components[self.component].payload;
            if self.offset < payload.len() {
                let n = buf.len().min(payload.len() - self.offset);
                buf[..n].copy_from_slice(&payload[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.component += 1;
            self.offset = 0;
        }
        Ok(0)
    }
}

/// Shared in-memory archive for record-then-replay within one process.
#[derive(Clone, Default)]
pub struct MemArchive {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> MemArchiveWriter {
        MemArchiveWriter {
            inner: ArchiveWriter::new(Vec::new()),
            shared: Arc::clone(&self.bytes),
        }
    }

    /// Snapshot-based reader; call after the writer finished.
    pub fn reader(&self) -> io::Result<ArchiveReader> {
        let bytes = self.bytes.lock().expect("mem archive poisoned");
        ArchiveReader::from_bytes(&bytes)
    }
}

pub struct MemArchiveWriter {
    inner: ArchiveWriter<Vec<u8>>,
    shared: Arc<Mutex<Vec<u8>>>,
}

impl ComponentWrite for MemArchiveWriter {
    fn open_component(&mut self, name: &str) -> io::Result<()> {
        self.inner.open_component(name)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()?;
        let mut shared = self.shared.lock().expect("mem archive poisoned");
        *shared = self.inner.sink.clone();
        Ok(())
    }
}

/// File-backed archive writer.
pub struct FileArchiveWriter {
    inner: ArchiveWriter<std::io::BufWriter<std::fs::File>>,
}

impl FileArchiveWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            inner: ArchiveWriter::new(std::io::BufWriter::new(file)),
        })
    }
}

impl ComponentWrite for FileArchiveWriter {
    fn open_component(&mut self, name: &str) -> io::Result<()> {
        self.inner.open_component(name)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

/// Validates a recorded schedule file without replaying it.
///
/// Rejects consecutive `Idle` segments: they balloon the file and the
/// recorder is required to merge them.
pub fn check_replay_file(reader: &mut dyn ComponentRead) -> Result<(), InitError> {
    let mut buf = [0u8; SEGMENT_BYTES];
    let mut prev_was_idle = false;
    loop {
        let more = read_exact_or_end(reader, &mut buf)
            .map_err(|e| InitError::file_read(e.to_string()))?;
        if !more {
            return Ok(());
        }
        let segment = ScheduleSegment::decode(&buf)?;
        if segment.seg_type == SegmentType::Idle {
            if prev_was_idle {
                return Err(InitError::invalid_parameter(
                    "consecutive idle records in schedule file",
                ));
            }
            prev_was_idle = true;
        } else {
            prev_was_idle = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(seg_type: SegmentType, key: u64) -> ScheduleSegment {
        ScheduleSegment::new(seg_type, key, 10, 20, 30)
    }

    #[test]
    fn segment_codec_round_trip() {
        let mut bytes = Vec::new();
        let original = seg(SegmentType::Default, 3);
        original.encode(&mut bytes);
        assert_eq!(bytes.len(), SEGMENT_BYTES);
        let decoded = ScheduleSegment::decode(bytes.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn segment_golden_bytes() {
        let mut bytes = Vec::new();
        ScheduleSegment::new(SegmentType::Skip, 1, 2, 3, 4).encode(&mut bytes);
        let expected: Vec<u8> = [
            2u32.to_le_bytes().as_slice(),
            0u32.to_le_bytes().as_slice(),
            1u64.to_le_bytes().as_slice(),
            2u64.to_le_bytes().as_slice(),
            3u64.to_le_bytes().as_slice(),
            4u64.to_le_bytes().as_slice(),
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn traced_entry_codec() {
        let entry = TracedEntry {
            thread: 1234,
            cpu: 7,
            start_instruction: 99,
            timestamp: 1_000_000,
        };
        let mut bytes = Vec::new();
        entry.encode(&mut bytes);
        assert_eq!(bytes.len(), TRACED_ENTRY_BYTES);
        assert_eq!(
            TracedEntry::decode(bytes.as_slice().try_into().unwrap()),
            entry
        );
    }

    #[test]
    fn archive_components_round_trip() {
        let mem = MemArchive::new();
        let mut w = mem.writer();
        w.open_component("output.0000").unwrap();
        w.write_all(b"hello").unwrap();
        w.open_component("output.0001").unwrap();
        w.write_all(b"world").unwrap();
        w.finish().unwrap();

        let mut r = mem.reader().unwrap();
        assert!(r.open_component("output.0001").unwrap());
        let mut buf = [0u8; 5];
        assert!(read_exact_or_end(&mut r, &mut buf).unwrap());
        assert_eq!(&buf, b"world");
        assert!(!r.open_component("output.0002").unwrap());
        // Reads continue across boundaries from the start.
        assert!(r.open_component("output.0000").unwrap());
        let mut all = [0u8; 10];
        assert!(read_exact_or_end(&mut r, &mut all).unwrap());
        assert_eq!(&all, b"helloworld");
    }

    #[test]
    fn checker_rejects_double_idle() {
        let mem = MemArchive::new();
        let mut w = mem.writer();
        w.open_component("output.0000").unwrap();
        let mut bytes = Vec::new();
        seg(SegmentType::Version, SCHEDULE_VERSION_CURRENT).encode(&mut bytes);
        seg(SegmentType::Idle, 0).encode(&mut bytes);
        seg(SegmentType::Idle, 0).encode(&mut bytes);
        w.write_all(&bytes).unwrap();
        w.finish().unwrap();
        let mut r = mem.reader().unwrap();
        assert!(check_replay_file(&mut r).is_err());
    }

    #[test]
    fn checker_accepts_separated_idle() {
        let mem = MemArchive::new();
        let mut w = mem.writer();
        w.open_component("output.0000").unwrap();
        let mut bytes = Vec::new();
        seg(SegmentType::Version, SCHEDULE_VERSION_CURRENT).encode(&mut bytes);
        seg(SegmentType::Idle, 0).encode(&mut bytes);
        seg(SegmentType::Default, 0).encode(&mut bytes);
        seg(SegmentType::Idle, 0).encode(&mut bytes);
        seg(SegmentType::Footer, 0).encode(&mut bytes);
        w.write_all(&bytes).unwrap();
        w.finish().unwrap();
        let mut r = mem.reader().unwrap();
        check_replay_file(&mut r).unwrap();
    }

    #[test]
    fn component_names_are_fixed_width() {
        assert_eq!(output_component_name(0), "output.0000");
        assert_eq!(output_component_name(37), "output.0037");
    }
}
