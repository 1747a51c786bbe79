//! Status and error taxonomy.
//!
//! Two families, by lifetime:
//!
//! - [`InitError`]: construction and schedule-ingestion failures. Fatal,
//!   surfaced immediately with a human-readable message.
//! - [`Status`]: the per-call result of the streaming state machine.
//!   Most variants are not errors at all: `Wait`/`Idle` mean "retry",
//!   `Skipped` is an internal control signal, `Eof` is the terminal state.

/// Fatal error from `Scheduler::init` or schedule ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// Bad option combination, out-of-range ordinal, missing required
    /// stream, overlapping ROIs, mixed ROI sources.
    InvalidParameter(String),
    FileOpen(String),
    FileRead(String),
    FileWrite(String),
}

impl InitError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        InitError::InvalidParameter(msg.into())
    }

    pub fn file_open(msg: impl Into<String>) -> Self {
        InitError::FileOpen(msg.into())
    }

    pub fn file_read(msg: impl Into<String>) -> Self {
        InitError::FileRead(msg.into())
    }

    pub fn file_write(msg: impl Into<String>) -> Self {
        InitError::FileWrite(msg.into())
    }

    /// The stored message.
    pub fn message(&self) -> &str {
        match self {
            InitError::InvalidParameter(m)
            | InitError::FileOpen(m)
            | InitError::FileRead(m)
            | InitError::FileWrite(m) => m,
        }
    }
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::InvalidParameter(m) => write!(f, "invalid parameter: {m}"),
            InitError::FileOpen(m) => write!(f, "file open failed: {m}"),
            InitError::FileRead(m) => write!(f, "file read failed: {m}"),
            InitError::FileWrite(m) => write!(f, "file write failed: {m}"),
        }
    }
}

impl std::error::Error for InitError {}

/// Non-record outcome of a streaming call.
///
/// Engine-internal helpers return `Result<T, Status>` so `?` propagates any
/// non-record outcome up to the stream boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// All records delivered; terminal and sticky.
    Eof,
    /// Blocked on another output's progress (replay); retry.
    Wait,
    /// Nothing runnable right now; retry.
    Idle,
    /// Records were skipped (ROI or replay skip); internal, the engine
    /// loops on it.
    Skipped,
    /// A bounded skip ran past end-of-trace.
    RegionInvalid,
    /// Protocol violation or reader failure.
    Invalid,
    /// Operation unsupported for this record schema.
    NotImplemented,
}

/// Result of `OutputStream::next_record`.
#[derive(Clone, Debug, PartialEq)]
pub enum NextRecord<R> {
    Record(R),
    /// Retry: blocked on another output's replay progress.
    Wait,
    /// Retry: nothing runnable on this output right now.
    Idle,
    Eof,
    /// A bounded region skip ran past end-of-trace.
    RegionInvalid,
    Invalid,
}

impl<R> NextRecord<R> {
    pub fn record(self) -> Option<R> {
        match self {
            NextRecord::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, NextRecord::Eof)
    }
}

impl<R> From<Status> for NextRecord<R> {
    fn from(status: Status) -> Self {
        match status {
            Status::Eof => NextRecord::Eof,
            Status::Wait => NextRecord::Wait,
            Status::Idle => NextRecord::Idle,
            Status::RegionInvalid => NextRecord::RegionInvalid,
            // Skipped never escapes the engine loop.
            Status::Skipped | Status::Invalid | Status::NotImplemented => NextRecord::Invalid,
        }
    }
}
