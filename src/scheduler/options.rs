//! Scheduler configuration.
//!
//! [`SchedulerOptions`] is plain data (serde-derived, sparse files work via
//! defaults). External streams and reader handles live in [`SchedulerIo`],
//! which cannot be serialized and is consumed by `Scheduler::init`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::reader::{ReaderFactory, RecordReader};
use crate::record::TraceRecord;
use crate::scheduler::segments::{ComponentRead, ComponentWrite};
use crate::scheduler::status::InitError;

/// How inputs are mapped onto outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingMode {
    /// Replay a schedule recorded by a prior run.
    AsPreviously,
    /// Fully dynamic dispatch: priority queues, quanta, blocking, direct
    /// switches. The normal simulation mode.
    ToAnyOutput,
    /// Static round-robin assignment at init; no migration, lock-free.
    ToConsistentOutput,
    /// Replay the CPU assignment recorded in the original trace.
    ToRecordedOutput,
}

/// Cross-input dependency handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepsMode {
    Ignore,
    /// Order inputs by their trace timestamps.
    Timestamps,
}

/// Unit for the scheduling quantum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantumUnit {
    Instructions,
    /// Caller-supplied time; see `time_units_per_us`.
    Time,
}

/// Tuning and mode knobs. All fields have workable defaults; construct with
/// `SchedulerOptions { mapping: ..., ..Default::default() }`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    pub mapping: MappingMode,
    pub deps: DepsMode,
    pub quantum_unit: QuantumUnit,
    /// Preempt threshold for instruction quanta.
    pub quantum_duration_instrs: u64,
    /// Preempt threshold for time quanta, in simulated microseconds.
    pub quantum_duration_us: u64,
    /// How many caller time units make up one simulated microsecond.
    pub time_units_per_us: f64,
    /// Scale from syscall latency to modeled blocked time.
    pub block_time_multiplier: f64,
    /// Upper bound on any single blocked interval, in microseconds.
    /// Also bounds how long unscheduled inputs can starve the outputs
    /// before being flushed back to the ready queue.
    pub block_time_max_us: u64,
    /// Latency cutoff for switching on maybe-blocking syscalls, us.
    pub blocking_switch_threshold: u64,
    /// Latency cutoff for switching on ordinary syscalls, us.
    pub syscall_switch_threshold: u64,
    /// Act on direct-switch / unschedule / schedule markers.
    pub honor_direct_switches: bool,
    /// Pop a random eligible ready-queue entry instead of the best one.
    pub randomize_next_input: bool,
    /// Seed for the randomized pop; fixed default keeps runs reproducible.
    pub rng_seed: u64,
    /// Pre-read each input's filetype (and timestamp where needed) during
    /// init so callers can query them before the first record.
    pub read_inputs_in_init: bool,
    /// Fuse all outputs onto one lockstep stream for serial analysis.
    pub single_lockstep_output: bool,
    /// Report shard ordinals as input ordinals rather than output ordinals.
    pub use_input_ordinals: bool,
    /// Like `use_input_ordinals` but auto-enabled only for the single-input
    /// single-output case.
    pub use_single_input_ordinals: bool,
    /// Use the nop speculator when an output speculates.
    pub speculate_nops: bool,
    /// Emit a window marker even when entering the first region of
    /// interest. Off by default to match recorded traces.
    pub emit_initial_window_marker: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mapping: MappingMode::ToAnyOutput,
            deps: DepsMode::Ignore,
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 10_000_000,
            quantum_duration_us: 5_000,
            time_units_per_us: 100.0,
            block_time_multiplier: 10.0,
            block_time_max_us: 25_000,
            blocking_switch_threshold: 100,
            syscall_switch_threshold: 500,
            honor_direct_switches: true,
            randomize_next_input: false,
            rng_seed: 0x9e37_79b9_7f4a_7c15,
            read_inputs_in_init: true,
            single_lockstep_output: false,
            use_input_ordinals: false,
            use_single_input_ordinals: false,
            speculate_nops: true,
            emit_initial_window_marker: false,
        }
    }
}

impl SchedulerOptions {
    /// Rejects option combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.quantum_duration_instrs == 0 {
            return Err(InitError::invalid_parameter(
                "quantum_duration_instrs must be > 0",
            ));
        }
        if self.quantum_duration_us == 0 {
            return Err(InitError::invalid_parameter(
                "quantum_duration_us must be > 0",
            ));
        }
        if self.time_units_per_us <= 0.0 {
            return Err(InitError::invalid_parameter("time_units_per_us must be > 0"));
        }
        if self.block_time_multiplier == 0.0 {
            return Err(InitError::invalid_parameter(
                "block_time_multiplier must be != 0",
            ));
        }
        if self.block_time_max_us == 0 {
            return Err(InitError::invalid_parameter("block_time_max_us must be > 0"));
        }
        Ok(())
    }
}

/// External streams and reader handles consumed at init.
///
/// Not serializable; pair it with a [`SchedulerOptions`].
pub struct SchedulerIo<R: TraceRecord> {
    /// Destination for the recorded schedule (record/replay round trips).
    pub schedule_record: Option<Box<dyn ComponentWrite>>,
    /// Source of a previously recorded schedule (`MappingMode::AsPreviously`).
    pub schedule_replay: Option<Box<dyn ComponentRead>>,
    /// Source of the as-traced cpu schedule
    /// (`MappingMode::ToRecordedOutput`, times-of-interest conversion).
    pub replay_as_traced: Option<Box<dyn ComponentRead>>,
    /// Kernel context-switch sequence trace, by path (opened via the
    /// factory) or as a pre-built reader.
    pub kernel_switch_path: Option<PathBuf>,
    pub kernel_switch_reader: Option<Box<dyn RecordReader<R>>>,
    /// Opens path-based workload inputs and `kernel_switch_path`.
    pub reader_factory: Option<Box<dyn ReaderFactory<R>>>,
}

impl<R: TraceRecord> Default for SchedulerIo<R> {
    fn default() -> Self {
        Self {
            schedule_record: None,
            schedule_replay: None,
            replay_as_traced: None,
            kernel_switch_path: None,
            kernel_switch_reader: None,
            reader_factory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SchedulerOptions::default().validate().unwrap();
    }

    #[test]
    fn zero_quantum_rejected() {
        let opts = SchedulerOptions {
            quantum_duration_instrs: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn sparse_deserialization_fills_defaults() {
        let opts: SchedulerOptions =
            serde_json::from_str(r#"{"mapping":"ToConsistentOutput"}"#).unwrap();
        assert_eq!(opts.mapping, MappingMode::ToConsistentOutput);
        assert_eq!(opts.quantum_duration_instrs, 10_000_000);
        assert!(opts.honor_direct_switches);
    }

    #[test]
    fn roundtrip_through_json() {
        let opts = SchedulerOptions {
            quantum_unit: QuantumUnit::Time,
            quantum_duration_us: 42,
            ..Default::default()
        };
        let text = serde_json::to_string(&opts).unwrap();
        let back: SchedulerOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(back.quantum_duration_us, 42);
        assert_eq!(back.quantum_unit, QuantumUnit::Time);
    }
}
