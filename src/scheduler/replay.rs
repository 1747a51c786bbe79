//! Schedule ingestion: previously recorded schedules and as-traced cpu
//! schedules.
//!
//! Both paths produce per-output segment lists that the replay dispatcher
//! walks. The as-traced path is the messy one: the on-disk entries carry
//! only start instructions (no stops), may contain counts that were stored
//! modulo the trace chunk size by old writers, and may contain
//! zero-instruction duplicates when a signal arrived between timestamps.
//! Ingestion repairs what it can detect and refuses the rest.

use std::collections::BTreeSet;

use ahash::AHashMap;
use log::{debug, info, warn};

use crate::scheduler::segments::{
    read_exact_or_end, ComponentRead, ScheduleSegment, SegmentType, TracedEntry,
    output_component_name, SCHEDULE_VERSION_CURRENT, SEGMENT_BYTES, TRACED_ENTRY_BYTES,
};
use crate::scheduler::status::InitError;

/// Chunk instruction count assumed by the modulo-bug repair.
///
/// Writers affected by the bug all used this default; traces with a
/// different chunk size cannot hit the repair path (detection requires the
/// wrap point).
const REPAIR_CHUNK_INSTRS: u64 = 10_000_000;

/// Reads one recorded component per output.
///
/// Each component must open with a current-version `Version` segment and
/// close with a `Footer`; both are stripped from the returned lists. An
/// extra component beyond `output_count` means the file was recorded with
/// more outputs than this run has.
pub(crate) fn read_recorded_schedule(
    reader: &mut dyn ComponentRead,
    output_count: usize,
) -> Result<Vec<Vec<ScheduleSegment>>, InitError> {
    let mut per_output = Vec::with_capacity(output_count);
    for output in 0..output_count {
        let name = output_component_name(output);
        let opened = reader
            .open_component(&name)
            .map_err(|e| InitError::file_read(format!("open {name}: {e}")))?;
        if !opened {
            return Err(InitError::invalid_parameter(format!(
                "schedule replay stream missing component {name}"
            )));
        }
        let mut segments = Vec::new();
        let mut saw_version = false;
        let mut saw_footer = false;
        let mut buf = [0u8; SEGMENT_BYTES];
        while read_exact_or_end(reader, &mut buf)
            .map_err(|e| InitError::file_read(e.to_string()))?
        {
            let segment = ScheduleSegment::decode(&buf)?;
            match segment.seg_type {
                SegmentType::Version => {
                    if segment.key != SCHEDULE_VERSION_CURRENT {
                        return Err(InitError::invalid_parameter(format!(
                            "unsupported schedule version {}",
                            segment.key
                        )));
                    }
                    saw_version = true;
                }
                SegmentType::Footer => {
                    saw_footer = true;
                    break;
                }
                _ => segments.push(segment),
            }
        }
        if !saw_version {
            return Err(InitError::invalid_parameter(format!(
                "{name} missing version record"
            )));
        }
        if !saw_footer {
            return Err(InitError::invalid_parameter(format!(
                "{name} missing footer"
            )));
        }
        info!(
            "read {} recorded segments for output #{output}",
            segments.len()
        );
        per_output.push(segments);
    }
    let extra = output_component_name(output_count);
    if reader
        .open_component(&extra)
        .map_err(|e| InitError::file_read(e.to_string()))?
    {
        return Err(InitError::invalid_parameter(
            "not enough output streams for recorded file",
        ));
    }
    Ok(per_output)
}

/// One as-traced span as read, addressed both per cpu and per input.
#[derive(Clone, Copy, Debug)]
struct OutputTracker {
    valid: bool,
    input: usize,
    start_instruction: u64,
    stop_instruction: u64,
    timestamp: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct InputTracker {
    /// Disk-order cpu ordinal holding this span.
    output: usize,
    /// Index into that cpu's span list.
    output_idx: usize,
    pub start_instruction: u64,
    pub timestamp: u64,
}

/// Parsed and repaired as-traced schedule, still in disk (cpu) order.
#[derive(Debug)]
pub(crate) struct TracedSchedule {
    per_cpu: Vec<Vec<OutputTracker>>,
    cpuids: Vec<u64>,
    start2stop: Vec<BTreeSet<u64>>,
    /// Per input, sorted by timestamp. Also used for the times-of-interest
    /// conversion, which needs (timestamp, instruction) pairs per input.
    pub input_sched: Vec<Vec<InputTracker>>,
}

/// Reads and repairs the as-traced cpu schedule.
///
/// `max_cpus` bounds the cpu count when replaying onto a fixed output set;
/// `None` when the schedule is only mined for times-of-interest.
pub(crate) fn read_traced_schedule(
    reader: &mut dyn ComponentRead,
    tid2input: &AHashMap<i64, usize>,
    input_count: usize,
    max_cpus: Option<usize>,
) -> Result<TracedSchedule, InitError> {
    let mut per_cpu: Vec<Vec<OutputTracker>> = Vec::new();
    let mut cpuids: Vec<u64> = Vec::new();
    let mut input_sched: Vec<Vec<InputTracker>> = vec![Vec::new(); input_count];
    let mut start2stop: Vec<BTreeSet<u64>> = vec![BTreeSet::new(); input_count];

    let mut buf = [0u8; TRACED_ENTRY_BYTES];
    let mut cur_cpu: Option<u64> = None;
    while read_exact_or_end(reader, &mut buf).map_err(|e| InitError::file_read(e.to_string()))? {
        let entry = TracedEntry::decode(&buf);
        if cur_cpu != Some(u64::from(entry.cpu)) {
            // Component boundary: one component per cpu.
            if cur_cpu.is_some() {
                if let Some(max) = max_cpus {
                    if per_cpu.len() >= max {
                        return Err(InitError::invalid_parameter(
                            "as-traced stream cpu count != output count",
                        ));
                    }
                }
            }
            cur_cpu = Some(u64::from(entry.cpu));
            cpuids.push(u64::from(entry.cpu));
            per_cpu.push(Vec::new());
        }
        let cpu_ord = per_cpu.len() - 1;
        let input = *tid2input.get(&(entry.thread as i64)).ok_or_else(|| {
            InitError::invalid_parameter(format!(
                "as-traced schedule references unknown thread {}",
                entry.thread
            ))
        })?;
        // A signal can land right after a timestamp with no instructions in
        // between, giving two entries with the same start; keep one.
        if let Some(last) = per_cpu[cpu_ord].last() {
            if last.input == input && last.start_instruction == entry.start_instruction {
                debug!(
                    "cpu ordinal {cpu_ord}: span at {} has no instructions, skipping",
                    entry.start_instruction
                );
                continue;
            }
        }
        per_cpu[cpu_ord].push(OutputTracker {
            valid: true,
            input,
            start_instruction: entry.start_instruction,
            stop_instruction: 0,
            timestamp: entry.timestamp,
        });
        start2stop[input].insert(entry.start_instruction);
        input_sched[input].push(InputTracker {
            output: cpu_ord,
            output_idx: per_cpu[cpu_ord].len() - 1,
            start_instruction: entry.start_instruction,
            timestamp: entry.timestamp,
        });
    }

    let mut sched = TracedSchedule {
        per_cpu,
        cpuids,
        start2stop,
        input_sched,
    };
    repair_modulo_wraps(&mut sched)?;
    remove_zero_instruction_spans(&mut sched);
    Ok(sched)
}

/// Detects and repairs start counts stored modulo the chunk size.
///
/// Affected writers wrapped the instruction count at each trace chunk, so a
/// thread's spans show decreasing starts at chunk boundaries. When the drop
/// happens within the upper half of the assumed chunk we add the chunk size
/// back; a drop anywhere else is real corruption.
fn repair_modulo_wraps(sched: &mut TracedSchedule) -> Result<(), InitError> {
    let input_count = sched.input_sched.len();
    let mut timestamp2adjust: Vec<AHashMap<u64, u64>> = vec![AHashMap::new(); input_count];
    let mut found_wrap = false;

    for (input, entries) in sched.input_sched.iter_mut().enumerate() {
        entries.sort_by_key(|e| e.timestamp);
        let mut prev_start = 0u64;
        let mut add_to_start = 0u64;
        let mut in_order = true;
        for entry in entries.iter_mut() {
            if entry.start_instruction < prev_start {
                if prev_start * 2 > REPAIR_CHUNK_INSTRS {
                    add_to_start += REPAIR_CHUNK_INSTRS;
                    if in_order {
                        warn!("repairing modulo-wrapped schedule counts for input #{input}");
                        in_order = false;
                        found_wrap = true;
                    }
                } else {
                    return Err(InitError::invalid_parameter(
                        "invalid decreasing start field in schedule file",
                    ));
                }
            }
            if timestamp2adjust[input].contains_key(&entry.timestamp) {
                return Err(InitError::invalid_parameter(
                    "duplicate timestamps not supported for modulo repair",
                ));
            }
            prev_start = entry.start_instruction;
            let adjusted = entry.start_instruction + add_to_start;
            timestamp2adjust[input].insert(entry.timestamp, adjusted);
            entry.start_instruction = adjusted;
        }
    }
    if !found_wrap {
        return Ok(());
    }
    // Re-key the start sets and patch the per-cpu spans via timestamps.
    for (input, set) in sched.start2stop.iter_mut().enumerate() {
        set.clear();
        set.extend(timestamp2adjust[input].values().copied());
    }
    for spans in sched.per_cpu.iter_mut() {
        for span in spans.iter_mut() {
            if !span.valid {
                continue;
            }
            let adjusted = timestamp2adjust[span.input]
                .get(&span.timestamp)
                .copied()
                .ok_or_else(|| {
                    InitError::invalid_parameter("failed to find timestamp during modulo repair")
                })?;
            debug_assert!(adjusted >= span.start_instruction);
            debug_assert_eq!(adjusted % REPAIR_CHUNK_INSTRS, span.start_instruction);
            span.start_instruction = adjusted;
        }
    }
    Ok(())
}

/// Drops the older of two same-start spans of one input.
///
/// Instruction-ordinal control points cannot express two spans with zero
/// instructions between them; the later entry is the one bundled with real
/// instructions, so it wins.
fn remove_zero_instruction_spans(sched: &mut TracedSchedule) {
    for (input, entries) in sched.input_sched.iter().enumerate() {
        // Already timestamp-sorted by the repair pass.
        let mut prev_start = 0u64;
        for (i, entry) in entries.iter().enumerate() {
            debug_assert!(entry.start_instruction >= prev_start);
            if i > 0 && entry.start_instruction == prev_start {
                debug!(
                    "dropping same-start span of input #{input} at {}",
                    entry.start_instruction
                );
                let prev = &entries[i - 1];
                sched.per_cpu[prev.output][prev.output_idx].valid = false;
            }
            prev_start = entry.start_instruction;
        }
    }
}

/// Final per-output replay state synthesized from an as-traced schedule.
pub(crate) struct InstantiatedTraced {
    /// One entry per populated output, already sorted by cpuid.
    pub per_output: Vec<Vec<ScheduleSegment>>,
    pub cpuids: Vec<u64>,
}

/// Fills in stop instructions, collapses consecutive same-input spans, and
/// orders outputs by cpuid.
pub(crate) fn instantiate_traced_schedule(
    sched: &TracedSchedule,
) -> Result<InstantiatedTraced, InitError> {
    // Sort outputs by cpuid for a natural ordering; the disk order is
    // whatever order the writer saw the cpus in.
    let mut by_cpuid: Vec<usize> = (0..sched.cpuids.len()).collect();
    by_cpuid.sort_by_key(|&disk| sched.cpuids[disk]);

    let mut per_output = Vec::with_capacity(by_cpuid.len());
    let mut cpuids = Vec::with_capacity(by_cpuid.len());
    for &disk in &by_cpuid {
        let spans = &sched.per_cpu[disk];
        let mut segments: Vec<ScheduleSegment> = Vec::new();
        let mut consec_start: Option<usize> = None;
        for idx in 0..spans.len() {
            let span = spans[idx];
            if !span.valid {
                continue;
            }
            let stop = sched.start2stop[span.input]
                .range((
                    std::ops::Bound::Excluded(span.start_instruction),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .copied()
                .unwrap_or(u64::MAX);
            let next = spans[idx + 1..].iter().find(|s| s.valid);
            if let Some(next) = next {
                if next.input == span.input && stop > next.start_instruction {
                    return Err(InitError::invalid_parameter(
                        "invalid decreasing start field in schedule file",
                    ));
                }
                if next.input == span.input && stop == next.start_instruction {
                    // Collapse into the next span.
                    if consec_start.is_none() {
                        consec_start = Some(idx);
                    }
                    continue;
                }
            }
            let first = consec_start.take().unwrap_or(idx);
            segments.push(ScheduleSegment::new(
                SegmentType::Default,
                spans[first].input as u64,
                spans[first].start_instruction,
                stop,
                spans[first].timestamp,
            ));
        }
        info!(
            "as-traced cpu {} collapsed to {} segments",
            sched.cpuids[disk],
            segments.len()
        );
        if segments.is_empty() {
            return Err(InitError::invalid_parameter("empty as-traced schedule"));
        }
        per_output.push(segments);
        cpuids.push(sched.cpuids[disk]);
    }
    Ok(InstantiatedTraced { per_output, cpuids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::segments::{ComponentWrite, MemArchive};

    fn tid_map(tids: &[i64]) -> AHashMap<i64, usize> {
        tids.iter().enumerate().map(|(i, &t)| (t, i)).collect()
    }

    fn write_entries(entries: &[TracedEntry]) -> MemArchive {
        let mem = MemArchive::new();
        let mut w = mem.writer();
        let mut cur_cpu = None;
        for entry in entries {
            if cur_cpu != Some(entry.cpu) {
                w.open_component(&format!("cpu.{}", entry.cpu)).unwrap();
                cur_cpu = Some(entry.cpu);
            }
            let mut bytes = Vec::new();
            entry.encode(&mut bytes);
            w.write_all(&bytes).unwrap();
        }
        w.finish().unwrap();
        mem
    }

    fn entry(thread: u64, cpu: u32, start: u64, timestamp: u64) -> TracedEntry {
        TracedEntry {
            thread,
            cpu,
            start_instruction: start,
            timestamp,
        }
    }

    #[test]
    fn stops_come_from_next_start() {
        let mem = write_entries(&[
            entry(100, 0, 0, 10),
            entry(100, 0, 50, 30),
            entry(101, 1, 0, 20),
        ]);
        let mut r = mem.reader().unwrap();
        let sched = read_traced_schedule(&mut r, &tid_map(&[100, 101]), 2, None).unwrap();
        let inst = instantiate_traced_schedule(&sched).unwrap();
        assert_eq!(inst.cpuids, vec![0, 1]);
        let out0 = &inst.per_output[0];
        assert_eq!(out0[0].stop_instruction, 50);
        assert_eq!(out0[1].stop_instruction, u64::MAX);
    }

    #[test]
    fn consecutive_same_input_spans_collapse() {
        // Input 0 runs 0..10 and 10..MAX on the same cpu: one segment.
        let mem = write_entries(&[entry(100, 0, 0, 10), entry(100, 0, 10, 20)]);
        let mut r = mem.reader().unwrap();
        let sched = read_traced_schedule(&mut r, &tid_map(&[100]), 1, None).unwrap();
        let inst = instantiate_traced_schedule(&sched).unwrap();
        assert_eq!(inst.per_output[0].len(), 1);
        assert_eq!(inst.per_output[0][0].value, 0);
        assert_eq!(inst.per_output[0][0].stop_instruction, u64::MAX);
    }

    #[test]
    fn zero_instruction_duplicate_keeps_later() {
        // Input 100 has two spans starting at 25, on different cpus; the
        // older one (timestamp 10) is dropped in favor of the later one.
        let mem = write_entries(&[
            entry(100, 0, 0, 5),
            entry(100, 0, 25, 10),
            entry(100, 1, 25, 40),
        ]);
        let mut r = mem.reader().unwrap();
        let sched = read_traced_schedule(&mut r, &tid_map(&[100]), 1, None).unwrap();
        let inst = instantiate_traced_schedule(&sched).unwrap();
        // cpu 0 keeps only its 0..25 span; cpu 1 owns 25..end.
        assert_eq!(inst.per_output[0].len(), 1);
        assert_eq!(inst.per_output[0][0].value, 0);
        assert_eq!(inst.per_output[0][0].stop_instruction, 25);
        assert_eq!(inst.per_output[1].len(), 1);
        assert_eq!(inst.per_output[1][0].value, 25);
        assert_eq!(inst.per_output[1][0].stop_instruction, u64::MAX);
    }

    #[test]
    fn modulo_wrap_is_repaired() {
        // Wrap from 9.5M down to 1000 within the upper half of the chunk.
        let mem = write_entries(&[
            entry(100, 0, 9_500_000, 10),
            entry(100, 0, 1_000, 20),
        ]);
        let mut r = mem.reader().unwrap();
        let sched = read_traced_schedule(&mut r, &tid_map(&[100]), 1, None).unwrap();
        let starts: Vec<u64> = sched.input_sched[0]
            .iter()
            .map(|e| e.start_instruction)
            .collect();
        assert_eq!(starts, vec![9_500_000, 10_001_000]);
    }

    #[test]
    fn early_decrease_is_an_error() {
        // Drop from 1000 to 10: not near a chunk boundary, not repairable.
        let mem = write_entries(&[entry(100, 0, 1_000, 10), entry(100, 0, 10, 20)]);
        let mut r = mem.reader().unwrap();
        let err = read_traced_schedule(&mut r, &tid_map(&[100]), 1, None).unwrap_err();
        assert!(matches!(err, InitError::InvalidParameter(_)));
    }

    #[test]
    fn recorded_schedule_requires_version_and_footer() {
        let mem = MemArchive::new();
        let mut w = mem.writer();
        w.open_component(&output_component_name(0)).unwrap();
        let mut bytes = Vec::new();
        ScheduleSegment::new(SegmentType::Default, 0, 0, 10, 0).encode(&mut bytes);
        w.write_all(&bytes).unwrap();
        w.finish().unwrap();
        let mut r = mem.reader().unwrap();
        assert!(read_recorded_schedule(&mut r, 1).is_err());
    }
}
