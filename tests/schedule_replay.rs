//! Record/replay round trips and as-traced schedule replay.

use tracemux::scheduler::{
    check_replay_file, output_component_name, ComponentRead, MemArchive, SegmentType, TracedEntry,
    SCHEDULE_VERSION_CURRENT,
};
use tracemux::workload::InstrRange;
use tracemux::{
    MappingMode, MarkerKind, MemrefRecord, NextRecord, QuantumUnit, ReaderSpec, Scheduler,
    SchedulerIo, SchedulerOptions, ThreadModifiers, VecReader, WorkloadSpec,
};

fn instr(tid: i64, pc: u64) -> MemrefRecord {
    MemrefRecord::Instr {
        tid,
        pid: 1,
        pc,
        size: 4,
    }
}

fn marker(tid: i64, kind: MarkerKind, value: u64) -> MemrefRecord {
    MemrefRecord::Marker {
        tid,
        pid: 1,
        kind,
        value,
    }
}

fn ver(tid: i64) -> MemrefRecord {
    marker(tid, MarkerKind::Version, 6)
}

fn ts(tid: i64, value: u64) -> MemrefRecord {
    marker(tid, MarkerKind::Timestamp, value)
}

fn workload(inputs: Vec<(i64, Vec<MemrefRecord>)>) -> WorkloadSpec<MemrefRecord> {
    WorkloadSpec::from_readers(
        inputs
            .into_iter()
            .map(|(tid, records)| ReaderSpec {
                reader: Box::new(VecReader::new(records)) as Box<dyn tracemux::RecordReader<_>>,
                tid,
            })
            .collect(),
    )
}

fn drain(stream: &mut tracemux::OutputStream<MemrefRecord>) -> Vec<MemrefRecord> {
    let mut records = Vec::new();
    let mut t = 100u64;
    for _ in 0..100_000 {
        match stream.next_record_at(t) {
            NextRecord::Record(r) => records.push(r),
            NextRecord::Idle | NextRecord::Wait => {}
            NextRecord::Eof => return records,
            other => panic!("unexpected status: {other:?}"),
        }
        t += 10;
    }
    panic!("output did not reach eof");
}

fn quantum_inputs() -> Vec<(i64, Vec<MemrefRecord>)> {
    vec![
        (
            100,
            vec![
                ver(100),
                ts(100, 1000),
                instr(100, 0x10),
                instr(100, 0x14),
                instr(100, 0x18),
                instr(100, 0x1c),
            ],
        ),
        (
            200,
            vec![ver(200), ts(200, 1100), instr(200, 0xb0), instr(200, 0xb4)],
        ),
    ]
}

#[test]
fn recorded_schedule_replays_identically() {
    let archive = MemArchive::new();
    let record_sequence = {
        let options = SchedulerOptions {
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 3,
            ..Default::default()
        };
        let io = SchedulerIo {
            schedule_record: Some(Box::new(archive.writer())),
            ..Default::default()
        };
        let sched = Scheduler::init(vec![workload(quantum_inputs())], 1, options, io).unwrap();
        let mut stream = sched.stream(0).unwrap();
        let records = drain(&mut stream);
        sched.write_recorded_schedule().unwrap();
        records
    };

    // The recorded file passes the consecutive-idle check.
    let mut checker_reader = archive.reader().unwrap();
    check_replay_file(&mut checker_reader).unwrap();

    let replay_sequence = {
        let options = SchedulerOptions {
            mapping: MappingMode::AsPreviously,
            ..Default::default()
        };
        let io = SchedulerIo {
            schedule_replay: Some(Box::new(archive.reader().unwrap())),
            ..Default::default()
        };
        let sched = Scheduler::init(vec![workload(quantum_inputs())], 1, options, io).unwrap();
        let mut stream = sched.stream(0).unwrap();
        drain(&mut stream)
    };

    assert_eq!(record_sequence, replay_sequence);
}

#[test]
fn recorded_log_brackets_with_version_and_footer() {
    let archive = MemArchive::new();
    {
        let io = SchedulerIo {
            schedule_record: Some(Box::new(archive.writer())),
            ..Default::default()
        };
        let sched = Scheduler::init(
            vec![workload(quantum_inputs())],
            1,
            SchedulerOptions::default(),
            io,
        )
        .unwrap();
        let mut stream = sched.stream(0).unwrap();
        drain(&mut stream);
        sched.write_recorded_schedule().unwrap();
    }
    let mut reader = archive.reader().unwrap();
    assert!(reader.open_component(&output_component_name(0)).unwrap());
    let mut segments = Vec::new();
    let mut buf = [0u8; tracemux::scheduler::segments::SEGMENT_BYTES];
    while tracemux::scheduler::segments::read_exact_or_end(&mut reader, &mut buf).unwrap() {
        segments.push(tracemux::scheduler::ScheduleSegment::decode(&buf).unwrap());
    }
    let first = segments.first().unwrap();
    assert_eq!(first.seg_type, SegmentType::Version);
    assert_eq!(first.key, SCHEDULE_VERSION_CURRENT);
    assert_eq!(segments.last().unwrap().seg_type, SegmentType::Footer);
    // No consecutive idles anywhere in between.
    for pair in segments.windows(2) {
        assert!(!(pair[0].seg_type == SegmentType::Idle && pair[1].seg_type == SegmentType::Idle));
    }
}

#[test]
fn roi_skip_survives_record_replay() {
    let records: Vec<MemrefRecord> = (0..20).map(|k| instr(100, 0x1000 + 4 * k)).collect();
    let archive = MemArchive::new();
    let make_workload = |records: &[MemrefRecord]| {
        let mut spec = workload(vec![(100, records.to_vec())]);
        spec.thread_modifiers =
            vec![ThreadModifiers::with_regions(vec![InstrRange::new(5, 10)])];
        spec
    };

    let recorded = {
        let options = SchedulerOptions {
            read_inputs_in_init: false,
            ..Default::default()
        };
        let io = SchedulerIo {
            schedule_record: Some(Box::new(archive.writer())),
            ..Default::default()
        };
        let sched = Scheduler::init(vec![make_workload(&records)], 1, options, io).unwrap();
        let mut stream = sched.stream(0).unwrap();
        let out = drain(&mut stream);
        sched.write_recorded_schedule().unwrap();
        out
    };
    // Instructions 5..=10 then the synthetic exit.
    let pcs: Vec<u64> = recorded
        .iter()
        .filter_map(|r| match r {
            MemrefRecord::Instr { pc, .. } => Some(*pc),
            _ => None,
        })
        .collect();
    let expected: Vec<u64> = (5u64..=10).map(|k| 0x1000 + 4 * (k - 1)).collect();
    assert_eq!(pcs, expected);
    assert!(matches!(
        recorded.last(),
        Some(MemrefRecord::ThreadExit { .. })
    ));

    let replayed = {
        // The replay run takes no ROI: the skip is in the recorded log.
        let options = SchedulerOptions {
            mapping: MappingMode::AsPreviously,
            read_inputs_in_init: false,
            ..Default::default()
        };
        let io = SchedulerIo {
            schedule_replay: Some(Box::new(archive.reader().unwrap())),
            ..Default::default()
        };
        let sched = Scheduler::init(vec![workload(vec![(100, records)])], 1, options, io).unwrap();
        let mut stream = sched.stream(0).unwrap();
        drain(&mut stream)
    };
    assert_eq!(recorded, replayed);
}

fn traced_archive(entries: &[TracedEntry]) -> MemArchive {
    use tracemux::scheduler::ComponentWrite;
    let archive = MemArchive::new();
    let mut writer = archive.writer();
    let mut cur_cpu = None;
    for entry in entries {
        if cur_cpu != Some(entry.cpu) {
            writer.open_component(&format!("cpu.{}", entry.cpu)).unwrap();
            cur_cpu = Some(entry.cpu);
        }
        let mut bytes = Vec::new();
        entry.encode(&mut bytes);
        writer.write_all(&bytes).unwrap();
    }
    writer.finish().unwrap();
    archive
}

#[test]
fn as_traced_schedule_maps_cpus_to_outputs() {
    let a = vec![ver(100), ts(100, 1000), instr(100, 0xa0), instr(100, 0xa4)];
    let b = vec![ver(200), ts(200, 1001), instr(200, 0xb0)];
    let archive = traced_archive(&[
        TracedEntry {
            thread: 100,
            cpu: 5,
            start_instruction: 0,
            timestamp: 1000,
        },
        TracedEntry {
            thread: 200,
            cpu: 7,
            start_instruction: 0,
            timestamp: 1001,
        },
    ]);
    let options = SchedulerOptions {
        mapping: MappingMode::ToRecordedOutput,
        ..Default::default()
    };
    let io = SchedulerIo {
        replay_as_traced: Some(Box::new(archive.reader().unwrap())),
        ..Default::default()
    };
    let sched = Scheduler::init(
        vec![workload(vec![(100, a.clone()), (200, b.clone())])],
        2,
        options,
        io,
    )
    .unwrap();
    let mut s0 = sched.stream(0).unwrap();
    let mut s1 = sched.stream(1).unwrap();
    assert_eq!(s0.cpuid(), 5);
    assert_eq!(s1.cpuid(), 7);
    // Replay outputs only report EOF once every output is done, so drive
    // them together.
    let mut out0 = Vec::new();
    let mut out1 = Vec::new();
    let mut done0 = false;
    let mut done1 = false;
    let mut t = 100u64;
    for _ in 0..10_000 {
        for (stream, records, done) in [
            (&mut s0, &mut out0, &mut done0),
            (&mut s1, &mut out1, &mut done1),
        ] {
            match stream.next_record_at(t) {
                NextRecord::Record(r) => records.push(r),
                NextRecord::Eof => *done = true,
                NextRecord::Idle | NextRecord::Wait => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        if done0 && done1 {
            break;
        }
        t += 10;
    }
    assert!(done0 && done1);
    assert_eq!(out0, a);
    assert_eq!(out1, b);
}

#[test]
fn as_traced_handoff_waits_for_the_owning_output() {
    // One input migrates from cpu 0 to cpu 1 at instruction 2; the second
    // output must wait until the first has advanced that far.
    let a = vec![
        ver(100),
        ts(100, 1000),
        instr(100, 0x10),
        instr(100, 0x14),
        instr(100, 0x18),
        instr(100, 0x1c),
    ];
    let archive = traced_archive(&[
        TracedEntry {
            thread: 100,
            cpu: 0,
            start_instruction: 0,
            timestamp: 1000,
        },
        TracedEntry {
            thread: 100,
            cpu: 1,
            start_instruction: 2,
            timestamp: 2000,
        },
    ]);
    let options = SchedulerOptions {
        mapping: MappingMode::ToRecordedOutput,
        ..Default::default()
    };
    let io = SchedulerIo {
        replay_as_traced: Some(Box::new(archive.reader().unwrap())),
        ..Default::default()
    };
    let sched = Scheduler::init(vec![workload(vec![(100, a)])], 2, options, io).unwrap();
    let mut s0 = sched.stream(0).unwrap();
    let mut s1 = sched.stream(1).unwrap();

    // Output 1 starts in the wait state: input 100 has not reached instr 2.
    assert_eq!(s1.next_record_at(100), NextRecord::Wait);

    // Output 0 delivers the headers and the first two instructions.
    let mut first_span = Vec::new();
    let mut t = 100;
    loop {
        match s0.next_record_at(t) {
            NextRecord::Record(r) => first_span.push(r),
            NextRecord::Idle | NextRecord::Wait => break,
            other => panic!("unexpected {other:?}"),
        }
        t += 10;
    }
    // The second instruction is read as the span-closing candidate and
    // handed to the next output via the input queue.
    let pcs0: Vec<u64> = first_span
        .iter()
        .filter_map(|r| match r {
            MemrefRecord::Instr { pc, .. } => Some(*pc),
            _ => None,
        })
        .collect();
    assert_eq!(pcs0, vec![0x10]);

    // Now output 1 takes over the remainder.
    let rest = drain(&mut s1);
    let pcs1: Vec<u64> = rest
        .iter()
        .filter_map(|r| match r {
            MemrefRecord::Instr { pc, .. } => Some(*pc),
            _ => None,
        })
        .collect();
    assert_eq!(pcs1, vec![0x14, 0x18, 0x1c]);
    assert!(drain(&mut s0).is_empty());
}

#[test]
fn blocking_run_records_merged_idles() {
    // A blocks long enough that the output records an idle period; the
    // resulting file still has no consecutive idle segments.
    let a = vec![
        ver(100),
        ts(100, 1000),
        instr(100, 0x10),
        marker(100, MarkerKind::Syscall, 202),
        marker(100, MarkerKind::MaybeBlockingSyscall, 202),
        ts(100, 2000),
        instr(100, 0x14),
    ];
    let options = SchedulerOptions {
        time_units_per_us: 1.0,
        block_time_multiplier: 1.0,
        blocking_switch_threshold: 100,
        ..Default::default()
    };
    let archive = MemArchive::new();
    let io = SchedulerIo {
        schedule_record: Some(Box::new(archive.writer())),
        ..Default::default()
    };
    let sched = Scheduler::init(vec![workload(vec![(100, a)])], 1, options, io).unwrap();
    let mut stream = sched.stream(0).unwrap();
    let records = drain(&mut stream);
    assert_eq!(records.len(), 7);
    sched.write_recorded_schedule().unwrap();
    let mut reader = archive.reader().unwrap();
    check_replay_file(&mut reader).unwrap();
}
