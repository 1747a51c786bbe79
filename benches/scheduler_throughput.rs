//! Scheduler streaming throughput: dynamic dispatch over synthetic inputs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tracemux::{
    MarkerKind, MemrefRecord, NextRecord, QuantumUnit, ReaderSpec, Scheduler, SchedulerIo,
    SchedulerOptions, VecReader, WorkloadSpec,
};

fn synthetic_input(tid: i64, instrs: usize) -> Vec<MemrefRecord> {
    let mut records = Vec::with_capacity(instrs + 2);
    records.push(MemrefRecord::Marker {
        tid,
        pid: 1,
        kind: MarkerKind::Version,
        value: 6,
    });
    records.push(MemrefRecord::Marker {
        tid,
        pid: 1,
        kind: MarkerKind::Timestamp,
        value: 1_000,
    });
    for k in 0..instrs {
        records.push(MemrefRecord::Instr {
            tid,
            pid: 1,
            pc: 0x1000 + 4 * k as u64,
            size: 4,
        });
    }
    records
}

fn build_scheduler(inputs: usize, instrs_per_input: usize) -> Scheduler<MemrefRecord> {
    let specs = (0..inputs)
        .map(|i| ReaderSpec {
            reader: Box::new(VecReader::new(synthetic_input(100 + i as i64, instrs_per_input)))
                as Box<dyn tracemux::RecordReader<_>>,
            tid: 100 + i as i64,
        })
        .collect();
    let options = SchedulerOptions {
        quantum_unit: QuantumUnit::Instructions,
        quantum_duration_instrs: 100,
        ..Default::default()
    };
    Scheduler::init(
        vec![WorkloadSpec::from_readers(specs)],
        1,
        options,
        SchedulerIo::default(),
    )
    .expect("scheduler init")
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_drain");
    for &inputs in &[1usize, 4, 16] {
        let instrs = 10_000;
        group.throughput(criterion::Throughput::Elements((inputs * instrs) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(inputs),
            &inputs,
            |b, &inputs| {
                b.iter_with_setup(
                    || build_scheduler(inputs, instrs),
                    |sched| {
                        let mut stream = sched.stream(0).unwrap();
                        let mut delivered = 0u64;
                        let mut t = 1u64;
                        loop {
                            match stream.next_record_at(t) {
                                NextRecord::Record(_) => delivered += 1,
                                NextRecord::Eof => break,
                                _ => {}
                            }
                            t += 1;
                        }
                        black_box(delivered)
                    },
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_drain);
criterion_main!(benches);
