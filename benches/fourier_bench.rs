//! Benchmarks for the Fourier pipeline.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ocean_fourier::spectrum::{
    process_data, DisplacementBufferCpu, DisplacementChannels, ExecutionMode, FourierCpu,
    Packing, PhillipsCondition, PhillipsParams, SpectrumBuffer, SpectrumCondition,
};
use ocean_fourier::tasks::{NeverCancel, Scheduler};

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("2D Transform");

    for size in [64, 128, 256] {
        let fourier = FourierCpu::new(size).unwrap();
        let cells = size * size;
        group.throughput(Throughput::Elements(cells as u64));

        for packing in [Packing::Single, Packing::Double] {
            let mut data = [vec![[0.5, 0.25, 0.125, 1.0]; cells], vec![[1.0; 4]; cells]];
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", packing), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        black_box(fourier.transform(packing, &mut data, 0, &NeverCancel).unwrap());
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_process_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("Redistribution");
    let size = 128;
    let data = vec![[1.0, 2.0, 3.0, 4.0]; size * size];
    let mut results = vec![[0.0; 4]; size * size];
    let mut channels = DisplacementChannels::new(size);

    for num_grids in 1..=4 {
        group.bench_with_input(
            BenchmarkId::new("process_data", num_grids),
            &num_grids,
            |b, &grids| {
                b.iter(|| {
                    for slot in 0..3 {
                        process_data(slot, grids, &mut results, &data, &mut channels);
                    }
                    black_box(&channels);
                });
            },
        );
    }

    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("Frame");
    group.measurement_time(Duration::from_secs(8));
    let size = 128;

    let condition: Arc<dyn SpectrumCondition> =
        Arc::new(PhillipsCondition::new(size, PhillipsParams::default()).unwrap());

    let modes = [
        ("synchronous", ExecutionMode::Synchronous),
        (
            "4 workers",
            ExecutionMode::Scheduled(Arc::new(Scheduler::new(4).unwrap())),
        ),
    ];
    for (name, mode) in modes {
        let mut buffer = DisplacementBufferCpu::new(size, 3, mode).unwrap();
        let mut time = 0.0;
        group.bench_function(name, |b| {
            b.iter(|| {
                time += 0.016;
                buffer.run(Arc::clone(&condition), time).unwrap();
                buffer.wait(Duration::from_secs(10));
                black_box(buffer.is_done());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_transform, bench_process_data, bench_frames);
criterion_main!(benches);
