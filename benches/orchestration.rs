use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hits::backend::simulated::SimulatedRuntime;
use hits::buffer::AlignedBuffer;
use hits::progress::RecordingProgress;
use hits::transfer::allocate_all;
use hits::{engine, report, RunConfig};
use std::time::Duration;

fn config(transfers: usize, iterations: u64) -> RunConfig {
    let mut builder = RunConfig::builder()
        .transfer_size(1 << 20)
        .iterations(iterations)
        .sysfs_root("/nonexistent");
    for i in 0..transfers {
        builder = match i % 3 {
            0 => builder.host_to_device(0),
            1 => builder.device_to_host(1),
            _ => builder.device_to_device(0, 1),
        };
    }
    builder.build().expect("valid benchmark configuration")
}

fn bench_issue_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("issue_loop");

    for transfers in [1usize, 3, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("transfers", transfers),
            transfers,
            |b, &transfers| {
                let config = config(transfers, 100);
                b.iter(|| {
                    let runtime = SimulatedRuntime::fully_connected(2);
                    let mut descriptors = allocate_all(&runtime, &config).unwrap();
                    let sink = RecordingProgress::new();
                    engine::execute(&runtime, &mut descriptors, config.iterations, &sink)
                        .unwrap();
                    black_box(report::measure_all(&runtime, &descriptors, config.iterations))
                })
            },
        );
    }

    group.finish();
}

fn bench_setup(c: &mut Criterion) {
    let mut group = c.benchmark_group("setup");

    group.bench_function("allocate_three_kinds", |b| {
        let config = config(3, 1);
        b.iter(|| {
            let runtime = SimulatedRuntime::fully_connected(2);
            black_box(allocate_all(&runtime, &config).unwrap())
        })
    });

    for size in [4096usize, 1 << 20, 16 << 20].iter() {
        group.bench_with_input(BenchmarkId::new("pageable_touch", size), size, |b, &size| {
            b.iter(|| {
                let mut buffer = AlignedBuffer::new(size).unwrap();
                buffer.touch_pages();
                black_box(buffer)
            })
        });
    }

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_issue_loop, bench_setup
}
criterion_main!(benches);
