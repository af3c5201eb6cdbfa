//! Benchmarks for channel and pipeline throughput
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stagepipe::pipeline::stages::{CountStage, IterOrigin, MapStage};
use stagepipe::pipeline::{channel, CutPoints, PipelineBuilder, RatePolicy};
use std::thread;

const ITEMS: u64 = 10_000;

fn bench_channel_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_transfer");
    group.throughput(Throughput::Elements(ITEMS));

    for capacity in [0usize, 1, 16, 256].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            capacity,
            |b, &capacity| {
                b.iter(|| {
                    let (sink, source) = channel::<u64>(capacity);
                    let producer = thread::spawn(move || {
                        for i in 0..ITEMS {
                            sink.push(i);
                        }
                    });
                    let mut sum = 0u64;
                    while let Some(item) = source.pop() {
                        sum = sum.wrapping_add(item);
                    }
                    producer.join().unwrap();
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

fn bench_pipeline_cuts(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_cuts");
    group.throughput(Throughput::Elements(ITEMS));

    let modes = [
        ("serial", CutPoints::Serial),
        ("every_stage", CutPoints::EveryStage),
        ("one_cut", CutPoints::Before(vec![2])),
    ];

    for (label, cuts) in modes.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(label), cuts, |b, cuts| {
            b.iter(|| {
                let (count, counted) = CountStage::new("count");
                let pipeline = PipelineBuilder::new(IterOrigin::new("numbers", 0..ITEMS))
                    .channel_capacity(64)
                    .stage(MapStage::new("square", |x: u64| Ok(x.wrapping_mul(x))))
                    .stage(MapStage::new("shift", |x: u64| Ok(x >> 3)))
                    .stage(count)
                    .assemble(cuts.clone())
                    .unwrap();
                pipeline.run(RatePolicy::unthrottled()).unwrap();
                black_box(counted)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_channel_transfer, bench_pipeline_cuts);
criterion_main!(benches);
