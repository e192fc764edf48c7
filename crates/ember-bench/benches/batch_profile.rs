//! Whole-batch benchmarks: one rank, and two ranks migrating particles.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_bench::reference_config;
use ember_domain::ChannelTransport;
use ember_engine::Context;
use ember_test_utils::{run_cluster, CountingTracker, PointSource, RandomWalkTracker};

/// 10K histories absorbed on first contact: pool and rank-loop overhead.
fn bench_single_rank(c: &mut Criterion) {
    let transport = ChannelTransport::cluster(1).remove(0);
    let mut ctx = Context::new(reference_config(), transport).unwrap();
    let source = PointSource::new(10_000, 1);
    let tracker = CountingTracker::default();
    let mut batch = 0;
    c.bench_function("batch_single_rank_10k", |b| {
        b.iter(|| {
            batch += 1;
            ctx.run_batch(batch, &source, &tracker).unwrap()
        });
    });
}

/// 4K histories random-walking across two ranks.
fn bench_two_rank_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_two_rank_walk");
    group.sample_size(10);
    group.bench_function("4k_histories", |b| {
        b.iter(|| {
            run_cluster(2, |t| {
                let mut ctx = Context::new(reference_config(), t).unwrap();
                let tracker = RandomWalkTracker::new(5, 2);
                let m = ctx
                    .run_batch(0, &PointSource::new(4_000, 2), &tracker)
                    .unwrap();
                ctx.shutdown().unwrap();
                m.tracked
            })
        });
    });
    group.finish();
}

criterion_group!(benches, bench_single_rank, bench_two_rank_walk);
criterion_main!(benches);
