use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use fiber::{CountdownEvent, FiberAttr, FiberConfig, LaunchPolicy, Runtime};
use std::sync::Arc;

fn bench_spawn_join(c: &mut Criterion) {
    let rt = Runtime::new(FiberConfig::new().concurrency(4)).unwrap();
    let mut group = c.benchmark_group("spawn_join");

    group.bench_function("from_thread", |b| {
        b.iter(|| rt.spawn(|| {}).unwrap().join().unwrap())
    });

    group.bench_function("batch_of_100_urgent", |b| {
        b.iter_batched(
            || Arc::new(CountdownEvent::new(100)),
            |done| {
                let d = done.clone();
                rt.spawn(move || {
                    for _ in 0..100 {
                        let d = d.clone();
                        fiber::spawn_with(
                            FiberAttr::small().launch(LaunchPolicy::Immediately),
                            move || d.signal(1),
                        )
                        .unwrap()
                        .detach();
                    }
                })
                .unwrap()
                .detach();
                done.wait();
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_yield(c: &mut Criterion) {
    let rt = Runtime::new(FiberConfig::new().concurrency(1)).unwrap();
    c.bench_function("yield_1000", |b| {
        b.iter(|| {
            rt.block_on(|| {
                for _ in 0..1000 {
                    fiber::yield_now();
                }
            })
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_spawn_join, bench_yield);
criterion_main!(benches);
