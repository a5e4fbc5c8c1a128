use criterion::{black_box, criterion_group, criterion_main, Criterion};
use workpool::prelude::*;

fn enqueue_lot(b: &mut Criterion) {
    let pool = Pool::new(Settings::builder().num_threads(4).build().unwrap());
    let adapter = TaskSchedulerAdapter::new(pool);
    b.bench_function("adapter enqueue 10k noop", |b| {
        b.iter(|| {
            for _ in 0..10_000 {
                let _ = adapter.enqueue(|| {
                    black_box(1 + 1);
                });
            }
        })
    });
}

fn enqueue_single(b: &mut Criterion) {
    let pool = Pool::new(Settings::builder().num_threads(4).build().unwrap());
    let adapter = TaskSchedulerAdapter::new(pool);
    b.bench_function("adapter enqueue single noop", |b| {
        b.iter(|| {
            let _ = adapter.enqueue(|| {
                black_box(1 + 1);
            });
        })
    });
}

criterion_group!(adapter, enqueue_lot, enqueue_single);
criterion_main!(adapter);
