use criterion::{black_box, criterion_group, criterion_main, Criterion};
use workpool::prelude::*;

fn spawn_lot(b: &mut Criterion) {
    let pool = Pool::new(Settings::builder().num_threads(4).build().unwrap());
    b.bench_function("submit 10k noop", |b| {
        b.iter(|| {
            for _ in 0..10_000 {
                let _ = pool.submit(|| {
                    black_box(1 + 1);
                });
            }
        })
    });
}

fn spawn_single(b: &mut Criterion) {
    let pool = Pool::new(Settings::builder().num_threads(4).build().unwrap());
    b.bench_function("submit single noop", |b| {
        b.iter(|| {
            let _ = pool.submit(|| {
                black_box(1 + 1);
            });
        })
    });
}

criterion_group!(submit, spawn_lot, spawn_single);
criterion_main!(submit);
