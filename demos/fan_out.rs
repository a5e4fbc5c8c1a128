use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use workpool::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let span = tracing::span!(tracing::Level::ERROR, "panic hook").entered();
        tracing::error!("{}", info);
        span.exit();
        hook(info);
    }));

    let settings = Settings::builder()
        .num_threads(4)
        .name("fan-out-demo")
        .build()
        .expect("valid settings");
    let pool = Pool::new(settings);
    let adapter = TaskSchedulerAdapter::new(pool.clone());

    let completed = Arc::new(AtomicUsize::new(0));
    for n in 0..2_000 {
        let completed = completed.clone();
        adapter.enqueue(move || {
            let m: u64 = (n % 20) as u64;
            std::thread::sleep(Duration::from_millis(m));
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while completed.load(Ordering::SeqCst) < 2_000 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    tracing::info!(
        completed = completed.load(Ordering::SeqCst),
        num_threads = pool.num_threads(),
        "fan-out demo finished"
    );

    pool.close();
    pool.wait_for_exit(Some(Duration::from_secs(10)));
}
