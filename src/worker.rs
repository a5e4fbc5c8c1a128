//! One OS thread draining a [`WorkChannel`], tracking its own idleness and
//! honoring a cooperative stop signal.
//!
//! Grounded on the teacher's `ThreadManager` static-thread spawn loop
//! (`thread::Builder::new().name(...).spawn(...)`), generalized from an
//! async `run_static`/`run_dynamic` split to the spec's single synchronous
//! drain loop with an idle estimator instead of a park/unpark pair.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::channel::WorkChannel;
use crate::settings::{Settings, ThreadType};

/// One-shot completion token, fulfilled when the worker's thread returns.
#[derive(Clone)]
pub(crate) struct ExitSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ExitSignal {
    fn new() -> Self {
        ExitSignal {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn complete(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        *done = true;
        cvar.notify_all();
    }

    /// Waits for completion, bounded by `deadline` if given. Returns `true`
    /// if the signal fired before the deadline.
    pub(crate) fn wait(&self, deadline: Option<std::time::Instant>) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap();
        loop {
            if *done {
                return true;
            }
            match deadline {
                None => done = cvar.wait(done).unwrap(),
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) = cvar.wait_timeout(done, deadline - now).unwrap();
                    done = guard;
                    if result.timed_out() && !*done {
                        return false;
                    }
                }
            }
        }
    }
}

/// A live worker slot: its thread handle, its stop flag, its idleness
/// estimator and its exit signal. Held by the pool; never resurrected once
/// dead.
pub(crate) struct PoolWorker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    idle: Arc<AtomicI8>,
    exit_signal: ExitSignal,
}

/// `idle` is a crude EWMA, integer math: floor 0, cap 100, `-1` sentinel
/// for "thread has exited".
const IDLE_DEAD: i8 = -1;
const IDLE_MAX: i8 = 100;
const IDLE_MIN: i8 = 0;

/// Short tag folded into a worker's thread name for its `thread_type`, the
/// way the teacher's thread names fold in a role tag.
fn thread_type_tag(thread_type: ThreadType) -> &'static str {
    match thread_type {
        ThreadType::Foreground => "fg",
        ThreadType::Background => "bg",
    }
}

impl PoolWorker {
    pub(crate) fn spawn(
        worker_id: usize,
        settings: Arc<Settings>,
        channel: Arc<WorkChannel>,
    ) -> Self {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let idle = Arc::new(AtomicI8::new(0));
        let exit_signal = ExitSignal::new();

        let thread_type = settings.thread_type;
        let thread_name = format!(
            "{}_{}_{}",
            settings.name,
            worker_id,
            thread_type_tag(thread_type)
        );

        let stop_in_thread = stop.clone();
        let idle_in_thread = idle.clone();
        let exit_signal_in_thread = exit_signal.clone();
        let handler = settings.exception_handler.clone();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::debug!(target: "workpool::worker", thread_name, ?thread_type, "worker starting");
                run_loop(&stop_in_thread, &idle_in_thread, &channel, handler.as_ref());
                idle_in_thread.store(IDLE_DEAD, Ordering::Release);
                exit_signal_in_thread.complete();
                tracing::debug!(target: "workpool::worker", thread_name, ?thread_type, "worker exiting");
            })
            .expect("failed to spawn pool worker thread");

        PoolWorker {
            handle: Some(handle),
            stop,
            idle,
            exit_signal,
        }
    }

    /// Set the cooperative stop flag; the worker observes it at the top of
    /// its next loop iteration.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// `-1` once the worker thread has returned; `0..=100` otherwise.
    pub(crate) fn idle(&self) -> i8 {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.idle() == IDLE_DEAD
    }

    pub(crate) fn exit_signal(&self) -> ExitSignal {
        self.exit_signal.clone()
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(
    stop: &std::sync::atomic::AtomicBool,
    idle: &AtomicI8,
    channel: &WorkChannel,
    handler: &(dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync),
) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        match channel.try_read() {
            Some(work) => {
                let previous = idle.load(Ordering::Acquire);
                idle.store((previous - 1).max(IDLE_MIN), Ordering::Release);
                run_one(work, handler);
            }
            None => {
                let previous = idle.load(Ordering::Acquire);
                idle.store((previous + 2).min(IDLE_MAX), Ordering::Release);
                if !channel.wait_for_read() {
                    return;
                }
            }
        }
    }
}

/// Runs a single callable, isolating any panic it raises and handing it to
/// the exception handler. A handler that itself panics is caught silently
/// (logged, not re-raised) so a broken handler can never take a worker
/// thread down.
fn run_one(
    work: crate::channel::Work,
    handler: &(dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync),
) {
    let result = catch_unwind(AssertUnwindSafe(work));
    if let Err(payload) = result {
        let handler_result = catch_unwind(AssertUnwindSafe(|| handler(payload)));
        if handler_result.is_err() {
            tracing::error!(
                target: "workpool::worker",
                "exception_handler itself panicked; the panic has been swallowed to keep the worker alive"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::sync::atomic::AtomicUsize;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::builder().num_threads(1).build().unwrap())
    }

    #[test]
    fn executes_submitted_work_and_decrements_idle() {
        let channel = Arc::new(WorkChannel::new());
        let worker = PoolWorker::spawn(0, test_settings(), channel.clone());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        channel.try_write(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        worker.stop();
        channel.complete();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        assert!(worker.exit_signal().wait(Some(deadline)));
        assert!(worker.is_dead());
    }

    #[test]
    fn exception_does_not_kill_worker() {
        let channel = Arc::new(WorkChannel::new());
        let worker = PoolWorker::spawn(0, test_settings(), channel.clone());

        channel.try_write(Box::new(|| panic!("boom")));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        channel.try_write(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!worker.is_dead());

        channel.complete();
        assert!(worker.exit_signal().wait(Some(
            std::time::Instant::now() + std::time::Duration::from_secs(5)
        )));
    }

    #[test]
    fn exits_on_channel_completion_without_stop() {
        let channel = Arc::new(WorkChannel::new());
        let worker = PoolWorker::spawn(0, test_settings(), channel.clone());
        channel.complete();
        assert!(worker.exit_signal().wait(Some(
            std::time::Instant::now() + std::time::Duration::from_secs(5)
        )));
        assert!(worker.is_dead());
    }
}
