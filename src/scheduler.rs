//! A secondary FIFO queue layered over a [`Pool`], permitting inline
//! (re-entrant) execution of a queued task from inside a worker already
//! running pool work.
//!
//! The "host platform task scheduler contract" the data model describes
//! subclassing has no Rust analogue -- there's no ambient abstract
//! task-scheduler base class to satisfy here the way there would be in a
//! managed runtime. This exposes the same operations
//! (`enqueue`/`try_execute_inline`/`try_dequeue`/`scheduled_tasks`/
//! `max_concurrency`) as a plain, idiomatic API instead (see
//! `REDESIGN FLAGS` in `SPEC_FULL.md`).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{PoolError, Result};
use crate::pool::Pool;

/// A queued unit of cooperative work. Never panics out through the
/// adapter: like pool `Work`, any panic is the task runtime's own
/// responsibility to have captured before reaching here.
type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A single slot a task is taken from exactly once, by whichever of
/// "the drain loop", "an inline execution" or "`try_dequeue`" gets there
/// first. `None` after that point, by any path.
struct Slot(Mutex<Option<TaskFn>>);

/// A handle to a previously-enqueued task. Cheap to clone; holding one lets
/// a caller later attempt to run it inline or remove it from the queue,
/// without having to search by value.
#[derive(Clone)]
pub struct TaskHandle {
    slot: Arc<Slot>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.slot.0.lock().unwrap().is_some();
        f.debug_struct("TaskHandle")
            .field("pending", &pending)
            .finish()
    }
}

impl TaskHandle {
    fn new(task: TaskFn) -> Self {
        TaskHandle {
            slot: Arc::new(Slot(Mutex::new(Some(task)))),
        }
    }

    /// Wraps a task that was never enqueued, purely so
    /// `try_execute_inline(_, was_queued = false)` can share the same type.
    pub fn detached(task: impl FnOnce() + Send + 'static) -> Self {
        TaskHandle::new(Box::new(task))
    }

    fn take(&self) -> Option<TaskFn> {
        self.slot.0.lock().unwrap().take()
    }
}

// The raw pointers of every `Shared` whose drain closure is currently
// running on this thread, innermost last. A bare bool can't distinguish
// "inside adapter A's drain closure" from "inside adapter B's" when two
// adapters share a pool and thus a worker thread, so this tracks identity
// instead of presence.
thread_local! {
    static ACTIVE_ADAPTERS: RefCell<Vec<*const Shared>> = const { RefCell::new(Vec::new()) };
}

struct Shared {
    tasks: Mutex<VecDeque<TaskHandle>>,
    parallel_workers: AtomicUsize,
    waiting_work: AtomicUsize,
    pool: Arc<Pool>,
}

/// Multiplexes higher-level cooperative tasks onto a shared [`Pool`].
///
/// Lives for the lifetime of the `Pool` it wraps; holds no resources of its
/// own beyond the in-memory queue.
#[derive(Clone)]
pub struct TaskSchedulerAdapter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskSchedulerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSchedulerAdapter")
            .field("waiting_work", &self.waiting_work())
            .field("parallel_workers", &self.parallel_workers())
            .finish_non_exhaustive()
    }
}

impl TaskSchedulerAdapter {
    pub fn new(pool: Arc<Pool>) -> Self {
        TaskSchedulerAdapter {
            shared: Arc::new(Shared {
                tasks: Mutex::new(VecDeque::new()),
                parallel_workers: AtomicUsize::new(0),
                waiting_work: AtomicUsize::new(0),
                pool,
            }),
        }
    }

    /// Enqueue `task` and return a handle to it. If fewer drain closures
    /// than `max_concurrency` are currently active on this adapter's
    /// behalf, submits one more to the pool.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> TaskHandle {
        let handle = TaskHandle::new(Box::new(task));
        let shared = self.shared.clone();
        {
            let mut tasks = shared.tasks.lock().unwrap();
            tasks.push_back(handle.clone());
            shared.waiting_work.fetch_add(1, Ordering::SeqCst);
        }

        let max = shared.pool.settings().max_threads();
        let launched = shared
            .parallel_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < max {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok();

        if launched {
            let drain_shared = shared.clone();
            // If the pool has been closed, `submit` fails and no drain
            // closure runs; `parallel_workers` settles back down the next
            // time someone enqueues against a pool that's still open.
            // There's nothing useful to roll back: a closed pool means no
            // further adapter work will ever drain anyway.
            let _ = shared.pool.submit(move || drain(drain_shared));
        }

        handle
    }

    /// Returns `true` only when called from inside *this adapter's* drain
    /// closure (i.e. the current thread is actively running work on behalf
    /// of this specific adapter, not merely some adapter sharing the same
    /// pool).
    ///
    /// If `was_queued`, first tries to take `handle`'s task by identity; if
    /// another path (the drain loop, or a racing `try_dequeue`) already
    /// took it, returns `false` without running anything. Otherwise runs it
    /// unconditionally -- the caller vouches the task was never queued.
    pub fn try_execute_inline(&self, handle: &TaskHandle, was_queued: bool) -> bool {
        let this = Arc::as_ptr(&self.shared);
        let on_this_adapters_drain = ACTIVE_ADAPTERS.with(|active| active.borrow().contains(&this));
        if !on_this_adapters_drain {
            return false;
        }

        let task = if was_queued {
            match handle.take() {
                Some(task) => {
                    self.shared.waiting_work.fetch_sub(1, Ordering::SeqCst);
                    task
                }
                None => return false,
            }
        } else {
            match handle.take() {
                Some(task) => task,
                None => return false,
            }
        };

        task();
        true
    }

    /// Removes `handle`'s task if it hasn't already been taken. Returns
    /// whether it was found (and thus removed).
    pub fn try_dequeue(&self, handle: &TaskHandle) -> bool {
        match handle.take() {
            Some(_) => {
                self.shared.waiting_work.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Best-effort queue depth snapshot. Tries the lock without blocking;
    /// returns `Unsupported` under contention rather than risking a
    /// deadlock against a caller that's already holding the lock (e.g. from
    /// inside `enqueue`'s own critical section).
    pub fn scheduled_tasks(&self) -> Result<usize> {
        match self.shared.tasks.try_lock() {
            Ok(tasks) => Ok(tasks.len()),
            Err(_) => Err(PoolError::Unsupported(
                "task queue is currently locked by another operation".into(),
            )),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.shared.pool.settings().max_threads()
    }

    /// Estimated queue depth (matches `tasks.len()` under the mutex).
    pub fn waiting_work(&self) -> usize {
        self.shared.waiting_work.load(Ordering::SeqCst)
    }

    pub fn parallel_workers(&self) -> usize {
        self.shared.parallel_workers.load(Ordering::SeqCst)
    }
}

fn drain(shared: Arc<Shared>) {
    let this = Arc::as_ptr(&shared);
    ACTIVE_ADAPTERS.with(|active| active.borrow_mut().push(this));
    let _guard = ClearOnDrop(this);

    loop {
        let handle = {
            let mut tasks = shared.tasks.lock().unwrap();
            match tasks.pop_front() {
                None => {
                    shared.parallel_workers.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                Some(handle) => handle,
            }
        };
        // The handle may already be empty if it was taken inline or
        // dequeued out from under us; that's not an error, just a task
        // this drain closure doesn't need to run.
        if let Some(task) = handle.take() {
            shared.waiting_work.fetch_sub(1, Ordering::SeqCst);
            task();
        }
    }
}

/// Pops this drain closure's `Shared` pointer off the thread-local active
/// set on every exit path, including a panic unwinding through `drain`
/// (which should never happen since tasks are expected to capture their own
/// errors, but the marker must not leak onto a pool worker thread that gets
/// reused for unrelated submissions or another adapter's drain closure).
struct ClearOnDrop(*const Shared);

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        ACTIVE_ADAPTERS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|&p| p == self.0) {
                active.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn inline_execution_runs_on_same_thread_as_caller() {
        // S5: adapter inlining over a single-thread pool.
        let settings = Settings::builder().num_threads(1).build().unwrap();
        let pool = Pool::new(settings);
        let adapter = TaskSchedulerAdapter::new(pool.clone());

        let b_ran_inline = Arc::new(AtomicBool::new(false));
        let b_ran_inline2 = b_ran_inline.clone();
        let adapter_for_a = adapter.clone();

        adapter.enqueue(move || {
            let handle = TaskHandle::detached(move || {
                b_ran_inline2.store(true, Ordering::SeqCst);
            });
            let result = adapter_for_a.try_execute_inline(&handle, false);
            assert!(
                result,
                "try_execute_inline should succeed from inside a drain closure"
            );
        });

        pool.close();
        pool.wait_for_exit(Some(Duration::from_secs(5)));
        assert!(b_ran_inline.load(Ordering::SeqCst));
    }

    #[test]
    fn try_execute_inline_is_scoped_to_the_calling_adapter() {
        // Two adapters sharing one pool: a thread running adapter A's drain
        // closure must not be able to inline-execute on adapter B's behalf.
        let settings = Settings::builder().num_threads(1).build().unwrap();
        let pool = Pool::new(settings);
        let adapter_a = TaskSchedulerAdapter::new(pool.clone());
        let adapter_b = TaskSchedulerAdapter::new(pool.clone());

        let ran_inline = Arc::new(AtomicBool::new(false));
        let ran_inline2 = ran_inline.clone();
        let adapter_b_from_a = adapter_b.clone();

        adapter_a.enqueue(move || {
            let handle = TaskHandle::detached(move || {
                ran_inline2.store(true, Ordering::SeqCst);
            });
            let result = adapter_b_from_a.try_execute_inline(&handle, false);
            assert!(
                !result,
                "adapter B's try_execute_inline must not succeed from inside adapter A's drain closure"
            );
        });

        pool.close();
        pool.wait_for_exit(Some(Duration::from_secs(5)));
        assert!(!ran_inline.load(Ordering::SeqCst));
    }

    #[test]
    fn inline_execution_fails_outside_drain_closure() {
        let settings = Settings::builder().num_threads(1).build().unwrap();
        let pool = Pool::new(settings);
        let adapter = TaskSchedulerAdapter::new(pool.clone());

        let handle = TaskHandle::detached(|| {});
        let result = adapter.try_execute_inline(&handle, false);
        assert!(!result);
        pool.close();
    }

    #[test]
    fn enqueued_tasks_all_run() {
        let settings = Settings::builder().num_threads(2).build().unwrap();
        let pool = Pool::new(settings);
        let adapter = TaskSchedulerAdapter::new(pool.clone());

        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let executed = executed.clone();
            adapter.enqueue(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while executed.load(Ordering::SeqCst) < 500 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(executed.load(Ordering::SeqCst), 500);

        pool.close();
        pool.wait_for_exit(Some(Duration::from_secs(5)));
    }

    #[test]
    fn try_dequeue_races_the_drain_loop_but_never_double_runs() {
        let settings = Settings::builder().num_threads(1).build().unwrap();
        let pool = Pool::new(settings);
        let adapter = TaskSchedulerAdapter::new(pool.clone());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handle = adapter.enqueue(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        // Whether this wins the race against the drain closure is
        // nondeterministic, but it must never cause the task to run twice.
        let removed = adapter.try_dequeue(&handle);

        pool.close();
        pool.wait_for_exit(Some(Duration::from_secs(5)));

        if removed {
            assert_eq!(ran.load(Ordering::SeqCst), 0);
        } else {
            assert_eq!(ran.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn max_concurrency_matches_pool_max_threads() {
        let settings = Settings::builder().num_threads(3).build().unwrap();
        let pool = Pool::new(settings);
        let expected = pool.settings().max_threads();
        let adapter = TaskSchedulerAdapter::new(pool.clone());
        assert_eq!(adapter.max_concurrency(), expected);
        pool.close();
    }

    #[test]
    fn scheduled_tasks_reports_queue_depth() {
        let settings = Settings::builder().num_threads(1).build().unwrap();
        let pool = Pool::new(settings);
        let adapter = TaskSchedulerAdapter::new(pool.clone());

        // Block the only worker so nothing drains yet.
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        adapter.enqueue(move || {
            let _ = rx.recv();
        });
        adapter.enqueue(|| {});
        adapter.enqueue(|| {});

        std::thread::sleep(Duration::from_millis(20));
        assert!(adapter.scheduled_tasks().unwrap() >= 1);

        let _ = tx.send(());
        pool.close();
        pool.wait_for_exit(Some(Duration::from_secs(5)));
    }
}
