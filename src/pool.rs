//! Owns the worker set and the shared [`WorkChannel`]; the adaptive resize
//! controller runs on the submit path.
//!
//! Grounded on the teacher's `ThreadManager`: a bounded, never-shrinking
//! slot array of worker threads, grown and (here) retired as load changes.
//! The teacher drives its scaling off a sampled-frequency EMA on a
//! dedicated timer thread; this pool instead runs its tick synchronously on
//! the submitter's thread every 50 submissions, driven by each worker's own
//! idle estimator -- a deliberate WHAT change the spec calls for, since the
//! timer-thread design was the thing the original "deadlock abort"
//! supervisor hung off of, and that supervisor was removed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{Work, WorkChannel};
use crate::error::{PoolError, Result};
use crate::settings::Settings;
use crate::worker::PoolWorker;

/// Resize tick cadence: one tick per this many successful submissions.
const RESIZE_TICK_PERIOD: u64 = 50;
/// A worker idler longer than this (out of 100) is a retirement candidate.
const RETIRE_IDLE_THRESHOLD: i8 = 75;
/// A worker busier than this (out of 100) counts toward the grow condition.
const BUSY_IDLE_THRESHOLD: i8 = 10;

struct WorkerSlot {
    worker: Option<PoolWorker>,
}

/// A dedicated worker-thread pool.
///
/// `submit` is lock-free against the pool itself; the resize tick piggybacks
/// on the submit path under the `synchronous_scheduler` contract (`spec.md`
/// §5): callers promise at most one `submit` in flight at a time. In debug
/// builds that promise is checked, not merely documented -- see
/// `check_single_submitter`.
pub struct Pool {
    settings: Arc<Settings>,
    channel: Arc<WorkChannel>,
    workers: Mutex<Vec<WorkerSlot>>,
    // `num_threads` and `clean_counter` are only ever mutated from inside
    // `submit`/`resize_tick`, which the `synchronous_scheduler` contract
    // guarantees is never entered concurrently with itself; they're plain
    // atomics (rather than a `Mutex`) purely so `Pool` stays `Sync` without
    // an `unsafe impl`, not because of any real cross-thread contention.
    num_threads: AtomicUsize,
    clean_counter: AtomicU64,
    next_worker_id: AtomicUsize,
    #[cfg(debug_assertions)]
    submitter_thread: Mutex<Option<std::thread::ThreadId>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("settings", &self.settings)
            .field("num_threads", &self.num_threads())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Construct a pool and spawn its initial `settings.num_threads` workers.
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let channel = Arc::new(WorkChannel::new());
        let num_threads = settings.num_threads;

        let pool = Arc::new(Pool {
            settings: settings.clone(),
            channel,
            workers: Mutex::new(Vec::with_capacity(settings.max_threads)),
            num_threads: AtomicUsize::new(0),
            clean_counter: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            submitter_thread: Mutex::new(None),
        });

        {
            let mut workers = pool.workers.lock().unwrap();
            for _ in 0..num_threads {
                workers.push(WorkerSlot {
                    worker: Some(pool.spawn_worker()),
                });
            }
        }
        pool.num_threads.store(num_threads, Ordering::Release);

        pool
    }

    fn spawn_worker(&self) -> PoolWorker {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        PoolWorker::spawn(id, self.settings.clone(), self.channel.clone())
    }

    #[cfg(debug_assertions)]
    fn check_single_submitter(&self) {
        if !self.settings.synchronous_scheduler {
            return;
        }
        let this_thread = std::thread::current().id();
        let mut seen = self.submitter_thread.lock().unwrap();
        match *seen {
            None => *seen = Some(this_thread),
            Some(previous) => debug_assert_eq!(
                previous, this_thread,
                "Settings::synchronous_scheduler promises submit() is called from a single \
                 thread at a time; this pool observed submit() from two different threads"
            ),
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_single_submitter(&self) {}

    /// Submit a unit of work. Returns `false` if the pool has been closed.
    pub fn submit<F>(&self, work: F) -> Result<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_single_submitter();

        if !self.channel.try_write(Box::new(work) as Work) {
            return Ok(false);
        }

        if self.settings.synchronous_scheduler {
            let count = self.clean_counter.fetch_add(1, Ordering::Relaxed) + 1;
            if count.is_multiple_of(RESIZE_TICK_PERIOD) {
                self.resize_tick();
            }
        }

        Ok(true)
    }

    /// Reject a null-equivalent submit explicitly, matching the spec's
    /// "invalid-argument on null work" boundary error for bindings that
    /// hand in an `Option<Work>` rather than a generic closure.
    pub fn submit_boxed(&self, work: Option<Work>) -> Result<bool> {
        match work {
            None => Err(PoolError::InvalidArgument("work must not be null".into())),
            Some(work) => {
                self.check_single_submitter();
                if !self.channel.try_write(work) {
                    return Ok(false);
                }
                if self.settings.synchronous_scheduler {
                    let count = self.clean_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count.is_multiple_of(RESIZE_TICK_PERIOD) {
                        self.resize_tick();
                    }
                }
                Ok(true)
            }
        }
    }

    /// The resize tick: retires over-idle workers and spawns fresh ones to
    /// keep `min_threads <= num_threads <= max_threads`. Runs synchronously
    /// on the submitter's thread, per the single-submitter contract.
    fn resize_tick(&self) {
        let mut workers = self.workers.lock().unwrap();
        let mut num_threads = self.num_threads.load(Ordering::Acquire);
        let min_threads = self.settings.min_threads;
        let max_threads = self.settings.max_threads;

        let mut stoppable = num_threads.saturating_sub(min_threads);
        let mut running = 0usize;

        for slot in workers.iter() {
            let idle = slot.worker.as_ref().map(|w| w.idle()).unwrap_or(-1);
            if idle == -1 {
                num_threads = num_threads.saturating_sub(1);
                stoppable = stoppable.saturating_sub(1);
            } else if stoppable > 0 && idle > RETIRE_IDLE_THRESHOLD {
                slot.worker.as_ref().unwrap().stop();
                stoppable -= 1;
            } else if idle < BUSY_IDLE_THRESHOLD {
                running += 1;
            }
        }

        let should_grow =
            num_threads < min_threads || (running == num_threads && num_threads < max_threads);

        if should_grow {
            num_threads += 1;
            if workers.len() < num_threads {
                workers.push(WorkerSlot { worker: None });
            }
            for slot in workers.iter_mut() {
                let needs_fresh = match &slot.worker {
                    None => true,
                    Some(w) => w.is_dead(),
                };
                if needs_fresh {
                    slot.worker = Some(self.spawn_worker());
                }
            }
        }

        self.num_threads.store(num_threads, Ordering::Release);
        tracing::debug!(
            target: "workpool::pool",
            num_threads,
            min_threads,
            max_threads,
            "resize tick complete"
        );
    }

    /// Current live worker count, as of the last resize tick.
    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Signal completion; outstanding items drain, then workers exit.
    /// Does not block.
    pub fn close(&self) {
        self.channel.complete();
    }

    /// Wait for every worker's exit signal, bounded by `timeout` (default:
    /// unbounded).
    pub fn wait_for_exit(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let signals: Vec<_> = {
            let workers = self.workers.lock().unwrap();
            workers
                .iter()
                .filter_map(|slot| slot.worker.as_ref().map(|w| w.exit_signal()))
                .collect()
        };
        for signal in signals {
            if !signal.wait(deadline) {
                return;
            }
        }
        let mut workers = self.workers.lock().unwrap();
        for slot in workers.iter_mut() {
            if let Some(worker) = slot.worker.as_mut() {
                worker.join();
            }
        }
    }
}
