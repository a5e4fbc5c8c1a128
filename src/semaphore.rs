//! A latency-optimized, cache-affine semaphore.
//!
//! Preferentially wakes threads that are already spinning in user space over
//! threads parked on the kernel-level wait, trading strict FIFO fairness for
//! fewer OS transitions and better cache locality. All non-kernel state lives
//! in a single `AtomicU64`; every transition goes through a pure `State`
//! value and a single CAS loop, the same discipline `lightproc::state`
//! applies to its packed proc state (there it's a 32-bit flag set plus a
//! 32-bit refcount; here it's four 16-bit saturating counters).
//!
//! This was the wakeup primitive behind an earlier queue design. It's wired
//! in as the blocking half of [`crate::channel::WorkChannel`] rather than
//! left unused.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const MAX_COUNT: u64 = 0x7FFF;

#[derive(Clone, Copy, PartialEq, Eq)]
struct State(u64);

impl State {
    const SPINNERS_SHIFT: u32 = 0;
    const COUNT_FOR_SPINNERS_SHIFT: u32 = 16;
    const WAITERS_SHIFT: u32 = 32;
    const COUNT_FOR_WAITERS_SHIFT: u32 = 48;

    const fn new() -> Self {
        State(0)
    }

    fn lane(self, shift: u32) -> u64 {
        (self.0 >> shift) & 0xFFFF
    }

    fn with_lane(self, shift: u32, value: u64) -> Self {
        debug_assert!(value <= 0xFFFF);
        let mask = 0xFFFFu64 << shift;
        State((self.0 & !mask) | (value << shift))
    }

    fn spinners(self) -> u64 {
        self.lane(Self::SPINNERS_SHIFT)
    }
    fn count_for_spinners(self) -> u64 {
        self.lane(Self::COUNT_FOR_SPINNERS_SHIFT)
    }
    fn waiters(self) -> u64 {
        self.lane(Self::WAITERS_SHIFT)
    }
    fn count_for_waiters(self) -> u64 {
        self.lane(Self::COUNT_FOR_WAITERS_SHIFT)
    }

    fn with_spinners(self, v: u64) -> Self {
        self.with_lane(Self::SPINNERS_SHIFT, v)
    }
    fn with_count_for_spinners(self, v: u64) -> Self {
        self.with_lane(Self::COUNT_FOR_SPINNERS_SHIFT, v)
    }
    fn with_waiters(self, v: u64) -> Self {
        self.with_lane(Self::WAITERS_SHIFT, v)
    }
    fn with_count_for_waiters(self, v: u64) -> Self {
        self.with_lane(Self::COUNT_FOR_WAITERS_SHIFT, v)
    }

    #[cfg(debug_assertions)]
    fn check_invariants(self) {
        debug_assert!(self.spinners() <= MAX_COUNT);
        debug_assert!(self.count_for_spinners() <= MAX_COUNT);
        debug_assert!(self.waiters() <= MAX_COUNT);
        debug_assert!(self.count_for_waiters() <= MAX_COUNT);
        debug_assert!(self.count_for_spinners() + self.count_for_waiters() <= MAX_COUNT);
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(self) {}
}

#[repr(transparent)]
struct AtomicState(AtomicU64);

impl AtomicState {
    fn new(state: State) -> Self {
        AtomicState(AtomicU64::new(state.0))
    }

    fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    fn compare_exchange_weak(
        &self,
        current: State,
        new: State,
        success: Ordering,
        failure: Ordering,
    ) -> Result<State, State> {
        new.check_invariants();
        self.0
            .compare_exchange_weak(current.0, new.0, success, failure)
            .map(State)
            .map_err(State)
    }
}

/// The "kernel" half of the bifurcation. `std` has no raw counting
/// semaphore, so parked waiters block on a condvar instead of trapping into
/// the OS directly -- the same shape `tokio`'s blocking pool uses for its
/// `Shared` wait (see `other_examples/*tokio*blocking-pool.rs`).
struct Kernel {
    mutex: Mutex<u64>,
    condvar: Condvar,
}

impl Kernel {
    fn new() -> Self {
        Kernel {
            mutex: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut permits = self.mutex.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }

    /// Blocks until a permit becomes available or `timeout` elapses.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut permits = self.mutex.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            match deadline {
                None => permits = self.condvar.wait(permits).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) =
                        self.condvar.wait_timeout(permits, deadline - now).unwrap();
                    permits = guard;
                    if result.timed_out() && *permits == 0 {
                        return false;
                    }
                }
            }
        }
    }
}

/// An unfair, latency-optimized counting semaphore.
///
/// "Unfair" because permits released while a thread is still spinning are
/// handed to that spinner even if another thread has been parked on the
/// kernel wait for longer -- the point is to avoid the kernel round-trip
/// whenever possible, not to guarantee ordering.
pub struct UnfairSemaphore {
    state: CachePadded<AtomicState>,
    kernel: CachePadded<Kernel>,
    cpu_count: u64,
}

/// Base spin budget before a spinner demotes itself to a kernel waiter,
/// divided by the number of spinners per core.
const SPIN_BUDGET_BASE: u64 = 50;

impl UnfairSemaphore {
    pub fn new() -> Self {
        Self::with_cpu_count(num_cpus::get().max(1) as u64)
    }

    fn with_cpu_count(cpu_count: u64) -> Self {
        UnfairSemaphore {
            state: CachePadded::new(AtomicState::new(State::new())),
            kernel: CachePadded::new(Kernel::new()),
            cpu_count,
        }
    }

    /// Acquire a single permit, blocking (optionally bounded by `timeout`)
    /// until one is available.
    ///
    /// Returns `false` only if `timeout` elapsed first.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        // Step 1: fast path -- a permit is already reserved for spinners.
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current.count_for_spinners() == 0 {
                break;
            }
            let new = current.with_count_for_spinners(current.count_for_spinners() - 1);
            match self.state.compare_exchange_weak(
                current,
                new,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }

        // Register as a spinner.
        loop {
            let new = current.with_spinners(current.spinners() + 1);
            match self.state.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        // Step 2: spin loop.
        let mut spins: u64 = 0;
        loop {
            current = self.state.load(Ordering::Acquire);
            if current.count_for_spinners() > 0 {
                let new = current
                    .with_count_for_spinners(current.count_for_spinners() - 1)
                    .with_spinners(current.spinners().saturating_sub(1));
                match self.state.compare_exchange_weak(
                    current,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(_) => continue,
                }
            }

            let spinners = current.spinners().max(1);
            let budget = (SPIN_BUDGET_BASE * self.cpu_count).div_ceil(spinners);
            if spins >= budget {
                // Demote to waiter.
                let new = current
                    .with_spinners(current.spinners().saturating_sub(1))
                    .with_waiters(current.waiters() + 1);
                match self.state.compare_exchange_weak(
                    current,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(_) => continue,
                }
            }

            spins += 1;
            // A zero-duration sleep, not `thread::yield_now()`: the latter
            // isn't guaranteed to migrate the thread across cores on every
            // platform, which defeats the point of spinning for cache
            // locality in the first place.
            std::thread::sleep(Duration::from_nanos(0));
        }

        // Step 3: block on the kernel wait.
        let woke = self.kernel.wait(timeout);
        loop {
            current = self.state.load(Ordering::Acquire);
            let mut new = current.with_waiters(current.waiters().saturating_sub(1));
            if woke {
                new = new.with_count_for_waiters(new.count_for_waiters().saturating_sub(1));
            }
            match self.state.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
        woke
    }

    /// Release `n` permits, preferring spinners, then parked waiters, and
    /// banking any leftover as future spinner credit.
    pub fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut current = self.state.load(Ordering::Acquire);
        let waiters_to_release;
        loop {
            let mut remaining = n;

            let unreserved_spinners = current
                .spinners()
                .saturating_sub(current.count_for_spinners());
            let to_spinners = unreserved_spinners.min(remaining);
            remaining -= to_spinners;

            let unreserved_waiters = current
                .waiters()
                .saturating_sub(current.count_for_waiters());
            let to_waiters = unreserved_waiters.min(remaining);
            remaining -= to_waiters;

            let to_spinner_credit = remaining;

            let new = current
                .with_count_for_spinners(
                    (current.count_for_spinners() + to_spinners + to_spinner_credit).min(MAX_COUNT),
                )
                .with_count_for_waiters((current.count_for_waiters() + to_waiters).min(MAX_COUNT));

            match self.state.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    waiters_to_release = to_waiters;
                    break;
                }
                Err(observed) => current = observed,
            }
        }
        self.kernel.release(waiters_to_release);
    }
}

impl Default for UnfairSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UnfairSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("UnfairSemaphore")
            .field("spinners", &state.spinners())
            .field("count_for_spinners", &state.count_for_spinners())
            .field("waiters", &state.waiters())
            .field("count_for_waiters", &state.count_for_waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_then_acquire_same_thread() {
        let sem = UnfairSemaphore::new();
        sem.release(1);
        assert!(sem.acquire(Some(Duration::from_secs(1))));
    }

    #[test]
    fn acquire_times_out_with_no_permits() {
        let sem = UnfairSemaphore::new();
        assert!(!sem.acquire(Some(Duration::from_millis(20))));
    }

    #[test]
    fn eight_acquirers_eight_releases() {
        // S7: 8 acquirers, release 8 permits across 8 calls to release(1).
        let sem = Arc::new(UnfairSemaphore::new());
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sem = sem.clone();
                let completed = completed.clone();
                thread::spawn(move || {
                    assert!(sem.acquire(Some(Duration::from_secs(5))));
                    completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();

        // Give the acquirers a moment to start spinning/waiting before we
        // start releasing, to exercise both the spinner and waiter paths.
        thread::sleep(Duration::from_millis(5));
        for _ in 0..8 {
            sem.release(1);
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), 8);
    }

    #[test]
    fn no_permit_lost_under_contention() {
        let sem = Arc::new(UnfairSemaphore::new());
        const N: usize = 200;
        let completed = Arc::new(AtomicUsize::new(0));

        let releasers: Vec<_> = (0..N)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.release(1))
            })
            .collect();

        let acquirers: Vec<_> = (0..N)
            .map(|_| {
                let sem = sem.clone();
                let completed = completed.clone();
                thread::spawn(move || {
                    assert!(sem.acquire(Some(Duration::from_secs(10))));
                    completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();

        for h in releasers {
            h.join().unwrap();
        }
        for h in acquirers {
            h.join().unwrap();
        }
        assert_eq!(completed.load(std::sync::atomic::Ordering::SeqCst), N);
    }
}
