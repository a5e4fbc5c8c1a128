//! Unbounded MPMC queue of callables with a completion signal.
//!
//! Backed by `crossbeam_queue::SegQueue` (already part of the teacher's
//! dependency stack) for the FIFO itself, and [`UnfairSemaphore`] as the
//! outstanding-work credit counter a blocked reader waits on -- this is
//! spec option (1) from the data model, not a generic channel wrapper.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::semaphore::UnfairSemaphore;

/// A callable unit of work: no parameters, no return value, may panic.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Unbounded FIFO of [`Work`] with single-completion semantics.
pub struct WorkChannel {
    queue: SegQueue<Work>,
    credit: UnfairSemaphore,
    completed: AtomicBool,
    // Permits released but not yet consumed by a reader, capped at
    // `permit_cap` so a burst of writes can't bank more outstanding
    // spin-wakeups than there are cores to act on them.
    outstanding_permits: AtomicUsize,
    permit_cap: usize,
}

impl WorkChannel {
    pub fn new() -> Self {
        WorkChannel {
            queue: SegQueue::new(),
            credit: UnfairSemaphore::new(),
            completed: AtomicBool::new(false),
            outstanding_permits: AtomicUsize::new(0),
            permit_cap: num_cpus::get().max(1),
        }
    }

    /// Enqueue `work` unless the channel has already been completed.
    pub fn try_write(&self, work: Work) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        self.queue.push(work);
        // Only release a permit while outstanding credit is below the cap;
        // once `permit_cap` readers have something to wake up for, further
        // writes still land in the queue but don't bother oversubscribing
        // the semaphore's spin-wakeup path.
        let granted = self
            .outstanding_permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.permit_cap).then_some(current + 1)
            })
            .is_ok();
        if granted {
            self.credit.release(1);
        }
        true
    }

    /// Non-blocking pop.
    pub fn try_read(&self) -> Option<Work> {
        let item = self.queue.pop();
        if item.is_some() {
            let _ = self.outstanding_permits.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |current| Some(current.saturating_sub(1)),
            );
        }
        item
    }

    /// Block until an item is available (`true`) or the channel is
    /// completed and drained (`false`).
    pub fn wait_for_read(&self) -> bool {
        loop {
            if self.completed.load(Ordering::Acquire) && self.queue.is_empty() {
                return false;
            }
            if !self.queue.is_empty() {
                return true;
            }
            // Wait (with a bounded timeout so we notice completion even if
            // no further permits are released after the last writer exits).
            self.credit.acquire(Some(Duration::from_millis(25)));
        }
    }

    /// Idempotent: mark the channel complete. Subsequent `try_write` calls
    /// fail; blocked readers eventually observe `wait_for_read() == false`
    /// once the queue drains.
    pub fn complete(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            // Wake any readers parked waiting for credit so they notice
            // completion promptly instead of waiting out their timeout.
            self.credit.release(1);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl Default for WorkChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkChannel")
            .field("completed", &self.is_completed())
            .field("len", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn write_then_read() {
        let chan = WorkChannel::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        assert!(chan.try_write(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        })));
        let work = chan.try_read().expect("item should be present");
        work();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_fails_after_complete() {
        let chan = WorkChannel::new();
        chan.complete();
        assert!(!chan.try_write(Box::new(|| {})));
    }

    #[test]
    fn complete_is_idempotent() {
        let chan = WorkChannel::new();
        chan.complete();
        chan.complete();
        assert!(chan.is_completed());
    }

    #[test]
    fn drains_remaining_items_before_reporting_end_of_stream() {
        let chan = WorkChannel::new();
        assert!(chan.try_write(Box::new(|| {})));
        chan.complete();
        assert!(chan.try_read().is_some());
        assert!(chan.try_read().is_none());
    }

    #[test]
    fn wait_for_read_unblocks_on_write() {
        let chan = Arc::new(WorkChannel::new());
        let reader = {
            let chan = chan.clone();
            std::thread::spawn(move || chan.wait_for_read())
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(chan.try_write(Box::new(|| {})));
        assert!(reader.join().unwrap());
    }

    #[test]
    fn wait_for_read_returns_false_once_completed_and_empty() {
        let chan = Arc::new(WorkChannel::new());
        let reader = {
            let chan = chan.clone();
            std::thread::spawn(move || chan.wait_for_read())
        };
        std::thread::sleep(Duration::from_millis(10));
        chan.complete();
        assert!(!reader.join().unwrap());
    }
}
