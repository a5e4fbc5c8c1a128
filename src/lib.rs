//!
//! A dedicated worker-thread pool, as an alternative to a process-global
//! work-stealing pool.
//!
//! `workpool` owns a bounded group of long-lived OS threads that consume a
//! shared queue of callable work items, with an adaptive controller that
//! grows or retires workers in response to load. A [`TaskSchedulerAdapter`]
//! layers a secondary FIFO queue on top, for higher-level cooperative tasks
//! that sometimes need to run inline on a thread already hosting pool work.
//!
//! Three pieces, leaves first: [`UnfairSemaphore`](semaphore::UnfairSemaphore)
//! (a latency-optimized wakeup primitive), [`channel::WorkChannel`] (the
//! queue it backs), [`pool::Pool`] (the worker set and resize controller),
//! and [`scheduler::TaskSchedulerAdapter`] on top of all three.
//!
//! Out of scope: work stealing between workers, priority queues, fairness
//! across submitters, cross-pool balancing, thread-priority tuning, and
//! forcible termination of a wedged callback -- the pool isolates user
//! faults, but it never tears a thread down from the outside.

#![warn(missing_debug_implementations)]
#![warn(unused_imports)]
#![forbid(unused_must_use)]

pub mod channel;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod semaphore;
pub mod settings;
mod worker;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use crate::channel::{Work, WorkChannel};
    pub use crate::error::{PoolError, Result};
    pub use crate::pool::Pool;
    pub use crate::scheduler::{TaskHandle, TaskSchedulerAdapter};
    pub use crate::semaphore::UnfairSemaphore;
    pub use crate::settings::{Settings, SettingsBuilder, ThreadType};
}
