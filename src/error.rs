//! Error taxonomy surfaced at the crate boundary.
//!
//! User-work faults never reach here: they're delivered to a
//! [`Settings`](crate::settings::Settings) exception handler on the worker
//! thread and are never turned into a `Result` the submitter sees.

use thiserror::Error;

/// Errors returned from the public API.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A `Settings` value failed validation, or a `null`/invalid argument was
    /// passed to an otherwise infallible call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The work channel has been completed; the pool is shutting down or
    /// already shut down.
    #[error("work channel is closed")]
    Closed,

    /// The operation could not be completed without risking a deadlock or
    /// blocking indefinitely (e.g. `scheduled_tasks` under lock contention).
    #[error("operation unsupported under current contention: {0}")]
    Unsupported(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PoolError>;
