//! Validated, immutable pool configuration.
//!
//! `min_threads`/`max_threads` are derived the same way the teacher's
//! thread-count heuristics were: clamped against `num_cpus::get()` rather
//! than left to the caller to get right.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PoolError, Result};

static POOL_INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether a pool's threads should be counted as keeping the process alive.
///
/// Rust has no portable equivalent of a managed runtime's foreground/
/// background thread distinction; this is recorded purely as metadata
/// (thread naming, tracing fields) rather than given forced semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    Foreground,
    Background,
}

/// Callback invoked with a submitted callable's panic payload.
///
/// Must be thread-safe: it is invoked directly on whichever worker thread
/// caught the panic, with no synchronization beyond what the handler brings
/// itself.
pub type ExceptionHandler = Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>;

fn default_exception_handler() -> ExceptionHandler {
    Arc::new(|payload| {
        let message = panic_message(&payload);
        tracing::warn!(target: "workpool::settings", %message, "unhandled exception from submitted work; install an exception_handler to observe these");
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Immutable, validated pool configuration.
///
/// Construct with [`SettingsBuilder`]; `Settings` itself is only ever
/// produced through [`SettingsBuilder::build`], which runs the validation
/// spelled out in the data model.
#[derive(Clone)]
pub struct Settings {
    pub(crate) num_threads: usize,
    pub(crate) min_threads: usize,
    pub(crate) max_threads: usize,
    pub(crate) thread_type: ThreadType,
    pub(crate) name: String,
    pub(crate) deadlock_timeout: Option<Duration>,
    pub(crate) exception_handler: ExceptionHandler,
    pub(crate) allow_synchronous_continuations: bool,
    pub(crate) synchronous_scheduler: bool,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("num_threads", &self.num_threads)
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("thread_type", &self.thread_type)
            .field("name", &self.name)
            .field("deadlock_timeout", &self.deadlock_timeout)
            .field(
                "allow_synchronous_continuations",
                &self.allow_synchronous_continuations,
            )
            .field("synchronous_scheduler", &self.synchronous_scheduler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Settings`]. Mirrors the keyword/builder-style construction
/// called for by the data model: every field has a sensible default and is
/// only validated once, at `build()`.
pub struct SettingsBuilder {
    num_threads: usize,
    thread_type: ThreadType,
    name: Option<String>,
    deadlock_timeout: Option<Duration>,
    exception_handler: Option<ExceptionHandler>,
    allow_synchronous_continuations: bool,
    synchronous_scheduler: bool,
}

impl fmt::Debug for SettingsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsBuilder")
            .field("num_threads", &self.num_threads)
            .field("thread_type", &self.thread_type)
            .field("name", &self.name)
            .field("deadlock_timeout", &self.deadlock_timeout)
            .field(
                "allow_synchronous_continuations",
                &self.allow_synchronous_continuations,
            )
            .field("synchronous_scheduler", &self.synchronous_scheduler)
            .finish_non_exhaustive()
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get().max(1),
            thread_type: ThreadType::Background,
            name: None,
            deadlock_timeout: None,
            exception_handler: None,
            allow_synchronous_continuations: true,
            synchronous_scheduler: true,
        }
    }
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn thread_type(mut self, thread_type: ThreadType) -> Self {
        self.thread_type = thread_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn deadlock_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_timeout = Some(timeout);
        self
    }

    pub fn exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn allow_synchronous_continuations(mut self, allow: bool) -> Self {
        self.allow_synchronous_continuations = allow;
        self
    }

    pub fn synchronous_scheduler(mut self, synchronous: bool) -> Self {
        self.synchronous_scheduler = synchronous;
        self
    }

    /// Validate and freeze the builder into a [`Settings`].
    ///
    /// Fails when `num_threads == 0` or `deadlock_timeout` is set but below
    /// 1ms, per the data model.
    pub fn build(self) -> Result<Settings> {
        if self.num_threads == 0 {
            return Err(PoolError::InvalidArgument(
                "num_threads must be greater than zero".into(),
            ));
        }
        if let Some(timeout) = self.deadlock_timeout {
            if timeout < Duration::from_millis(1) {
                return Err(PoolError::InvalidArgument(
                    "deadlock_timeout must be null or >= 1ms".into(),
                ));
            }
        }

        let min_threads = self.num_threads.min(2);
        // Mirrors the teacher's thread-count heuristic of clamping against
        // the visible core count rather than trusting the caller's number.
        let max_threads = self
            .num_threads
            .max(2.max(num_cpus::get().saturating_sub(1)));

        let name = self.name.unwrap_or_else(|| {
            let id = POOL_INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("pool-{id}")
        });

        Ok(Settings {
            num_threads: self.num_threads,
            min_threads,
            max_threads,
            thread_type: self.thread_type,
            name,
            deadlock_timeout: self.deadlock_timeout,
            exception_handler: self
                .exception_handler
                .unwrap_or_else(default_exception_handler),
            allow_synchronous_continuations: self.allow_synchronous_continuations,
            synchronous_scheduler: self.synchronous_scheduler,
        })
    }
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn min_threads(&self) -> usize {
        self.min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
