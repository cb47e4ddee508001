//! Scheduler parameterization (spec §5, §9)
//!
//! Three logical schedulers behind one `schedule(work)` call, so a `Pipe`
//! or `AwaitableCompletion` can run inline for latency-sensitive tests and
//! benchmarks, or pooled for production throughput, without touching
//! either component's core logic.

use std::fmt;
use std::sync::Arc;

use crate::worker_pool::WorkerPool;

/// Where a continuation runs once its wait is satisfied.
#[derive(Clone)]
pub enum Scheduler {
    /// Run on the thread that completed the wait. Never truly "async" —
    /// useful for tests and single-threaded benchmarks.
    Inline,
    /// Defer to the ambient `compio` runtime via `compio::runtime::spawn`.
    SharedPool,
    /// Defer to a dedicated [`WorkerPool`].
    Dedicated(Arc<WorkerPool>),
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("Scheduler::Inline"),
            Self::SharedPool => f.write_str("Scheduler::SharedPool"),
            Self::Dedicated(_) => f.write_str("Scheduler::Dedicated(..)"),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::SharedPool
    }
}

impl Scheduler {
    /// `true` iff this scheduler resumes continuations on the thread that
    /// observed completion (no hop through an executor).
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self, Self::Inline)
    }

    /// Run `work` according to this scheduler's policy.
    pub fn schedule(&self, work: impl FnOnce() + Send + 'static) {
        match self {
            Self::Inline => work(),
            Self::SharedPool => {
                compio::runtime::spawn(async move { work() }).detach();
            }
            Self::Dedicated(pool) => pool.schedule(work),
        }
    }
}
