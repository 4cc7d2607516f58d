//! Job executors for background reflection.
//!
//! The coordinator never spawns threads itself; it hands boxed jobs to an
//! [`Executor`]. Production code uses [`PoolExecutor`] (a rayon thread pool),
//! tests can swap in [`InlineExecutor`] to run jobs synchronously.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::Result;

/// A unit of background work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs background jobs.
pub trait Executor: Send + Sync {
    /// Schedule `job`. A panicking job must not take the process down.
    fn execute(&self, job: Job);

    /// Block until every job scheduled so far has finished.
    ///
    /// Must not be called from inside a job.
    fn wait_idle(&self);
}

/// Executor backed by a dedicated rayon thread pool.
pub struct PoolExecutor {
    pool: rayon::ThreadPool,
    pending: Arc<Pending>,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the pending count when a job ends, including by panic.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl PoolExecutor {
    /// Create a pool with `threads` workers; `0` means twice the available parallelism.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("schemacache-reflect-{}", i))
            .panic_handler(|payload| {
                tracing::error!("Reflection job panicked: {}", panic_message(&*payload));
            })
            .build()?;

        tracing::debug!("Started reflection pool with {} threads", threads);
        Ok(Self {
            pool,
            pending: Arc::new(Pending::default()),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, job: Job) {
        *self.pending.count.lock() += 1;
        let guard = PendingGuard(Arc::clone(&self.pending));
        self.pool.spawn(move || {
            let _guard = guard;
            job();
        });
    }

    fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }
}

/// Runs every job on the calling thread before `execute` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!("Reflection job panicked: {}", panic_message(&*payload));
        }
    }

    fn wait_idle(&self) {}
}

/// Twice the available parallelism: reflection is dominated by waiting on the database.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
