//! Thread-pool port and its tokio implementation.
//!
//! Job executions, partitions and split flows are submitted as boxed futures.
//! The engine never awaits a submitted unit directly; results travel back
//! over channels or through persistence.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::Semaphore;

/// A unit of work submitted to the pool.
pub type WorkUnit = BoxFuture<'static, ()>;

pub trait BatchThreadPool: Send + Sync {
    /// Submit a top-level job execution.
    fn execute_task(&self, work: WorkUnit);

    /// Submit a partition or split-flow unit on behalf of a running job.
    fn execute_parallel_task(&self, work: WorkUnit);
}

/// Spawns work units on a tokio runtime.
///
/// `max_concurrent_tasks` bounds top-level job executions only. Parallel
/// units are bounded by their coordinator (partition `threads`), and gating
/// them on the same permits could starve a job waiting on its own partitions.
pub struct TokioThreadPool {
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
}

impl TokioThreadPool {
    pub fn new(handle: Handle, max_concurrent_tasks: Option<usize>) -> Self {
        Self {
            handle,
            permits: max_concurrent_tasks.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Pool on the runtime of the calling task.
    pub fn from_current(max_concurrent_tasks: Option<usize>) -> Result<Self, TryCurrentError> {
        Ok(Self::new(Handle::try_current()?, max_concurrent_tasks))
    }
}

impl BatchThreadPool for TokioThreadPool {
    fn execute_task(&self, work: WorkUnit) {
        match &self.permits {
            Some(permits) => {
                let permits = permits.clone();
                self.handle.spawn(async move {
                    // Closed only if the semaphore is dropped, which never happens while held here.
                    let _permit = permits.acquire_owned().await;
                    work.await;
                });
            }
            None => {
                self.handle.spawn(work);
            }
        }
    }

    fn execute_parallel_task(&self, work: WorkUnit) {
        self.handle.spawn(work);
    }
}
