//! Job-end notification.
//!
//! The kernel reports every finished top-level execution here. Waiters
//! subscribe before checking the ended set so that a completion racing with
//! the check is never missed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

/// User hook invoked after an execution has ended and been persisted.
pub trait JobEndCallback: Send + Sync {
    fn on_job_execution_end(&self, execution_id: i64);
}

/// Ended ids remembered for waiters that subscribe late.
const RETAINED_ENDINGS: usize = 4096;

pub struct JobEndCallbacks {
    ended: DashSet<i64>,
    ended_order: Mutex<VecDeque<i64>>,
    retained: usize,
    sender: broadcast::Sender<i64>,
    callbacks: RwLock<Vec<Arc<dyn JobEndCallback>>>,
    poll_interval: Duration,
}

impl JobEndCallbacks {
    pub fn new(poll_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            ended: DashSet::new(),
            ended_order: Mutex::new(VecDeque::new()),
            retained: RETAINED_ENDINGS,
            sender,
            callbacks: RwLock::new(Vec::new()),
            poll_interval,
        }
    }

    /// Remember at most `retained` ended executions.
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    pub fn register(&self, callback: Arc<dyn JobEndCallback>) {
        self.callbacks.write().push(callback);
    }

    pub fn job_ended(&self, execution_id: i64) {
        self.ended.insert(execution_id);
        {
            let mut order = self.ended_order.lock();
            order.push_back(execution_id);
            while order.len() > self.retained {
                if let Some(oldest) = order.pop_front() {
                    self.ended.remove(&oldest);
                }
            }
        }
        let _ = self.sender.send(execution_id);
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback.on_job_execution_end(execution_id);
        }
    }

    pub fn has_ended(&self, execution_id: i64) -> bool {
        self.ended.contains(&execution_id)
    }

    /// Wait until `execution_id` has been reported as ended.
    ///
    /// The ended set is re-checked every poll interval, which also covers a
    /// receiver that lagged behind the broadcast.
    pub async fn wait_for_end(&self, execution_id: i64) {
        let mut rx = self.sender.subscribe();
        loop {
            if self.has_ended(execution_id) {
                return;
            }
            match tokio::time::timeout(self.poll_interval, rx.recv()).await {
                Ok(Ok(id)) if id == execution_id => return,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    tokio::time::sleep(self.poll_interval).await
                }
                _ => {}
            }
        }
    }
}

impl std::fmt::Debug for JobEndCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEndCallbacks")
            .field("ended", &self.ended.len())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}
