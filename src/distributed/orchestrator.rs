//! Validation orchestrator: admission, result await, and lease housekeeping.

use crate::core::error::CodewardError;
use crate::core::store::Store;
use crate::distributed::queue::{QueueStats, ReclaimedTask, TaskQueue, TaskResult, TaskSpec};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pending-task bound; submissions beyond it are rejected (backpressure).
    pub max_backlog: u64,
    /// Lease length handed to claiming workers and used when reclaiming.
    pub lease_secs: u64,
    /// Retry budget for lease-expired tasks.
    pub max_retries: u32,
    /// Poll cadence for `await_result`.
    pub poll_interval_ms: u64,
    /// Attempts for transient queue I/O before giving up.
    pub io_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_backlog: 1024,
            lease_secs: 30,
            max_retries: 3,
            poll_interval_ms: 25,
            io_attempts: 3,
        }
    }
}

/// Admits tasks, tracks in-flight work through the queue, and surfaces
/// backlog health. The orchestrator never talks to a worker directly; all
/// coordination is queue state and lease expiry.
pub struct ValidationOrchestrator {
    queue: TaskQueue,
    config: OrchestratorConfig,
}

impl ValidationOrchestrator {
    pub fn new(store: &Store, config: OrchestratorConfig) -> Result<Self, CodewardError> {
        Ok(Self { queue: TaskQueue::open(store)?, config })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Admits one task, rejecting with `QueueFull` once the pending backlog
    /// reaches the configured bound.
    pub fn submit(&self, spec: &TaskSpec) -> Result<String, CodewardError> {
        let depth = self.with_io_retries(|| self.queue.depth())?;
        if depth >= self.config.max_backlog {
            return Err(CodewardError::QueueFull { depth, bound: self.config.max_backlog });
        }
        self.with_io_retries(|| self.queue.enqueue(spec))
    }

    /// Blocks the caller until the task (or its retry successor) reaches a
    /// terminal state, or the timeout elapses. A timeout returns
    /// `TimeoutExceeded` to the caller only; the task keeps running
    /// server-side and may be polled again.
    pub fn await_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskResult, CodewardError> {
        let deadline = Instant::now() + timeout;
        let mut current = task_id.to_string();
        loop {
            self.reclaim_expired()?;

            if let Some(result) = self.queue.result(&current)? {
                // A timed-out lease spawns a successor; keep following the
                // lineage so callers see the eventual outcome.
                if result.status == crate::distributed::queue::TaskStatus::TimedOut {
                    if let Some(next) = self.queue.successor_of(&current)? {
                        current = next;
                        continue;
                    }
                }
                return Ok(result);
            }

            if Instant::now() >= deadline {
                return Err(CodewardError::TimeoutExceeded(task_id.to_string()));
            }
            std::thread::sleep(Duration::from_millis(self.config.poll_interval_ms));
        }
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats, CodewardError> {
        self.with_io_retries(|| self.queue.stats())
    }

    /// Housekeeping tick: closes expired leases and re-enqueues work within
    /// the retry budget.
    pub fn reclaim_expired(&self) -> Result<Vec<ReclaimedTask>, CodewardError> {
        self.with_io_retries(|| self.queue.reclaim_expired(self.config.max_retries))
    }

    pub fn request_cancel(&self, task_id: &str) -> Result<bool, CodewardError> {
        self.with_io_retries(|| self.queue.request_cancel(task_id))
    }

    /// Bounded backoff for transient queue I/O (locked database, contended
    /// WAL). Everything else escalates immediately.
    fn with_io_retries<R>(
        &self,
        mut f: impl FnMut() -> Result<R, CodewardError>,
    ) -> Result<R, CodewardError> {
        let mut backoff = Duration::from_millis(10);
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e @ CodewardError::RusqliteError(_)) | Err(e @ CodewardError::IoError(_)) => {
                    attempt += 1;
                    if attempt >= self.config.io_attempts {
                        return Err(e);
                    }
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
