//! The three-stage asynchronous pipeline: per-stage task queues over the
//! lock-free ring, each drained by a dedicated worker thread.

pub mod queue;
pub mod task_queue;

pub use queue::{LockFreeRingQueue, PushError};
pub use task_queue::AsyncTaskQueue;

use std::sync::Arc;

/// The infer and launch queues driving a graph run. The queues are shared:
/// infer-stage tasks push their launch continuation from the infer worker
/// thread.
pub struct Pipeline {
    pub infer: Arc<AsyncTaskQueue>,
    pub launch: Arc<AsyncTaskQueue>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline {
            infer: Arc::new(AsyncTaskQueue::new("da-infer")),
            launch: Arc::new(AsyncTaskQueue::new("da-launch")),
        }
    }

    pub fn resume_all(&self) {
        self.infer.resume();
        self.launch.resume();
    }

    pub fn pause_all(&self) {
        self.infer.pause();
        self.launch.pause();
    }

    /// Wait for both stages to drain, infer first since it feeds launch.
    pub fn wait_all(&self) {
        self.infer.wait();
        self.launch.wait();
    }

    pub fn join_all(&self) {
        self.infer.worker_join();
        self.launch.worker_join();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}
