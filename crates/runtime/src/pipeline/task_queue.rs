//! An asynchronous task queue: a lock-free ring drained by one long-lived
//! worker thread. Multiple producers may push concurrently; `wait` rides a
//! marker task through the queue so callers can block until everything
//! already submitted has run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::pipeline::queue::{LockFreeRingQueue, PushError};
use crate::{RtError, RtResult};

const QUEUE_CAPACITY: usize = 8192;

pub type Job = Box<dyn FnOnce() + Send>;

pub struct AsyncTaskQueue {
    name: &'static str,
    queue: Arc<LockFreeRingQueue<Job>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTaskQueue {
    /// Create the queue and its worker thread. The queue starts paused.
    pub fn new(name: &'static str) -> AsyncTaskQueue {
        let queue = Arc::new(LockFreeRingQueue::<Job>::new(QUEUE_CAPACITY));
        let worker_queue = queue.clone();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = worker_queue.pop_blocking() {
                    job();
                }
                log::debug!("task queue worker exiting");
            })
            .expect("spawn task queue worker");
        AsyncTaskQueue { name, queue, worker: Mutex::new(Some(worker)) }
    }

    pub fn push(&self, job: Job) -> RtResult<()> {
        match self.queue.push(job) {
            Ok(()) => Ok(()),
            Err(PushError::Shutdown) => {
                // Shutdown races are benign; the task is dropped.
                Ok(())
            }
            Err(PushError::Full | PushError::Paused) => Err(RtError::QueuePush(self.name)),
        }
    }

    /// Block until every task submitted before this call has run.
    pub fn wait(&self) {
        let flag = Arc::new(AtomicBool::new(false));
        let marker = flag.clone();
        if self
            .push(Box::new(move || marker.store(true, Ordering::Release)))
            .is_err()
        {
            return;
        }
        while !flag.load(Ordering::Acquire) {
            if self.worker.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Drain, then gate the consumer.
    pub fn pause(&self) {
        if self.queue.is_paused() {
            return;
        }
        self.wait();
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.unpause();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Shut down and join the worker.
    pub fn worker_join(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker else {
            return;
        };
        while !self.queue.is_empty() {
            std::thread::yield_now();
        }
        self.queue.finalize();
        let _ = worker.join();
    }
}

impl Drop for AsyncTaskQueue {
    fn drop(&mut self) {
        self.worker_join();
    }
}
