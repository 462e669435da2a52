//! CPU execution streams.
//!
//! A stream is a FIFO worker thread: tasks submitted to one stream run in
//! submission order; tasks on different streams are ordered only through
//! events. This mirrors the device-stream contract of the accelerator
//! backends on a host that has no hardware queues.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::{RtError, RtResult};

pub type StreamId = u32;

/// The default stream every manager starts with.
pub const DEFAULT_STREAM: StreamId = 0;

pub type StreamTask = Box<dyn FnOnce() + Send>;

std::thread_local! {
    static CURRENT_STREAM: core::cell::Cell<StreamId> =
        const { core::cell::Cell::new(DEFAULT_STREAM) };
}

/// The stream-id subsequent launches from this thread target.
pub fn current_stream() -> StreamId {
    CURRENT_STREAM.with(|s| s.get())
}

pub fn set_current_stream(id: StreamId) {
    CURRENT_STREAM.with(|s| s.set(id));
}

struct Pending {
    count: Mutex<usize>,
    cv: Condvar,
}

struct Worker {
    tx: Sender<StreamTask>,
    pending: Arc<Pending>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: StreamId) -> Worker {
        let (tx, rx) = channel::<StreamTask>();
        let pending = Arc::new(Pending { count: Mutex::new(0), cv: Condvar::new() });
        let worker_pending = pending.clone();
        let handle = std::thread::Builder::new()
            .name(format!("da-stream-{id}"))
            .spawn(move || {
                set_current_stream(id);
                while let Ok(task) = rx.recv() {
                    task();
                    let mut count = worker_pending
                        .count
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    *count -= 1;
                    if *count == 0 {
                        worker_pending.cv.notify_all();
                    }
                }
            })
            .expect("spawn stream worker");
        Worker { tx, pending, handle: Some(handle) }
    }

    fn submit(&self, task: StreamTask) {
        {
            let mut count = self.pending.count.lock().unwrap_or_else(PoisonError::into_inner);
            *count += 1;
        }
        // The receiver only disappears at destroy time, after a sync.
        let _ = self.tx.send(task);
    }

    /// Block until every submitted task has run.
    fn sync(&self) {
        let count = self.pending.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _unused = self
            .pending
            .cv
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn join(&mut self) {
        self.sync();
        // Closing the channel ends the worker loop.
        let (tx, _) = channel();
        self.tx = tx;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The per-device stream table. Stream ids are never reused within a
/// manager's lifetime.
pub struct StreamManager {
    streams: Mutex<Vec<Option<Worker>>>,
}

impl Default for StreamManager {
    fn default() -> Self {
        StreamManager::new()
    }
}

impl StreamManager {
    /// A manager with the default stream already created.
    pub fn new() -> StreamManager {
        let mgr = StreamManager { streams: Mutex::new(Vec::new()) };
        mgr.create();
        mgr
    }

    pub fn create(&self) -> StreamId {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let id = streams.len() as StreamId;
        streams.push(Some(Worker::spawn(id)));
        log::debug!("stream {id} created");
        id
    }

    pub fn destroy(&self, id: StreamId) -> RtResult<()> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        match streams.get_mut(id as usize).and_then(Option::take) {
            Some(mut worker) => {
                drop(streams);
                worker.join();
                Ok(())
            }
            None => Err(RtError::UnknownStream(id)),
        }
    }

    pub fn submit(&self, id: StreamId, task: StreamTask) -> RtResult<()> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        match streams.get(id as usize).and_then(Option::as_ref) {
            Some(worker) => {
                worker.submit(task);
                Ok(())
            }
            None => Err(RtError::UnknownStream(id)),
        }
    }

    /// Block until stream `id` is idle.
    pub fn sync(&self, id: StreamId) -> RtResult<()> {
        let pending = {
            let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            match streams.get(id as usize).and_then(Option::as_ref) {
                Some(worker) => worker.pending.clone(),
                None => return Err(RtError::UnknownStream(id)),
            }
        };
        let count = pending.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _unused = pending
            .cv
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }

    pub fn sync_all(&self) -> RtResult<()> {
        let ids: Vec<StreamId> = {
            let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            streams
                .iter()
                .enumerate()
                .filter(|(_, w)| w.is_some())
                .map(|(i, _)| i as StreamId)
                .collect()
        };
        for id in ids {
            self.sync(id)?;
        }
        Ok(())
    }

    /// Whether every live stream has drained. Used by the post-run checks.
    pub fn all_idle(&self) -> bool {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.iter().flatten().all(|worker| {
            *worker.pending.count.lock().unwrap_or_else(PoisonError::into_inner) == 0
        })
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in streams.iter_mut().filter_map(Option::as_mut) {
            worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submission_order_is_preserved_within_a_stream() {
        let mgr = StreamManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = seen.clone();
            mgr.submit(DEFAULT_STREAM, Box::new(move || seen.lock().unwrap().push(i)))
                .unwrap();
        }
        mgr.sync(DEFAULT_STREAM).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
        assert!(mgr.all_idle());
    }

    #[test]
    fn streams_are_independent() {
        let mgr = StreamManager::new();
        let s1 = mgr.create();
        assert_eq!(s1, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = ran.clone();
            mgr.submit(s1, Box::new(move || { ran.fetch_add(1, Ordering::SeqCst); })).unwrap();
        }
        mgr.sync_all().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn destroyed_streams_reject_work() {
        let mgr = StreamManager::new();
        let s1 = mgr.create();
        mgr.destroy(s1).unwrap();
        assert!(matches!(mgr.submit(s1, Box::new(|| ())), Err(RtError::UnknownStream(1))));
        assert!(matches!(mgr.destroy(s1), Err(RtError::UnknownStream(1))));
    }
}
