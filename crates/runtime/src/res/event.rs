//! Runtime events: cross-stream ordering and the lifetime bookkeeping the
//! memory recycler consumes.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::res::stream::{StreamId, StreamManager};
use crate::RtResult;

struct EventState {
    recorded: bool,
    fired: bool,
    fired_at: Option<Instant>,
}

struct EventInner {
    blocking: bool,
    timing: bool,
    state: Mutex<EventState>,
    cv: Condvar,
}

/// A device event. Recording on stream A and waiting on stream B enforces
/// happens-before between the two streams: B's worker blocks until the
/// record task has run on A.
#[derive(Clone)]
pub struct RuntimeEvent {
    inner: Arc<EventInner>,
}

impl RuntimeEvent {
    pub fn new(blocking: bool, timing: bool) -> RuntimeEvent {
        RuntimeEvent {
            inner: Arc::new(EventInner {
                blocking,
                timing,
                // An event that was never recorded reads as complete.
                state: Mutex::new(EventState { recorded: false, fired: true, fired_at: None }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.blocking
    }

    /// Mark the event pending and complete it once every task already
    /// submitted to `stream` has run.
    pub fn record(&self, stream: StreamId, streams: &StreamManager) -> RtResult<()> {
        {
            let mut state = self.lock();
            state.recorded = true;
            state.fired = false;
            state.fired_at = None;
        }
        let inner = self.inner.clone();
        streams.submit(
            stream,
            Box::new(move || {
                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.fired = true;
                if inner.timing {
                    state.fired_at = Some(Instant::now());
                }
                inner.cv.notify_all();
            }),
        )
    }

    /// Make `stream` wait for this event before running anything submitted
    /// after the wait.
    pub fn wait(&self, stream: StreamId, streams: &StreamManager) -> RtResult<()> {
        let inner = self.inner.clone();
        streams.submit(
            stream,
            Box::new(move || {
                let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                let _unused = inner
                    .cv
                    .wait_while(state, |state| !state.fired)
                    .unwrap_or_else(PoisonError::into_inner);
            }),
        )
    }

    /// Block the calling thread until the event fires.
    pub fn sync(&self) {
        let state = self.lock();
        let _unused = self
            .inner
            .cv
            .wait_while(state, |state| !state.fired)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Whether the event has fired (true for never-recorded events).
    pub fn query(&self) -> bool {
        self.lock().fired
    }

    /// Milliseconds between this event's completion and `other`'s. Requires
    /// both events to have been created with timing enabled and recorded.
    pub fn elapsed_time(&self, other: &RuntimeEvent) -> Option<f32> {
        if !self.inner.timing || !other.inner.timing {
            return None;
        }
        let start = self.lock().fired_at?;
        let end = other.lock().fired_at?;
        Some(end.duration_since(start).as_secs_f32() * 1e3)
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One "address is in use by `user_stream` until `event` fires" entry.
struct LifetimeEntry {
    task_id: i64,
    user_stream: StreamId,
    mem_stream: StreamId,
    addr: usize,
    event: RuntimeEvent,
}

/// Cross-stream lifetime table: records which addresses a stream still
/// holds, keyed by the event that ends the hold.
#[derive(Default)]
pub struct EventTable {
    entries: Mutex<Vec<LifetimeEntry>>,
}

impl EventTable {
    /// Mark each `(mem_stream, addr)` pair as held by `user_stream` until
    /// `event` fires.
    pub fn record(
        &self,
        task_id: i64,
        user_stream: StreamId,
        addresses: &[(StreamId, usize)],
        event: RuntimeEvent,
    ) {
        let mut entries = self.lock();
        for &(mem_stream, addr) in addresses {
            entries.push(LifetimeEntry {
                task_id,
                user_stream,
                mem_stream,
                addr,
                event: event.clone(),
            });
        }
    }

    /// Drop every entry matching `(task_id, user_stream, mem_stream)`.
    /// Returns the number of entries dropped.
    pub fn wait(&self, task_id: i64, user_stream: StreamId, mem_stream: StreamId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| {
            !(e.task_id == task_id && e.user_stream == user_stream && e.mem_stream == mem_stream)
        });
        before - entries.len()
    }

    /// Whether any live entry still pins `addr`.
    pub fn holds(&self, addr: usize) -> bool {
        self.lock().iter().any(|e| e.addr == addr && !e.event.query())
    }

    /// Block until every recorded event fires, then clear the table.
    pub fn sync_all(&self) {
        let entries = std::mem::take(&mut *self.lock());
        for entry in &entries {
            entry.event.sync();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LifetimeEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::res::stream::DEFAULT_STREAM;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn record_then_wait_orders_two_streams() {
        let streams = StreamManager::new();
        let producer = DEFAULT_STREAM;
        let consumer = streams.create();

        let flag = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));

        let event = RuntimeEvent::new(false, false);
        {
            // A slow producer task, then the record.
            let flag = flag.clone();
            streams
                .submit(
                    producer,
                    Box::new(move || {
                        std::thread::sleep(std::time::Duration::from_millis(30));
                        flag.store(true, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        event.record(producer, &streams).unwrap();
        event.wait(consumer, &streams).unwrap();
        {
            // The consumer-side task must observe the producer's write.
            let flag = flag.clone();
            let observed = observed.clone();
            streams
                .submit(
                    consumer,
                    Box::new(move || observed.store(flag.load(Ordering::SeqCst), Ordering::SeqCst)),
                )
                .unwrap();
        }
        streams.sync_all().unwrap();
        assert!(observed.load(Ordering::SeqCst));
        assert!(event.query());
    }

    #[test]
    fn unrecorded_events_read_complete() {
        let event = RuntimeEvent::new(true, false);
        assert!(event.query());
        event.sync();
    }

    #[test]
    fn elapsed_time_needs_timing() {
        let streams = StreamManager::new();
        let a = RuntimeEvent::new(false, true);
        let b = RuntimeEvent::new(false, true);
        a.record(DEFAULT_STREAM, &streams).unwrap();
        b.record(DEFAULT_STREAM, &streams).unwrap();
        streams.sync_all().unwrap();
        let ms = a.elapsed_time(&b).unwrap();
        assert!(ms >= 0.0);
        let untimed = RuntimeEvent::new(false, false);
        assert!(untimed.elapsed_time(&b).is_none());
    }

    #[test]
    fn lifetime_entries_drop_on_wait() {
        let table = EventTable::default();
        let event = RuntimeEvent::new(false, false);
        table.record(7, 1, &[(0, 0x1000), (2, 0x2000)], event);
        assert_eq!(table.wait(7, 1, 0), 1);
        assert_eq!(table.wait(7, 1, 2), 1);
        assert_eq!(table.wait(7, 1, 2), 0);
    }

    #[test]
    fn sync_all_clears() {
        let streams = StreamManager::new();
        let table = EventTable::default();
        let event = RuntimeEvent::new(false, false);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = counter.clone();
            streams
                .submit(DEFAULT_STREAM, Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        event.record(DEFAULT_STREAM, &streams).unwrap();
        table.record(1, 0, &[(0, 0xdead)], event);
        table.sync_all();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!table.holds(0xdead));
    }
}
