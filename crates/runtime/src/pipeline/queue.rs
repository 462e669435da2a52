//! The multi-producer single-consumer lock-free ring queue underneath the
//! pipeline's task queues.
//!
//! Producers reserve a slot by CAS on the tail index and publish it with a
//! per-slot ready flag (release on write completion, acquire on read). The
//! single consumer pops from the head. A paused queue rejects pushes and
//! parks its consumer on a condition variable; `finalize` wakes everyone
//! and makes the consumer return `None`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crossbeam_utils::CachePadded;

/// Why a push was rejected. Every variant is fatal to the caller except
/// where the pipeline is already shutting down.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PushError {
    /// Capacity exhausted.
    Full,
    /// The queue is paused; production is a bug in the run loop.
    Paused,
    /// The queue has been finalized.
    Shutdown,
}

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct LockFreeRingQueue<T> {
    buf: Box<[Slot<T>]>,
    mask: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    /// False while paused. The queue starts paused.
    running: CachePadded<AtomicBool>,
    alive: CachePadded<AtomicBool>,
    mutex: Mutex<()>,
    cv: Condvar,
}

// The consumer side is single-threaded by contract; producers only touch
// slots they have reserved through the tail CAS.
unsafe impl<T: Send> Send for LockFreeRingQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeRingQueue<T> {}

impl<T> LockFreeRingQueue<T> {
    /// Capacity must be a power of two.
    pub fn new(capacity: usize) -> LockFreeRingQueue<T> {
        assert!(capacity > 0 && capacity.is_power_of_two());
        let buf: Box<[Slot<T>]> = (0..capacity)
            .map(|_| Slot { ready: AtomicBool::new(false), value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect();
        LockFreeRingQueue {
            buf,
            mask: capacity as u64 - 1,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            running: CachePadded::new(AtomicBool::new(false)),
            alive: CachePadded::new(AtomicBool::new(true)),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.running.store(true, Ordering::Release);
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    /// Shut the queue down: consumers return, producers are rejected.
    pub fn finalize(&self) {
        self.alive.store(false, Ordering::Release);
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    /// Push a value. Retries on CAS contention only; a full or paused queue
    /// is an error the caller escalates.
    pub fn push(&self, value: T) -> Result<(), PushError> {
        loop {
            if !self.alive.load(Ordering::Acquire) {
                return Err(PushError::Shutdown);
            }
            if !self.running.load(Ordering::Acquire) {
                return Err(PushError::Paused);
            }
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) >= self.buf.len() as u64 {
                return Err(PushError::Full);
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.buf[(tail & self.mask) as usize];
                unsafe { (*slot.value.get()).write(value) };
                slot.ready.store(true, Ordering::Release);
                // A parked consumer needs the wakeup even while paused.
                let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
                self.cv.notify_one();
                return Ok(());
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let slot = &self.buf[(head & self.mask) as usize];
        if !slot.ready.load(Ordering::Acquire) {
            // The producer reserved the slot but has not published yet.
            return None;
        }
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Release);
        self.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    /// Consumer side: block until an element is available (spinning while
    /// running, parked on the condvar while paused) or the queue shuts
    /// down.
    pub fn pop_blocking(&self) -> Option<T> {
        loop {
            if !self.alive.load(Ordering::Acquire) {
                return None;
            }
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            if self.is_paused() {
                let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
                let _unused = self
                    .cv
                    .wait_while(guard, |_| {
                        self.alive.load(Ordering::Acquire)
                            && self.is_paused()
                            && self.is_empty()
                    })
                    .unwrap_or_else(PoisonError::into_inner);
            } else {
                core::hint::spin_loop();
            }
        }
    }
}

impl<T> Drop for LockFreeRingQueue<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
