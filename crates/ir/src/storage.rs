//! Reference-counted, device-resident byte buffers.

use std::sync::{Arc, Mutex, PoisonError};

use crate::device::Device;

/// The allocation interface a storage uses to obtain and return device
/// memory. Implemented by the runtime's per-device memory pool; kept as a
/// trait here so the IR crate stays below the runtime in the dependency
/// order.
pub trait StorageAllocator: Send + Sync {
    /// Allocate `size` bytes for use on `stream_id`. Returns `None` when the
    /// pool is exhausted.
    fn allocate(&self, size: usize, stream_id: u32) -> Option<*mut u8>;

    /// Return a pointer previously handed out by [`StorageAllocator::allocate`].
    fn free(&self, ptr: *mut u8);
}

struct State {
    ptr: *mut u8,
    size: usize,
    /// Whether this storage owns its buffer. Wrapped external memory is
    /// never freed on drop.
    owned: bool,
    stream: u32,
}

// A storage's buffer is exclusively referenced through its `State`; the
// pointer never escapes other than via `data_ptr`, whose callers synchronize
// through the pipeline's queues.
unsafe impl Send for State {}

struct Shared {
    device: Device,
    allocator: Option<Arc<dyn StorageAllocator>>,
    state: Mutex<State>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.owned && !state.ptr.is_null() {
            if let Some(alloc) = &self.allocator {
                alloc.free(state.ptr);
            }
        }
    }
}

/// A shared handle to a device-resident byte buffer of known size.
///
/// Cloning shares the buffer. The buffer is returned to its pool when the
/// last handle drops, or earlier when the refcount recycler calls
/// [`Storage::release`].
#[derive(Clone)]
pub struct Storage {
    shared: Arc<Shared>,
}

impl Storage {
    /// Allocate a new storage of `size` bytes from `allocator` for
    /// `stream_id`. Returns `None` when the pool is exhausted.
    pub fn new_allocated(
        size: usize,
        device: Device,
        stream_id: u32,
        allocator: Arc<dyn StorageAllocator>,
    ) -> Option<Storage> {
        let ptr = allocator.allocate(size, stream_id)?;
        Some(Storage {
            shared: Arc::new(Shared {
                device,
                allocator: Some(allocator),
                state: Mutex::new(State { ptr, size, owned: true, stream: stream_id }),
            }),
        })
    }

    /// Wrap externally-owned memory. The buffer is not freed on drop.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `size` bytes for the
    /// lifetime of the returned storage and all of its clones.
    pub unsafe fn from_external(ptr: *mut u8, size: usize, device: Device) -> Storage {
        Storage {
            shared: Arc::new(Shared {
                device,
                allocator: None,
                state: Mutex::new(State { ptr, size, owned: false, stream: 0 }),
            }),
        }
    }

    pub fn device(&self) -> Device {
        self.shared.device
    }

    pub fn size_bytes(&self) -> usize {
        self.lock().size
    }

    /// The raw buffer pointer; null after [`Storage::release`].
    pub fn data_ptr(&self) -> *mut u8 {
        self.lock().ptr
    }

    pub fn stream_id(&self) -> u32 {
        self.lock().stream
    }

    /// Number of live handles to this buffer, exposed for bridge code.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Re-request a buffer of `new_size` bytes from the pool. Contents are
    /// not preserved. Returns `false` when the pool is exhausted or when
    /// this storage wraps external memory.
    pub fn resize(&self, new_size: usize) -> bool {
        let mut state = self.lock();
        if state.size >= new_size && !state.ptr.is_null() {
            return true;
        }
        let Some(alloc) = &self.shared.allocator else {
            return false;
        };
        let Some(ptr) = alloc.allocate(new_size, state.stream) else {
            return false;
        };
        if state.owned && !state.ptr.is_null() {
            alloc.free(state.ptr);
        }
        state.ptr = ptr;
        state.size = new_size;
        state.owned = true;
        true
    }

    /// Point this storage at a different externally-owned buffer.
    ///
    /// # Safety
    ///
    /// Same contract as [`Storage::from_external`].
    pub unsafe fn set_data(&self, ptr: *mut u8, size: usize) {
        let mut state = self.lock();
        if state.owned && !state.ptr.is_null() {
            if let Some(alloc) = &self.shared.allocator {
                alloc.free(state.ptr);
            }
        }
        state.ptr = ptr;
        state.size = size;
        state.owned = false;
    }

    /// Return the buffer to the pool now, ahead of the last handle dropping.
    /// Used by the refcount recycler once all consumers of a node have been
    /// submitted. Subsequent [`Storage::data_ptr`] calls return null.
    pub fn release(&self) {
        let mut state = self.lock();
        if state.owned && !state.ptr.is_null() {
            if let Some(alloc) = &self.shared.allocator {
                alloc.free(state.ptr);
            }
        }
        state.ptr = core::ptr::null_mut();
        state.size = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for Storage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Storage")
            .field("device", &self.shared.device)
            .field("size", &state.size)
            .field("owned", &state.owned)
            .finish()
    }
}
