//! The device resource manager abstraction and the backend registry.

pub mod cpu;
pub mod event;
pub mod stream;

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;

use da_ir::{Device, DeviceKind, StorageAllocator};

use crate::pool::PoolStats;
use crate::{RtError, RtResult};

pub use event::{EventTable, RuntimeEvent};
pub use stream::{current_stream, set_current_stream, StreamId, DEFAULT_STREAM};

/// The per-device resource surface: memory pool, streams, events and the
/// cross-stream lifetime bookkeeping.
pub trait ResManager: Send + Sync {
    fn device(&self) -> Device;

    /// The allocator storages draw from.
    fn storage_allocator(&self) -> Arc<dyn StorageAllocator>;

    /// Allocate pool memory for `stream`. `None` means exhaustion; whether
    /// that is fatal is the caller's call.
    fn allocate(&self, size: usize, stream: StreamId) -> Option<*mut u8>;
    fn free(&self, ptr: *mut u8);

    fn create_stream(&self) -> RtResult<StreamId>;
    fn destroy_stream(&self, stream: StreamId) -> RtResult<()>;
    fn sync_stream(&self, stream: StreamId) -> RtResult<()>;
    fn sync_all_streams(&self) -> RtResult<()>;
    fn default_stream(&self) -> StreamId {
        DEFAULT_STREAM
    }
    /// Submit a task to run on `stream` in submission order.
    fn submit(&self, stream: StreamId, task: Box<dyn FnOnce() + Send>) -> RtResult<()>;
    /// Whether every stream has drained.
    fn all_streams_idle(&self) -> bool;

    fn create_event(&self, blocking: bool, enable_timing: bool) -> RuntimeEvent;
    fn record_event(&self, event: &RuntimeEvent, stream: StreamId) -> RtResult<()>;
    fn wait_event(&self, event: &RuntimeEvent, stream: StreamId) -> RtResult<()>;

    /// Mark addresses as held by `user_stream` until `event` fires.
    fn lifetime_record(
        &self,
        task_id: i64,
        user_stream: StreamId,
        addresses: &[(StreamId, usize)],
        event: RuntimeEvent,
    );
    /// Drop lifetime entries for `(task_id, user_stream, mem_stream)`.
    fn lifetime_wait(&self, task_id: i64, user_stream: StreamId, mem_stream: StreamId) -> usize;
    /// Wait for every pending lifetime event.
    fn sync_all_events(&self);

    fn memory_stats(&self) -> PoolStats;
    /// Decommit idle pool memory.
    fn eager_free(&self) -> usize;
    /// Release cached backing to the OS; returns the bytes released.
    fn empty_cache(&self) -> usize;
}

type Factory = Box<dyn Fn(Device) -> RtResult<Arc<dyn ResManager>> + Send + Sync>;

/// `(device-name, factory)` registration for backends, plus the cache of
/// live managers. Managers are created on first use and shared afterwards.
pub struct DeviceRegistry {
    factories: Mutex<Vec<(DeviceKind, Factory)>>,
    live: Mutex<FxHashMap<Device, Arc<dyn ResManager>>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            factories: Mutex::new(Vec::new()),
            live: Mutex::new(FxHashMap::default()),
        }
    }

    /// A registry with the built-in CPU backend registered.
    pub fn with_builtin() -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.register(
            DeviceKind::Cpu,
            Box::new(|device| {
                let mgr = cpu::CpuResManager::new(device, Default::default());
                Ok(Arc::new(mgr) as Arc<dyn ResManager>)
            }),
        );
        registry
    }

    pub fn register(&self, kind: DeviceKind, factory: Factory) {
        log::debug!("device backend registered: {}", kind.as_str());
        self.factories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, factory));
    }

    pub fn get_or_create(&self, device: Device) -> RtResult<Arc<dyn ResManager>> {
        if let Some(mgr) = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
        {
            return Ok(mgr.clone());
        }
        let factories = self.factories.lock().unwrap_or_else(PoisonError::into_inner);
        let factory = factories
            .iter()
            .find(|(kind, _)| *kind == device.kind)
            .map(|(_, f)| f)
            .ok_or_else(|| {
                RtError::Internal(format!("no backend registered for device {device}"))
            })?;
        let mgr = factory(device)?;
        drop(factories);
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, mgr.clone());
        Ok(mgr)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        DeviceRegistry::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_backend_is_builtin_and_cached() {
        let registry = DeviceRegistry::with_builtin();
        let a = registry.get_or_create(Device::CPU).unwrap();
        let b = registry.get_or_create(Device::CPU).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.device(), Device::CPU);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = DeviceRegistry::new();
        assert!(registry.get_or_create(Device::CPU).is_err());
    }
}
