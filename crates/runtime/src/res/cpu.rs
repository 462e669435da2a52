//! The CPU resource manager: the best-fit pool over the host VMM path,
//! worker-thread streams and host events.

use std::sync::Arc;

use da_ir::{Device, StorageAllocator};

use crate::pool::{BestFitPool, PoolAllocator, PoolConfig, PoolStats};
use crate::res::event::{EventTable, RuntimeEvent};
use crate::res::stream::{StreamId, StreamManager};
use crate::res::ResManager;
use crate::RtResult;

pub struct CpuResManager {
    device: Device,
    pool: Arc<BestFitPool>,
    streams: StreamManager,
    events: EventTable,
}

impl CpuResManager {
    pub fn new(device: Device, cfg: PoolConfig) -> CpuResManager {
        CpuResManager {
            device,
            pool: Arc::new(BestFitPool::new(cfg)),
            streams: StreamManager::new(),
            events: EventTable::default(),
        }
    }

    pub fn pool(&self) -> &Arc<BestFitPool> {
        &self.pool
    }
}

impl ResManager for CpuResManager {
    fn device(&self) -> Device {
        self.device
    }

    fn storage_allocator(&self) -> Arc<dyn StorageAllocator> {
        Arc::new(PoolAllocator::new(self.pool.clone()))
    }

    fn allocate(&self, size: usize, stream: StreamId) -> Option<*mut u8> {
        self.pool.allocate(size, stream)
    }

    fn free(&self, ptr: *mut u8) {
        self.pool.free(ptr);
    }

    fn create_stream(&self) -> RtResult<StreamId> {
        Ok(self.streams.create())
    }

    fn destroy_stream(&self, stream: StreamId) -> RtResult<()> {
        self.streams.destroy(stream)
    }

    fn sync_stream(&self, stream: StreamId) -> RtResult<()> {
        self.streams.sync(stream)
    }

    fn sync_all_streams(&self) -> RtResult<()> {
        self.streams.sync_all()
    }

    fn submit(&self, stream: StreamId, task: Box<dyn FnOnce() + Send>) -> RtResult<()> {
        self.streams.submit(stream, task)
    }

    fn all_streams_idle(&self) -> bool {
        self.streams.all_idle()
    }

    fn create_event(&self, blocking: bool, enable_timing: bool) -> RuntimeEvent {
        RuntimeEvent::new(blocking, enable_timing)
    }

    fn record_event(&self, event: &RuntimeEvent, stream: StreamId) -> RtResult<()> {
        event.record(stream, &self.streams)
    }

    fn wait_event(&self, event: &RuntimeEvent, stream: StreamId) -> RtResult<()> {
        event.wait(stream, &self.streams)
    }

    fn lifetime_record(
        &self,
        task_id: i64,
        user_stream: StreamId,
        addresses: &[(StreamId, usize)],
        event: RuntimeEvent,
    ) {
        self.events.record(task_id, user_stream, addresses, event);
    }

    fn lifetime_wait(&self, task_id: i64, user_stream: StreamId, mem_stream: StreamId) -> usize {
        self.events.wait(task_id, user_stream, mem_stream)
    }

    fn sync_all_events(&self) {
        self.events.sync_all();
    }

    fn memory_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn eager_free(&self) -> usize {
        self.pool.eager_free()
    }

    fn empty_cache(&self) -> usize {
        self.pool.empty_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_through_the_trait() {
        let mgr = CpuResManager::new(
            Device::CPU,
            PoolConfig { reserve_bytes: 32 << 20, block_unit: 2 << 20, ..Default::default() },
        );
        let ptr = mgr.allocate(1024, 0).unwrap();
        unsafe { ptr.write_bytes(0x5a, 1024) };
        mgr.free(ptr);
        let stats = mgr.memory_stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
    }

    #[test]
    fn storages_draw_from_the_pool() {
        let mgr = CpuResManager::new(
            Device::CPU,
            PoolConfig { reserve_bytes: 32 << 20, block_unit: 2 << 20, ..Default::default() },
        );
        let alloc = mgr.storage_allocator();
        let storage =
            da_ir::Storage::new_allocated(4096, Device::CPU, 0, alloc).unwrap();
        assert!(mgr.memory_stats().used >= 4096);
        drop(storage);
        assert_eq!(mgr.memory_stats().used, 0);
    }
}
