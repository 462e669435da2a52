//! The best-fit device memory pool.
//!
//! A pool hands out aligned buffers carved from large blocks. Blocks come
//! from the VMM adapter when the host supports reserving address space, and
//! from the plain heap otherwise. Freed buffers merge with idle neighbours;
//! eager-free decommits whole idle blocks while keeping them tracked; empty
//! cache returns the decommitted backing to the OS.

pub mod vmm;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use da_ir::StorageAllocator;

use vmm::{VmmAdapter, VMM_GRANULE};

/// Allocation granule inside a block.
pub const POOL_ALIGN: usize = 512;

/// Caller-installed allocation callbacks overriding the built-in path.
pub type AllocFn = Box<dyn Fn(usize) -> *mut u8 + Send>;
pub type FreeFn = Box<dyn Fn(*mut u8) + Send>;

#[derive(Copy, Clone, Debug)]
pub struct PoolConfig {
    /// Address space reserved by the VMM path.
    pub reserve_bytes: usize,
    /// Minimum growth unit when the free list cannot satisfy a request.
    pub block_unit: usize,
    /// VMM mapping granule.
    pub granule: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            reserve_bytes: 4 << 30,
            block_unit: 16 << 20,
            granule: VMM_GRANULE,
        }
    }
}

/// Pool accounting. `used + idle + eager_free == total` at all times.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub idle: usize,
    pub eager_free: usize,
    pub peak_reserved: usize,
    pub peak_allocated: usize,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum BufState {
    Used,
    Idle,
    EagerFreed,
}

#[derive(Copy, Clone, Debug)]
struct MemBuf {
    size: usize,
    state: BufState,
    stream: u32,
    block: usize,
}

enum Source {
    Vmm(VmmAdapter),
    Heap(HeapSource),
}

/// Fallback block source over the system heap, for hosts without the VMM
/// path. Decommit and cache-release are no-ops there.
#[derive(Default)]
struct HeapSource {
    blocks: FxHashMap<usize, std::alloc::Layout>,
}

impl HeapSource {
    fn alloc_block(&mut self, size: usize) -> Option<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(size, POOL_ALIGN).ok()?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        self.blocks.insert(ptr as usize, layout);
        Some(ptr)
    }
}

impl Drop for HeapSource {
    fn drop(&mut self) {
        for (&addr, &layout) in &self.blocks {
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

struct Pluggable {
    alloc: AllocFn,
    free: FreeFn,
}

struct PoolInner {
    source: Source,
    /// Every tracked buffer, keyed by address. Adjacent idle buffers within
    /// a block merge on free.
    bufs: BTreeMap<usize, MemBuf>,
    /// Idle buffers ordered by (size, addr) for the best-fit search.
    free_by_size: BTreeSet<(usize, usize)>,
    blocks: Vec<(usize, usize)>,
    stats: PoolStats,
    pluggable: Option<Pluggable>,
    plug_live: FxHashMap<usize, usize>,
}

// Buffer addresses are plain integers here; the pool owns the blocks they
// point into.
unsafe impl Send for PoolInner {}

/// A best-fit allocator over a device block source, shared between the
/// pipeline threads.
pub struct BestFitPool {
    cfg: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl BestFitPool {
    pub fn new(cfg: PoolConfig) -> BestFitPool {
        let source = match VmmAdapter::reserve(cfg.reserve_bytes, cfg.granule) {
            Some(vmm) => Source::Vmm(vmm),
            None => {
                log::debug!("pool: VMM path unavailable, falling back to the heap source");
                Source::Heap(HeapSource::default())
            }
        };
        BestFitPool {
            cfg,
            inner: Mutex::new(PoolInner {
                source,
                bufs: BTreeMap::new(),
                free_by_size: BTreeSet::new(),
                blocks: Vec::new(),
                stats: PoolStats::default(),
                pluggable: None,
                plug_live: FxHashMap::default(),
            }),
        }
    }

    pub fn has_vmm(&self) -> bool {
        matches!(self.lock().source, Source::Vmm(_))
    }

    /// Install caller-provided allocation callbacks. Subsequent allocations
    /// bypass the block pool entirely; the two modes are mutually
    /// exclusive.
    pub fn set_allocator(&self, alloc: AllocFn, free: FreeFn) {
        self.lock().pluggable = Some(Pluggable { alloc, free });
    }

    /// Allocate `size` bytes for `stream`. On a miss the pool grows by a
    /// block; on exhaustion it retries once after releasing caches, then
    /// dumps its state and returns `None`.
    pub fn allocate(&self, size: usize, stream: u32) -> Option<*mut u8> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(plug) = &inner.pluggable {
            let ptr = (plug.alloc)(size);
            if ptr.is_null() {
                return None;
            }
            inner.plug_live.insert(ptr as usize, size);
            inner.stats.used += size;
            inner.stats.total += size;
            bump_peaks(&mut inner.stats);
            return Some(ptr);
        }

        let size = round_up(size.max(1), POOL_ALIGN);
        if let Some(ptr) = inner.try_alloc(size, stream) {
            return Some(ptr);
        }
        if inner.grow(&self.cfg, size) {
            if let Some(ptr) = inner.try_alloc(size, stream) {
                return Some(ptr);
            }
        }
        // One recovery pass: decommit idle memory, drop caches, regrow.
        inner.eager_free_idle();
        inner.release_cached();
        if inner.grow(&self.cfg, size) {
            if let Some(ptr) = inner.try_alloc(size, stream) {
                return Some(ptr);
            }
        }
        log::error!(
            "pool: allocation of {size} bytes failed; stats: {:?}",
            inner.stats
        );
        None
    }

    /// Return a buffer to the pool.
    pub fn free(&self, ptr: *mut u8) {
        let mut inner = self.lock();
        if let Some(size) = inner.plug_live.remove(&(ptr as usize)) {
            inner.stats.used -= size;
            inner.stats.total -= size;
            if let Some(plug) = &inner.pluggable {
                (plug.free)(ptr);
            }
            return;
        }
        inner.free_buf(ptr as usize);
    }

    /// Decommit every whole idle buffer. Returns the bytes decommitted.
    pub fn eager_free(&self) -> usize {
        self.lock().eager_free_idle()
    }

    /// Release all cached physical backing. Returns the bytes given back to
    /// the OS.
    pub fn empty_cache(&self) -> usize {
        let mut inner = self.lock();
        inner.eager_free_idle();
        inner.release_cached()
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BestFitPool {
    fn drop(&mut self) {
        let stats = self.stats();
        log::debug!(
            "pool: peak reserved {} bytes, peak allocated {} bytes",
            stats.peak_reserved,
            stats.peak_allocated
        );
    }
}

impl PoolInner {
    fn try_alloc(&mut self, size: usize, stream: u32) -> Option<*mut u8> {
        let &(buf_size, addr) = self.free_by_size.range((size, 0)..).next()?;
        self.free_by_size.remove(&(buf_size, addr));
        let buf = self.bufs[&addr];
        debug_assert_eq!(buf.size, buf_size);

        if buf.state == BufState::EagerFreed {
            if let Source::Vmm(vmm) = &mut self.source {
                if !vmm.commit(addr, buf.size) {
                    return None;
                }
            }
            self.stats.eager_free -= buf.size;
        } else {
            self.stats.idle -= buf.size;
        }

        // Split the remainder back onto the free list.
        let remainder = buf_size - size;
        if remainder >= POOL_ALIGN {
            let rem_addr = addr + size;
            self.bufs.insert(
                rem_addr,
                MemBuf { size: remainder, state: BufState::Idle, stream: 0, block: buf.block },
            );
            self.free_by_size.insert((remainder, rem_addr));
            self.stats.idle += remainder;
            self.bufs.insert(
                addr,
                MemBuf { size, state: BufState::Used, stream, block: buf.block },
            );
            self.stats.used += size;
        } else {
            self.bufs.insert(
                addr,
                MemBuf { size: buf_size, state: BufState::Used, stream, block: buf.block },
            );
            self.stats.used += buf_size;
        }
        bump_peaks(&mut self.stats);
        Some(addr as *mut u8)
    }

    fn grow(&mut self, cfg: &PoolConfig, at_least: usize) -> bool {
        let block_size = round_up(at_least.max(cfg.block_unit), cfg.granule);
        let ptr = match &mut self.source {
            Source::Vmm(vmm) => vmm.alloc_block(block_size),
            Source::Heap(heap) => heap.alloc_block(block_size),
        };
        let Some(ptr) = ptr else {
            return false;
        };
        let addr = ptr as usize;
        let block = self.blocks.len();
        self.blocks.push((addr, block_size));
        self.bufs.insert(
            addr,
            MemBuf { size: block_size, state: BufState::Idle, stream: 0, block },
        );
        self.free_by_size.insert((block_size, addr));
        self.stats.total += block_size;
        self.stats.idle += block_size;
        bump_peaks(&mut self.stats);
        log::debug!("pool: grew by a {} KiB block", block_size >> 10);
        true
    }

    fn free_buf(&mut self, addr: usize) {
        let Some(buf) = self.bufs.get(&addr).copied() else {
            log::error!("pool: free of untracked address {addr:#x}");
            return;
        };
        if buf.state != BufState::Used {
            log::error!("pool: double free of {addr:#x}");
            return;
        }
        self.stats.used -= buf.size;
        self.stats.idle += buf.size;

        let mut start = addr;
        let mut size = buf.size;
        let block = buf.block;

        // Merge the idle successor, then the idle predecessor.
        if let Some((&next_addr, &next)) = self.bufs.range(addr + 1..).next() {
            if next_addr == addr + size && next.state == BufState::Idle && next.block == block {
                self.bufs.remove(&next_addr);
                self.free_by_size.remove(&(next.size, next_addr));
                size += next.size;
            }
        }
        if let Some((&prev_addr, &prev)) = self.bufs.range(..addr).next_back() {
            if prev_addr + prev.size == addr && prev.state == BufState::Idle && prev.block == block
            {
                self.bufs.remove(&addr);
                self.free_by_size.remove(&(prev.size, prev_addr));
                start = prev_addr;
                size += prev.size;
            }
        }
        self.bufs.insert(
            start,
            MemBuf { size, state: BufState::Idle, stream: 0, block },
        );
        self.free_by_size.insert((size, start));
    }

    fn eager_free_idle(&mut self) -> usize {
        let Source::Vmm(vmm) = &mut self.source else {
            return 0;
        };
        let mut freed = 0;
        let candidates: Vec<(usize, MemBuf)> = self
            .bufs
            .iter()
            .filter(|(_, b)| b.state == BufState::Idle)
            .map(|(&a, &b)| (a, b))
            .collect();
        for (addr, buf) in candidates {
            if !vmm.aligned(addr, buf.size) {
                continue;
            }
            let bytes = vmm.decommit(addr, buf.size);
            if bytes == buf.size {
                // The buffer stays on the free list; reuse re-commits it.
                self.bufs.insert(addr, MemBuf { state: BufState::EagerFreed, ..buf });
                self.stats.idle -= buf.size;
                self.stats.eager_free += buf.size;
                freed += bytes;
            }
        }
        freed
    }

    fn release_cached(&mut self) -> usize {
        match &mut self.source {
            Source::Vmm(vmm) => vmm.release_cached(),
            Source::Heap(_) => 0,
        }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn bump_peaks(stats: &mut PoolStats) {
    stats.peak_reserved = stats.peak_reserved.max(stats.total);
    stats.peak_allocated = stats.peak_allocated.max(stats.used);
}

/// Adapter letting IR storages allocate straight from a pool.
pub struct PoolAllocator {
    pool: Arc<BestFitPool>,
}

impl PoolAllocator {
    pub fn new(pool: Arc<BestFitPool>) -> PoolAllocator {
        PoolAllocator { pool }
    }
}

impl StorageAllocator for PoolAllocator {
    fn allocate(&self, size: usize, stream_id: u32) -> Option<*mut u8> {
        self.pool.allocate(size, stream_id)
    }

    fn free(&self, ptr: *mut u8) {
        self.pool.free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> BestFitPool {
        BestFitPool::new(PoolConfig {
            reserve_bytes: 64 << 20,
            block_unit: 4 << 20,
            granule: VMM_GRANULE,
        })
    }

    #[test]
    fn accounting_invariant_holds() {
        let pool = small_pool();
        let a = pool.allocate(1000, 0).unwrap();
        let b = pool.allocate(5000, 0).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.used, round_up(1000, POOL_ALIGN) + round_up(5000, POOL_ALIGN));
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
        pool.free(a);
        pool.free(b);
        let stats = pool.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
        assert_eq!(stats.peak_allocated, round_up(1000, POOL_ALIGN) + round_up(5000, POOL_ALIGN));
    }

    #[test]
    fn free_buffers_merge_and_get_reused() {
        let pool = small_pool();
        let a = pool.allocate(4096, 0).unwrap();
        let b = pool.allocate(4096, 0).unwrap();
        pool.free(a);
        pool.free(b);
        // Merged free space satisfies a request bigger than either piece.
        let c = pool.allocate(8192, 0).unwrap();
        assert_eq!(c, a);
        pool.free(c);
    }

    #[test]
    fn best_fit_prefers_the_tightest_block() {
        let pool = small_pool();
        let a = pool.allocate(1 << 20, 0).unwrap();
        let keep1 = pool.allocate(POOL_ALIGN, 0).unwrap();
        let b = pool.allocate(8192, 0).unwrap();
        let keep2 = pool.allocate(POOL_ALIGN, 0).unwrap();
        pool.free(a);
        pool.free(b);
        // The 8 KiB hole fits better than the 1 MiB one.
        let c = pool.allocate(4096, 0).unwrap();
        assert_eq!(c, b);
        pool.free(c);
        pool.free(keep1);
        pool.free(keep2);
    }

    #[cfg(unix)]
    #[test]
    fn empty_cache_releases_a_freed_working_set() {
        let pool = small_pool();
        let working: Vec<*mut u8> =
            (0..4).map(|_| pool.allocate(4 << 20, 0).unwrap()).collect();
        let total_before = pool.stats().total;
        for ptr in working {
            pool.free(ptr);
        }
        let released = pool.empty_cache();
        assert!(released >= 16 << 20);
        let stats = pool.stats();
        // Released blocks stay tracked as eager-freed address space.
        assert_eq!(stats.total, total_before);
        assert_eq!(stats.used, 0);
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
        // And the space is still usable afterwards.
        let again = pool.allocate(4 << 20, 0).unwrap();
        pool.free(again);
    }

    #[cfg(unix)]
    #[test]
    fn eager_free_decommits_but_keeps_tracking() {
        let pool = small_pool();
        let ptr = pool.allocate(4 << 20, 0).unwrap();
        pool.free(ptr);
        let freed = pool.eager_free();
        assert!(freed >= 4 << 20);
        let stats = pool.stats();
        assert_eq!(stats.eager_free, freed);
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
        // Reuse re-commits the decommitted range.
        let again = pool.allocate(1 << 20, 0).unwrap();
        unsafe { again.write_bytes(1, 1 << 20) };
        let stats = pool.stats();
        assert_eq!(stats.eager_free, 0);
        assert_eq!(stats.used + stats.idle + stats.eager_free, stats.total);
        pool.free(again);
    }

    #[test]
    fn pluggable_allocator_overrides_the_pool() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        let pool = small_pool();
        pool.set_allocator(
            Box::new(|size| {
                LIVE.fetch_add(1, Ordering::SeqCst);
                let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
                unsafe { std::alloc::alloc(layout) }
            }),
            Box::new(|_ptr| {
                LIVE.fetch_sub(1, Ordering::SeqCst);
            }),
        );
        let ptr = pool.allocate(256, 0).unwrap();
        assert_eq!(LIVE.load(Ordering::SeqCst), 1);
        pool.free(ptr);
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }
}
