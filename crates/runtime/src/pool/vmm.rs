//! The VMM path: a large reserved virtual range with fixed-size granules
//! mapped and unmapped on demand.
//!
//! The adapter reserves one contiguous `PROT_NONE` range up front. Growing
//! the pool *commits* granules inside the range; freeing *decommits* them
//! but keeps the physical backing cached for reuse; `release_cached` gives
//! the cached granules back to the OS. A host has no separate physical
//! handle namespace, so granules are tracked by index in a page state
//! table rather than an address-to-handle map.

/// Fixed mapping granule.
pub const VMM_GRANULE: usize = 2 * 1024 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum PageState {
    /// Reserved address space never handed out.
    Free,
    /// Mapped and in use by the pool.
    Committed,
    /// Decommitted, physical handle cached for reuse.
    Cached,
    /// Decommitted with the handle released. Still owned by whoever the
    /// range was handed to; only `commit` brings it back.
    Released,
}

pub struct VmmAdapter {
    base: usize,
    reserved: usize,
    granule: usize,
    pages: Vec<PageState>,
}

// The adapter owns its whole reserved range exclusively.
unsafe impl Send for VmmAdapter {}

impl VmmAdapter {
    /// Reserve `reserve_bytes` of address space. Returns `None` when the
    /// host cannot provide the mapping (or on non-unix targets).
    pub fn reserve(reserve_bytes: usize, granule: usize) -> Option<VmmAdapter> {
        sys::reserve(reserve_bytes).map(|base| {
            log::debug!(
                "vmm: reserved {} MiB at {:#x}",
                reserve_bytes >> 20,
                base
            );
            VmmAdapter {
                base,
                reserved: reserve_bytes,
                granule,
                pages: vec![PageState::Free; reserve_bytes / granule],
            }
        })
    }

    pub fn granule(&self) -> usize {
        self.granule
    }

    /// Bytes of decommitted granules whose physical handles are cached.
    pub fn cached_bytes(&self) -> usize {
        self.pages.iter().filter(|&&p| p == PageState::Cached).count() * self.granule
    }

    /// Whether `(addr, size)` sits on granule boundaries of this range.
    pub fn aligned(&self, addr: usize, size: usize) -> bool {
        addr >= self.base
            && (addr - self.base) % self.granule == 0
            && size % self.granule == 0
    }

    fn page_range(&self, addr: usize, size: usize) -> core::ops::Range<usize> {
        debug_assert!(self.aligned(addr, size));
        let first = (addr - self.base) / self.granule;
        first..first + size / self.granule
    }

    /// Map a block of `size` bytes (rounded up to the granule) somewhere in
    /// the never-handed-out part of the reserved range. Returns `None` when
    /// the range has no large-enough run left. Ranges already handed out
    /// stay owned by their holder even after decommit; they come back only
    /// through [`VmmAdapter::commit`].
    pub fn alloc_block(&mut self, size: usize) -> Option<*mut u8> {
        let pages = size.div_ceil(self.granule);
        let start = self.find_run(pages)?;
        for idx in start..start + pages {
            self.commit_page(idx)?;
        }
        Some((self.base + start * self.granule) as *mut u8)
    }

    /// Re-commit a previously decommitted range.
    pub fn commit(&mut self, addr: usize, size: usize) -> bool {
        let range = self.page_range(addr, size);
        for idx in range {
            if self.pages[idx] == PageState::Committed {
                continue;
            }
            if self.commit_page(idx).is_none() {
                return false;
            }
        }
        true
    }

    /// Decommit a range, caching the physical handles. Returns the bytes
    /// decommitted.
    pub fn decommit(&mut self, addr: usize, size: usize) -> usize {
        let mut freed = 0;
        for idx in self.page_range(addr, size) {
            if self.pages[idx] != PageState::Committed {
                continue;
            }
            let page = self.base + idx * self.granule;
            if sys::decommit(page, self.granule) {
                self.pages[idx] = PageState::Cached;
                freed += self.granule;
            }
        }
        freed
    }

    /// Give every cached granule back to the OS. Returns the bytes released.
    pub fn release_cached(&mut self) -> usize {
        let mut released = 0;
        for idx in 0..self.pages.len() {
            if self.pages[idx] != PageState::Cached {
                continue;
            }
            let page = self.base + idx * self.granule;
            if sys::release(page, self.granule) {
                self.pages[idx] = PageState::Released;
                released += self.granule;
            }
        }
        if released > 0 {
            log::debug!("vmm: released {} MiB of cached granules", released >> 20);
        }
        released
    }

    fn commit_page(&mut self, idx: usize) -> Option<()> {
        let page = self.base + idx * self.granule;
        match self.pages[idx] {
            PageState::Committed => Some(()),
            // A cached granule keeps its backing; mapping it again is just a
            // protection change. Free and released granules need a fresh
            // commit.
            PageState::Cached | PageState::Free | PageState::Released => {
                if sys::commit(page, self.granule) {
                    self.pages[idx] = PageState::Committed;
                    Some(())
                } else {
                    None
                }
            }
        }
    }

    /// First-fit scan for `len` consecutive never-handed-out granules.
    fn find_run(&self, len: usize) -> Option<usize> {
        let mut run = 0;
        for (idx, &page) in self.pages.iter().enumerate() {
            if page == PageState::Free {
                run += 1;
                if run == len {
                    return Some(idx + 1 - len);
                }
            } else {
                run = 0;
            }
        }
        None
    }
}

impl Drop for VmmAdapter {
    fn drop(&mut self) {
        sys::unreserve(self.base, self.reserved);
    }
}

#[cfg(unix)]
mod sys {
    use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

    pub fn reserve(len: usize) -> Option<usize> {
        let ptr = unsafe {
            mmap_anonymous(core::ptr::null_mut(), len, ProtFlags::empty(), MapFlags::PRIVATE)
        }
        .ok()?;
        Some(ptr as usize)
    }

    pub fn commit(addr: usize, len: usize) -> bool {
        unsafe {
            mprotect(
                addr as *mut core::ffi::c_void,
                len,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        }
        .is_ok()
    }

    pub fn decommit(addr: usize, len: usize) -> bool {
        unsafe { mprotect(addr as *mut core::ffi::c_void, len, MprotectFlags::empty()) }.is_ok()
    }

    pub fn release(addr: usize, len: usize) -> bool {
        // Replace the mapping in place to drop the physical backing while
        // keeping the address range reserved.
        unsafe {
            mmap_anonymous(
                addr as *mut core::ffi::c_void,
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::FIXED,
            )
        }
        .is_ok()
    }

    pub fn unreserve(addr: usize, len: usize) {
        let _ = unsafe { munmap(addr as *mut core::ffi::c_void, len) };
    }
}

#[cfg(not(unix))]
mod sys {
    pub fn reserve(_len: usize) -> Option<usize> {
        None
    }

    pub fn commit(_addr: usize, _len: usize) -> bool {
        false
    }

    pub fn decommit(_addr: usize, _len: usize) -> bool {
        false
    }

    pub fn release(_addr: usize, _len: usize) -> bool {
        false
    }

    pub fn unreserve(_addr: usize, _len: usize) {}
}
