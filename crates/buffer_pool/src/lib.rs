//! Per-worker slab of fixed-size packet buffers, DMA-mapped into every NIC
//! a worker touches, with a free-list over integer slot ids.
//!
//! Grounded on `ixmap_buf_alloc`/`ixmap_buf_release`: one huge-page mmap,
//! one `dma_map` per NIC over the same virtual region, and a stack-discipline
//! free list (`ixmap_slot_assign`/`ixmap_slot_release` pop/push the tail).
//! Pool exhaustion is expected, not exceptional: [`BufferPool::assign`]
//! returns `None` and callers count it as back-pressure.

use std::sync::Arc;
use thiserror::Error;
use uio_shim::Shim;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("mmap of {0} bytes for buffer pool failed: {1}")]
    Mmap(usize, std::io::Error),
    #[error("dma map of buffer pool into nic {nic_idx} failed: {source}")]
    DmaMap {
        nic_idx: usize,
        #[source]
        source: dma::DmaError,
    },
}

/// A slab of `count` buffers of `buf_size` bytes each, DMA-mapped into every
/// NIC passed to [`BufferPool::alloc`]. Slot ids are plain indices in
/// `[0, count)`; the slab never moves once allocated, so a slot's virtual
/// and bus addresses are stable for the pool's entire lifetime.
pub struct BufferPool {
    base: *mut u8,
    buf_size: u32,
    count: u32,
    mappings: Vec<dma::DmaMapping>,
    free: Vec<u32>,
}

// SAFETY: the backing mmap is only ever read/written through slot
// addresses handed out by `assign`, and a `BufferPool` is owned by exactly
// one worker thread at a time.
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Allocates `count` buffers of `buf_size` bytes, mapping the whole
    /// region into the IOMMU domain of every NIC in `shims`. `buf_size` must
    /// be at least the largest MTU across those NICs.
    pub fn alloc(
        shims: Vec<Arc<dyn Shim + Send + Sync>>,
        count: u32,
        buf_size: u32,
    ) -> Result<Self, PoolError> {
        let size = buf_size as usize * count as usize;

        // SAFETY: MAP_ANONYMOUS with fd=-1/offset=0 is always a valid mmap
        // request; the result is checked against MAP_FAILED below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PoolError::Mmap(size, std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        let nic_count = shims.len();
        let mut mappings = Vec::with_capacity(nic_count);
        for (nic_idx, shim) in shims.into_iter().enumerate() {
            match dma::DmaMapping::new(shim, base as u64, size as u64) {
                Ok(mapping) => mappings.push(mapping),
                Err(source) => {
                    // Dropping `mappings` here unmaps every NIC already
                    // mapped above before we free the mmap.
                    drop(mappings);
                    // SAFETY: `base`/`size` is exactly the region just mapped above.
                    unsafe {
                        libc::munmap(base as *mut libc::c_void, size);
                    }
                    return Err(PoolError::DmaMap { nic_idx, source });
                }
            }
        }

        log::debug!(
            "buffer pool: count={} buf_size={} mapped into {} nics",
            count,
            buf_size,
            nic_count
        );

        Ok(BufferPool {
            base,
            buf_size,
            count,
            mappings,
            free: (0..count).rev().collect(),
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pops a slot off the free list, or `None` if the pool is exhausted.
    /// Exhaustion is back-pressure, not an error: callers count it and
    /// retry on the next refill.
    pub fn assign(&mut self) -> Option<u32> {
        self.free.pop()
    }

    /// Returns `slot` to the free list. Debug builds assert the slot isn't
    /// already free, catching a double-release in tests without paying for
    /// the scan on the hot path in release builds.
    pub fn release(&mut self, slot: u32) {
        debug_assert!(
            !self.free.contains(&slot),
            "slot {slot} released while already free"
        );
        self.free.push(slot);
    }

    pub fn bus_addr(&self, slot: u32, nic_idx: usize) -> u64 {
        self.mappings[nic_idx].bus_addr() + slot as u64 * self.buf_size as u64
    }

    pub fn virt_addr(&self, slot: u32) -> *mut u8 {
        // SAFETY: caller must ensure `slot < count`; the offset stays within
        // the mmap'd region by that same precondition.
        unsafe { self.base.add(slot as usize * self.buf_size as usize) }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.mappings.clear();
        let size = self.buf_size as usize * self.count as usize;
        // SAFETY: `base`/`size` were returned together by the mmap in `alloc`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uio_shim::mock::MockShim;
    use uio_shim::ShimInfo;

    fn pool(count: u32) -> BufferPool {
        let shim: Arc<dyn Shim + Send + Sync> = Arc::new(MockShim::new(ShimInfo::default()));
        BufferPool::alloc(vec![shim], count, 2048).unwrap()
    }

    #[test]
    fn starts_with_every_slot_free() {
        let pool = pool(16);
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn assign_then_release_round_trips_slot_count() {
        let mut pool = pool(4);
        let a = pool.assign().unwrap();
        let b = pool.assign().unwrap();
        assert_eq!(pool.free_count(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = pool(1);
        assert!(pool.assign().is_some());
        assert!(pool.assign().is_none());
    }

    #[test]
    fn release_then_reassign_returns_n_distinct_ids() {
        let mut pool = pool(8);
        let taken: Vec<u32> = (0..8).map(|_| pool.assign().unwrap()).collect();
        for s in &taken {
            pool.release(*s);
        }
        let mut reassigned: Vec<u32> = (0..8).map(|_| pool.assign().unwrap()).collect();
        reassigned.sort_unstable();
        let mut expected = taken;
        expected.sort_unstable();
        assert_eq!(reassigned, expected);
    }

    #[test]
    fn slot_addresses_are_distinct_and_ordered() {
        let pool = pool(4);
        assert!(pool.virt_addr(1) as usize > pool.virt_addr(0) as usize);
        assert_eq!(pool.bus_addr(1, 0) - pool.bus_addr(0, 0), 2048);
    }
}
