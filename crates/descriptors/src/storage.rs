//! Huge-page-backed storage for every descriptor ring belonging to one NIC.
//!
//! One contiguous anonymous `MAP_HUGETLB` region sized
//! `num_queues * (size_rx + size_tx)`, DMA-mapped as a whole, then carved
//! into per-queue Rx blocks followed by per-queue Tx blocks. Re-deriving the
//! mmap length from the last ring's carved pointer after the carving loop
//! has already stepped one index past the last valid queue is an
//! out-of-bounds trap waiting to happen -- this type instead remembers the
//! mmap base and length it was given at allocation time, so release always
//! unmaps exactly what was mapped.

use crate::{RxDescriptorCell, TxDescriptorCell};
use std::sync::Arc;
use thiserror::Error;
use uio_shim::Shim;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("mmap of {0} bytes for descriptor storage failed: {1}")]
    Mmap(usize, std::io::Error),
    #[error("dma map of descriptor storage failed: {0}")]
    DmaMap(#[from] dma::DmaError),
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// One queue's worth of descriptor-ring storage: a virtual base the CPU can
/// write through, the matching bus address the NIC DMAs against, and the
/// descriptor count it was carved for.
#[derive(Clone, Copy)]
pub struct RingBlock {
    pub virt_base: *mut u8,
    pub bus_base: u64,
    pub num_descriptors: usize,
}

impl RingBlock {
    /// # Safety
    /// `index` must be `< num_descriptors`; the returned reference aliases
    /// the storage's mmap'd region for as long as the caller holds it.
    pub unsafe fn rx_cell(&self, index: usize) -> &mut RxDescriptorCell {
        &mut *(self.virt_base as *mut RxDescriptorCell).add(index)
    }

    /// # Safety
    /// Same contract as [`RingBlock::rx_cell`], over the Tx descriptor layout.
    pub unsafe fn tx_cell(&self, index: usize) -> &mut TxDescriptorCell {
        &mut *(self.virt_base as *mut TxDescriptorCell).add(index)
    }
}

/// Owns the entire mmap'd + DMA-mapped descriptor region for one NIC and
/// hands out [`RingBlock`]s carved from it. Dropping this unmaps the DMA
/// translation and then unmaps the virtual memory, in that order, mirroring
/// `ixmap_desc_release`.
pub struct DescriptorStorage {
    mapping: Option<dma::DmaMapping>,
    base: *mut u8,
    total_len: usize,
    bus_base: u64,
    num_queues: usize,
    size_rx: usize,
    size_tx: usize,
    num_rx_desc: usize,
    num_tx_desc: usize,
}

// SAFETY: the mmap'd region is used strictly as DMA-target memory behind
// `RingBlock` pointers the owning `nic_queues::Ring` accesses from a single
// worker thread; `DescriptorStorage` itself performs no unsynchronized
// mutation.
unsafe impl Send for DescriptorStorage {}

impl DescriptorStorage {
    pub fn alloc(
        shim: Arc<dyn Shim + Send + Sync>,
        num_queues: usize,
        num_rx_desc: usize,
        num_tx_desc: usize,
    ) -> Result<Self, StorageError> {
        let size_rx = align_up(std::mem::size_of::<RxDescriptorCell>() * num_rx_desc, 128);
        let size_tx = align_up(std::mem::size_of::<TxDescriptorCell>() * num_tx_desc, 128);
        let total_len = num_queues * (size_rx + size_tx);

        // SAFETY: MAP_ANONYMOUS with fd=-1/offset=0 is always a valid mmap
        // request; the result is checked against MAP_FAILED below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StorageError::Mmap(total_len, std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        let mapping = match dma::DmaMapping::new(shim, base as u64, total_len as u64) {
            Ok(mapping) => mapping,
            Err(e) => {
                // SAFETY: `base`/`total_len` is exactly the region just mapped above.
                unsafe {
                    libc::munmap(base as *mut libc::c_void, total_len);
                }
                return Err(e.into());
            }
        };
        let bus_base = mapping.bus_addr();

        log::debug!(
            "descriptor storage: {} queues, rx_desc={} tx_desc={}, {} bytes at bus {:#x}",
            num_queues,
            num_rx_desc,
            num_tx_desc,
            total_len,
            bus_base
        );

        Ok(DescriptorStorage {
            mapping: Some(mapping),
            base,
            total_len,
            bus_base,
            num_queues,
            size_rx,
            size_tx,
            num_rx_desc,
            num_tx_desc,
        })
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    /// The Rx block for queue `q`. `q` must be `< num_queues`.
    pub fn rx_block(&self, q: usize) -> RingBlock {
        assert!(q < self.num_queues, "rx queue index out of range");
        let queue_stride = self.size_rx + self.size_tx;
        let offset = q * queue_stride;
        RingBlock {
            // SAFETY: `offset < total_len` by construction of `queue_stride`.
            virt_base: unsafe { self.base.add(offset) },
            bus_base: self.bus_base + offset as u64,
            num_descriptors: self.num_rx_desc,
        }
    }

    /// The Tx block for queue `q`. `q` must be `< num_queues`.
    pub fn tx_block(&self, q: usize) -> RingBlock {
        assert!(q < self.num_queues, "tx queue index out of range");
        let queue_stride = self.size_rx + self.size_tx;
        let offset = q * queue_stride + self.size_rx;
        RingBlock {
            // SAFETY: `offset < total_len` by construction of `queue_stride`.
            virt_base: unsafe { self.base.add(offset) },
            bus_base: self.bus_base + offset as u64,
            num_descriptors: self.num_tx_desc,
        }
    }
}

impl Drop for DescriptorStorage {
    fn drop(&mut self) {
        self.mapping.take();
        // SAFETY: `base`/`total_len` were returned together by the mmap in `alloc`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uio_shim::mock::MockShim;
    use uio_shim::ShimInfo;

    #[test]
    fn carves_non_overlapping_blocks_per_queue() {
        let shim: Arc<dyn Shim + Send + Sync> = Arc::new(MockShim::new(ShimInfo::default()));
        let storage = DescriptorStorage::alloc(shim, 2, 8, 4).unwrap();

        let rx0 = storage.rx_block(0);
        let tx0 = storage.tx_block(0);
        let rx1 = storage.rx_block(1);

        assert_eq!(rx0.num_descriptors, 8);
        assert_eq!(tx0.num_descriptors, 4);
        assert!(tx0.virt_base as usize > rx0.virt_base as usize);
        assert!(rx1.virt_base as usize > tx0.virt_base as usize);
    }

    #[test]
    fn rx_cells_are_independently_addressable() {
        let shim: Arc<dyn Shim + Send + Sync> = Arc::new(MockShim::new(ShimInfo::default()));
        let storage = DescriptorStorage::alloc(shim, 1, 4, 4).unwrap();
        let block = storage.rx_block(0);
        unsafe {
            block.rx_cell(0).init(0x1000);
            block.rx_cell(1).init(0x2000);
            assert_ne!(
                block.rx_cell(0) as *mut _ as usize,
                block.rx_cell(1) as *mut _ as usize
            );
        }
    }
}
