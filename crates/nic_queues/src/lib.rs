//! The four ring operations -- `rx_refill`, `rx_clean`, `tx_xmit`, `tx_clean`
//! -- over a single (port, queue) pair.
//!
//! Every op here is non-blocking and makes bounded progress. None of them
//! touch the buffer pool's free list except through `assign`/`release`, and
//! none of them allocate on the hot path -- `slot_index` and the descriptor
//! memory are both fixed-size, sized once at ring construction.

use buffer_pool::BufferPool;
use descriptors::storage::RingBlock;
use descriptors::{RxDescriptor, RxDescriptorCell, TxDescriptor, TxDescriptorCell};
use forwarder::Bulk;
use mmio::RegisterWindow;
use std::sync::Arc;

/// Outcome of one `rx_refill` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxRefillStats {
    pub filled: u32,
    pub alloc_failed: u32,
}

/// Outcome of one `tx_xmit` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxXmitStats {
    pub published: u32,
    pub failed: u32,
}

fn unused(num_descriptors: u32, next_to_use: u32, next_to_clean: u32) -> u32 {
    let num = num_descriptors as i64;
    let diff = (next_to_use as i64 - next_to_clean as i64).rem_euclid(num);
    (num - 1 - diff) as u32
}

fn advance(index: u32, num_descriptors: u32) -> u32 {
    let next = index + 1;
    if next < num_descriptors {
        next
    } else {
        0
    }
}

/// Common bookkeeping shared by the Rx and Tx ring state machines: producer
/// and consumer indices, the descriptor-slot -> buffer-pool-slot side array,
/// and the device's tail register.
struct RingCommon<D> {
    virt_base: *mut D,
    bus_base: u64,
    num_descriptors: u32,
    next_to_use: u32,
    next_to_clean: u32,
    slot_index: Vec<u32>,
    bar: Arc<RegisterWindow>,
    tail_offset: usize,
    status_offset: usize,
}

// SAFETY: a `RingCommon` is only ever touched by the single worker thread
// that owns the ring it belongs to; the raw pointer is into DMA-visible
// memory whose lifetime is tied to the owning `DescriptorStorage`.
unsafe impl<D> Send for RingCommon<D> {}

impl<D> RingCommon<D> {
    fn new(block: RingBlock, bar: Arc<RegisterWindow>, tail_offset: usize, status_offset: usize) -> Self {
        RingCommon {
            virt_base: block.virt_base as *mut D,
            bus_base: block.bus_base,
            num_descriptors: block.num_descriptors as u32,
            next_to_use: 0,
            next_to_clean: 0,
            slot_index: vec![0u32; block.num_descriptors],
            bar,
            tail_offset,
            status_offset,
        }
    }

    fn unused(&self) -> u32 {
        unused(self.num_descriptors, self.next_to_use, self.next_to_clean)
    }

    fn is_empty(&self) -> bool {
        self.next_to_clean == self.next_to_use
    }

    /// # Safety
    /// `index` must be `< num_descriptors`.
    unsafe fn descriptor(&self, index: u32) -> &mut D {
        &mut *self.virt_base.add(index as usize)
    }

    fn write_tail(&self, value: u32) {
        mmio::wmb();
        self.bar.write32(self.tail_offset, value);
        self.bar.write_flush(self.status_offset);
    }
}

/// The Rx side of one (NIC, queue): owns the Rx descriptor ring, runs
/// `rx_refill` (user produces descriptors for the NIC to fill) and
/// `rx_clean` (user consumes writebacks the NIC produced).
pub struct RxRing {
    common: RingCommon<RxDescriptorCell>,
}

impl RxRing {
    pub fn new(block: RingBlock, bar: Arc<RegisterWindow>, tail_offset: usize, status_offset: usize) -> Self {
        RxRing {
            common: RingCommon::new(block, bar, tail_offset, status_offset),
        }
    }

    pub fn next_to_use(&self) -> u32 {
        self.common.next_to_use
    }

    pub fn next_to_clean(&self) -> u32 {
        self.common.next_to_clean
    }

    /// Fills every free Rx descriptor slot with a freshly assigned buffer,
    /// publishing the new tail if at least one descriptor was written.
    /// Pool exhaustion stops the loop early and is counted, not propagated
    /// as an error.
    pub fn rx_refill(&mut self, pool: &mut BufferPool, port_idx: usize) -> RxRefillStats {
        let max = self.common.unused();
        let mut stats = RxRefillStats::default();

        while stats.filled < max {
            let slot = match pool.assign() {
                Some(slot) => slot,
                None => {
                    stats.alloc_failed += max - stats.filled;
                    break;
                }
            };

            let ntu = self.common.next_to_use;
            self.common.slot_index[ntu as usize] = slot;
            let pkt_addr = pool.bus_addr(slot, port_idx);
            // SAFETY: `ntu < num_descriptors` by the loop's invariant.
            unsafe { self.common.descriptor(ntu).init(pkt_addr) };

            self.common.next_to_use = advance(ntu, self.common.num_descriptors);
            stats.filled += 1;
        }

        if stats.filled > 0 {
            self.common.write_tail(self.common.next_to_use);
        }
        stats
    }

    /// Drains up to `budget` completed Rx descriptors into `bulk`. Stops
    /// early if the ring is empty or the next descriptor isn't DD yet.
    /// `EOP` is never checked: RSC is disabled and jumbo frames are out of
    /// scope, so every descriptor is a whole frame.
    pub fn rx_clean(&mut self, bulk: &mut Bulk, budget: usize) -> u32 {
        let mut produced = 0u32;

        while (produced as usize) < budget {
            if self.common.is_empty() {
                break;
            }

            let ntc = self.common.next_to_clean;
            // SAFETY: `ntc < num_descriptors` by the ring invariant.
            let desc = unsafe { self.common.descriptor(ntc) };
            if !desc.descriptor_done() {
                break;
            }
            mmio::rmb();

            if desc.has_frame_error() {
                log::warn!("rx frame error at descriptor {ntc}");
            }

            let slot = self.common.slot_index[ntc as usize];
            let length = desc.length();
            bulk.push(slot, length);

            self.common.next_to_clean = advance(ntc, self.common.num_descriptors);
            produced += 1;
        }

        produced
    }
}

/// The Tx side of one (NIC, queue).
pub struct TxRing {
    common: RingCommon<TxDescriptorCell>,
}

impl TxRing {
    pub fn new(block: RingBlock, bar: Arc<RegisterWindow>, tail_offset: usize, status_offset: usize) -> Self {
        TxRing {
            common: RingCommon::new(block, bar, tail_offset, status_offset),
        }
    }

    pub fn next_to_use(&self) -> u32 {
        self.common.next_to_use
    }

    pub fn next_to_clean(&self) -> u32 {
        self.common.next_to_clean
    }

    /// Submits as many entries of `bulk` as fit in the ring's free
    /// descriptors. Oversized entries are dropped (released, counted as
    /// failed) without consuming a descriptor slot; entries beyond what the
    /// ring can currently hold are dropped the same way. Publishes the new
    /// tail once, after every descriptor this call writes.
    pub fn tx_xmit(&mut self, pool: &mut BufferPool, port_idx: usize, bulk: &mut Bulk) -> TxXmitStats {
        let mut stats = TxXmitStats::default();
        if bulk.is_empty() {
            return stats;
        }

        let usable = (bulk.len() as u32).min(self.common.unused()) as usize;
        let overflow = bulk.split_off_tail(usable);

        for i in 0..usable {
            let slot = bulk.slot(i);
            let size = bulk.length(i) as u32;

            if size > descriptors::MAX_DATA_PER_TXD {
                log::warn!("tx: dropping oversize packet slot={slot} size={size}");
                pool.release(slot);
                stats.failed += 1;
                continue;
            }

            let ntu = self.common.next_to_use;
            self.common.slot_index[ntu as usize] = slot;
            let buffer_addr = pool.bus_addr(slot, port_idx);
            // SAFETY: `ntu < num_descriptors` by the loop's invariant.
            unsafe { self.common.descriptor(ntu).send(buffer_addr, size) };

            self.common.next_to_use = advance(ntu, self.common.num_descriptors);
            stats.published += 1;
        }

        if stats.published > 0 {
            self.common.write_tail(self.common.next_to_use);
        }

        for slot in overflow {
            log::warn!("tx: dropping slot={slot}, ring full");
            pool.release(slot);
            stats.failed += 1;
        }

        stats
    }

    /// Releases every Tx slot the NIC has finished with, up to `budget`
    /// descriptors.
    pub fn tx_clean(&mut self, pool: &mut BufferPool, budget: usize) -> u32 {
        let mut released = 0u32;

        while (released as usize) < budget {
            if self.common.is_empty() {
                break;
            }

            let ntc = self.common.next_to_clean;
            // SAFETY: `ntc < num_descriptors` by the ring invariant.
            let desc = unsafe { self.common.descriptor(ntc) };
            if !desc.status_done() {
                break;
            }

            let slot = self.common.slot_index[ntc as usize];
            desc.reset_status();
            pool.release(slot);

            self.common.next_to_clean = advance(ntc, self.common.num_descriptors);
            released += 1;
        }

        released
    }
}

#[cfg(test)]
mod tests;
