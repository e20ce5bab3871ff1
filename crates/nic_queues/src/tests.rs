use super::*;
use descriptors::storage::RingBlock;
use descriptors::{MAX_DATA_PER_TXD, RXD_STAT_DD, TXD_STAT_DD};
use std::sync::Arc;
use uio_shim::mock::MockShim;
use uio_shim::{Shim, ShimInfo};

const TAIL_OFFSET: usize = 0x18;
const STATUS_OFFSET: usize = 0x08;
const REG_WINDOW_LEN: usize = 0x100;

fn pool(count: u32) -> BufferPool {
    let shim: Arc<dyn Shim + Send + Sync> = Arc::new(MockShim::new(ShimInfo::default()));
    BufferPool::alloc(vec![shim], count, 2048).unwrap()
}

fn bar() -> (Vec<u8>, Arc<RegisterWindow>) {
    let mut reg_buf = vec![0u8; REG_WINDOW_LEN];
    // SAFETY: `reg_buf` is kept alive alongside the `RegisterWindow` by the caller.
    let bar = Arc::new(unsafe { RegisterWindow::new(reg_buf.as_mut_ptr(), reg_buf.len()) });
    (reg_buf, bar)
}

/// Writes a writeback Rx status/length pair straight into descriptor memory,
/// standing in for the NIC completing a receive.
fn set_rx_done(block: &RingBlock, index: usize, length: u16) {
    // SAFETY: `index` is within `num_descriptors` in every test below, and no
    // other reference to this cell is live at the same time.
    let cell = unsafe { block.rx_cell(index) };
    let upper: u64 = RXD_STAT_DD as u64 | ((length as u64) << 32);
    cell.0[0..8].copy_from_slice(&0u64.to_le_bytes());
    cell.0[8..16].copy_from_slice(&upper.to_le_bytes());
}

/// Writes a writeback Tx status straight into descriptor memory, standing in
/// for the NIC completing a send.
fn set_tx_done(block: &RingBlock, index: usize) {
    // SAFETY: same contract as `set_rx_done`.
    let cell = unsafe { block.tx_cell(index) };
    cell.0[0..8].copy_from_slice(&0u64.to_le_bytes());
    cell.0[8..12].copy_from_slice(&0u32.to_le_bytes());
    cell.0[12..16].copy_from_slice(&TXD_STAT_DD.to_le_bytes());
}

struct RxHarness {
    _desc_buf: Vec<u8>,
    _reg_buf: Vec<u8>,
    block: RingBlock,
    ring: RxRing,
}

fn rx_harness(num_desc: usize) -> RxHarness {
    let mut desc_buf = vec![0u8; 16 * num_desc];
    let block = RingBlock {
        virt_base: desc_buf.as_mut_ptr(),
        bus_base: 0x1000,
        num_descriptors: num_desc,
    };
    let (reg_buf, bar) = bar();
    let ring = RxRing::new(block, bar, TAIL_OFFSET, STATUS_OFFSET);
    RxHarness {
        _desc_buf: desc_buf,
        _reg_buf: reg_buf,
        block,
        ring,
    }
}

struct TxHarness {
    _desc_buf: Vec<u8>,
    _reg_buf: Vec<u8>,
    block: RingBlock,
    ring: TxRing,
}

fn tx_harness(num_desc: usize) -> TxHarness {
    let mut desc_buf = vec![0u8; 16 * num_desc];
    let block = RingBlock {
        virt_base: desc_buf.as_mut_ptr(),
        bus_base: 0x2000,
        num_descriptors: num_desc,
    };
    let (reg_buf, bar) = bar();
    let ring = TxRing::new(block, bar, TAIL_OFFSET, STATUS_OFFSET);
    TxHarness {
        _desc_buf: desc_buf,
        _reg_buf: reg_buf,
        block,
        ring,
    }
}

#[test]
fn unused_is_capacity_minus_one_when_empty() {
    assert_eq!(unused(8, 0, 0), 7);
    assert_eq!(unused(4, 0, 0), 3);
}

#[test]
fn advance_wraps_at_the_last_index() {
    assert_eq!(advance(6, 8), 7);
    assert_eq!(advance(7, 8), 0);
}

#[test]
fn rx_refill_fills_every_free_descriptor() {
    let mut h = rx_harness(8);
    let mut p = pool(16);

    let stats = h.ring.rx_refill(&mut p, 0);

    assert_eq!(stats.filled, 7);
    assert_eq!(stats.alloc_failed, 0);
    assert_eq!(p.free_count(), 9);
    assert_eq!(h.ring.next_to_use(), 7);
}

#[test]
fn rx_clean_drains_only_the_descriptors_marked_done() {
    let mut h = rx_harness(8);
    let mut p = pool(16);
    h.ring.rx_refill(&mut p, 0);

    set_rx_done(&h.block, 0, 64);
    set_rx_done(&h.block, 1, 128);
    set_rx_done(&h.block, 2, 64);

    let mut bulk = Bulk::with_capacity(8);
    let produced = h.ring.rx_clean(&mut bulk, 8);

    assert_eq!(produced, 3);
    assert_eq!(h.ring.next_to_clean(), 3);
    let entries: Vec<_> = bulk.iter().collect();
    assert_eq!(entries, vec![(0, 64), (1, 128), (2, 64)]);
}

#[test]
fn rx_clean_stops_at_the_first_not_done_descriptor() {
    let mut h = rx_harness(8);
    let mut p = pool(16);
    h.ring.rx_refill(&mut p, 0);

    set_rx_done(&h.block, 0, 64);
    // index 1 left not-done; index 2 marked done out of order should not matter.
    set_rx_done(&h.block, 2, 64);

    let mut bulk = Bulk::with_capacity(8);
    let produced = h.ring.rx_clean(&mut bulk, 8);

    assert_eq!(produced, 1);
    assert_eq!(h.ring.next_to_clean(), 1);
}

#[test]
fn rx_refill_counts_pool_exhaustion_without_erroring() {
    let mut h = rx_harness(16);
    let mut p = pool(4);

    let first = h.ring.rx_refill(&mut p, 0);
    assert_eq!(first.filled, 4);
    assert_eq!(first.alloc_failed, 11);
    assert_eq!(p.free_count(), 0);

    let second = h.ring.rx_refill(&mut p, 0);
    assert_eq!(second.filled, 0);
    assert_eq!(second.alloc_failed, 11);
}

#[test]
fn tx_xmit_publishes_up_to_the_ring_and_drops_the_overflow() {
    let mut h = tx_harness(4);
    let mut p = pool(8);

    let mut bulk = Bulk::with_capacity(5);
    for _ in 0..5 {
        let slot = p.assign().unwrap();
        bulk.push(slot, 1000);
    }
    assert_eq!(p.free_count(), 3);

    let stats = h.ring.tx_xmit(&mut p, 0, &mut bulk);

    assert_eq!(stats.published, 3);
    assert_eq!(stats.failed, 2);
    assert_eq!(h.ring.next_to_use(), 3);
    assert_eq!(p.free_count(), 5);
}

#[test]
fn tx_clean_releases_every_descriptor_marked_done() {
    let mut h = tx_harness(4);
    let mut p = pool(8);

    let mut bulk = Bulk::with_capacity(3);
    for _ in 0..3 {
        let slot = p.assign().unwrap();
        bulk.push(slot, 512);
    }
    let stats = h.ring.tx_xmit(&mut p, 0, &mut bulk);
    assert_eq!(stats.published, 3);

    set_tx_done(&h.block, 0);
    set_tx_done(&h.block, 1);
    set_tx_done(&h.block, 2);

    let before = p.free_count();
    let released = h.ring.tx_clean(&mut p, 8);

    assert_eq!(released, 3);
    assert_eq!(h.ring.next_to_clean(), 3);
    assert_eq!(p.free_count(), before + 3);
}

#[test]
fn tx_xmit_drops_an_oversize_packet_without_consuming_a_descriptor() {
    let mut h = tx_harness(8);
    let mut p = pool(4);

    let slot = p.assign().unwrap();
    let mut bulk = Bulk::with_capacity(1);
    bulk.push(slot, (MAX_DATA_PER_TXD + 1) as u16);
    let free_before = p.free_count();

    let stats = h.ring.tx_xmit(&mut p, 0, &mut bulk);

    assert_eq!(stats.published, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(h.ring.next_to_use(), 0);
    assert_eq!(p.free_count(), free_before + 1);
}
