//! Advanced Rx/Tx descriptor layouts and the huge-page-backed region that
//! holds every (NIC, direction, queue) descriptor ring.
//!
//! The layouts mirror `AdvancedReceiveDescriptorR`/`WB` from the kernel-side
//! ixgbe driver this crate family grew out of: a 16-byte read form the
//! driver writes before handing a descriptor to the NIC, and a 16-byte
//! writeback form the NIC overwrites it with once DMA completes. Rx and Tx
//! each get their own pair, plus a shared trait so `nic_queues` can work
//! against "a descriptor" without caring which concrete layout backs it --
//! this driver only ever instantiates the advanced layout, but the
//! indirection keeps the ring engine from hard-coding field offsets.

use bit_field::BitField;

pub mod storage;

pub use storage::{DescriptorStorage, StorageError};

/// Descriptor-Done: the NIC sets this once it has written back a descriptor.
pub const RXD_STAT_DD: u32 = 0x0000_0001;
/// End-of-packet bit in the Rx writeback status word. Not consulted by this
/// driver: hardware RSC is disabled and jumbo frames are out of scope, so
/// every Rx descriptor is by construction a complete frame.
pub const RXD_STAT_EOP: u32 = 0x0000_0002;
/// Frame-error bits in the Rx writeback status/error word. A set bit here
/// doesn't stop the packet from being delivered to the forwarder -- it is
/// logged and passed through rather than dropped.
pub const RXDADV_ERR_FRAME_ERR_MASK: u32 = 0x0550_0000;

/// Descriptor-Done in the Tx writeback status word.
pub const TXD_STAT_DD: u32 = 0x0000_0001;
/// End-of-packet: this driver never splits a packet across descriptors, so
/// every Tx descriptor it writes carries this bit.
pub const TXD_CMD_EOP: u32 = 0x0100_0000;
/// Report Status: ask the NIC to set `TXD_STAT_DD` once this descriptor is done.
pub const TXD_CMD_RS: u32 = 0x0800_0000;
/// Insert the Ethernet frame checksum.
pub const TXD_CMD_IFCS: u32 = 0x0200_0000;
pub const ADVTXD_DTYP_DATA: u32 = 0x0030_0000;
pub const ADVTXD_DCMD_DEXT: u32 = 0x2000_0000;
pub const ADVTXD_PAYLEN_SHIFT: u32 = 14;

/// Largest payload a single Tx descriptor can describe. This driver supports
/// exactly one Tx segment per packet, so a bulk entry larger than this is an
/// oversized-packet drop rather than a multi-descriptor send.
pub const MAX_DATA_PER_TXD: u32 = 1 << 14;

/// Rx descriptor, read (producer) form: what the driver writes before
/// handing the slot to the NIC.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct AdvancedRxDescriptorRead {
    pub pkt_addr: u64,
    pub hdr_addr: u64,
}

/// Rx descriptor, writeback form: what the NIC overwrites the read form with.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct AdvancedRxDescriptorWb {
    lower: u64,
    upper: u64,
}

impl AdvancedRxDescriptorWb {
    pub fn status_error(&self) -> u32 {
        (self.upper & 0xFFFF_FFFF) as u32
    }

    pub fn length(&self) -> u16 {
        self.upper.get_bits(32..48) as u16
    }

    pub fn descriptor_done(&self) -> bool {
        self.status_error() & RXD_STAT_DD != 0
    }

    pub fn end_of_packet(&self) -> bool {
        self.status_error() & RXD_STAT_EOP != 0
    }

    pub fn has_frame_error(&self) -> bool {
        self.status_error() & RXDADV_ERR_FRAME_ERR_MASK != 0
    }
}

/// One slot in a descriptor array that the ring engine can init, detect
/// completion on, and read a writeback length out of, regardless of which
/// concrete descriptor layout it overlays.
pub trait RxDescriptor {
    fn init(&mut self, pkt_addr: u64);
    fn reset_status(&mut self);
    fn descriptor_done(&self) -> bool;
    fn has_frame_error(&self) -> bool;
    fn length(&self) -> u16;
}

/// A single storage cell big enough for either the read or writeback form of
/// an advanced Rx descriptor -- a tagged-free union by construction, since
/// the two forms alias the same sixteen bytes. Expressed here as a same-size
/// byte buffer with typed accessors instead of actual union aliasing, which
/// Rust doesn't offer safely for non-`Copy`-free layouts like these packed
/// structs.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct RxDescriptorCell(pub [u8; 16]);

impl Default for RxDescriptorCell {
    fn default() -> Self {
        RxDescriptorCell([0u8; 16])
    }
}

impl RxDescriptorCell {
    fn as_read_mut(&mut self) -> &mut AdvancedRxDescriptorRead {
        // SAFETY: the cell is exactly sized and aligned for either view.
        unsafe { &mut *(self.0.as_mut_ptr() as *mut AdvancedRxDescriptorRead) }
    }

    fn as_wb(&self) -> &AdvancedRxDescriptorWb {
        // SAFETY: the cell is exactly sized and aligned for either view.
        unsafe { &*(self.0.as_ptr() as *const AdvancedRxDescriptorWb) }
    }
}

impl RxDescriptor for RxDescriptorCell {
    fn init(&mut self, pkt_addr: u64) {
        self.0 = [0u8; 16];
        let read = self.as_read_mut();
        read.pkt_addr = pkt_addr.to_le();
        read.hdr_addr = 0;
    }

    fn reset_status(&mut self) {
        self.0 = [0u8; 16];
    }

    fn descriptor_done(&self) -> bool {
        self.as_wb().descriptor_done()
    }

    fn has_frame_error(&self) -> bool {
        self.as_wb().has_frame_error()
    }

    fn length(&self) -> u16 {
        self.as_wb().length()
    }
}

const _: () = assert!(std::mem::size_of::<RxDescriptorCell>() == 16);

/// Tx descriptor, read (producer) form.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct AdvancedTxDescriptorRead {
    pub buffer_addr: u64,
    pub cmd_type_len: u32,
    pub olinfo_status: u32,
}

/// Tx descriptor, writeback form.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct AdvancedTxDescriptorWb {
    pub rsvd: u64,
    pub nxtseq_seed: u32,
    pub status: u32,
}

pub trait TxDescriptor {
    /// Writes a single-segment send: `size` bytes starting at `buffer_addr`,
    /// with EOP/RS/DEXT/IFCS/advanced-data-type all set for a
    /// one-descriptor-per-packet send.
    fn send(&mut self, buffer_addr: u64, size: u32);
    fn reset_status(&mut self);
    fn status_done(&self) -> bool;
}

#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct TxDescriptorCell(pub [u8; 16]);

impl Default for TxDescriptorCell {
    fn default() -> Self {
        TxDescriptorCell([0u8; 16])
    }
}

impl TxDescriptorCell {
    fn as_read_mut(&mut self) -> &mut AdvancedTxDescriptorRead {
        // SAFETY: the cell is exactly sized and aligned for either view.
        unsafe { &mut *(self.0.as_mut_ptr() as *mut AdvancedTxDescriptorRead) }
    }

    fn as_wb(&self) -> &AdvancedTxDescriptorWb {
        // SAFETY: the cell is exactly sized and aligned for either view.
        unsafe { &*(self.0.as_ptr() as *const AdvancedTxDescriptorWb) }
    }
}

impl TxDescriptor for TxDescriptorCell {
    fn send(&mut self, buffer_addr: u64, size: u32) {
        self.0 = [0u8; 16];
        let cmd_type_len =
            size | TXD_CMD_EOP | TXD_CMD_RS | ADVTXD_DTYP_DATA | ADVTXD_DCMD_DEXT | TXD_CMD_IFCS;
        let olinfo_status = size << ADVTXD_PAYLEN_SHIFT;
        let read = self.as_read_mut();
        read.buffer_addr = buffer_addr.to_le();
        read.cmd_type_len = cmd_type_len.to_le();
        read.olinfo_status = olinfo_status.to_le();
    }

    fn reset_status(&mut self) {
        self.0 = [0u8; 16];
    }

    fn status_done(&self) -> bool {
        u32::from_le(self.as_wb().status) & TXD_STAT_DD != 0
    }
}

const _: () = assert!(std::mem::size_of::<TxDescriptorCell>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_cell_reports_not_done_until_status_written() {
        let mut cell = RxDescriptorCell::default();
        cell.init(0xdead_beef_0000);
        assert!(!cell.descriptor_done());
    }

    #[test]
    fn tx_cell_send_sets_eop_rs_and_size() {
        let mut cell = TxDescriptorCell::default();
        cell.send(0x1000, 64);
        let read = unsafe { &*(cell.0.as_ptr() as *const AdvancedTxDescriptorRead) };
        let cmd = u32::from_le(read.cmd_type_len);
        assert_eq!(cmd & 0xFFFF, 64);
        assert_ne!(cmd & TXD_CMD_EOP, 0);
        assert_ne!(cmd & TXD_CMD_RS, 0);
    }
}
