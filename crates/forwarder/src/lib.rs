//! The narrow boundary between the ring engine and whatever decides where a
//! packet goes next.
//!
//! A bulk is parallel `slot_index`/`size` arrays with a count, handed off at
//! one call site per wakeup: `rx_clean` fills a [`Bulk`], a forwarder
//! rewrites it into zero or more
//! outgoing `(port, Bulk)` pairs, and `tx_xmit` drains each one. Routing
//! policy itself -- FIB, neighbour resolution, LPM, a netlink listener -- is
//! deliberately not implemented here; this crate only types the seam.

/// Identifies one of the NICs a worker has a view over.
pub type PortId = usize;

/// An ordered (slot id, byte length) sequence, capacity-bounded by the ring
/// engine's per-wakeup budget. Produced by `rx_clean`, consumed by
/// `tx_xmit`; every slot id inside one is owned by whoever holds the `Bulk`.
#[derive(Debug, Default, Clone)]
pub struct Bulk {
    slots: Vec<u32>,
    lengths: Vec<u16>,
}

impl Bulk {
    /// A bulk pre-sized for `budget` entries, so the per-wakeup hot path
    /// never grows the backing `Vec`s.
    pub fn with_capacity(budget: usize) -> Self {
        Bulk {
            slots: Vec::with_capacity(budget),
            lengths: Vec::with_capacity(budget),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, slot: u32, length: u16) {
        self.slots.push(slot);
        self.lengths.push(length);
    }

    pub fn slot(&self, i: usize) -> u32 {
        self.slots[i]
    }

    pub fn length(&self, i: usize) -> u16 {
        self.lengths[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.slots.iter().copied().zip(self.lengths.iter().copied())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.lengths.clear();
    }

    /// Removes and returns the slots beyond `usable`, for the ring-overflow
    /// and oversize-packet drop paths in `tx_xmit`.
    pub fn split_off_tail(&mut self, usable: usize) -> Vec<u32> {
        self.lengths.truncate(usable);
        self.slots.split_off(usable)
    }
}

/// Consumes a received bulk from one port and produces zero or more
/// outgoing bulks, each tagged with the port to transmit it on.
///
/// Implementations must account for every slot id in `received`: place it
/// into exactly one returned bulk, or release it back to the buffer pool
/// that owns it. A slot id that is neither forwarded nor released is a
/// leak -- the `buffer_pool` crate's debug assertions are the first line of
/// defense against this in tests, but there is no runtime enforcement here.
pub trait Forwarder: Send {
    fn forward(&mut self, port: PortId, received: Bulk) -> Vec<(PortId, Bulk)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_iterate_preserves_order() {
        let mut bulk = Bulk::with_capacity(4);
        bulk.push(3, 64);
        bulk.push(7, 128);
        let entries: Vec<_> = bulk.iter().collect();
        assert_eq!(entries, vec![(3, 64), (7, 128)]);
    }

    #[test]
    fn split_off_tail_separates_overflow() {
        let mut bulk = Bulk::with_capacity(4);
        for slot in 0..5u32 {
            bulk.push(slot, 100);
        }
        let overflow = bulk.split_off_tail(3);
        assert_eq!(overflow, vec![3, 4]);
        assert_eq!(bulk.len(), 3);
    }
}
