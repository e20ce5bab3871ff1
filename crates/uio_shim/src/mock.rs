//! An in-process fake of the shim ioctl protocol, for tests that exercise
//! `dma`/`ixgbe` wiring without a real `/dev/<iface>` node.

use crate::{IrqInfoResponse, MapRequest, Shim, ShimError, ShimInfo, UpRequest};
use std::collections::HashSet;
use std::sync::Mutex;

/// A `Shim` that answers INFO with caller-supplied capabilities and tracks
/// MAP/UNMAP calls so tests can assert on mapping lifetime.
pub struct MockShim {
    info: ShimInfo,
    irq_info: IrqInfoResponse,
    next_bus_addr: Mutex<u64>,
    live_mappings: Mutex<HashSet<u64>>,
}

impl MockShim {
    pub fn new(info: ShimInfo) -> Self {
        MockShim {
            info,
            irq_info: IrqInfoResponse::default(),
            next_bus_addr: Mutex::new(0x1_0000_0000),
            live_mappings: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_irq_info(mut self, irq_info: IrqInfoResponse) -> Self {
        self.irq_info = irq_info;
        self
    }

    /// Number of mappings `map` has handed out that haven't been `unmap`'d yet.
    pub fn live_mapping_count(&self) -> usize {
        self.live_mappings.lock().unwrap().len()
    }
}

impl Shim for MockShim {
    fn info(&self) -> Result<ShimInfo, ShimError> {
        Ok(self.info)
    }

    fn up(&self, _req: UpRequest) -> Result<(), ShimError> {
        Ok(())
    }

    fn map(&self, _req: MapRequest) -> Result<u64, ShimError> {
        let mut next = self.next_bus_addr.lock().unwrap();
        let addr = *next;
        *next += 0x1000;
        self.live_mappings.lock().unwrap().insert(addr);
        Ok(addr)
    }

    fn unmap(&self, addr_dma: u64) -> Result<(), ShimError> {
        self.live_mappings.lock().unwrap().remove(&addr_dma);
        Ok(())
    }

    fn irq_info(&self) -> Result<IrqInfoResponse, ShimError> {
        Ok(self.irq_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_unmap_clears_bookkeeping() {
        let shim = MockShim::new(ShimInfo::default());
        let addr = shim
            .map(MapRequest {
                vaddr: 0x4000,
                reserved: 0,
                size: 4096,
                cache: crate::CacheMode::Disable,
            })
            .unwrap();
        assert_eq!(shim.live_mapping_count(), 1);
        shim.unmap(addr).unwrap();
        assert_eq!(shim.live_mapping_count(), 0);
    }

    #[test]
    fn distinct_maps_get_distinct_addresses() {
        let shim = MockShim::new(ShimInfo::default());
        let req = MapRequest {
            vaddr: 0,
            reserved: 0,
            size: 4096,
            cache: crate::CacheMode::Disable,
        };
        let a = shim.map(req).unwrap();
        let b = shim.map(req).unwrap();
        assert_ne!(a, b);
        assert_eq!(shim.live_mapping_count(), 2);
    }
}
