//! Request/release an IOMMU translation for a virtual range, via the UIO
//! shim's `MAP`/`UNMAP` ioctls.
//!
//! A successful [`dma_map`] always returns a valid bus address; there is no
//! partially-initialized state to observe on failure.

use std::sync::Arc;
use thiserror::Error;
use uio_shim::{CacheMode, MapRequest, Shim, ShimError};

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("dma map of {len} bytes at {vaddr:#x} failed: {source}")]
    Map {
        vaddr: u64,
        len: u64,
        #[source]
        source: ShimError,
    },
    #[error("dma unmap of bus address {addr_dma:#x} failed: {source}")]
    Unmap {
        addr_dma: u64,
        #[source]
        source: ShimError,
    },
}

/// Maps `len` bytes starting at `vaddr` into the IOMMU domain behind `shim`,
/// uncached (the descriptor rings and buffer pool are DMA targets, not
/// something the CPU wants cached).
pub fn dma_map(shim: &dyn Shim, vaddr: u64, len: u64) -> Result<u64, DmaError> {
    let req = MapRequest {
        vaddr,
        reserved: 0,
        size: len,
        cache: CacheMode::Disable,
    };
    log::debug!("dma_map: vaddr={:#x} len={:#x}", vaddr, len);
    let addr_dma = shim
        .map(req)
        .map_err(|source| DmaError::Map { vaddr, len, source })?;
    log::debug!("dma_map: vaddr={:#x} -> bus={:#x}", vaddr, addr_dma);
    Ok(addr_dma)
}

/// Releases a mapping previously returned by [`dma_map`].
pub fn dma_unmap(shim: &dyn Shim, addr_dma: u64) -> Result<(), DmaError> {
    log::debug!("dma_unmap: bus={:#x}", addr_dma);
    shim.unmap(addr_dma)
        .map_err(|source| DmaError::Unmap { addr_dma, source })
}

/// A `dma_map`/`dma_unmap` pair wrapped so the mapping is released exactly
/// once, in `Drop`, regardless of which exit path a caller takes. This is
/// the building block the descriptor-storage and buffer-pool allocators use
/// so the LIFO teardown order the startup-failure contract requires falls
/// out of normal scope exit instead of a hand-written unwind ladder.
pub struct DmaMapping {
    shim: Arc<dyn Shim + Send + Sync>,
    addr_dma: u64,
}

impl DmaMapping {
    pub fn new(shim: Arc<dyn Shim + Send + Sync>, vaddr: u64, len: u64) -> Result<Self, DmaError> {
        let addr_dma = dma_map(shim.as_ref(), vaddr, len)?;
        Ok(DmaMapping { shim, addr_dma })
    }

    pub fn bus_addr(&self) -> u64 {
        self.addr_dma
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        if let Err(e) = dma_unmap(self.shim.as_ref(), self.addr_dma) {
            log::error!("dma_unmap failed during drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uio_shim::mock::MockShim;
    use uio_shim::ShimInfo;

    #[test]
    fn map_returns_bus_address() {
        let shim = MockShim::new(ShimInfo::default());
        let addr = dma_map(&shim, 0x7f0000000000, 4096).unwrap();
        assert_ne!(addr, 0);
    }

    #[test]
    fn unmap_is_idempotent_on_bookkeeping() {
        let shim = MockShim::new(ShimInfo::default());
        let addr = dma_map(&shim, 0x7f0000000000, 4096).unwrap();
        assert_eq!(shim.live_mapping_count(), 1);
        dma_unmap(&shim, addr).unwrap();
        assert_eq!(shim.live_mapping_count(), 0);
    }

    #[test]
    fn drop_releases_the_mapping() {
        let shim = Arc::new(MockShim::new(ShimInfo::default()));
        {
            let _mapping = DmaMapping::new(shim.clone(), 0x7f0000000000, 4096).unwrap();
            assert_eq!(shim.live_mapping_count(), 1);
        }
        assert_eq!(shim.live_mapping_count(), 0);
    }
}
