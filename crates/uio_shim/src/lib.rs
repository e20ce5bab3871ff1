//! Typed bindings for the kernel shim's character-device ioctl protocol.
//!
//! This binds against an external kernel module (a UIO driver for the
//! 82599) that is not part of this crate family — it only types the wire
//! protocol described in the driver's specification: `UIO_IXGBE_INFO`,
//! `UIO_IXGBE_UP`, `UIO_IXGBE_MAP`, `UIO_IXGBE_UNMAP` on the NIC control fd,
//! and `UIO_IRQ_INFO` on each per-queue IRQ fd.
//!
//! Real callers go through [`RawFdShim`], which issues the ioctls with
//! [`libc::ioctl`]. Tests go through [`mock::MockShim`], which never touches
//! a real device node.

use std::os::unix::io::RawFd;
use thiserror::Error;

pub mod mock;

/// One ioctl request failed.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("ioctl {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// `cache` parameter of `UIO_IXGBE_MAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CacheMode {
    Default = 0,
    Disable = 1,
    WriteCombine = 2,
}

/// Response payload of `UIO_IXGBE_INFO`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ShimInfo {
    pub mmio_base: u64,
    pub mmio_size: u64,
    pub mac_type: u32,
    pub mac_addr: [u8; 6],
    pub phy_type: u32,
    pub max_interrupt_rate: u16,
    pub num_interrupt_rate: u16,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub max_msix_vectors: u16,
}

/// Request payload of `UIO_IXGBE_UP`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UpRequest {
    pub num_interrupt_rate: u16,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
}

/// Request payload of `UIO_IXGBE_MAP`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MapRequest {
    pub vaddr: u64,
    pub reserved: u64,
    pub size: u64,
    pub cache: CacheMode,
}

/// Response payload of `UIO_IRQ_INFO`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IrqInfoResponse {
    pub vector: u32,
    pub entry: u32,
}

/// Linux ioctl numbers are built from a direction, a size, a type character
/// and a sequence number. These mirror the encoding the kernel shim uses for
/// its private `UIO_IXGBE_*` / `UIO_IRQ_*` requests; the exact type
/// character ('i' for "ixmap") only has to agree between this binding and
/// the out-of-tree kernel module.
const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u64 {
    ((dir as u64) << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | (nr as u64)
}

const IXMAP_IOC_TYPE: u32 = b'i' as u32;

const UIO_IXGBE_INFO: u64 = ioc(
    IOC_READ,
    IXMAP_IOC_TYPE,
    1,
    std::mem::size_of::<ShimInfo>() as u32,
);
const UIO_IXGBE_UP: u64 = ioc(
    IOC_WRITE,
    IXMAP_IOC_TYPE,
    2,
    std::mem::size_of::<UpRequest>() as u32,
);
const UIO_IXGBE_MAP: u64 = ioc(
    IOC_WRITE | IOC_READ,
    IXMAP_IOC_TYPE,
    3,
    std::mem::size_of::<MapRequest>() as u32,
);
const UIO_IXGBE_UNMAP: u64 = ioc(IOC_WRITE, IXMAP_IOC_TYPE, 4, 8);
const UIO_IRQ_INFO: u64 = ioc(
    IOC_READ,
    IXMAP_IOC_TYPE,
    5,
    std::mem::size_of::<IrqInfoResponse>() as u32,
);

/// Abstraction over "something that answers the shim ioctl protocol",
/// implemented by [`RawFdShim`] for real devices and [`mock::MockShim`] for
/// tests. Kept as a trait (rather than free functions over a bare fd) so the
/// `dma` and `ixgbe` crates can be exercised without a real UIO device node.
pub trait Shim {
    fn info(&self) -> Result<ShimInfo, ShimError>;
    fn up(&self, req: UpRequest) -> Result<(), ShimError>;
    fn map(&self, req: MapRequest) -> Result<u64, ShimError>;
    fn unmap(&self, addr_dma: u64) -> Result<(), ShimError>;
    fn irq_info(&self) -> Result<IrqInfoResponse, ShimError>;
}

/// A `Shim` backed by a real open file descriptor to `/dev/<iface>` (or an
/// IRQ fd, for `irq_info`).
pub struct RawFdShim {
    fd: RawFd,
}

impl RawFdShim {
    /// Wraps an already-open fd. Ownership of the fd stays with the caller.
    pub fn new(fd: RawFd) -> Self {
        RawFdShim { fd }
    }
}

impl Shim for RawFdShim {
    fn info(&self) -> Result<ShimInfo, ShimError> {
        let mut info = ShimInfo::default();
        // SAFETY: `info` is a valid, correctly sized out-parameter for the
        // UIO_IXGBE_INFO ioctl, and `self.fd` is expected to refer to an open
        // NIC control device.
        let ret = unsafe { libc::ioctl(self.fd, UIO_IXGBE_INFO, &mut info as *mut ShimInfo) };
        if ret < 0 {
            return Err(ShimError::Ioctl {
                op: "UIO_IXGBE_INFO",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(info)
    }

    fn up(&self, req: UpRequest) -> Result<(), ShimError> {
        // SAFETY: `req` is a valid in-parameter for UIO_IXGBE_UP.
        let ret = unsafe { libc::ioctl(self.fd, UIO_IXGBE_UP, &req as *const UpRequest) };
        if ret < 0 {
            return Err(ShimError::Ioctl {
                op: "UIO_IXGBE_UP",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn map(&self, req: MapRequest) -> Result<u64, ShimError> {
        #[repr(C)]
        struct MapIoctl {
            req: MapRequest,
            addr_dma: u64,
        }
        let mut io = MapIoctl { req, addr_dma: 0 };
        // SAFETY: `io` is a valid combined in/out parameter for UIO_IXGBE_MAP.
        let ret = unsafe { libc::ioctl(self.fd, UIO_IXGBE_MAP, &mut io as *mut MapIoctl) };
        if ret < 0 {
            return Err(ShimError::Ioctl {
                op: "UIO_IXGBE_MAP",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(io.addr_dma)
    }

    fn unmap(&self, addr_dma: u64) -> Result<(), ShimError> {
        // SAFETY: `addr_dma` is a valid in-parameter for UIO_IXGBE_UNMAP.
        let ret = unsafe { libc::ioctl(self.fd, UIO_IXGBE_UNMAP, &addr_dma as *const u64) };
        if ret < 0 {
            return Err(ShimError::Ioctl {
                op: "UIO_IXGBE_UNMAP",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn irq_info(&self) -> Result<IrqInfoResponse, ShimError> {
        let mut info = IrqInfoResponse::default();
        // SAFETY: `info` is a valid out-parameter for UIO_IRQ_INFO, issued
        // against an open per-queue IRQ fd.
        let ret =
            unsafe { libc::ioctl(self.fd, UIO_IRQ_INFO, &mut info as *mut IrqInfoResponse) };
        if ret < 0 {
            return Err(ShimError::Ioctl {
                op: "UIO_IRQ_INFO",
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(info)
    }
}
