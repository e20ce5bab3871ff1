//! NIC lifecycle: open the character device, negotiate queue/interrupt
//! counts, map the BAR, allocate descriptor-ring storage, and expose the
//! per-queue rings and interrupt-mask registers the rest of the core drives.
//!
//! Open/bring-up/teardown follows an `ixmap_up`/`ixmap_down`-style sequence:
//! one ioctl round trip to learn device capabilities, a second to negotiate
//! queue counts, then an mmap of the BAR and of the descriptor region.
//! Register-programming sequences for link bring-up, RSS, flow director and
//! VLAN stay an opaque extension point (`configure_rx`/`configure_tx`) --
//! this crate only owns the generic open/close/interrupt machinery all of
//! that sits on top of.

pub mod regs;

use descriptors::storage::{DescriptorStorage, StorageError};
use nic_queues::{RxRing, TxRing};
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use thiserror::Error;
use uio_shim::{RawFdShim, Shim, ShimError, ShimInfo, UpRequest};

#[derive(Debug, Error)]
pub enum NicError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shim protocol error: {0}")]
    Shim(#[from] ShimError),
    #[error("mmap of BAR ({len} bytes) failed: {source}")]
    Mmap {
        len: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("descriptor storage allocation failed: {0}")]
    Storage(#[from] StorageError),
    #[error("device offers 0 {direction} queues")]
    NoQueues { direction: &'static str },
}

/// One physical port's device-wide resources: the control fd, the mapped
/// BAR, descriptor-ring storage, and one `RxRing`/`TxRing` pair per
/// negotiated queue.
///
/// Queue `k`'s rings are touched by exactly one worker thread (the one
/// assigned worker index `k`) for the handle's entire lifetime; the
/// `UnsafeCell`s below exist so workers each get an exclusive `&mut` into
/// their own queue's state without the whole `NicHandle` needing `&mut`.
pub struct NicHandle {
    iface: String,
    fd: RawFd,
    shim: Arc<dyn Shim + Send + Sync>,
    bar: Arc<mmio::RegisterWindow>,
    storage: Option<DescriptorStorage>,
    rx_rings: Vec<UnsafeCell<RxRing>>,
    tx_rings: Vec<UnsafeCell<TxRing>>,
    num_queues: usize,
    mtu: u32,
    promiscuous: bool,
}

// SAFETY: callers only ever reach a given queue's ring through
// `rx_ring`/`tx_ring`, and the partitioning contract documented there (one
// worker per queue index) is what makes concurrent access to disjoint
// `UnsafeCell`s sound. `Shim`, `RegisterWindow` and `DescriptorStorage` are
// themselves `Send + Sync` (or wrapped in `Arc`) for the same reason.
unsafe impl Sync for NicHandle {}

impl NicHandle {
    /// Opens `/dev/<iface>`, negotiates `requested_queues` down to what the
    /// device reports supporting, brings it up, maps its BAR and allocates
    /// descriptor storage for `num_rx_desc`/`num_tx_desc`-deep rings.
    pub fn nic_open(
        iface: &str,
        requested_queues: u16,
        num_rx_desc: usize,
        num_tx_desc: usize,
        intr_rate: u16,
        mtu: u32,
        promiscuous: bool,
    ) -> Result<NicHandle, NicError> {
        let path = format!("/dev/{iface}");
        let cpath = CString::new(path.clone()).expect("iface name contains no NUL bytes");
        // SAFETY: `cpath` is a valid, NUL-terminated C string.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(NicError::Open {
                path,
                source: std::io::Error::last_os_error(),
            });
        }
        let shim: Arc<dyn Shim + Send + Sync> = Arc::new(RawFdShim::new(fd));
        match Self::open_with_shim(
            iface,
            fd,
            shim,
            requested_queues,
            num_rx_desc,
            num_tx_desc,
            intr_rate,
            mtu,
            promiscuous,
        ) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                // SAFETY: `fd` was just opened above and nothing else holds it yet.
                unsafe {
                    libc::close(fd);
                }
                Err(e)
            }
        }
    }

    /// The open/negotiate/mmap/allocate sequence, parameterized over the
    /// shim so tests can drive it with `uio_shim::mock::MockShim` against a
    /// `memfd`-backed fd instead of a real `/dev` node.
    fn open_with_shim(
        iface: &str,
        fd: RawFd,
        shim: Arc<dyn Shim + Send + Sync>,
        requested_queues: u16,
        num_rx_desc: usize,
        num_tx_desc: usize,
        intr_rate: u16,
        mtu: u32,
        promiscuous: bool,
    ) -> Result<NicHandle, NicError> {
        let info: ShimInfo = shim.info()?;
        log::debug!("nic_open: {info:?}");

        let num_rx_queues = requested_queues.min(info.max_rx_queues);
        let num_tx_queues = requested_queues.min(info.max_tx_queues);
        if num_rx_queues == 0 {
            return Err(NicError::NoQueues { direction: "rx" });
        }
        if num_tx_queues == 0 {
            return Err(NicError::NoQueues { direction: "tx" });
        }
        if num_rx_queues != requested_queues || num_tx_queues != requested_queues {
            log::warn!(
                "negotiated {num_rx_queues} rx / {num_tx_queues} tx queues (requested {requested_queues})"
            );
        }
        let num_queues = num_rx_queues.min(num_tx_queues) as usize;
        let num_interrupt_rate = intr_rate.min(info.max_interrupt_rate);

        shim.up(UpRequest {
            num_interrupt_rate,
            num_rx_queues,
            num_tx_queues,
        })?;

        let bar_len = info.mmio_size as usize;
        // SAFETY: `fd` refers to an open device (or, in tests, a sized
        // memfd) that supports mmap; the result is checked against
        // MAP_FAILED below.
        let bar_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bar_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if bar_ptr == libc::MAP_FAILED {
            return Err(NicError::Mmap {
                len: bar_len,
                source: std::io::Error::last_os_error(),
            });
        }
        // SAFETY: `bar_ptr`/`bar_len` is exactly the mapping just created.
        let bar = Arc::new(unsafe { mmio::RegisterWindow::new(bar_ptr as *mut u8, bar_len) });

        let storage = match DescriptorStorage::alloc(shim.clone(), num_queues, num_rx_desc, num_tx_desc) {
            Ok(storage) => storage,
            Err(e) => {
                // SAFETY: `bar_ptr`/`bar_len` was returned by the mmap above.
                unsafe {
                    libc::munmap(bar_ptr, bar_len);
                }
                return Err(e.into());
            }
        };

        let mut rx_rings = Vec::with_capacity(num_queues);
        let mut tx_rings = Vec::with_capacity(num_queues);
        for q in 0..num_queues {
            let rx = RxRing::new(storage.rx_block(q), bar.clone(), regs::rx_tail_offset(q), regs::STATUS);
            let tx = TxRing::new(storage.tx_block(q), bar.clone(), regs::tx_tail_offset(q), regs::STATUS);
            rx_rings.push(UnsafeCell::new(rx));
            tx_rings.push(UnsafeCell::new(tx));
        }

        log::debug!("nic_open: {num_queues} queues, {num_rx_desc} rx desc, {num_tx_desc} tx desc");

        Ok(NicHandle {
            iface: iface.to_owned(),
            fd,
            shim,
            bar,
            storage: Some(storage),
            rx_rings,
            tx_rings,
            num_queues,
            mtu,
            promiscuous,
        })
    }

    /// Device name this handle was opened as (`/dev/<iface>`), used to
    /// derive per-queue IRQ fd paths (`/dev/<iface>-irqrx<q>` etc).
    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn num_queues(&self) -> usize {
        self.num_queues
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn promiscuous(&self) -> bool {
        self.promiscuous
    }

    /// The shim handle backing this NIC's ioctls, shared with whoever
    /// DMA-maps a buffer pool into this NIC's IOMMU domain.
    pub fn shim(&self) -> Arc<dyn Shim + Send + Sync> {
        self.shim.clone()
    }

    /// Exclusive access to queue `queue`'s Rx ring.
    ///
    /// # Safety
    /// The caller must ensure no other caller concurrently accesses the
    /// same `queue` on this `NicHandle` -- the data-plane invariant is one
    /// worker thread per queue index, for the handle's whole lifetime.
    pub unsafe fn rx_ring(&self, queue: usize) -> &mut RxRing {
        &mut *self.rx_rings[queue].get()
    }

    /// Exclusive access to queue `queue`'s Tx ring. Same contract as
    /// [`NicHandle::rx_ring`].
    ///
    /// # Safety
    /// See [`NicHandle::rx_ring`].
    pub unsafe fn tx_ring(&self, queue: usize) -> &mut TxRing {
        &mut *self.tx_rings[queue].get()
    }

    /// `qmask` bit for Rx queue `queue`.
    pub fn qmask_rx(&self, queue: usize) -> u64 {
        1u64 << queue
    }

    /// `qmask` bit for Tx queue `queue`.
    pub fn qmask_tx(&self, queue: usize) -> u64 {
        1u64 << (queue + self.num_queues)
    }

    /// Invokes the caller-supplied register-programming sequence for Rx
    /// bring-up (link, RSS, flow director, VLAN -- out of scope here) once,
    /// at startup.
    pub fn configure_rx(&self, f: impl FnOnce(&NicHandle) -> Result<(), NicError>) -> Result<(), NicError> {
        log::debug!("configure_rx");
        f(self)
    }

    /// Same as [`NicHandle::configure_rx`], for the Tx side.
    pub fn configure_tx(&self, f: impl FnOnce(&NicHandle) -> Result<(), NicError>) -> Result<(), NicError> {
        log::debug!("configure_tx");
        f(self)
    }

    /// Enables every queue's MSI-X vector, leaving link-status-change, the
    /// TCP timer and the "other causes" vector masked -- misc interrupts sit
    /// outside the per-queue Rx/Tx data path this driver serves.
    pub fn irq_enable(&self) {
        let mask = (regs::EIMS_ENABLE_MASK & !regs::EIMS_RTX_QUEUE)
            & !regs::EIMS_LSC
            & !regs::EIMS_TCP_TIMER
            & !regs::EIMS_OTHER;
        self.bar.write32(regs::EIMS, mask);
        self.bar.write32(regs::EIMS_EX0, !0u32);
        self.bar.write32(regs::EIMS_EX1, !0u32);
        self.bar.write_flush(regs::STATUS);
    }

    /// Re-arms exactly the vectors named by `qmask`, called after a ring's
    /// clean/refill cycle to re-enable the queue whose interrupt just fired.
    pub fn irq_enable_queues(&self, qmask: u64) {
        let low = qmask as u32;
        let high = (qmask >> 32) as u32;
        if low != 0 {
            self.bar.write32(regs::EIMS_EX0, low);
        }
        if high != 0 {
            self.bar.write32(regs::EIMS_EX1, high);
        }
        self.bar.write_flush(regs::STATUS);
    }

    /// Masks every interrupt cause. Called once during teardown.
    pub fn irq_disable(&self) {
        self.bar.write32(regs::EIMC, !0u32);
        self.bar.write_flush(regs::STATUS);
    }
}

impl Drop for NicHandle {
    fn drop(&mut self) {
        self.irq_disable();
        // SAFETY: `self.bar` is exactly the mapping `open_with_shim` created;
        // no other live reference dereferences it past this point because a
        // `NicHandle` is only dropped after every worker touching its rings
        // has been joined.
        unsafe {
            libc::munmap(self.bar.as_ptr() as *mut libc::c_void, self.bar.len());
        }
        // Drop descriptor storage explicitly, between the BAR unmap and the
        // fd close, mirroring an `ixmap_down`-style teardown order.
        self.storage.take();
        // SAFETY: `self.fd` was opened by `nic_open`/`open_with_shim` and is
        // not shared past this point.
        unsafe {
            libc::close(self.fd);
        }
        log::debug!("nic_close complete");
    }
}
