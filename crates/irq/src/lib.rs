//! Per-worker readiness wait over every per-queue IRQ fd plus a termination
//! fd, dispatching nothing itself -- it only tells the caller which tagged
//! descriptor became ready, draining the 8-byte UIO counter along the way so
//! the fd doesn't stay readable.
//!
//! One `epoll` instance per worker, registered once at startup with every
//! Rx-IRQ fd, every Tx-IRQ fd and the worker's [`termination::TerminationFd`],
//! in an `ixgbe_epoll_prepare`/`ixgbe_epoll_wait`-style sequence. This crate
//! only types the wait and the tag; the `worker` crate owns what happens
//! once a tag comes back ready (running `rx_clean`/`tx_xmit`/etc. is out of
//! scope here so `irq` stays a leaf the ring engine doesn't need to know
//! about).

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Largest number of readiness events drained in a single `wait()` call.
/// Bounded by the number of registered fds (two per queue per NIC, plus
/// one), which is small and fixed at worker startup.
const MAX_EVENTS: usize = 128;

#[derive(Debug, Error)]
pub enum IrqError {
    #[error("failed to create epoll instance: {0}")]
    Create(#[source] nix::Error),
    #[error("failed to register {target:?} with epoll: {source}")]
    Register {
        target: EpollTarget,
        #[source]
        source: nix::Error,
    },
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] nix::Error),
    #[error("failed to drain IRQ counter: {0}")]
    DrainCounter(#[source] std::io::Error),
}

/// One member of a worker's readiness set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpollTarget {
    RxIrq { nic: usize, queue: usize },
    TxIrq { nic: usize, queue: usize },
    TermSignal,
}

const TERM_BIT: u64 = 1 << 63;
const TX_BIT: u64 = 1 << 62;
const NIC_SHIFT: u32 = 32;
const NIC_MASK: u64 = (1 << 30) - 1;
const QUEUE_MASK: u64 = u32::MAX as u64;

fn encode(target: EpollTarget) -> u64 {
    match target {
        EpollTarget::TermSignal => TERM_BIT,
        EpollTarget::RxIrq { nic, queue } => {
            ((nic as u64 & NIC_MASK) << NIC_SHIFT) | (queue as u64 & QUEUE_MASK)
        }
        EpollTarget::TxIrq { nic, queue } => {
            TX_BIT | ((nic as u64 & NIC_MASK) << NIC_SHIFT) | (queue as u64 & QUEUE_MASK)
        }
    }
}

fn decode(token: u64) -> EpollTarget {
    if token & TERM_BIT != 0 {
        return EpollTarget::TermSignal;
    }
    let nic = ((token >> NIC_SHIFT) & NIC_MASK) as usize;
    let queue = (token & QUEUE_MASK) as usize;
    if token & TX_BIT != 0 {
        EpollTarget::TxIrq { nic, queue }
    } else {
        EpollTarget::RxIrq { nic, queue }
    }
}

fn drain_counter(fd: RawFd) -> Result<(), IrqError> {
    let mut buf = [0u8; 8];
    // SAFETY: `fd` is a valid, open fd the caller registered; `buf` is sized
    // for exactly the 8-byte counter the UIO shim (or an `eventfd`) posts.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n != buf.len() as isize {
        return Err(IrqError::DrainCounter(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Owns one worker's `epoll` instance and the bookkeeping needed to drain
/// each IRQ fd's counter once it fires. Does not own the registered fds
/// themselves -- those stay owned by whoever opened them (the `worker`
/// crate), keeping exactly one owner on the path from fd to close.
pub struct IrqDemux {
    epoll: Epoll,
    drain_fds: HashMap<u64, RawFd>,
}

impl IrqDemux {
    pub fn new() -> Result<Self, IrqError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(IrqError::Create)?;
        Ok(IrqDemux {
            epoll,
            drain_fds: HashMap::new(),
        })
    }

    /// Adds `fd` to the readiness set under `target`. IRQ-variant targets
    /// have their 8-byte counter drained automatically by [`IrqDemux::wait`]
    /// whenever they're reported ready; [`EpollTarget::TermSignal`] is left
    /// for the caller to drain via `termination::TerminationFd::drain`.
    pub fn register(&mut self, fd: RawFd, target: EpollTarget) -> Result<(), IrqError> {
        let token = encode(target);
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token);
        // SAFETY: `fd` is expected to be a valid, open fd that outlives this
        // registration; the caller retains ownership.
        let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, event)
            .map_err(|source| IrqError::Register { target, source })?;
        if !matches!(target, EpollTarget::TermSignal) {
            self.drain_fds.insert(token, fd);
        }
        log::debug!("registered {target:?} (fd={fd}) with worker readiness set");
        Ok(())
    }

    /// Removes a previously registered fd from the readiness set.
    pub fn unregister(&mut self, fd: RawFd, target: EpollTarget) -> Result<(), IrqError> {
        let token = encode(target);
        // SAFETY: see `register`.
        let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .delete(borrowed.as_fd())
            .map_err(|source| IrqError::Register { target, source })?;
        self.drain_fds.remove(&token);
        Ok(())
    }

    /// Blocks until at least one registered fd is ready, then returns every
    /// target that fired this wakeup, having already drained their IRQ
    /// counters. Never times out: the only suspension point in the whole
    /// data-plane engine is this call.
    pub fn wait(&self) -> Result<Vec<EpollTarget>, IrqError> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let n = self
            .epoll
            .wait(&mut events, EpollTimeout::NONE)
            .map_err(IrqError::Wait)?;

        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let token = event.data();
            let target = decode(token);
            if let Some(&fd) = self.drain_fds.get(&token) {
                drain_counter(fd)?;
            }
            ready.push(target);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eventfd() -> RawFd {
        // SAFETY: a plain eventfd(2) call with no preconditions; stands in
        // for a UIO IRQ fd, whose readiness/counter semantics match eventfd
        // exactly.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        assert!(fd >= 0, "eventfd creation failed");
        fd
    }

    fn post(fd: RawFd, value: u64) {
        let buf = value.to_ne_bytes();
        // SAFETY: `fd` is a live eventfd and `buf` is exactly 8 bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 8) };
        assert_eq!(n, 8);
    }

    #[test]
    fn wait_reports_the_fired_target_and_drains_its_counter() {
        let mut demux = IrqDemux::new().unwrap();
        let fd = eventfd();
        demux
            .register(fd, EpollTarget::RxIrq { nic: 1, queue: 2 })
            .unwrap();

        post(fd, 1);
        let ready = demux.wait().unwrap();
        assert_eq!(ready, vec![EpollTarget::RxIrq { nic: 1, queue: 2 }]);

        // The counter was drained by `wait`, so a direct nonblocking read
        // must now fail with EAGAIN rather than return stale data.
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        assert_eq!(n, -1);
        assert_eq!(std::io::Error::last_os_error().kind(), std::io::ErrorKind::WouldBlock);

        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn distinguishes_rx_tx_and_term_targets_with_the_same_indices() {
        let rx = EpollTarget::RxIrq { nic: 3, queue: 5 };
        let tx = EpollTarget::TxIrq { nic: 3, queue: 5 };
        let term = EpollTarget::TermSignal;
        assert_ne!(encode(rx), encode(tx));
        assert_ne!(encode(rx), encode(term));
        assert_eq!(decode(encode(rx)), rx);
        assert_eq!(decode(encode(tx)), tx);
        assert_eq!(decode(encode(term)), term);
    }

    #[test]
    fn unregister_stops_future_wakeups() {
        let mut demux = IrqDemux::new().unwrap();
        let fd = eventfd();
        let target = EpollTarget::TxIrq { nic: 0, queue: 0 };
        demux.register(fd, target).unwrap();
        demux.unregister(fd, target).unwrap();

        post(fd, 1);
        // Nothing else is registered, so waiting again would block forever;
        // instead just confirm the drain bookkeeping for this token is gone.
        assert!(!demux.drain_fds.contains_key(&encode(target)));

        unsafe {
            libc::close(fd);
        }
    }
}
