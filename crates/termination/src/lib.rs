//! Signal-driven shutdown: a per-worker `TerminationFd` bound to SIGUSR1, a
//! `WorkerThreadId` the supervisor uses to deliver it, and a main-thread
//! `wait_for_shutdown_signal` that blocks on SIGINT/SIGTERM/SIGHUP.
//!
//! SIGUSR1 is private to one worker thread and arrives as a `signalfd`
//! readiness event registered alongside the IRQ fds in that worker's
//! readiness set, so the main loop's "block until something is ready" stays
//! a single wait call. The main thread never receives SIGUSR1 itself -- it
//! blocks only the three signals a shell or service manager would send it.

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("failed to block signal mask on this thread: {0}")]
    SigMask(#[source] nix::Error),
    #[error("failed to create signalfd: {0}")]
    SignalFd(#[source] nix::Error),
    #[error("failed to read pending signal: {0}")]
    ReadSignal(#[source] nix::Error),
    #[error("pthread_kill failed: {0}")]
    Kill(#[source] std::io::Error),
    #[error("signalfd woke up for an unexpected signal: {0}")]
    UnexpectedSignal(libc::c_int),
}

/// A `signalfd` bound to SIGUSR1 alone, owned by one worker thread.
///
/// Must be constructed on the thread it will terminate: creation blocks
/// SIGUSR1 in the calling thread's mask (so the signal is delivered through
/// the fd, never as an async handler) before binding the `signalfd` to it.
pub struct TerminationFd {
    sfd: SignalFd,
}

impl TerminationFd {
    /// Blocks SIGUSR1 on the current thread and returns a `signalfd` that
    /// becomes readable exactly when that thread is sent it.
    pub fn new() -> Result<Self, TerminationError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR1);
        mask.thread_block().map_err(TerminationError::SigMask)?;
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
            .map_err(TerminationError::SignalFd)?;
        Ok(TerminationFd { sfd })
    }

    /// Fd to register in the worker's readiness set (`irq::EpollTarget::TermSignal`).
    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.sfd.as_raw_fd()
    }

    /// Consumes the pending `siginfo` once the fd is reported ready. Never
    /// blocks on a correctly-registered readiness set, since the fd is only
    /// drained after readiness-wait reports it readable.
    pub fn drain(&mut self) -> Result<(), TerminationError> {
        match self.sfd.read_signal() {
            Ok(Some(info)) if info.ssi_signo as libc::c_int == Signal::SIGUSR1 as libc::c_int => {
                Ok(())
            }
            Ok(Some(info)) => Err(TerminationError::UnexpectedSignal(info.ssi_signo as libc::c_int)),
            Ok(None) => Ok(()),
            Err(e) => Err(TerminationError::ReadSignal(e)),
        }
    }
}

/// A handle the supervisor uses to deliver SIGUSR1 to one worker thread,
/// independent of the `JoinHandle` std returns (which does not expose the
/// underlying `pthread_t`).
#[derive(Clone, Copy)]
pub struct WorkerThreadId(libc::pthread_t);

// SAFETY: a `pthread_t` is an opaque handle safe to copy and use for
// `pthread_kill` from any thread, including ones other than the one it names.
unsafe impl Send for WorkerThreadId {}
unsafe impl Sync for WorkerThreadId {}

impl WorkerThreadId {
    /// Captures the calling thread's id. Call this from inside the worker
    /// thread itself, before entering its main loop, and hand the result
    /// back to the supervisor (e.g. through the `WorkerHandle` the `worker`
    /// crate returns from `spawn`).
    pub fn current() -> Self {
        // SAFETY: `pthread_self` has no preconditions.
        WorkerThreadId(unsafe { libc::pthread_self() })
    }

    /// Delivers SIGUSR1 to the named thread. The thread must have
    /// constructed a `TerminationFd` (blocking SIGUSR1 in its mask) before
    /// this is called, or the signal's default disposition (terminate the
    /// process) applies instead.
    pub fn signal_terminate(&self) -> Result<(), TerminationError> {
        // SAFETY: `self.0` was captured by a live call to `pthread_self` on
        // some thread; `pthread_kill` is safe to call with SIGUSR1 even if
        // that thread has since exited (it would just return ESRCH).
        let ret = unsafe { libc::pthread_kill(self.0, libc::SIGUSR1) };
        if ret != 0 {
            return Err(TerminationError::Kill(std::io::Error::from_raw_os_error(ret)));
        }
        log::debug!("sent SIGUSR1 to worker thread");
        Ok(())
    }
}

/// Blocks SIGINT/SIGTERM/SIGHUP on the calling thread (intended to be the
/// process's main thread) and waits synchronously for one of them, returning
/// which it was. Workers never see these signals -- only SIGUSR1, delivered
/// directly by [`WorkerThreadId::signal_terminate`].
pub fn wait_for_shutdown_signal() -> Result<Signal, TerminationError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.thread_block().map_err(TerminationError::SigMask)?;

    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
        .map_err(TerminationError::SignalFd)?;
    let info = loop {
        match sfd.read_signal() {
            Ok(Some(info)) => break info,
            Ok(None) => continue,
            Err(e) => return Err(TerminationError::ReadSignal(e)),
        }
    };
    let signal = Signal::try_from(info.ssi_signo as libc::c_int)
        .map_err(|_| TerminationError::UnexpectedSignal(info.ssi_signo as libc::c_int))?;
    log::info!("received {signal:?}, beginning shutdown");
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::{AsFd, BorrowedFd};

    #[test]
    fn termination_fd_becomes_readable_on_sigusr1_to_self() {
        let mut term = TerminationFd::new().unwrap();
        let us = WorkerThreadId::current();
        us.signal_terminate().unwrap();

        let fd: BorrowedFd = unsafe { BorrowedFd::borrow_raw(term.as_raw_fd()) };
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::from(1000u16)).unwrap();
        assert_eq!(n, 1);

        term.drain().unwrap();
    }

    #[test]
    fn drain_is_idempotent_when_nothing_pending() {
        // A second, independently constructed `TerminationFd` should drain
        // its own delivery the same way the first test's does.
        let mut term = TerminationFd::new().unwrap();
        WorkerThreadId::current().signal_terminate().unwrap();
        let fd: std::os::fd::BorrowedFd =
            unsafe { std::os::fd::BorrowedFd::borrow_raw(term.as_raw_fd()) };
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(1000u16)).unwrap();
        term.drain().unwrap();
    }
}
