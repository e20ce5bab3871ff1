//! Bundles one buffer pool and a slice of every NIC's rings into a
//! stand-alone per-core data plane, owning its worker thread, CPU affinity
//! and the `irq` demultiplexer that drives its main loop.
//!
//! Startup order is pin to a CPU, open and affinity-bind every per-queue
//! IRQ fd, seed the Rx rings, then loop on readiness until terminated. Each
//! worker touches exactly queue `worker_idx` of every NIC for its entire
//! lifetime and nothing else, so no lock is needed between workers.

use buffer_pool::BufferPool;
use forwarder::{Bulk, Forwarder, PortId};
use irq::{EpollTarget, IrqDemux};
use ixgbe::NicHandle;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use termination::{TerminationFd, WorkerThreadId};
use thiserror::Error;
use uio_shim::{RawFdShim, Shim};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Nic(#[from] ixgbe::NicError),
    #[error(transparent)]
    Pool(#[from] buffer_pool::PoolError),
    #[error(transparent)]
    Irq(#[from] irq::IrqError),
    #[error(transparent)]
    Termination(#[from] termination::TerminationError),
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("failed to set CPU affinity to core {core}: {source}")]
    Affinity {
        core: usize,
        #[source]
        source: nix::Error,
    },
    #[error("failed to open IRQ fd {path}: {source}")]
    OpenIrqFd {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker_idx {worker_idx} is out of range for a NIC with {num_queues} queues")]
    InvalidQueueIndex { worker_idx: usize, num_queues: usize },
    #[error("worker {worker_idx} failed during startup: {0}")]
    Startup { worker_idx: usize, message: String },
}

/// Per-NIC, per-worker counters. Plain fields, not atomics: exactly one
/// worker thread ever writes to a given port's counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NicPortStats {
    pub rx_alloc_failed: u64,
    pub rx_clean_total: u64,
    pub tx_xmit_failed: u64,
    pub tx_clean_total: u64,
}

struct OpenIrqFd {
    fd: RawFd,
}

impl Drop for OpenIrqFd {
    fn drop(&mut self) {
        // SAFETY: `self.fd` was opened exclusively by this worker and is not
        // shared with any other owner.
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn open_irq_fd(path: &str) -> Result<RawFd, WorkerError> {
    let cpath = CString::new(path).expect("irq fd path contains no NUL bytes");
    // SAFETY: `cpath` is a valid, NUL-terminated C string.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(WorkerError::OpenIrqFd {
            path: path.to_owned(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

/// Opens `/dev/<iface>-irq{rx,tx}<queue>`, reads its MSI-X vector via
/// `UIO_IRQ_INFO`, and binds that vector to `cpu` by writing
/// `/proc/irq/<vector>/smp_affinity`. A failure to write the affinity file
/// (common when running without `CAP_SYS_ADMIN`, e.g. in tests) is logged
/// and not fatal -- the fd still delivers interrupts, just not pinned.
fn open_and_bind_irq_fd(iface: &str, direction: &str, queue: usize, cpu: usize) -> Result<OpenIrqFd, WorkerError> {
    let path = format!("/dev/{iface}-irq{direction}{queue}");
    let fd = open_irq_fd(&path)?;
    let shim = RawFdShim::new(fd);
    let info = match shim.irq_info() {
        Ok(info) => info,
        Err(e) => {
            // SAFETY: `fd` was just opened above by this function.
            unsafe {
                libc::close(fd);
            }
            return Err(e.into());
        }
    };

    let affinity_path = format!("/proc/irq/{}/smp_affinity", info.vector);
    let mask_low = if cpu < 32 { 1u32 << cpu } else { 0 };
    let mask_high = if cpu >= 32 { 1u32 << (cpu - 32) } else { 0 };
    let mask = format!("{mask_high:08x},{mask_low:08x}");
    if let Err(source) = std::fs::write(&affinity_path, mask) {
        log::warn!("{affinity_path}: {source} (continuing without IRQ affinity)");
    }
    log::debug!("{path}: vector={} bound toward cpu {cpu}", info.vector);

    Ok(OpenIrqFd { fd })
}

fn set_cpu_affinity(core: usize) -> Result<(), WorkerError> {
    let mut set = CpuSet::new();
    set.set(core).map_err(|source| WorkerError::Affinity { core, source })?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|source| WorkerError::Affinity { core, source })
}

/// One worker core's data plane: a buffer pool, a Rx/Tx ring view into
/// every NIC at index `worker_idx`, and the IRQ readiness set driving its
/// main loop. Lives entirely inside the spawned thread.
struct WorkerLoop {
    worker_idx: usize,
    nics: Arc<[NicHandle]>,
    pool: BufferPool,
    forwarder: Box<dyn Forwarder>,
    budget: usize,
    demux: IrqDemux,
    term_fd: TerminationFd,
    _irq_fds: Vec<OpenIrqFd>,
    stats: Vec<NicPortStats>,
}

impl WorkerLoop {
    fn run(mut self) -> Result<(), WorkerError> {
        for port in 0..self.nics.len() {
            // SAFETY: this worker is the sole accessor of queue `worker_idx`
            // on every NIC in `self.nics`, for its entire lifetime.
            let rx_ring = unsafe { self.nics[port].rx_ring(self.worker_idx) };
            let refill = rx_ring.rx_refill(&mut self.pool, port);
            self.stats[port].rx_alloc_failed += refill.alloc_failed as u64;
        }

        loop {
            let ready = self.demux.wait()?;
            for target in ready {
                match target {
                    EpollTarget::TermSignal => {
                        self.term_fd.drain()?;
                        log::info!(
                            "worker {} exiting: {:?}",
                            self.worker_idx,
                            &self.stats[..]
                        );
                        return Ok(());
                    }
                    EpollTarget::RxIrq { nic, .. } => self.handle_rx_irq(nic)?,
                    EpollTarget::TxIrq { nic, .. } => self.handle_tx_irq(nic),
                }
            }
        }
    }

    fn handle_rx_irq(&mut self, port: PortId) -> Result<(), WorkerError> {
        let mut bulk = Bulk::with_capacity(self.budget);
        {
            // SAFETY: see `run`.
            let rx_ring = unsafe { self.nics[port].rx_ring(self.worker_idx) };
            let produced = rx_ring.rx_clean(&mut bulk, self.budget);
            self.stats[port].rx_clean_total += produced as u64;
        }

        if !bulk.is_empty() {
            for (out_port, mut tx_bulk) in self.forwarder.forward(port, bulk) {
                // SAFETY: see `run`.
                let tx_ring = unsafe { self.nics[out_port].tx_ring(self.worker_idx) };
                let stats = tx_ring.tx_xmit(&mut self.pool, out_port, &mut tx_bulk);
                self.stats[out_port].tx_xmit_failed += stats.failed as u64;
            }
        }

        // SAFETY: see `run`.
        let rx_ring = unsafe { self.nics[port].rx_ring(self.worker_idx) };
        let refill = rx_ring.rx_refill(&mut self.pool, port);
        self.stats[port].rx_alloc_failed += refill.alloc_failed as u64;

        self.nics[port].irq_enable_queues(self.nics[port].qmask_rx(self.worker_idx));
        Ok(())
    }

    fn handle_tx_irq(&mut self, port: PortId) {
        // SAFETY: see `run`.
        let tx_ring = unsafe { self.nics[port].tx_ring(self.worker_idx) };
        let released = tx_ring.tx_clean(&mut self.pool, self.budget);
        self.stats[port].tx_clean_total += released as u64;
        self.nics[port].irq_enable_queues(self.nics[port].qmask_tx(self.worker_idx));
    }
}

/// A running worker's handle, held by the supervisor. Dropping this without
/// calling [`WorkerHandle::terminate`] and [`WorkerHandle::join`] leaves the
/// worker thread running.
pub struct WorkerHandle {
    thread_id: WorkerThreadId,
    join_handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl WorkerHandle {
    /// Delivers SIGUSR1 to the worker thread, asking it to exit its main
    /// loop after at most one more readiness cycle.
    pub fn terminate(&self) -> Result<(), WorkerError> {
        self.thread_id.signal_terminate().map_err(Into::into)
    }

    /// Blocks until the worker thread has exited, returning its result.
    pub fn join(mut self) -> Result<(), WorkerError> {
        match self.join_handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(WorkerError::ThreadSpawn(std::io::Error::other("worker thread panicked")))),
            None => Ok(()),
        }
    }
}

/// Allocates a buffer pool, pins a new OS thread to `worker_idx`, binds
/// every NIC's `worker_idx`-th queue's IRQ to that core, seeds the Rx rings,
/// and enters the readiness loop. Blocks until the thread has either
/// finished startup successfully or failed, so the returned `WorkerHandle`
/// is only ever for a worker whose loop has actually started.
pub fn spawn(
    worker_idx: usize,
    nics: Arc<[NicHandle]>,
    forwarder: Box<dyn Forwarder>,
    pool_count: u32,
    buf_size: u32,
    budget: usize,
) -> Result<WorkerHandle, WorkerError> {
    for nic in nics.iter() {
        if worker_idx >= nic.num_queues() {
            return Err(WorkerError::InvalidQueueIndex {
                worker_idx,
                num_queues: nic.num_queues(),
            });
        }
    }

    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<WorkerThreadId, String>>(0);

    let join_handle = std::thread::Builder::new()
        .name(format!("ixgbe-worker-{worker_idx}"))
        .spawn(move || -> Result<(), WorkerError> {
            let worker_loop = match prepare(worker_idx, &nics, forwarder, pool_count, buf_size, budget) {
                Ok(w) => w,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return Err(e);
                }
            };
            let thread_id = WorkerThreadId::current();
            if ready_tx.send(Ok(thread_id)).is_err() {
                // Spawner gave up waiting (e.g. it's dropping already); run
                // anyway so resources still get released via normal teardown.
                return worker_loop.run();
            }
            worker_loop.run()
        })
        .map_err(WorkerError::ThreadSpawn)?;

    match ready_rx.recv() {
        Ok(Ok(thread_id)) => Ok(WorkerHandle {
            thread_id,
            join_handle: Some(join_handle),
        }),
        Ok(Err(message)) => {
            let _ = join_handle.join();
            Err(WorkerError::Startup { worker_idx, message })
        }
        Err(_) => match join_handle.join() {
            Ok(Err(e)) => Err(e),
            _ => Err(WorkerError::Startup {
                worker_idx,
                message: "worker thread exited before reporting readiness".to_owned(),
            }),
        },
    }
}

fn prepare(
    worker_idx: usize,
    nics: &Arc<[NicHandle]>,
    forwarder: Box<dyn Forwarder>,
    pool_count: u32,
    buf_size: u32,
    budget: usize,
) -> Result<WorkerLoop, WorkerError> {
    set_cpu_affinity(worker_idx)?;

    debug_assert!(
        nics.iter().all(|nic| buf_size >= nic.mtu()),
        "buffer size {buf_size} smaller than a NIC's configured MTU"
    );

    let shims: Vec<Arc<dyn Shim + Send + Sync>> = nics.iter().map(|nic| nic.shim()).collect();
    let pool = BufferPool::alloc(shims, pool_count, buf_size)?;

    let term_fd = TerminationFd::new()?;
    let mut demux = IrqDemux::new()?;
    let mut irq_fds = Vec::with_capacity(nics.len() * 2);

    for (p, nic) in nics.iter().enumerate() {
        let rx = open_and_bind_irq_fd(nic.iface(), "rx", worker_idx, worker_idx)?;
        demux.register(rx.fd, EpollTarget::RxIrq { nic: p, queue: worker_idx })?;
        irq_fds.push(rx);

        let tx = open_and_bind_irq_fd(nic.iface(), "tx", worker_idx, worker_idx)?;
        demux.register(tx.fd, EpollTarget::TxIrq { nic: p, queue: worker_idx })?;
        irq_fds.push(tx);
    }
    demux.register(term_fd.as_raw_fd(), EpollTarget::TermSignal)?;

    log::debug!("worker {worker_idx}: {} ports, pool_count={pool_count}, budget={budget}", nics.len());

    Ok(WorkerLoop {
        worker_idx,
        nics: nics.clone(),
        pool,
        forwarder,
        budget,
        demux,
        term_fd,
        _irq_fds: irq_fds,
        stats: vec![NicPortStats::default(); nics.len()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nic_port_stats_default_to_zero() {
        let stats = NicPortStats::default();
        assert_eq!(stats.rx_alloc_failed, 0);
        assert_eq!(stats.rx_clean_total, 0);
        assert_eq!(stats.tx_xmit_failed, 0);
        assert_eq!(stats.tx_clean_total, 0);
    }

    #[test]
    fn open_irq_fd_reports_the_missing_path_on_failure() {
        let err = open_irq_fd("/dev/does-not-exist-ixgbe-irqrx0").unwrap_err();
        match err {
            WorkerError::OpenIrqFd { path, .. } => {
                assert_eq!(path, "/dev/does-not-exist-ixgbe-irqrx0");
            }
            other => panic!("expected OpenIrqFd, got {other:?}"),
        }
    }

    #[test]
    fn open_and_bind_irq_fd_fails_when_the_device_node_is_missing() {
        let err = open_and_bind_irq_fd("no-such-iface", "rx", 0, 0).unwrap_err();
        assert!(matches!(err, WorkerError::OpenIrqFd { .. }));
    }

    #[test]
    fn set_cpu_affinity_pins_to_core_zero() {
        // Every Linux host this runs on has at least one online CPU, so
        // pinning to core 0 specifically should never fail for lack of a
        // valid core, only for a missing CAP_SYS_NICE-equivalent privilege
        // (which plain sched_setaffinity to an already-permitted core does
        // not require).
        set_cpu_affinity(0).unwrap();
    }

    #[test]
    fn spawn_rejects_a_worker_index_past_every_nic_list() {
        let nics: Arc<[NicHandle]> = Arc::from(Vec::<NicHandle>::new());
        struct NoopForwarder;
        impl Forwarder for NoopForwarder {
            fn forward(&mut self, _port: PortId, _received: Bulk) -> Vec<(PortId, Bulk)> {
                Vec::new()
            }
        }
        // With zero NICs the `worker_idx >= nic.num_queues()` loop never
        // runs, so `spawn` should proceed past validation into `prepare`,
        // where there is nothing left to bind and it should complete
        // startup immediately.
        let handle = spawn(0, nics, Box::new(NoopForwarder), 8, 2048, 64).unwrap();
        handle.terminate().unwrap();
        handle.join().unwrap();
    }
}
