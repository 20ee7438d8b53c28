use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::*;
use crate::bench::scatter::Striping;
use crate::bench::{Operation, Phase, Sweep};
use crate::config::BenchConfig;
use crate::mem::{AddressSpace, MemKind};
use crate::poll::SpinWait;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reusable two-party barrier that either side can tear down.
struct Rendezvous {
    state: Mutex<RendezvousState>,
    cond: Condvar,
}

#[derive(Default)]
struct RendezvousState {
    arrived: u32,
    generation: u64,
    closed: bool,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            state: Mutex::new(RendezvousState::default()),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<(), AccelError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AccelError::PeerDisconnected);
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == 2 {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.closed {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation != generation {
            Ok(())
        } else {
            Err(AccelError::PeerDisconnected)
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.cond.notify_all();
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// Closes the rendezvous when the peer thread exits, however it exits.
struct CloseOnDrop<'a>(&'a Rendezvous);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One side of the connection: its registered buffer and completion counters.
struct Endpoint {
    mem: OnceLock<Buffer>,
    completed: [AtomicU32; Oper::COUNT],
}

impl Endpoint {
    fn new() -> Self {
        Self {
            mem: OnceLock::new(),
            completed: Default::default(),
        }
    }

    fn mem(&self) -> Result<&Buffer, AccelError> {
        self.mem
            .get()
            .ok_or(AccelError::Connection("not initialized"))
    }

    fn complete(&self, oper: Oper) {
        self.completed[oper.index()].fetch_add(1, Ordering::Release);
    }

    fn completed(&self, oper: Oper) -> u32 {
        self.completed[oper.index()].load(Ordering::Acquire)
    }

    fn clear(&self) {
        for c in &self.completed {
            c.store(0, Ordering::Release);
        }
    }
}

/// What the simulated client does, mirroring the server's sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPlan {
    pub operation: Operation,
    pub runs: u32,
    pub min_size: u32,
    pub max_size: u32,
    /// Transfers per round of each phase, in order.
    pub transfers: Vec<u32>,
    /// Bound on the client's own completion waits.
    pub timeout: Option<Duration>,
}

/// Setup of a [`Loopback`] accelerator.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    pub plan: PeerPlan,
    /// Number of GPUs that memory can be allocated on.
    pub devices: u32,
    /// Striping applied by the emulated scatter hardware.
    pub striping: Striping,
    /// Largest single allocation.
    pub max_alloc: usize,
}

impl LoopbackConfig {
    pub const DEFAULT_MAX_ALLOC: usize = 1 << 30;

    /// A peer that runs the client side of the benchmark described by `config`.
    ///
    /// # Panics
    ///
    /// Panic if `config` has zero scatter targets or a zero chunk size.
    pub fn for_bench(config: &BenchConfig) -> Self {
        let targets = config.scatter.targets;
        Self {
            plan: PeerPlan {
                operation: config.operation,
                runs: config.runs,
                min_size: config.min_size,
                max_size: config.max_size,
                transfers: config.phases.iter().map(|p: &Phase| p.transfers).collect(),
                timeout: config.timeout(),
            },
            devices: (targets as u32).max(config.gpu_id + 1),
            striping: Striping::new(config.scatter.chunk_size, targets),
            max_alloc: Self::DEFAULT_MAX_ALLOC,
        }
    }
}

/// What the simulated client observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSummary {
    /// Rounds completed and verified.
    pub rounds: u64,
    /// Bytes the client moved.
    pub bytes: u64,
}

struct Shared {
    rendezvous: Rendezvous,
    server: Endpoint,
    client: Endpoint,
    regs: Mutex<Vec<u64>>,
    /// Destinations of the emulated scatter, resolved when VALID is raised.
    scatter: Mutex<Option<Vec<Buffer>>>,
    striping: Striping,
    allocations: Mutex<HashMap<u64, Buffer>>,
    space: AddressSpace,
    devices: u32,
    max_alloc: usize,
}

impl Shared {
    /// Inbound write into the server's buffer, scattered to the GPU targets
    /// when the register file says so.
    fn write_to_server(&self, src: &Buffer, sg: &RdmaSg) -> Result<(), AccelError> {
        let dst = self.server.mem()?;
        dst.copy_from(sg.remote_offs, src, sg.local_offs, sg.len)?;

        if let Some(targets) = lock(&self.scatter).as_ref() {
            src.read(sg.local_offs..sg.local_offs + sg.len, |payload| {
                self.striping.chunks(sg.len).try_for_each(|chunk| {
                    targets[chunk.target].write_at(chunk.dst_offset, &payload[chunk.src])
                })
            })??;
        }

        self.server.complete(Oper::LocalWrite);
        self.client.complete(Oper::RemoteRdmaWrite);
        Ok(())
    }

    fn write_to_client(&self, sg: &RdmaSg) -> Result<(), AccelError> {
        let src = self.server.mem()?;
        let dst = self.client.mem()?;
        dst.copy_from(sg.remote_offs, src, sg.local_offs, sg.len)?;
        self.client.complete(Oper::LocalWrite);
        self.server.complete(Oper::RemoteRdmaWrite);
        Ok(())
    }

    /// One-sided read of `owner`'s buffer into `reader`'s, counted on the
    /// reading side.
    fn read(&self, reader: &Endpoint, owner: &Endpoint, sg: &RdmaSg) -> Result<(), AccelError> {
        let src = owner.mem()?;
        let dst = reader.mem()?;
        dst.copy_from(sg.local_offs, src, sg.remote_offs, sg.len)?;
        reader.complete(Oper::RemoteRdmaRead);
        Ok(())
    }

    fn resolve_scatter(&self, regs: &[u64]) -> Result<Vec<Buffer>, AccelError> {
        let allocations = lock(&self.allocations);
        regs[..self.striping.width()]
            .iter()
            .map(|addr| {
                allocations
                    .get(addr)
                    .cloned()
                    .ok_or(AccelError::UnknownBuffer(*addr))
            })
            .collect()
    }
}

/// An in-process [`Accelerator`] whose peer is a simulated client thread.
///
/// [`Accelerator::init_rdma`] starts the client, which then runs the mirror
/// image of the benchmark in [`LoopbackConfig::plan`]: every round it meets
/// the server at the barrier, writes or reads the payload, and checks the
/// verification pattern on what it got back. RDMA operations become buffer
/// copies that bump the completion counters of both sides.
///
/// The register file emulates the scatter design: once the valid register
/// (index `striping.width()`) is set, inbound writes are also striped across
/// the buffers whose addresses sit in registers `0..width`.
pub struct Loopback {
    shared: Arc<Shared>,
    plan: PeerPlan,
    peer: Mutex<Option<JoinHandle<Result<PeerSummary, AccelError>>>>,
}

impl Loopback {
    /// Number of emulated control registers.
    pub const NUM_REGS: usize = 64;

    pub fn new(config: LoopbackConfig) -> Self {
        let shared = Shared {
            rendezvous: Rendezvous::new(),
            server: Endpoint::new(),
            client: Endpoint::new(),
            regs: Mutex::new(vec![0; Self::NUM_REGS]),
            scatter: Mutex::new(None),
            striping: config.striping,
            allocations: Mutex::new(HashMap::new()),
            space: AddressSpace::new(0x7f00_0000_0000),
            devices: config.devices,
            max_alloc: config.max_alloc,
        };
        Self {
            shared: Arc::new(shared),
            plan: config.plan,
            peer: Mutex::new(None),
        }
    }

    /// Wait for the client to finish and return what it observed.
    pub fn finish(&self) -> Result<PeerSummary, AccelError> {
        match lock(&self.peer).take() {
            Some(handle) => join_peer(handle),
            None => Err(AccelError::Connection("not initialized")),
        }
    }

    /// The client's error after the barrier reported a disconnect.
    fn peer_failure(&self) -> AccelError {
        match lock(&self.peer).take() {
            Some(handle) => match join_peer(handle) {
                Err(e) => e,
                Ok(_) => AccelError::PeerDisconnected,
            },
            None => AccelError::PeerDisconnected,
        }
    }
}

fn join_peer(
    handle: JoinHandle<Result<PeerSummary, AccelError>>,
) -> Result<PeerSummary, AccelError> {
    match handle.join() {
        Ok(Ok(summary)) => Ok(summary),
        Ok(Err(AccelError::Peer(msg))) => Err(AccelError::Peer(msg)),
        Ok(Err(e)) => Err(AccelError::Peer(e.to_string())),
        Err(_) => Err(AccelError::Peer("client thread panicked".into())),
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.shared.rendezvous.close();
        if let Some(handle) = lock(&self.peer).take() {
            let _ = handle.join();
        }
    }
}

impl Accelerator for Loopback {
    fn init_rdma(&self, buf_size: usize, port: u16) -> Result<Buffer, AccelError> {
        let mut peer = lock(&self.peer);
        if peer.is_some() || self.shared.server.mem.get().is_some() {
            return Err(AccelError::Connection("already initialized"));
        }
        if buf_size == 0 || buf_size > self.shared.max_alloc {
            return Err(AccelError::AllocationFailed {
                alloc: AllocType::Reg,
                size: buf_size,
            });
        }

        let mem = Buffer::new(self.shared.space.reserve(buf_size), MemKind::Host, buf_size);
        self.shared
            .server
            .mem
            .set(mem.clone())
            .map_err(|_| AccelError::Connection("already initialized"))?;

        let shared = self.shared.clone();
        let plan = self.plan.clone();
        *peer = Some(thread::spawn(move || run_client(&shared, &plan, buf_size)));
        drop(peer);

        log::info!(
            "scatterbench: loopback connection on port {}, {} bytes at {:#x}",
            port,
            buf_size,
            mem.vaddr()
        );
        self.conn_sync(false)?;
        Ok(mem)
    }

    fn conn_sync(&self, _is_client: bool) -> Result<(), AccelError> {
        self.shared.rendezvous.wait().map_err(|e| match e {
            AccelError::PeerDisconnected => self.peer_failure(),
            e => e,
        })
    }

    fn get_mem(&self, spec: AllocSpec) -> Result<Buffer, AccelError> {
        let kind = match spec.alloc {
            AllocType::Gpu if spec.gpu_dev_id < self.shared.devices => {
                MemKind::Gpu(spec.gpu_dev_id)
            }
            AllocType::Reg | AllocType::Hpf => MemKind::Host,
            _ => {
                return Err(AccelError::AllocationFailed {
                    alloc: spec.alloc,
                    size: spec.size,
                })
            }
        };
        if spec.size == 0 || spec.size > self.shared.max_alloc {
            return Err(AccelError::AllocationFailed {
                alloc: spec.alloc,
                size: spec.size,
            });
        }

        let buf = Buffer::new(self.shared.space.reserve(spec.size), kind, spec.size);
        lock(&self.shared.allocations).insert(buf.vaddr(), buf.clone());
        log::debug!(
            "scatterbench: allocated {} bytes of {} memory at {:#x}",
            spec.size,
            kind,
            buf.vaddr()
        );
        Ok(buf)
    }

    fn free_mem(&self, buf: &Buffer) -> Result<(), AccelError> {
        lock(&self.shared.allocations)
            .remove(&buf.vaddr())
            .map(|_| ())
            .ok_or(AccelError::UnknownBuffer(buf.vaddr()))
    }

    fn set_csr(&self, val: u64, idx: u32) -> Result<(), AccelError> {
        let mut regs = lock(&self.shared.regs);
        *regs
            .get_mut(idx as usize)
            .ok_or(AccelError::BadRegister(idx))? = val;

        if idx as usize == self.shared.striping.width() {
            let targets = if val != 0 {
                Some(self.shared.resolve_scatter(&regs)?)
            } else {
                None
            };
            *lock(&self.shared.scatter) = targets;
        }
        Ok(())
    }

    fn get_csr(&self, idx: u32) -> Result<u64, AccelError> {
        lock(&self.shared.regs)
            .get(idx as usize)
            .copied()
            .ok_or(AccelError::BadRegister(idx))
    }

    fn clear_completed(&self) {
        self.shared.server.clear();
    }

    fn check_completed(&self, oper: Oper) -> u32 {
        self.shared.server.completed(oper)
    }

    fn invoke(&self, oper: Oper, sg: &RdmaSg) -> Result<(), AccelError> {
        match oper {
            Oper::RemoteRdmaWrite => self.shared.write_to_client(sg),
            Oper::RemoteRdmaRead => {
                self.shared
                    .read(&self.shared.server, &self.shared.client, sg)
            }
            _ => Err(AccelError::UnsupportedOper(oper)),
        }
    }
}

/// The client side of the benchmark.
fn run_client(shared: &Shared, plan: &PeerPlan, buf_size: usize) -> Result<PeerSummary, AccelError> {
    let _close = CloseOnDrop(&shared.rendezvous);

    // Received data lands in `recv`; outbound writes come from `send`.
    let recv = Buffer::new(shared.space.reserve(buf_size), MemKind::Host, buf_size);
    let send = Buffer::new(shared.space.reserve(buf_size), MemKind::Host, buf_size);
    send.fill_pattern(buf_size)?;
    shared
        .client
        .mem
        .set(recv.clone())
        .map_err(|_| AccelError::Connection("already initialized"))?;
    shared.rendezvous.wait()?;

    let mut summary = PeerSummary::default();
    for size in Sweep::new(plan.min_size, plan.max_size) {
        let sg = RdmaSg::new(size);
        for &transfers in &plan.transfers {
            for run in 0..plan.runs {
                shared.client.clear();
                recv.zero(size)?;
                shared.rendezvous.wait()?;

                match plan.operation {
                    Operation::Write => {
                        for _ in 0..transfers {
                            shared.write_to_server(&send, &sg)?;
                        }
                        wait_for_server(shared, transfers, plan.timeout)?;
                    }
                    Operation::Read => {
                        for _ in 0..transfers {
                            shared.read(&shared.client, &shared.server, &sg)?;
                        }
                    }
                }

                recv.verify_pattern(size)?.map_err(|m| {
                    AccelError::Peer(format!("round {} of {} bytes: {}", run, size, m))
                })?;
                summary.rounds += 1;
                summary.bytes += size as u64 * u64::from(transfers);
            }
        }
    }

    shared.rendezvous.wait()?;
    log::debug!(
        "scatterbench: loopback client done after {} rounds",
        summary.rounds
    );
    Ok(summary)
}

fn wait_for_server(
    shared: &Shared,
    transfers: u32,
    timeout: Option<Duration>,
) -> Result<(), AccelError> {
    let mut spin = SpinWait::new(timeout);
    spin.until(|| {
        if shared.rendezvous.is_closed() {
            return Some(Err(AccelError::PeerDisconnected));
        }
        (shared.client.completed(Oper::LocalWrite) >= transfers).then_some(Ok(()))
    })
    .map_err(|waited| {
        AccelError::Peer(format!(
            "no write-back from the server after {:?}",
            waited
        ))
    })?
}
