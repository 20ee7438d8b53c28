use std::time::Duration;

use quanta::Instant;

use super::scatter::{verify_scatter, DestinationSet, ScatterPlan, StageHandles, Striping};
use super::{BenchError, Operation};
use crate::accel::{Accelerator, Oper, RdmaSg};
use crate::config::BenchConfig;
use crate::mem::Buffer;
use crate::poll::wait_completed;

/// The driver always plays the server side of the barrier.
pub const IS_CLIENT: bool = false;

/// Knobs of one benchmark call beyond the transfer parameters.
pub struct RunOptions<'a> {
    /// Bound on every completion wait. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Check the verification pattern after a write-mode run.
    pub validate: bool,
    /// Copy stage run between receiving a payload and sending it back.
    pub scatter: Option<ScatterPlan<'a>>,
    /// Check the destinations after a write-mode run.
    pub verify: Option<(&'a DestinationSet, Striping)>,
}

impl<'a> RunOptions<'a> {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            validate: true,
            scatter: None,
            verify: None,
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            validate: config.validate,
            ..Self::new(config.timeout())
        }
    }

    pub fn with_scatter(mut self, plan: ScatterPlan<'a>) -> Self {
        self.scatter = Some(plan);
        self
    }

    pub fn with_verify(mut self, dests: &'a DestinationSet, striping: Striping) -> Self {
        self.verify = Some((dests, striping));
        self
    }
}

/// Measurements of one [`run_bench`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// Transfer size in bytes.
    pub len: usize,
    /// Transfers per round.
    pub transfers: u32,
    pub runs: u32,
    pub operation: Operation,
    /// Wall time of each round, from counter reset to the last issued write.
    pub rounds: Vec<Duration>,
    /// Counter polls spent waiting for the peer, over all rounds.
    pub polls: u64,
}

impl RunStats {
    pub fn total(&self) -> Duration {
        self.rounds.iter().sum()
    }

    pub fn mean(&self) -> Duration {
        if self.rounds.is_empty() {
            return Duration::ZERO;
        }
        self.total() / self.rounds.len() as u32
    }

    pub fn min(&self) -> Duration {
        self.rounds.iter().copied().min().unwrap_or_default()
    }

    pub fn max(&self) -> Duration {
        self.rounds.iter().copied().max().unwrap_or_default()
    }

    /// Bytes moved in one direction over the whole call.
    pub fn bytes(&self) -> u64 {
        self.len as u64 * u64::from(self.transfers) * u64::from(self.runs)
    }
}

/// Run `n_runs` rounds of `transfers` transfers of `sg.len` bytes.
///
/// In write mode every round waits for the peer's `transfers` writes to land
/// in `mem` before issuing exactly `transfers` writes back. In read mode the
/// peer reads `mem` and the server only takes part in the barrier.
pub fn run_bench<A: Accelerator + ?Sized>(
    accel: &A,
    sg: &RdmaSg,
    mem: &Buffer,
    transfers: u32,
    n_runs: u32,
    operation: Operation,
    opts: &mut RunOptions<'_>,
) -> Result<RunStats, BenchError> {
    if sg.len == 0 {
        return Err(BenchError::InvalidArgument("transfer size must be positive".into()));
    }
    if mem.len() < sg.len {
        return Err(BenchError::InvalidArgument(format!(
            "buffer of {} bytes cannot hold {}-byte transfers",
            mem.len(),
            sg.len
        )));
    }
    if transfers == 0 || n_runs == 0 {
        return Err(BenchError::InvalidArgument(format!(
            "need at least one transfer and one run, got {} and {}",
            transfers, n_runs
        )));
    }
    if let Some(plan) = &opts.scatter {
        let need = plan.striping().capacity_for(sg.len);
        if let Some(short) = plan.destinations().iter().find(|b| b.len() < need) {
            return Err(BenchError::InvalidArgument(format!(
                "scatter destination at {:#x} holds {} bytes, need {}",
                short.vaddr(),
                short.len(),
                need
            )));
        }
    }

    match operation {
        Operation::Write => mem.zero(sg.len)?,
        Operation::Read => mem.fill_pattern(sg.len)?,
    }

    let mut stats = RunStats {
        len: sg.len,
        transfers,
        runs: n_runs,
        operation,
        rounds: Vec::with_capacity(n_runs as usize),
        polls: 0,
    };

    let handles = match (&mut opts.scatter, operation) {
        (Some(plan), Operation::Write) => Some(plan.open()?),
        _ => None,
    };
    let ret = run_rounds(accel, sg, mem, &mut stats, opts, handles.as_ref());
    let closed = match (&mut opts.scatter, handles) {
        (Some(plan), Some(handles)) => plan.close(handles),
        _ => Ok(()),
    };
    // A failed round outranks a failed teardown.
    ret?;
    closed?;

    if operation.is_write() {
        if opts.validate {
            mem.verify_pattern(sg.len)??;
        }
        if let Some((dests, striping)) = opts.verify {
            verify_scatter(mem, dests, striping, sg.len)?;
        }
    }
    Ok(stats)
}

fn run_rounds<A: Accelerator + ?Sized>(
    accel: &A,
    sg: &RdmaSg,
    mem: &Buffer,
    stats: &mut RunStats,
    opts: &mut RunOptions<'_>,
    handles: Option<&StageHandles>,
) -> Result<(), BenchError> {
    for run in 0..stats.runs {
        let start = Instant::now();
        accel.clear_completed();
        accel.conn_sync(IS_CLIENT)?;
        log::trace!("scatterbench: round {} of {} bytes synchronized", run, sg.len);

        if stats.operation.is_write() {
            let waited = wait_completed(accel, Oper::LocalWrite, stats.transfers, opts.timeout)?;
            stats.polls += waited.polls;

            if let (Some(plan), Some(handles)) = (opts.scatter.as_mut(), handles) {
                plan.scatter(handles, mem, sg.len, opts.timeout)?;
            }
            for _ in 0..stats.transfers {
                accel.invoke(Oper::RemoteRdmaWrite, sg)?;
            }
        }
        stats.rounds.push(start.elapsed());
    }
    Ok(())
}
