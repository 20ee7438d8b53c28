mod driver;
pub mod scatter;
mod sweep;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::driver::*;
pub use self::scatter::ScatterError;
pub use self::sweep::Sweep;
use crate::accel::{AccelError, Accelerator, RdmaSg};
use crate::config::{BenchConfig, ConfigError};
use crate::mem::{Buffer, OutOfBounds, PatternMismatch};
use crate::poll::PollError;
use crate::report::PhaseReport;

/// Direction of the benchmarked traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// The peer reads the server's buffer.
    #[default]
    Read,
    /// The peer writes to the server, which writes the payload back.
    Write,
}

impl Operation {
    #[inline]
    pub fn is_write(self) -> bool {
        self == Operation::Write
    }
}

impl From<bool> for Operation {
    fn from(write: bool) -> Self {
        if write {
            Operation::Write
        } else {
            Operation::Read
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => write!(f, "READ"),
            Operation::Write => write!(f, "WRITE"),
        }
    }
}

/// A named group of runs with a fixed number of transfers per round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub transfers: u32,
}

impl Phase {
    /// Transfers per round of the throughput phase.
    pub const N_THROUGHPUT_REPS: u32 = 32;

    /// Transfers per round of the latency phase.
    pub const N_LATENCY_REPS: u32 = 1;

    pub fn new(name: impl Into<String>, transfers: u32) -> Self {
        Self {
            name: name.into(),
            transfers,
        }
    }

    pub fn throughput() -> Self {
        Self::new("throughput", Self::N_THROUGHPUT_REPS)
    }

    pub fn latency() -> Self {
        Self::new("latency", Self::N_LATENCY_REPS)
    }

    /// Throughput phase followed by latency phase.
    pub fn defaults() -> Vec<Self> {
        vec![Self::throughput(), Self::latency()]
    }
}

/// Benchmark error type.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("accelerator: {0}")]
    Accel(#[from] AccelError),

    #[error("completion wait: {0}")]
    Poll(#[from] PollError),

    #[error("scatter stage: {0}")]
    Scatter(#[from] ScatterError),

    #[error("local buffer: {0}")]
    Memory(#[from] OutOfBounds),

    /// The buffer does not hold what the peer wrote.
    #[error("integrity check failed: {0}")]
    Integrity(#[from] PatternMismatch),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Run the whole sweep described by `config` and return one report per size
/// and phase.
///
/// Sizes double from `min_size` up to `max_size`; every size runs each phase
/// in order for `runs` rounds. A final barrier closes the benchmark, also when
/// the sweep is empty.
pub fn run_sweep<A: Accelerator + ?Sized>(
    accel: &A,
    mem: &Buffer,
    config: &BenchConfig,
    opts: &mut RunOptions<'_>,
) -> Result<Vec<PhaseReport>, BenchError> {
    config.validate()?;

    let mut reports = Vec::new();
    for size in Sweep::new(config.min_size, config.max_size) {
        let sg = RdmaSg::new(size);
        for phase in &config.phases {
            log::debug!(
                "scatterbench: {} phase, {} bytes, {} transfers x {} runs",
                phase.name,
                size,
                phase.transfers,
                config.runs
            );
            let stats = run_bench(
                accel,
                &sg,
                mem,
                phase.transfers,
                config.runs,
                config.operation,
                opts,
            )?;

            let report = PhaseReport::new(&phase.name, &stats);
            log::info!(
                "scatterbench: size {} {} mean {:.2} us, {:.3} GiB/s",
                report.size,
                report.phase,
                report.mean_us,
                report.gib_per_sec
            );
            reports.push(report);
        }
    }

    accel.conn_sync(IS_CLIENT)?;
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::scatter::{CopyMode, DestinationSet, Placement, ScatterPlan, Striping};
    use super::*;
    use crate::accel::mock::{Call, MockAccel};
    use crate::accel::{Loopback, LoopbackConfig, Oper};
    use crate::gpu::HostGpu;
    use crate::regs::ScatterRegs;

    fn small_config(operation: Operation) -> BenchConfig {
        BenchConfig {
            operation,
            runs: 3,
            min_size: 64,
            max_size: 16384,
            timeout_ms: 5000,
            ..Default::default()
        }
    }

    #[test]
    fn test_operation() {
        assert_eq!(Operation::from(true), Operation::Write);
        assert_eq!(Operation::from(false), Operation::Read);
        assert_eq!(Operation::Write.to_string(), "WRITE");
        assert_eq!(Operation::default(), Operation::Read);
    }

    #[test]
    fn test_mock_sweep() {
        let accel = MockAccel::new();
        let config = BenchConfig {
            operation: Operation::Write,
            runs: 1,
            min_size: 64,
            max_size: 256,
            phases: vec![Phase::latency()],
            ..Default::default()
        };
        let mem = accel.init_rdma(256, 0).unwrap();
        accel.set_peer_writes(1);

        let mut opts = RunOptions::from_config(&config);
        let reports = run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        let sizes: Vec<_> = reports.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![64, 128, 256]);

        let invokes: Vec<_> = accel
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Invoke(oper, len) => Some((oper, len)),
                _ => None,
            })
            .collect();
        assert_eq!(
            invokes,
            vec![
                (Oper::RemoteRdmaWrite, 64),
                (Oper::RemoteRdmaWrite, 128),
                (Oper::RemoteRdmaWrite, 256)
            ]
        );
        assert_eq!(accel.calls().last(), Some(&Call::Sync));
    }

    #[test]
    fn test_two_phases() {
        let accel = MockAccel::new();
        let config = BenchConfig {
            operation: Operation::Read,
            runs: 2,
            min_size: 64,
            max_size: 256,
            ..Default::default()
        };
        let mem = accel.init_rdma(256, 0).unwrap();

        let mut opts = RunOptions::from_config(&config);
        let reports = run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        let shape: Vec<_> = reports
            .iter()
            .map(|r| (r.size, r.phase.as_str(), r.transfers))
            .collect();
        assert_eq!(
            shape,
            vec![
                (64, "throughput", 32),
                (64, "latency", 1),
                (128, "throughput", 32),
                (128, "latency", 1),
                (256, "throughput", 32),
                (256, "latency", 1),
            ]
        );
        // 3 sizes x 2 phases x 2 runs, plus the closing barrier.
        let syncs = accel.calls().iter().filter(|c| **c == Call::Sync).count();
        assert_eq!(syncs, 13);
    }

    #[test]
    fn test_empty_sweep_still_syncs() {
        let accel = MockAccel::new();
        let config = BenchConfig {
            min_size: 256,
            max_size: 64,
            ..Default::default()
        };
        let mem = accel.init_rdma(256, 0).unwrap();

        let mut opts = RunOptions::from_config(&config);
        let reports = run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        assert!(reports.is_empty());
        assert_eq!(accel.calls(), vec![Call::InitRdma(256), Call::Sync]);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let accel = MockAccel::new();
        let config = BenchConfig {
            runs: 0,
            ..Default::default()
        };
        let mem = accel.init_rdma(64, 0).unwrap();
        let mut opts = RunOptions::from_config(&config);
        assert!(matches!(
            run_sweep(&accel, &mem, &config, &mut opts),
            Err(BenchError::Config(_))
        ));
        assert_eq!(accel.calls(), vec![Call::InitRdma(64)]);
    }

    #[test]
    fn test_loopback_write() {
        let config = small_config(Operation::Write);
        let accel = Loopback::new(LoopbackConfig::for_bench(&config));
        let mem = accel.init_rdma(config.max_size as usize, 0).unwrap();

        let mut opts = RunOptions::from_config(&config);
        let reports = run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        assert_eq!(reports.len(), 9 * 2);

        let summary = accel.finish().unwrap();
        assert_eq!(summary.rounds, 9 * 2 * 3);
    }

    #[test]
    fn test_loopback_read() {
        let config = small_config(Operation::Read);
        let accel = Loopback::new(LoopbackConfig::for_bench(&config));
        let mem = accel.init_rdma(config.max_size as usize, 0).unwrap();

        let mut opts = RunOptions::from_config(&config);
        run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        let summary = accel.finish().unwrap();
        assert_eq!(summary.rounds, 9 * 2 * 3);
        assert!(summary.bytes > 0);
    }

    #[test]
    fn test_loopback_hardware_scatter() {
        let config = small_config(Operation::Write);
        let accel = Loopback::new(LoopbackConfig::for_bench(&config));
        let mem = accel.init_rdma(config.max_size as usize, 0).unwrap();

        let striping = Striping::new(config.scatter.chunk_size, config.scatter.targets);
        let dests = DestinationSet::allocate(
            &accel,
            config.scatter.targets,
            config.max_size as usize,
            Placement::SingleDevice(config.gpu_id),
        )
        .unwrap();
        ScatterRegs::new(config.scatter.targets as u32)
            .program(&accel, &dests.addrs())
            .unwrap();

        let mut opts = RunOptions::from_config(&config).with_verify(&dests, striping);
        run_sweep(&accel, &mem, &config, &mut opts).unwrap();
        accel.finish().unwrap();
        dests.release(&accel).unwrap();
    }

    #[test]
    fn test_loopback_baseline() {
        for mode in [CopyMode::Blocking, CopyMode::EventPoll] {
            let config = small_config(Operation::Write);
            let accel = Loopback::new(LoopbackConfig::for_bench(&config));
            let mem = accel.init_rdma(config.max_size as usize, 0).unwrap();

            let targets = config.scatter.targets;
            let striping = Striping::new(config.scatter.chunk_size, targets);
            let dests = DestinationSet::allocate(
                &accel,
                targets,
                config.max_size as usize,
                Placement::PerDevice,
            )
            .unwrap();
            let mut gpu = HostGpu::new(targets as u32);
            let plan = ScatterPlan::new(&mut gpu, &dests, striping, mode).unwrap();

            let mut opts = RunOptions::from_config(&config)
                .with_scatter(plan)
                .with_verify(&dests, striping);
            run_sweep(&accel, &mem, &config, &mut opts).unwrap();
            accel.finish().unwrap();
        }
    }

    #[test]
    fn test_loopback_timeout() {
        let config = BenchConfig {
            timeout_ms: 50,
            ..small_config(Operation::Write)
        };
        let accel = Loopback::new(LoopbackConfig::for_bench(&config));
        let mem = accel.init_rdma(config.max_size as usize, 0).unwrap();

        // The peer expects 32 transfers per round; waiting for 64 never ends.
        let mut opts = RunOptions::from_config(&config);
        let err = run_bench(
            &accel,
            &RdmaSg::new(64),
            &mem,
            64,
            1,
            Operation::Write,
            &mut opts,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Poll(PollError::TimedOut { target: 64, .. })
        ));
    }
}
