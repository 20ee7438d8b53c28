//! Server-side benchmark driver for RDMA scatter data paths.
//!
//! `scatterbench` drives a fixed sweep over transfer sizes against a remote
//! peer. Each sweep step runs a number of synchronized rounds; within a round
//! the server waits for the peer's RDMA writes to land, optionally fans the
//! received payload out across several GPU buffers, and writes it back.
//!
//! The transport itself is not part of this crate. Everything the driver needs
//! from it is expressed by the [`Accelerator`] trait: connection setup,
//! barrier sync, memory allocation, register access, completion counting and
//! operation invocation. GPU copies go through [`gpu::GpuRuntime`].
//!
//! Two in-process implementations are provided so that the driver can run
//! without hardware: [`accel::Loopback`], which plays the client role on a
//! separate thread and emulates the scatter register file, and
//! [`gpu::HostGpu`], which models devices as host memory with queued
//! asynchronous copies.
//!
//! # Example
//!
//! ```rust,no_run
//! use scatterbench::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BenchConfig::default();
//!     let accel = Loopback::new(LoopbackConfig::for_bench(&config));
//!     let mem = accel.init_rdma(config.max_size as usize, DEF_PORT)?;
//!
//!     let mut opts = RunOptions::from_config(&config);
//!     let reports = run_sweep(&accel, &mem, &config, &mut opts)?;
//!     print_reports(&reports);
//!
//!     accel.finish()?;
//!     Ok(())
//! }
//! ```

/// The accelerator-thread collaborator and its in-process implementations.
pub mod accel;

/// Benchmark driver: sweep, rounds and scatter stage.
pub mod bench;

/// Command-line surface shared by the benchmark binaries.
pub mod cli;

/// Benchmark configuration.
pub mod config;

/// GPU runtime collaborator.
pub mod gpu;

/// Logging setup for the binaries.
pub mod logging;

/// Memory buffers and the verification pattern.
pub mod mem;

/// Bounded completion waiting.
pub mod poll;

/// Scatter register file layout.
pub mod regs;

/// Result reporting.
pub mod report;

pub mod prelude;

pub use accel::{Accelerator, Oper, RdmaSg};
pub use bench::{run_bench, run_sweep, BenchError};
pub use config::BenchConfig;
