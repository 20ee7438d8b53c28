//! The `scatterbench` prelude.
//!
//! The purpose of this module is to alleviate imports of the types needed to
//! set up and run a benchmark.

pub use crate::accel::{
    AccelError, Accelerator, AllocSpec, AllocType, Loopback, LoopbackConfig, Oper, RdmaSg,
    DEF_PORT,
};
pub use crate::bench::scatter::{CopyMode, DestinationSet, Placement, Striping};
pub use crate::bench::{run_bench, run_sweep, BenchError, Operation, RunOptions, IS_CLIENT};
pub use crate::config::BenchConfig;
pub use crate::gpu::{GpuRuntime, HostGpu};
pub use crate::mem::Buffer;
pub use crate::report::print_reports;
