//! Server side of the hardware scatter benchmark.
//!
//! The vFPGA stripes every inbound write across the destination buffers
//! whose addresses are programmed into its registers; the server itself only
//! runs the plain benchmark loop.

use anyhow::Context;
use clap::Parser;
use scatterbench::cli::BenchArgs;
use scatterbench::prelude::*;
use scatterbench::regs::ScatterRegs;
use scatterbench::report;

fn main() -> anyhow::Result<()> {
    let args = BenchArgs::parse();
    scatterbench::logging::init(&args.logging)?;
    let config = args.to_config()?;
    report::print_parameters(&config);

    let accel = Loopback::new(LoopbackConfig::for_bench(&config));
    let mem = accel
        .init_rdma(config.max_size as usize, config.port)
        .context("Could not allocate memory; exiting...")?;

    let striping = config.striping();
    let dests = DestinationSet::allocate(
        &accel,
        striping.width(),
        striping.capacity_for(config.max_size as usize),
        Placement::SingleDevice(config.gpu_id),
    )
    .context("Could not allocate memory for scatter buffers; exiting...")?;
    report::print_buffers(&dests.addrs());
    ScatterRegs::new(striping.width() as u32).program(&accel, &dests.addrs())?;

    report::header("RDMA BENCHMARK: SERVER");
    let mut opts = RunOptions::from_config(&config);
    if config.scatter.verify {
        opts = opts.with_verify(&dests, striping);
    }
    let reports = run_sweep(&accel, &mem, &config, &mut opts)?;
    report::print_reports(&reports);
    if let Some(path) = &args.output {
        report::write_json_lines(path, &reports)
            .with_context(|| format!("Could not write results to {}", path.display()))?;
    }

    dests.release(&accel)?;
    let summary = accel.finish()?;
    log::info!(
        "scatterbench: peer verified {} rounds, {} bytes",
        summary.rounds,
        summary.bytes
    );
    Ok(())
}
