//! Server side of the host fan-out baseline.
//!
//! Every received payload is copied chunk by chunk from host memory to one
//! buffer per GPU before it is written back to the client.

use anyhow::Context;
use clap::Parser;
use scatterbench::bench::scatter::ScatterPlan;
use scatterbench::cli::BenchArgs;
use scatterbench::prelude::*;
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
    let mut gpu = HostGpu::new(striping.width() as u32);
    gpu.set_device(0).context("Couldn't select GPU!")?;

    let dests = DestinationSet::allocate(
        &accel,
        striping.width(),
        striping.capacity_for(config.max_size as usize),
        Placement::PerDevice,
    )
    .context("Could not allocate memory for scatter buffers; exiting...")?;
    report::print_buffers(&dests.addrs());

    report::header("RDMA BENCHMARK: SERVER");
    let plan = ScatterPlan::new(&mut gpu, &dests, striping, config.scatter.copy_mode)?;
    let mut opts = RunOptions::from_config(&config).with_scatter(plan);
    if config.scatter.verify {
        opts = opts.with_verify(&dests, striping);
    }
    let reports = run_sweep(&accel, &mem, &config, &mut opts)?;
    drop(opts);
    report::print_reports(&reports);
    if let Some(path) = &args.output {
        report::write_json_lines(path, &reports)
            .with_context(|| format!("Could not write results to {}", path.display()))?;
    }

    dests.release(&accel)?;
    let summary = accel.finish()?;
    log::info!(
        "scatterbench: peer verified {} rounds, {} bytes, {} copies left in flight",
        summary.rounds,
        summary.bytes,
        gpu.in_flight()
    );
    Ok(())
}
