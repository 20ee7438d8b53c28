use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::bench::{Operation, RunStats};
use crate::config::BenchConfig;

const GIB: f64 = (1u64 << 30) as f64;

/// Result of one phase at one transfer size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub size: usize,
    pub phase: String,
    pub transfers: u32,
    pub runs: u32,
    pub operation: Operation,
    /// Round latencies in microseconds.
    pub mean_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub gib_per_sec: f64,
    /// Counter polls spent waiting for the peer.
    pub polls: u64,
}

impl PhaseReport {
    pub fn new(phase: &str, stats: &RunStats) -> Self {
        let total = stats.total().as_secs_f64();
        Self {
            size: stats.len,
            phase: phase.to_owned(),
            transfers: stats.transfers,
            runs: stats.runs,
            operation: stats.operation,
            mean_us: stats.mean().as_secs_f64() * 1e6,
            min_us: stats.min().as_secs_f64() * 1e6,
            max_us: stats.max().as_secs_f64() * 1e6,
            gib_per_sec: if total > 0.0 {
                stats.bytes() as f64 / GIB / total
            } else {
                0.0
            },
            polls: stats.polls,
        }
    }
}

/// Print a section header.
pub fn header(title: &str) {
    println!();
    println!("-- {} {}", title, "-".repeat(60usize.saturating_sub(title.len())));
}

/// Print the effective benchmark parameters.
pub fn print_parameters(config: &BenchConfig) {
    header("CLI PARAMETERS:");
    println!("Benchmark operation: {}", config.operation);
    println!("Number of test runs: {}", config.runs);
    println!("Starting transfer size: {}", config.min_size);
    println!("Ending transfer size: {}", config.max_size);
    println!();
}

/// Print the addresses of the scatter destinations.
pub fn print_buffers(addrs: &[u64]) {
    println!("Scatter buffer addresses:");
    for (k, addr) in addrs.iter().enumerate() {
        println!("Buffer {}: {:x}", k + 1, addr);
    }
}

/// Print the results as a table.
pub fn print_reports(reports: &[PhaseReport]) {
    println!(
        "{:>10} {:>12} {:>6} {:>6} {:>12} {:>12} {:>12} {:>10}",
        "size", "phase", "xfers", "runs", "mean(us)", "min(us)", "max(us)", "GiB/s"
    );
    for r in reports {
        println!(
            "{:>10} {:>12} {:>6} {:>6} {:>12.2} {:>12.2} {:>12.2} {:>10.3}",
            r.size, r.phase, r.transfers, r.runs, r.mean_us, r.min_us, r.max_us, r.gib_per_sec
        );
    }
}

/// Append the results to `path`, one JSON object per line.
pub fn write_json_lines(path: impl AsRef<Path>, reports: &[PhaseReport]) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    for r in reports {
        serde_json::to_writer(&mut out, r)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}
