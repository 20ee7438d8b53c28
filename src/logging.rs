use std::io::IsTerminal;

use clap::{Args, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing::{dispatcher, Dispatch};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Args)]
pub struct LoggingOpts {
    /// Default log level. Directives in RUST_LOG take priority.
    #[arg(long = "log", default_value = "info")]
    pub log_level: LevelFilter,

    #[arg(long, value_enum, default_value = "auto")]
    pub log_color: LogColor,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::INFO,
            log_color: LogColor::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

/// Install a global subscriber writing to stderr and route `log` records
/// through it.
pub fn init(opts: &LoggingOpts) -> Result<(), anyhow::Error> {
    let color = match opts.log_color {
        LogColor::Auto => std::io::stderr().is_terminal(),
        LogColor::Always => true,
        LogColor::Never => false,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(opts.log_level.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color)
        .finish();
    dispatcher::set_global_default(Dispatch::new(subscriber))?;

    // Must come after the subscriber so that its max level is known.
    tracing_log::LogTracer::builder()
        .with_max_level(LevelFilter::current().as_log())
        .init()?;
    Ok(())
}
