use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::Parser;

use crate::bench::scatter::CopyMode;
use crate::config::{BenchConfig, ConfigError};
use crate::logging::LoggingOpts;

/// Command line of the benchmark servers.
///
/// Every benchmark parameter is optional here: unset flags fall back to the
/// configuration file given with `--config`, then to the built-in defaults.
#[derive(Debug, Parser)]
#[command(about = "RDMA scatter benchmark, server side")]
pub struct BenchArgs {
    /// Benchmark operation: READ(0) or WRITE(1)
    #[arg(short = 'o', long, value_parser = BoolishValueParser::new())]
    pub operation: Option<bool>,

    /// Number of times to repeat the test
    #[arg(short = 'r', long)]
    pub runs: Option<u32>,

    /// Starting (minimum) transfer size
    #[arg(short = 'x', long = "min_size")]
    pub min_size: Option<u32>,

    /// Ending (maximum) transfer size
    #[arg(short = 'X', long = "max_size")]
    pub max_size: Option<u32>,

    /// TOML file with a [bench] table
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Give up waiting for completions after this many milliseconds (0 waits forever)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Scatter chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Number of scatter destinations
    #[arg(long)]
    pub targets: Option<usize>,

    /// How the host fan-out waits for its GPU copies
    #[arg(long, value_enum)]
    pub copy_mode: Option<CopyMode>,

    /// Skip the integrity check after write runs
    #[arg(long)]
    pub no_validate: bool,

    /// Check the scatter destinations after write runs
    #[arg(long)]
    pub verify_scatter: bool,

    /// Append one JSON object per result to this file
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOpts,
}

impl BenchArgs {
    /// Build the effective configuration: file (or defaults), then flags.
    pub fn to_config(&self) -> Result<BenchConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::load_toml(path)?,
            None => BenchConfig::default(),
        };

        if let Some(write) = self.operation {
            config.operation = write.into();
        }
        if let Some(runs) = self.runs {
            config.runs = runs;
        }
        if let Some(min_size) = self.min_size {
            config.min_size = min_size;
        }
        if let Some(max_size) = self.max_size {
            config.max_size = max_size;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.scatter.chunk_size = chunk_size;
        }
        if let Some(targets) = self.targets {
            config.scatter.targets = targets;
        }
        if let Some(mode) = self.copy_mode {
            config.scatter.copy_mode = mode;
        }
        if self.no_validate {
            config.validate = false;
        }
        if self.verify_scatter {
            config.scatter.verify = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing::level_filters::LevelFilter;

    use super::*;
    use crate::bench::Operation;

    fn parse(args: &[&str]) -> BenchArgs {
        BenchArgs::try_parse_from(std::iter::once("scatter_server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.to_config().unwrap(), BenchConfig::default());
        assert_eq!(args.logging.log_level, LevelFilter::INFO);
    }

    #[test]
    fn test_short_flags() {
        let config = parse(&["-o", "1", "-r", "5", "-x", "128", "-X", "4096"])
            .to_config()
            .unwrap();
        assert_eq!(config.operation, Operation::Write);
        assert_eq!(config.runs, 5);
        assert_eq!(config.min_size, 128);
        assert_eq!(config.max_size, 4096);

        for value in ["false", "0"] {
            let config = parse(&["--operation", value]).to_config().unwrap();
            assert_eq!(config.operation, Operation::Read);
        }
        let config = parse(&["--operation", "true"]).to_config().unwrap();
        assert_eq!(config.operation, Operation::Write);
    }

    #[test]
    fn test_long_flags() {
        let args = parse(&[
            "--min_size",
            "256",
            "--timeout-ms",
            "0",
            "--chunk-size",
            "1024",
            "--targets",
            "2",
            "--copy-mode",
            "event-poll",
            "--no-validate",
            "--verify-scatter",
            "--log",
            "debug",
        ]);
        assert_eq!(args.logging.log_level, LevelFilter::DEBUG);

        let config = args.to_config().unwrap();
        assert_eq!(config.min_size, 256);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.scatter.chunk_size, 1024);
        assert_eq!(config.scatter.targets, 2);
        assert_eq!(config.scatter.copy_mode, CopyMode::EventPoll);
        assert!(!config.validate);
        assert!(config.scatter.verify);
    }

    #[test]
    fn test_flags_override_file() {
        let path = std::env::temp_dir().join(format!("scatterbench-{}.toml", std::process::id()));
        std::fs::write(&path, "[bench]\nruns = 9\nmin_size = 512\ntimeout_ms = 250\n").unwrap();

        let config = parse(&["-c", path.to_str().unwrap(), "-r", "3"])
            .to_config()
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.runs, 3);
        assert_eq!(config.min_size, 512);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(BenchArgs::try_parse_from(["scatter_server", "-o", "maybe"]).is_err());
        assert!(BenchArgs::try_parse_from(["scatter_server", "--copy-mode", "lazy"]).is_err());
        assert!(matches!(
            parse(&["-x", "0"]).to_config(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse(&["--targets", "0"]).to_config(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
