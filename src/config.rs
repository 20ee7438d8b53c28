use std::io::prelude::*;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accel::DEF_PORT;
use crate::bench::scatter::{CopyMode, Striping};
use crate::bench::{Operation, Phase};

/// Default values of the benchmark parameters.
pub mod defaults {
    /// Rounds per size and phase.
    pub const N_RUNS: u32 = 50;
    pub const MIN_SIZE: u32 = 64;
    pub const MAX_SIZE: u32 = 1024 * 1024;
    /// Bound on completion waits; zero waits forever.
    pub const TIMEOUT_MS: u64 = 10_000;
    pub const TARGETS: usize = 4;
    pub const CHUNK_SIZE: usize = 4096;
    pub const GPU_ID: u32 = 0;
}

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} configuration not found")]
    MissingSection(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scatter stage parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScatterConfig {
    /// Number of destination buffers.
    pub targets: usize,
    pub chunk_size: usize,
    /// How the host fan-out waits for its copies.
    pub copy_mode: CopyMode,
    /// Check the destinations after write runs.
    pub verify: bool,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            targets: defaults::TARGETS,
            chunk_size: defaults::CHUNK_SIZE,
            copy_mode: CopyMode::default(),
            verify: false,
        }
    }
}

/// Benchmark parameters, fixed for the whole run.
///
/// Loaded from the `[bench]` table of a TOML file, e.g.:
///
/// ```toml
/// [bench]
/// operation = "write"
/// runs = 100
/// min_size = 4096
///
/// [[bench.phases]]
/// name = "latency"
/// transfers = 1
///
/// [bench.scatter]
/// targets = 4
/// copy_mode = "event-poll"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub operation: Operation,
    /// Rounds per size and phase.
    pub runs: u32,
    pub min_size: u32,
    pub max_size: u32,
    /// Phases run for every size, in order.
    pub phases: Vec<Phase>,
    /// Bound on completion waits in milliseconds; zero waits forever.
    pub timeout_ms: u64,
    /// Check the verification pattern after write runs.
    pub validate: bool,
    pub port: u16,
    /// GPU holding the hardware scatter destinations.
    pub gpu_id: u32,
    pub scatter: ScatterConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            operation: Operation::default(),
            runs: defaults::N_RUNS,
            min_size: defaults::MIN_SIZE,
            max_size: defaults::MAX_SIZE,
            phases: Phase::defaults(),
            timeout_ms: defaults::TIMEOUT_MS,
            validate: true,
            port: DEF_PORT,
            gpu_id: defaults::GPU_ID,
            scatter: ScatterConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Name of the TOML table holding the configuration.
    pub const SECTION: &'static str = "bench";

    pub fn load_toml(config_file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut file = std::fs::File::open(config_file)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let toml: toml::Value = toml::from_str(toml_str)?;
        let section = match toml.get(Self::SECTION) {
            Some(t) if t.is_table() => t.clone(),
            _ => return Err(ConfigError::MissingSection(Self::SECTION)),
        };
        Ok(section.try_into()?)
    }

    /// The completion wait bound, `None` meaning unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Striping of the scatter stage.
    ///
    /// # Panics
    ///
    /// Panic if the configuration does not [validate](BenchConfig::validate).
    pub fn striping(&self) -> Striping {
        Striping::new(self.scatter.chunk_size, self.scatter.targets)
    }

    /// Reject parameters the benchmark cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.min_size == 0 {
            return invalid("min_size must be positive".into());
        }
        if self.min_size % 4 != 0 {
            return invalid(format!(
                "min_size {} is not a multiple of 4 bytes",
                self.min_size
            ));
        }
        if self.runs == 0 {
            return invalid("runs must be positive".into());
        }
        if self.phases.is_empty() {
            return invalid("no phases configured".into());
        }
        if let Some(p) = self.phases.iter().find(|p| p.transfers == 0) {
            return invalid(format!("phase {} has zero transfers", p.name));
        }
        if self.scatter.targets == 0 {
            return invalid("scatter needs at least one target".into());
        }
        if self.scatter.chunk_size == 0 {
            return invalid("scatter chunk_size must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.runs, 50);
        assert_eq!(config.min_size, 64);
        assert_eq!(config.max_size, 1 << 20);
        assert_eq!(config.operation, Operation::Read);
        assert_eq!(config.phases, vec![Phase::throughput(), Phase::latency()]);
        assert_eq!(config.port, 18488);
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.striping(), Striping::new(4096, 4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = BenchConfig::from_toml_str(
            r#"
            [bench]
            operation = "write"
            runs = 7
            min_size = 4096
            timeout_ms = 0

            [[bench.phases]]
            name = "latency"
            transfers = 1

            [bench.scatter]
            targets = 2
            copy_mode = "event-poll"
            "#,
        )
        .unwrap();
        assert_eq!(config.operation, Operation::Write);
        assert_eq!(config.runs, 7);
        assert_eq!(config.min_size, 4096);
        assert_eq!(config.max_size, defaults::MAX_SIZE);
        assert_eq!(config.phases, vec![Phase::latency()]);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.scatter.targets, 2);
        assert_eq!(config.scatter.chunk_size, 4096);
        assert_eq!(config.scatter.copy_mode, CopyMode::EventPoll);
    }

    #[test]
    fn test_toml_errors() {
        assert!(matches!(
            BenchConfig::from_toml_str("[other]\nruns = 1\n"),
            Err(ConfigError::MissingSection("bench"))
        ));
        assert!(matches!(
            BenchConfig::from_toml_str("[bench]\nrunz = 1\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BenchConfig::from_toml_str("[bench\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BenchConfig::load_toml("/nonexistent/scatterbench.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validate() {
        let bad = [
            BenchConfig {
                min_size: 0,
                ..Default::default()
            },
            BenchConfig {
                min_size: 66,
                ..Default::default()
            },
            BenchConfig {
                runs: 0,
                ..Default::default()
            },
            BenchConfig {
                phases: vec![],
                ..Default::default()
            },
            BenchConfig {
                phases: vec![Phase::new("idle", 0)],
                ..Default::default()
            },
            BenchConfig {
                scatter: ScatterConfig {
                    targets: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            BenchConfig {
                scatter: ScatterConfig {
                    chunk_size: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{config:?}"
            );
        }

        // An empty sweep is fine.
        let config = BenchConfig {
            min_size: 256,
            max_size: 64,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
