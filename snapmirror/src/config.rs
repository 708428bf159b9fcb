//! Configuration management for the mirroring engine.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`SNAPMIRROR__<SECTION>__<KEY>`). Every field has a default, so
//! running without a file is the common case.

use crate::scheduler::DistanceMetric;
use crate::utils::MirrorError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mirror: MirrorConfig,
    pub matcher: MatcherConfig,
    pub engine: EngineConfig,
    pub transfer: TransferConfig,
    pub volume: VolumeConfig,
    pub log: LogConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// How the distance between two labels is measured
    pub distance: DistanceMetric,

    /// Multiplier applied when the base is older than the snapshot being built
    pub forward_weight: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Relative size difference still considered "the same size" for partial matches
    pub size_tolerance: f64,

    /// Absolute floor for the size tolerance, in bytes
    pub min_tolerance_bytes: u64,

    /// Minimum share of the desired file that a partial match must cover
    pub min_partial_coverage: f64,

    /// Upper bound of the head/tail window hashed into a fingerprint
    pub fingerprint_window: u64,

    /// File name substrings excluded from matching (still transferred)
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Matches below this confidence are left to the transfer
    pub clone_threshold: f64,

    /// Byte alignment required by the clone primitive for partial ranges
    pub alignment: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// rsync executable
    pub rsync: String,

    /// Extra arguments appended after the built-in flags
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// btrfs executable
    pub btrfs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, compact)
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrency limit for fingerprinting and cloning within a step
    pub jobs: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            distance: DistanceMetric::Positions,
            forward_weight: 1,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            size_tolerance: 0.01,
            min_tolerance_bytes: 4096,
            min_partial_coverage: 0.5,
            fingerprint_window: 64 * 1024,
            exclude: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clone_threshold: 1.0,
            alignment: 4096,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync: "rsync".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            btrfs: "btrfs".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, MirrorError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SNAPMIRROR")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MirrorError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    #[cfg(test)]
    pub fn from_toml_str(content: &str) -> Result<Self, MirrorError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MirrorError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), MirrorError> {
        let invalid = |msg: String| Err(MirrorError::Configuration(msg));

        if self.mirror.forward_weight == 0 {
            return invalid("mirror.forward_weight must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.matcher.size_tolerance) {
            return invalid(format!(
                "matcher.size_tolerance must be in [0, 1), got {}",
                self.matcher.size_tolerance
            ));
        }
        if !(self.matcher.min_partial_coverage > 0.0 && self.matcher.min_partial_coverage <= 1.0) {
            return invalid(format!(
                "matcher.min_partial_coverage must be in (0, 1], got {}",
                self.matcher.min_partial_coverage
            ));
        }
        if self.matcher.fingerprint_window == 0 {
            return invalid("matcher.fingerprint_window must be at least 1".into());
        }
        if !(self.engine.clone_threshold > 0.0 && self.engine.clone_threshold <= 1.0) {
            return invalid(format!(
                "engine.clone_threshold must be in (0, 1], got {}",
                self.engine.clone_threshold
            ));
        }
        if !self.engine.alignment.is_power_of_two() {
            return invalid(format!(
                "engine.alignment must be a power of two, got {}",
                self.engine.alignment
            ));
        }
        if self.performance.jobs == 0 {
            return invalid("performance.jobs must be at least 1".into());
        }

        Ok(())
    }
}
