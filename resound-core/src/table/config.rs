//! Configuration of [`Table`](super::Table).

use crate::error::{ResoundError, Result};
use crate::rate_limiter::RateLimiterConfig;
use crate::selector::SelectorOptions;
use crate::tensor::Signature;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

/// Configuration of [`Table`](super::Table).
///
/// # Examples
///
/// ```rust
/// use resound_core::{RateLimiterConfig, SelectorOptions, TableConfig};
///
/// let config = TableConfig::default()
///     .name("priority_replay")
///     .sampler(SelectorOptions::Prioritized { priority_exponent: 0.8 })
///     .remover(SelectorOptions::Fifo)
///     .max_size(100_000)
///     .rate_limiter(RateLimiterConfig::sample_to_insert_ratio(4.0, 1_000, 40.0));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Name the table is addressed by.
    pub name: String,

    /// Policy selecting which item a sample returns.
    pub sampler: SelectorOptions,

    /// Policy selecting the eviction victim once the table is full.
    pub remover: SelectorOptions,

    /// Maximum number of items held at any time.
    pub max_size: usize,

    /// Items sampled this many times are deleted right after the
    /// sample. Zero or negative means unlimited.
    pub max_times_sampled: i32,

    /// Admission control coupling inserts and samples.
    pub rate_limiter: RateLimiterConfig,

    /// Optional dtype/shape contract advertised to writers.
    pub signature: Option<Signature>,
}

impl Default for TableConfig {
    /// A uniformly sampled table of one million items with FIFO
    /// eviction and a non-blocking rate limiter.
    fn default() -> Self {
        Self {
            name: "replay".to_string(),
            sampler: SelectorOptions::Uniform,
            remover: SelectorOptions::Fifo,
            max_size: 1_000_000,
            max_times_sampled: 0,
            rate_limiter: RateLimiterConfig::default(),
            signature: None,
        }
    }
}

impl TableConfig {
    /// Sets the table name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the sampling policy.
    pub fn sampler(mut self, sampler: SelectorOptions) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sets the eviction policy.
    pub fn remover(mut self, remover: SelectorOptions) -> Self {
        self.remover = remover;
        self
    }

    /// Sets the capacity bound.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the per-item sample limit. Zero or negative is unlimited.
    pub fn max_times_sampled(mut self, max_times_sampled: i32) -> Self {
        self.max_times_sampled = max_times_sampled;
        self
    }

    /// Sets the rate limiter.
    pub fn rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Sets the signature advertised to writers.
    pub fn signature(mut self, signature: Option<Signature>) -> Self {
        self.signature = signature;
        self
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ResoundError::InvalidArgument(
                "table name must not be empty".to_string(),
            ));
        }
        if self.max_size == 0 {
            return Err(ResoundError::InvalidArgument(
                "max_size must be at least 1".to_string(),
            ));
        }
        self.rate_limiter.check()
    }

    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        serde_yaml::from_reader(rdr)
            .map_err(|e| ResoundError::InvalidArgument(format!("malformed table config: {}", e)))
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .map_err(|e| ResoundError::Internal(format!("serializing table config: {}", e)))?;
        let mut file = File::create(path)?;
        file.write_all(yaml.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TableConfig::default().check().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(TableConfig::default().max_size(0).check().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.yaml");
        let config = TableConfig::default()
            .name("queue")
            .sampler(SelectorOptions::Fifo)
            .remover(SelectorOptions::Fifo)
            .max_times_sampled(1)
            .rate_limiter(RateLimiterConfig::queue(100));
        config.save(&path).unwrap();
        assert_eq!(TableConfig::load(&path).unwrap(), config);
    }
}
