//! Admission control coupling insertion and sampling progress.

use crate::error::{ResoundError, Result};
use serde::{Deserialize, Serialize};

/// Configuration of a [`RateLimiter`].
///
/// The limiter tracks the quantity
/// `diff = (inserts - deletes) * samples_per_insert - samples` and only
/// admits operations that keep it inside `[min_diff, max_diff]`:
/// inserts push `diff` up by `samples_per_insert`, samples pull it down
/// by one. Until the table holds `min_size_to_sample` items inserts are
/// always admitted and samples never are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Average number of samples the limiter admits per insert.
    pub samples_per_insert: f64,

    /// Number of items that must be present before sampling starts.
    pub min_size_to_sample: i64,

    /// Lower bound on the insert/sample diff.
    pub min_diff: f64,

    /// Upper bound on the insert/sample diff.
    pub max_diff: f64,
}

impl Default for RateLimiterConfig {
    /// The default limiter only waits for the first item; beyond that
    /// neither side ever throttles the other.
    fn default() -> Self {
        Self::min_size(1)
    }
}

impl RateLimiterConfig {
    /// A limiter that only waits for the table to reach `min_size`
    /// items and never throttles beyond that.
    pub fn min_size(min_size: i64) -> Self {
        Self {
            samples_per_insert: 1.0,
            min_size_to_sample: min_size,
            min_diff: f64::NEG_INFINITY,
            max_diff: f64::INFINITY,
        }
    }

    /// Couples sampling to insertion at `samples_per_insert` with a
    /// tolerance of `error_buffer` samples around the target ratio.
    pub fn sample_to_insert_ratio(
        samples_per_insert: f64,
        min_size_to_sample: i64,
        error_buffer: f64,
    ) -> Self {
        let offset = samples_per_insert * min_size_to_sample as f64;
        Self {
            samples_per_insert,
            min_size_to_sample,
            min_diff: offset - error_buffer,
            max_diff: offset + error_buffer,
        }
    }

    /// A limiter for queue-like tables: every item is inserted and
    /// sampled exactly once, with at most `size` unsampled items.
    pub fn queue(size: i64) -> Self {
        Self {
            samples_per_insert: 1.0,
            min_size_to_sample: 1,
            min_diff: 0.0,
            max_diff: size as f64,
        }
    }

    /// Validates the configuration.
    pub fn check(&self) -> Result<()> {
        if !(self.samples_per_insert > 0.0) {
            return Err(ResoundError::InvalidArgument(format!(
                "samples_per_insert must be positive, got {}",
                self.samples_per_insert
            )));
        }
        if self.min_size_to_sample < 1 {
            return Err(ResoundError::InvalidArgument(format!(
                "min_size_to_sample must be at least 1, got {}",
                self.min_size_to_sample
            )));
        }
        if self.min_diff > self.max_diff {
            return Err(ResoundError::InvalidArgument(format!(
                "min_diff ({}) must not exceed max_diff ({})",
                self.min_diff, self.max_diff
            )));
        }
        Ok(())
    }
}

/// Serializable snapshot of a limiter, stored in checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterCheckpoint {
    /// The limiter configuration.
    pub config: RateLimiterConfig,
    /// Lifetime insert count.
    pub inserts: i64,
    /// Lifetime sample count.
    pub samples: i64,
    /// Lifetime delete count.
    pub deletes: i64,
}

/// The admission controller of one table.
///
/// The limiter holds no lock of its own: every call happens with the
/// owning table's mutex held, so the admission test and the counter
/// mutation that follows are atomic. The table waits on its condition
/// variable and re-tests after every counter change.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    inserts: i64,
    samples: i64,
    deletes: i64,
}

impl RateLimiter {
    /// Creates a limiter with zeroed counters.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            inserts: 0,
            samples: 0,
            deletes: 0,
        }
    }

    /// Restores a limiter from a checkpoint snapshot.
    pub fn from_checkpoint(cp: &RateLimiterCheckpoint) -> Self {
        Self {
            config: cp.config.clone(),
            inserts: cp.inserts,
            samples: cp.samples,
            deletes: cp.deletes,
        }
    }

    /// Whether `n` more inserts may proceed now.
    pub fn can_insert(&self, n: i64) -> bool {
        let size = self.inserts + n - self.deletes;
        if size <= self.config.min_size_to_sample {
            return true;
        }
        let diff = size as f64 * self.config.samples_per_insert - self.samples as f64;
        diff <= self.config.max_diff
    }

    /// Whether `n` more samples may proceed now.
    pub fn can_sample(&self, n: i64) -> bool {
        let size = self.inserts - self.deletes;
        if size < self.config.min_size_to_sample {
            return false;
        }
        let diff =
            size as f64 * self.config.samples_per_insert - (self.samples + n) as f64;
        diff >= self.config.min_diff
    }

    /// Records an admitted insert.
    pub fn insert(&mut self) {
        self.inserts += 1;
    }

    /// Records an admitted sample.
    pub fn sample(&mut self) {
        self.samples += 1;
    }

    /// Records a deletion or eviction.
    pub fn delete(&mut self) {
        self.deletes += 1;
    }

    /// Zeroes the counters, as on table reset.
    pub fn reset(&mut self) {
        self.inserts = 0;
        self.samples = 0;
        self.deletes = 0;
    }

    /// Lifetime insert count.
    pub fn num_inserts(&self) -> i64 {
        self.inserts
    }

    /// Lifetime sample count.
    pub fn num_samples(&self) -> i64 {
        self.samples
    }

    /// Lifetime delete count.
    pub fn num_deletes(&self) -> i64 {
        self.deletes
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Snapshot for checkpointing.
    pub fn checkpoint(&self) -> RateLimiterCheckpoint {
        RateLimiterCheckpoint {
            config: self.config.clone(),
            inserts: self.inserts,
            samples: self.samples,
            deletes: self.deletes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_size_gates_sampling_only() {
        let mut limiter = RateLimiter::new(RateLimiterConfig::min_size(2));
        assert!(limiter.can_insert(1));
        assert!(!limiter.can_sample(1));
        limiter.insert();
        assert!(!limiter.can_sample(1));
        limiter.insert();
        assert!(limiter.can_sample(1));
        // Unbounded diff: sampling never blocks once the size is there.
        for _ in 0..100 {
            assert!(limiter.can_sample(1));
            limiter.sample();
        }
    }

    #[test]
    fn one_insert_admits_spi_samples() {
        let config = RateLimiterConfig {
            samples_per_insert: 2.0,
            min_size_to_sample: 1,
            min_diff: 0.0,
            max_diff: 2.0,
        };
        let mut limiter = RateLimiter::new(config);
        assert!(!limiter.can_sample(1));
        assert!(limiter.can_insert(1));
        limiter.insert();

        assert!(limiter.can_sample(1));
        limiter.sample();
        assert!(limiter.can_sample(1));
        limiter.sample();
        assert!(!limiter.can_sample(1));

        limiter.insert();
        assert!(limiter.can_sample(1));
    }

    #[test]
    fn max_diff_throttles_inserts() {
        let config = RateLimiterConfig {
            samples_per_insert: 1.0,
            min_size_to_sample: 1,
            min_diff: 0.0,
            max_diff: 1.0,
        };
        let mut limiter = RateLimiter::new(config);
        limiter.insert();
        // A second unsampled insert would push the diff to 2 > max_diff.
        assert!(!limiter.can_insert(1));
        limiter.sample();
        assert!(limiter.can_insert(1));
    }

    #[test]
    fn deletes_shrink_the_effective_size() {
        let mut limiter = RateLimiter::new(RateLimiterConfig::min_size(1));
        limiter.insert();
        assert!(limiter.can_sample(1));
        limiter.delete();
        assert!(!limiter.can_sample(1));
    }

    #[test]
    fn config_validation() {
        assert!(RateLimiterConfig::min_size(1).check().is_ok());
        assert!(RateLimiterConfig {
            samples_per_insert: 0.0,
            ..RateLimiterConfig::min_size(1)
        }
        .check()
        .is_err());
        assert!(RateLimiterConfig {
            min_size_to_sample: 0,
            ..RateLimiterConfig::min_size(1)
        }
        .check()
        .is_err());
        assert!(RateLimiterConfig {
            min_diff: 2.0,
            max_diff: 1.0,
            ..RateLimiterConfig::min_size(1)
        }
        .check()
        .is_err());
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut limiter = RateLimiter::new(RateLimiterConfig::queue(10));
        limiter.insert();
        limiter.insert();
        limiter.sample();
        let restored = RateLimiter::from_checkpoint(&limiter.checkpoint());
        assert_eq!(restored.num_inserts(), 2);
        assert_eq!(restored.num_samples(), 1);
        assert_eq!(restored.num_deletes(), 0);
        assert_eq!(restored.config(), limiter.config());
    }
}
