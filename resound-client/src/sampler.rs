//! Client-side prefetching sampler.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;
use resound_core::chunk::{Chunk, ChunkKey, ItemKey};
use resound_core::error::{ResoundError, Result};
use resound_core::item::merge_columns;
use resound_core::service::{ReplayService, SampleEntry, SampleRequest};
use resound_core::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration of [`Sampler`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Number of worker threads, each owning one stream at a time.
    pub num_workers: usize,

    /// Bound on undelivered samples buffered per worker.
    pub max_in_flight_samples_per_worker: usize,

    /// Samples taken from one stream before rotating to a fresh one,
    /// which rebalances load across server replicas. `None` never
    /// rotates.
    pub max_samples_per_stream: Option<usize>,

    /// Total number of samples to fetch; `None` is unlimited.
    pub max_samples: Option<usize>,

    /// Items the server may take per table lock acquisition.
    pub flexible_batch_size: usize,

    /// Rate-limiter deadline per server batch; the resulting
    /// `DeadlineExceeded` carries the rate-limiter marker and is
    /// delivered unchanged.
    pub rate_limiter_timeout: Option<Duration>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            max_in_flight_samples_per_worker: 64,
            max_samples_per_stream: None,
            max_samples: None,
            flexible_batch_size: 8,
            rate_limiter_timeout: None,
        }
    }
}

impl SamplerConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let rdr = std::io::BufReader::new(file);
        serde_yaml::from_reader(rdr)
            .map_err(|e| ResoundError::InvalidArgument(format!("malformed sampler config: {}", e)))
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .map_err(|e| ResoundError::Internal(format!("serializing sampler config: {}", e)))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(ResoundError::InvalidArgument(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight_samples_per_worker == 0 {
            return Err(ResoundError::InvalidArgument(
                "max_in_flight_samples_per_worker must be at least 1".to_string(),
            ));
        }
        if self.flexible_batch_size == 0 {
            return Err(ResoundError::InvalidArgument(
                "flexible_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One sampled trajectory with its columns materialized.
#[derive(Clone, Debug)]
pub struct SampledTrajectory {
    /// Key of the sampled item.
    pub key: ItemKey,
    /// Probability of the draw.
    pub probability: f64,
    /// Table size at draw time.
    pub table_size: usize,
    /// Priority of the item at draw time.
    pub priority: f64,
    /// Joined column tensors, squeeze applied.
    pub columns: Vec<Tensor>,
}

/// One row of a trajectory, as produced by
/// [`Sampler::next_timestep`].
#[derive(Clone, Debug)]
pub struct TimestepSample {
    /// Key of the item the row belongs to.
    pub key: ItemKey,
    /// Row index within the trajectory.
    pub step: usize,
    /// Whether this is the trajectory's last row.
    pub end_of_trajectory: bool,
    /// One row per column, step axis removed.
    pub columns: Vec<Tensor>,
}

/// Prefetches samples from one table through worker-owned streams.
///
/// Workers pull entries into a bounded queue; `next_trajectory` and
/// `next_timestep` consume from it. Server errors are delivered
/// unchanged, so a rate-limiter timeout can be recognized with
/// [`resound_core::error::is_rate_limiter_timeout`] and treated as
/// end-of-sequence by iterator layers.
pub struct Sampler {
    deliveries: Option<Receiver<Result<SampledTrajectory>>>,
    workers: Vec<JoinHandle<()>>,
    current: Option<(SampledTrajectory, usize)>,
}

impl Sampler {
    /// Starts sampling `table` through `config.num_workers` streams.
    pub fn new(
        service: Arc<ReplayService>,
        table: impl Into<String>,
        config: SamplerConfig,
    ) -> Result<Self> {
        config.check()?;
        let table = table.into();
        let capacity = config.num_workers * config.max_in_flight_samples_per_worker;
        let (tx, rx) = bounded(capacity);
        let budget = config
            .max_samples
            .map(|n| Arc::new(AtomicI64::new(n as i64)));
        let workers = (0..config.num_workers)
            .map(|index| {
                let service = service.clone();
                let table = table.clone();
                let config = config.clone();
                let tx = tx.clone();
                let budget = budget.clone();
                thread::Builder::new()
                    .name(format!("resound-sampler-{}", index))
                    .spawn(move || run_worker(service, table, config, tx, budget))
                    .expect("failed to spawn sampler worker")
            })
            .collect();
        Ok(Self {
            deliveries: Some(rx),
            workers,
            current: None,
        })
    }

    /// The next prefetched trajectory. Blocks until one is available;
    /// fails `Cancelled` once the sampler is exhausted or closed.
    pub fn next_trajectory(&mut self) -> Result<SampledTrajectory> {
        self.current = None;
        let deliveries = self.deliveries.as_ref().ok_or_else(|| {
            ResoundError::Cancelled("sampler closed".to_string())
        })?;
        deliveries
            .recv()
            .map_err(|_| ResoundError::Cancelled("sampler exhausted".to_string()))?
    }

    /// The next row, fetching a new trajectory whenever the previous
    /// one is used up. Requires every column to carry a step axis of
    /// equal length.
    pub fn next_timestep(&mut self) -> Result<TimestepSample> {
        if self.current.is_none() {
            let trajectory = self.next_trajectory()?;
            let lengths: Vec<usize> = trajectory
                .columns
                .iter()
                .map(|c| {
                    if c.shape().is_empty() {
                        0
                    } else {
                        c.num_rows()
                    }
                })
                .collect();
            let length = lengths.first().copied().unwrap_or(0);
            if length == 0 || lengths.iter().any(|&l| l != length) {
                return Err(ResoundError::InvalidArgument(format!(
                    "trajectory columns have unequal or missing step axes: {:?}",
                    lengths
                )));
            }
            self.current = Some((trajectory, 0));
        }
        let (trajectory, cursor) = self.current.as_mut().expect("trajectory set above");
        let step = *cursor;
        let columns = trajectory
            .columns
            .iter()
            .map(|c| c.slice_rows(step, 1)?.squeeze_leading())
            .collect::<Result<Vec<_>>>()?;
        let length = trajectory.columns[0].num_rows();
        let sample = TimestepSample {
            key: trajectory.key,
            step,
            end_of_trajectory: step + 1 == length,
            columns,
        };
        *cursor += 1;
        if sample.end_of_trajectory {
            self.current = None;
        }
        Ok(sample)
    }

    /// Stops delivery. Workers notice as soon as their next send fails
    /// and wind down; samples still in flight are dropped.
    pub fn close(&mut self) {
        self.deliveries.take();
        self.current = None;
        // Detach the worker handles; a worker blocked on a stream exits
        // once that stream yields or fails.
        self.workers.clear();
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(
    service: Arc<ReplayService>,
    table: String,
    config: SamplerConfig,
    deliveries: Sender<Result<SampledTrajectory>>,
    budget: Option<Arc<AtomicI64>>,
) {
    loop {
        let per_stream = config
            .max_samples_per_stream
            .unwrap_or(usize::MAX)
            .min(i64::MAX as usize);
        let claimed = match &budget {
            Some(budget) => claim(budget, per_stream as i64),
            None => per_stream,
        };
        if claimed == 0 {
            debug!("sampler worker out of budget, exiting");
            return;
        }
        let stream = service.open_sample_stream(
            SampleRequest {
                table: table.clone(),
                num_samples: claimed,
                flexible_batch_size: config.flexible_batch_size,
                rate_limiter_timeout: config.rate_limiter_timeout,
            },
            config.max_in_flight_samples_per_worker,
        );
        while let Some(entry) = stream.recv() {
            let delivery = entry.and_then(materialize);
            let failed = delivery.is_err();
            if deliveries.send(delivery).is_err() {
                // Receiver gone: the sampler was closed.
                return;
            }
            if failed {
                return;
            }
        }
        // Stream exhausted its quota; rotate to a fresh one.
    }
}

// Takes up to `want` from the remaining total budget.
fn claim(budget: &AtomicI64, want: i64) -> usize {
    loop {
        let current = budget.load(Ordering::SeqCst);
        if current <= 0 {
            return 0;
        }
        let take = want.min(current);
        if budget
            .compare_exchange(current, current - take, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return take as usize;
        }
    }
}

fn materialize(entry: SampleEntry) -> Result<SampledTrajectory> {
    let chunks: HashMap<ChunkKey, Arc<Chunk>> = entry
        .chunks
        .into_iter()
        .map(|data| (data.key, Arc::new(Chunk::new(data))))
        .collect();
    let columns = merge_columns(&entry.item.trajectory, &chunks)?;
    Ok(SampledTrajectory {
        key: entry.item.key,
        probability: entry.probability,
        table_size: entry.table_size,
        priority: entry.item.priority,
        columns,
    })
}
