//! Per-column chunking of appended values.

use rand::random;
use resound_core::chunk::{CellRef, Chunk, ChunkData, ChunkKey, EpisodeId};
use resound_core::error::{ResoundError, Result};
use resound_core::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Chunking strategy of one writer column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChunkerOptions {
    /// A fixed chunk length.
    Constant {
        /// Rows per chunk before the buffer is finalized.
        max_chunk_length: usize,
        /// Number of most recent cell references kept alive.
        num_keep_alive_refs: usize,
    },
    /// Adapts the chunk length toward the typical item length.
    ///
    /// Small chunks waste metadata and round trips, large chunks ship
    /// rows an item does not span; tracking the observed item length
    /// balances the two.
    AutoTuned {
        /// Number of most recent cell references kept alive.
        num_keep_alive_refs: usize,
        /// EWMA weight given to each newly observed item length.
        throughput_weight: f64,
    },
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        ChunkerOptions::Constant {
            max_chunk_length: 100,
            num_keep_alive_refs: 100,
        }
    }
}

impl ChunkerOptions {
    /// The configured keep-alive window size.
    pub fn num_keep_alive_refs(&self) -> usize {
        match self {
            ChunkerOptions::Constant {
                num_keep_alive_refs,
                ..
            } => *num_keep_alive_refs,
            ChunkerOptions::AutoTuned {
                num_keep_alive_refs,
                ..
            } => *num_keep_alive_refs,
        }
    }

    /// Validates the options.
    pub fn check(&self) -> Result<()> {
        match self {
            ChunkerOptions::Constant {
                max_chunk_length,
                num_keep_alive_refs,
            } => {
                if *max_chunk_length == 0 || max_chunk_length > num_keep_alive_refs {
                    return Err(ResoundError::InvalidArgument(format!(
                        "max_chunk_length must be in 1..=num_keep_alive_refs \
                         ({}), got {}",
                        num_keep_alive_refs, max_chunk_length
                    )));
                }
            }
            ChunkerOptions::AutoTuned {
                num_keep_alive_refs,
                throughput_weight,
            } => {
                if *num_keep_alive_refs == 0 {
                    return Err(ResoundError::InvalidArgument(
                        "num_keep_alive_refs must be at least 1".to_string(),
                    ));
                }
                if !(*throughput_weight > 0.0 && *throughput_weight <= 1.0) {
                    return Err(ResoundError::InvalidArgument(format!(
                        "throughput_weight must be in (0, 1], got {}",
                        throughput_weight
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Rolling buffer of one column's appended values.
///
/// Values accumulate until `max_chunk_length` is reached or `flush` is
/// called, at which point the run is stacked into an immutable chunk
/// and every cell reference handed out for the run resolves to it. The
/// keep-alive ring retains the newest `num_keep_alive_refs` references
/// so items can still be formed against recent steps; older references
/// expire.
pub struct Chunker {
    options: ChunkerOptions,
    max_chunk_length: usize,
    num_keep_alive_refs: usize,
    delta_encode: bool,
    episode_id: EpisodeId,
    buffer: Vec<Tensor>,
    buffer_start_step: usize,
    buffer_last_step: usize,
    active_chunk_key: ChunkKey,
    pending: Vec<CellRef>,
    keep_alive: VecDeque<CellRef>,
    item_length_ewma: f64,
}

impl Chunker {
    /// Creates a chunker for one column of `episode_id`.
    pub fn new(options: ChunkerOptions, episode_id: EpisodeId, delta_encode: bool) -> Result<Self> {
        options.check()?;
        let num_keep_alive_refs = options.num_keep_alive_refs();
        let max_chunk_length = match &options {
            ChunkerOptions::Constant {
                max_chunk_length, ..
            } => *max_chunk_length,
            // Starts at the window bound and adapts as items arrive.
            ChunkerOptions::AutoTuned {
                num_keep_alive_refs,
                ..
            } => *num_keep_alive_refs,
        };
        Ok(Self {
            options,
            max_chunk_length,
            num_keep_alive_refs,
            delta_encode,
            episode_id,
            buffer: Vec::new(),
            buffer_start_step: 0,
            buffer_last_step: 0,
            active_chunk_key: random(),
            pending: Vec::new(),
            keep_alive: VecDeque::new(),
            item_length_ewma: 0.0,
        })
    }

    /// Appends one step value, returning its cell reference. The
    /// reference stays unresolved until the run is finalized.
    pub fn append(&mut self, value: Tensor, episode_step: usize) -> Result<CellRef> {
        if let Some(first) = self.buffer.first() {
            if value.dtype() != first.dtype() || value.shape() != first.shape() {
                return Err(ResoundError::InvalidArgument(format!(
                    "appended value has dtype/shape {}/{:?} but the open chunk \
                     holds {}/{:?}",
                    value.dtype(),
                    value.shape(),
                    first.dtype(),
                    first.shape()
                )));
            }
        }
        if self.buffer.is_empty() {
            self.active_chunk_key = random();
            self.buffer_start_step = episode_step;
        }
        self.buffer_last_step = episode_step;
        let cell = CellRef::new(
            self.active_chunk_key,
            self.buffer.len(),
            self.episode_id,
            episode_step,
            value.spec(),
        );
        self.buffer.push(value);
        self.pending.push(cell.clone());
        self.keep_alive.push_back(cell.clone());
        while self.keep_alive.len() > self.num_keep_alive_refs {
            self.keep_alive.pop_front();
        }
        if self.buffer.len() >= self.max_chunk_length {
            self.flush()?;
        }
        Ok(cell)
    }

    /// Finalizes the open run, resolving its cell references. Returns
    /// the new chunk, or `None` when the buffer was empty.
    pub fn flush(&mut self) -> Result<Option<Arc<Chunk>>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let stacked = Tensor::stack_rows(&self.buffer)?;
        let delta_encoded = self.delta_encode && stacked.dtype().is_integer();
        let data = ChunkData {
            key: self.active_chunk_key,
            episode_id: self.episode_id,
            step_range: (self.buffer_start_step, self.buffer_last_step),
            delta_encoded,
            data: if delta_encoded {
                stacked.delta_encode()
            } else {
                stacked
            },
        };
        let chunk = Arc::new(Chunk::new(data));
        for cell in self.pending.drain(..) {
            cell.resolve(chunk.clone());
        }
        self.buffer.clear();
        Ok(Some(chunk))
    }

    /// Feeds back the column length of a created item; auto-tuned
    /// chunkers move their chunk length toward the running average.
    pub fn on_item_created(&mut self, column_length: usize) {
        if let ChunkerOptions::AutoTuned {
            num_keep_alive_refs,
            throughput_weight,
        } = &self.options
        {
            self.item_length_ewma = if self.item_length_ewma == 0.0 {
                column_length as f64
            } else {
                throughput_weight * column_length as f64
                    + (1.0 - throughput_weight) * self.item_length_ewma
            };
            self.max_chunk_length =
                (self.item_length_ewma.round() as usize).clamp(1, *num_keep_alive_refs);
        }
    }

    /// Drops the open run and moves to `episode_id`. With `clear_refs`
    /// the keep-alive ring is emptied, expiring all handed-out
    /// references.
    pub fn reset(&mut self, episode_id: EpisodeId, clear_refs: bool) {
        self.buffer.clear();
        self.pending.clear();
        if clear_refs {
            self.keep_alive.clear();
        }
        self.episode_id = episode_id;
    }

    /// Key of the open run's chunk, if a run is open.
    pub fn active_chunk_key(&self) -> Option<ChunkKey> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.active_chunk_key)
        }
    }

    /// Current chunk length target.
    pub fn max_chunk_length(&self) -> usize {
        self.max_chunk_length
    }

    /// Number of rows in the open run.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Keys of every chunk the keep-alive window still references.
    pub fn live_chunk_keys(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        self.keep_alive.iter().map(|cell| cell.chunk_key())
    }
}
