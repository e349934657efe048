//! Chunks and cell references.
//!
//! A chunk is an immutable slab of one column's values over a contiguous
//! range of episode steps. Items never copy step data; they reference
//! cells, i.e. (chunk, row offset) pairs. Strong references from items
//! and from the chunker's keep-alive window determine a chunk's
//! lifetime; everything else holds it weakly and must upgrade before
//! use.

use crate::error::{ResoundError, Result};
use crate::tensor::{Tensor, TensorSpec};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};

/// Key of a [`Chunk`]; random 64-bit, generated by the chunker.
pub type ChunkKey = u64;

/// Key of an item; random 64-bit, generated by the writer.
pub type ItemKey = u64;

/// Identifier of a writer episode; random 64-bit per episode.
pub type EpisodeId = u64;

/// The serializable payload of a chunk, carried on the wire and in
/// checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    /// Chunk key.
    pub key: ChunkKey,
    /// Episode the rows belong to.
    pub episode_id: EpisodeId,
    /// Inclusive range `[start, end]` of episode steps covered.
    pub step_range: (usize, usize),
    /// Whether integer rows are stored as adjacent differences.
    pub delta_encoded: bool,
    /// The stacked rows, possibly delta-encoded.
    pub data: Tensor,
}

impl ChunkData {
    /// Number of step rows stored.
    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }
}

/// An immutable chunk of one column's rows.
#[derive(Debug)]
pub struct Chunk {
    data: ChunkData,
}

impl Chunk {
    /// Wraps finalized chunk data.
    pub fn new(data: ChunkData) -> Self {
        Self { data }
    }

    /// Chunk key.
    pub fn key(&self) -> ChunkKey {
        self.data.key
    }

    /// Episode of the rows.
    pub fn episode_id(&self) -> EpisodeId {
        self.data.episode_id
    }

    /// Number of step rows stored.
    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }

    /// The raw payload, as stored.
    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    /// The rows with delta encoding undone.
    pub fn rows(&self) -> Tensor {
        if self.data.delta_encoded {
            self.data.data.clone().delta_decode()
        } else {
            self.data.data.clone()
        }
    }
}

#[derive(Debug)]
struct CellRefInner {
    chunk_key: ChunkKey,
    offset: usize,
    episode_id: EpisodeId,
    episode_step: usize,
    spec: TensorSpec,
    // Filled in exactly once, when the chunker finalizes the run.
    chunk: Mutex<Option<Arc<Chunk>>>,
}

/// A strong reference to one cell: a row `offset` of a chunk.
///
/// Created by the chunker when a value is appended, before the owning
/// chunk exists; [`CellRef::chunk`] fails `FailedPrecondition` until the
/// chunker resolves the run. Cloning shares the underlying cell.
#[derive(Clone, Debug)]
pub struct CellRef {
    inner: Arc<CellRefInner>,
}

impl CellRef {
    /// Creates an unresolved reference to row `offset` of the chunk that
    /// will be published under `chunk_key`.
    pub fn new(
        chunk_key: ChunkKey,
        offset: usize,
        episode_id: EpisodeId,
        episode_step: usize,
        spec: TensorSpec,
    ) -> Self {
        Self {
            inner: Arc::new(CellRefInner {
                chunk_key,
                offset,
                episode_id,
                episode_step,
                spec,
                chunk: Mutex::new(None),
            }),
        }
    }

    /// Key of the chunk this cell belongs to.
    pub fn chunk_key(&self) -> ChunkKey {
        self.inner.chunk_key
    }

    /// Row offset within the chunk.
    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    /// Episode the cell belongs to.
    pub fn episode_id(&self) -> EpisodeId {
        self.inner.episode_id
    }

    /// Step within the episode.
    pub fn episode_step(&self) -> usize {
        self.inner.episode_step
    }

    /// Spec of the cell value as appended.
    pub fn spec(&self) -> &TensorSpec {
        &self.inner.spec
    }

    /// Whether the owning chunk has been finalized.
    pub fn is_resolved(&self) -> bool {
        self.inner.chunk.lock().unwrap().is_some()
    }

    /// The owning chunk, once finalized.
    pub fn chunk(&self) -> Result<Arc<Chunk>> {
        self.inner.chunk.lock().unwrap().clone().ok_or_else(|| {
            ResoundError::FailedPrecondition(format!(
                "chunk {} has not been finalized yet",
                self.inner.chunk_key
            ))
        })
    }

    /// Attaches the finalized chunk. Called by the chunker exactly once
    /// per reference.
    pub fn resolve(&self, chunk: Arc<Chunk>) {
        debug_assert_eq!(chunk.key(), self.inner.chunk_key);
        *self.inner.chunk.lock().unwrap() = Some(chunk);
    }

    /// A client-visible handle that expires with the keep-alive window.
    pub fn downgrade(&self) -> WeakCellRef {
        WeakCellRef {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A weak handle to a cell, as handed out to writer users.
///
/// The chunker only keeps the most recent `num_keep_alive_refs` cells
/// strongly referenced; once the window rolls past a cell, upgrading its
/// handle fails `FailedPrecondition`.
#[derive(Clone, Debug)]
pub struct WeakCellRef {
    inner: Weak<CellRefInner>,
}

impl WeakCellRef {
    /// Recovers the strong reference, failing if the keep-alive window
    /// has expired it.
    pub fn upgrade(&self) -> Result<CellRef> {
        self.inner
            .upgrade()
            .map(|inner| CellRef { inner })
            .ok_or_else(|| {
                ResoundError::FailedPrecondition(
                    "cell reference expired; the keep-alive window has moved past it".to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Dtype;
    use ndarray::{ArrayD, IxDyn};

    fn spec() -> TensorSpec {
        TensorSpec {
            dtype: Dtype::F32,
            shape: vec![],
        }
    }

    #[test]
    fn cell_ref_resolution() {
        let cell = CellRef::new(7, 2, 1, 2, spec());
        assert!(!cell.is_resolved());
        assert!(matches!(
            cell.chunk(),
            Err(ResoundError::FailedPrecondition(_))
        ));

        let chunk = Arc::new(Chunk::new(ChunkData {
            key: 7,
            episode_id: 1,
            step_range: (0, 2),
            delta_encoded: false,
            data: Tensor::F32(ArrayD::from_elem(IxDyn(&[3]), 0.5)),
        }));
        cell.resolve(chunk);
        assert!(cell.is_resolved());
        assert_eq!(cell.chunk().unwrap().num_rows(), 3);
    }

    #[test]
    fn weak_handle_expires_with_last_strong_ref() {
        let cell = CellRef::new(3, 0, 1, 0, spec());
        let weak = cell.downgrade();
        assert!(weak.upgrade().is_ok());
        drop(cell);
        assert!(matches!(
            weak.upgrade(),
            Err(ResoundError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn delta_encoded_chunk_decodes_on_read() {
        let rows = Tensor::I32(
            ArrayD::from_shape_vec(IxDyn(&[4]), vec![10, 12, 11, 20]).unwrap(),
        );
        let chunk = Chunk::new(ChunkData {
            key: 1,
            episode_id: 1,
            step_range: (0, 3),
            delta_encoded: true,
            data: rows.clone().delta_encode(),
        });
        assert_eq!(chunk.rows(), rows);
    }
}
