//! Items: prioritized references into chunked trajectories.

use crate::chunk::{Chunk, ChunkKey, ItemKey};
use crate::error::{ResoundError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A contiguous run of rows inside one chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkSlice {
    /// Chunk holding the rows.
    pub chunk_key: ChunkKey,
    /// First row of the run.
    pub offset: usize,
    /// Number of rows.
    pub length: usize,
}

/// One column of a trajectory: an ordered list of chunk slices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryColumn {
    /// The runs making up the column, in step order.
    pub slices: Vec<ChunkSlice>,
    /// If set and the column holds a single row, the leading axis is
    /// dropped when the column is materialized.
    pub squeeze: bool,
}

impl TrajectoryColumn {
    /// Total number of rows across all slices.
    pub fn num_rows(&self) -> usize {
        self.slices.iter().map(|s| s.length).sum()
    }
}

/// A trajectory: one [`TrajectoryColumn`] per column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlatTrajectory {
    /// The columns, in writer column order.
    pub columns: Vec<TrajectoryColumn>,
}

impl FlatTrajectory {
    /// Keys of every chunk referenced, deduplicated, in first-use order.
    pub fn chunk_keys(&self) -> Vec<ChunkKey> {
        let mut seen = Vec::new();
        for column in &self.columns {
            for slice in &column.slices {
                if !seen.contains(&slice.chunk_key) {
                    seen.push(slice.chunk_key);
                }
            }
        }
        seen
    }
}

/// The wire-level item: what a writer submits for insertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedItem {
    /// Random 64-bit item key.
    pub key: ItemKey,
    /// Destination table.
    pub table: String,
    /// Non-negative sampling priority.
    pub priority: f64,
    /// The referenced trajectory.
    pub trajectory: FlatTrajectory,
}

/// Materializes each trajectory column by joining the referenced chunk
/// rows, applying the squeeze flag.
///
/// Fails `NotFound` if a referenced chunk is missing from `chunks` and
/// `InvalidArgument` if a slice exceeds its chunk.
pub fn merge_columns(
    trajectory: &FlatTrajectory,
    chunks: &HashMap<ChunkKey, Arc<Chunk>>,
) -> Result<Vec<Tensor>> {
    let mut columns = Vec::with_capacity(trajectory.columns.len());
    for column in &trajectory.columns {
        let mut parts = Vec::with_capacity(column.slices.len());
        for slice in &column.slices {
            let chunk = chunks.get(&slice.chunk_key).ok_or_else(|| {
                ResoundError::NotFound(format!(
                    "chunk {} referenced by trajectory not present",
                    slice.chunk_key
                ))
            })?;
            parts.push(chunk.rows().slice_rows(slice.offset, slice.length)?);
        }
        let mut joined = Tensor::concat_rows(&parts)?;
        if column.squeeze {
            joined = joined.squeeze_leading()?;
        }
        columns.push(joined);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkData;
    use ndarray::{ArrayD, IxDyn};

    fn chunk(key: ChunkKey, rows: Vec<f32>) -> Arc<Chunk> {
        let n = rows.len();
        Arc::new(Chunk::new(ChunkData {
            key,
            episode_id: 1,
            step_range: (0, n - 1),
            delta_encoded: false,
            data: Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[n]), rows).unwrap()),
        }))
    }

    #[test]
    fn merge_joins_slices_across_chunks() {
        let chunks: HashMap<ChunkKey, Arc<Chunk>> = [
            (1, chunk(1, vec![0.0, 1.0, 2.0])),
            (2, chunk(2, vec![3.0, 4.0, 5.0])),
        ]
        .into_iter()
        .collect();
        let trajectory = FlatTrajectory {
            columns: vec![TrajectoryColumn {
                slices: vec![
                    ChunkSlice {
                        chunk_key: 1,
                        offset: 1,
                        length: 2,
                    },
                    ChunkSlice {
                        chunk_key: 2,
                        offset: 0,
                        length: 2,
                    },
                ],
                squeeze: false,
            }],
        };
        let columns = merge_columns(&trajectory, &chunks).unwrap();
        assert_eq!(
            columns[0],
            Tensor::F32(
                ArrayD::from_shape_vec(IxDyn(&[4]), vec![1.0, 2.0, 3.0, 4.0]).unwrap()
            )
        );
    }

    #[test]
    fn squeeze_drops_the_leading_axis() {
        let chunks: HashMap<ChunkKey, Arc<Chunk>> =
            [(1, chunk(1, vec![7.0, 8.0]))].into_iter().collect();
        let trajectory = FlatTrajectory {
            columns: vec![TrajectoryColumn {
                slices: vec![ChunkSlice {
                    chunk_key: 1,
                    offset: 1,
                    length: 1,
                }],
                squeeze: true,
            }],
        };
        let columns = merge_columns(&trajectory, &chunks).unwrap();
        assert_eq!(columns[0].shape(), &[] as &[usize]);
    }

    #[test]
    fn missing_chunk_is_not_found() {
        let trajectory = FlatTrajectory {
            columns: vec![TrajectoryColumn {
                slices: vec![ChunkSlice {
                    chunk_key: 99,
                    offset: 0,
                    length: 1,
                }],
                squeeze: false,
            }],
        };
        assert!(matches!(
            merge_columns(&trajectory, &HashMap::new()),
            Err(ResoundError::NotFound(_))
        ));
    }

    #[test]
    fn chunk_keys_deduplicate() {
        let trajectory = FlatTrajectory {
            columns: vec![
                TrajectoryColumn {
                    slices: vec![
                        ChunkSlice {
                            chunk_key: 5,
                            offset: 0,
                            length: 1,
                        },
                        ChunkSlice {
                            chunk_key: 6,
                            offset: 0,
                            length: 1,
                        },
                    ],
                    squeeze: false,
                },
                TrajectoryColumn {
                    slices: vec![ChunkSlice {
                        chunk_key: 5,
                        offset: 1,
                        length: 1,
                    }],
                    squeeze: false,
                },
            ],
        };
        assert_eq!(trajectory.chunk_keys(), vec![5, 6]);
    }
}
