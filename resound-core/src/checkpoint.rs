//! Best-effort checkpointing of tables and their chunks.
//!
//! A checkpoint is a timestamped directory under the checkpointer's
//! root:
//!
//! ```text
//! <root>/
//!   <timestamp>/
//!     tables.bin
//!     chunks.bin
//!     DONE
//! ```
//!
//! `DONE` is an empty sentinel written last; a directory without it is
//! an interrupted save and is never loaded. The newest checkpoint is the
//! lexicographically greatest complete directory. Chunks referenced by
//! several tables are stored once.

use crate::chunk::{Chunk, ChunkData, ChunkKey, ItemKey};
use crate::chunk_store::ChunkStore;
use crate::error::{ResoundError, Result};
use crate::item::FlatTrajectory;
use crate::rate_limiter::RateLimiterCheckpoint;
use crate::selector::SelectorOptions;
use crate::table::Table;
use crate::tensor::Signature;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TABLES_FILE: &str = "tables.bin";
const CHUNKS_FILE: &str = "chunks.bin";
const DONE_FILE: &str = "DONE";

/// Serializable state of one stored item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemCheckpoint {
    /// Item key.
    pub key: ItemKey,
    /// Sampling priority.
    pub priority: f64,
    /// How often the item had been sampled.
    pub times_sampled: u32,
    /// The referenced trajectory.
    pub trajectory: FlatTrajectory,
}

/// Serializable state of one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    /// Table name.
    pub name: String,
    /// Capacity bound.
    pub max_size: usize,
    /// Per-item sample limit.
    pub max_times_sampled: i32,
    /// Sampler to rebuild.
    pub sampler: SelectorOptions,
    /// Remover to rebuild.
    pub remover: SelectorOptions,
    /// Limiter configuration and counters.
    pub rate_limiter: RateLimiterCheckpoint,
    /// Signature advertised to writers.
    pub signature: Option<Signature>,
    /// The stored items, sorted by key.
    pub items: Vec<ItemCheckpoint>,
}

/// Saves and restores table state below a root directory.
pub struct Checkpointer {
    root_dir: PathBuf,
    fallback_checkpoint_path: Option<PathBuf>,
}

impl Checkpointer {
    /// Creates a checkpointer rooted at `root_dir`. The directory is
    /// created on the first save.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            fallback_checkpoint_path: None,
        }
    }

    /// Sets a checkpoint to load when the root holds none, typically
    /// the final checkpoint of a previous experiment.
    pub fn with_fallback(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback_checkpoint_path = Some(path.into());
        self
    }

    /// Saves a checkpoint of `tables`, returning its directory.
    ///
    /// After a successful save all but the `keep_latest` newest
    /// complete checkpoints are deleted.
    pub fn save(&self, tables: &[Arc<Table>], keep_latest: usize) -> Result<PathBuf> {
        fs::create_dir_all(&self.root_dir)?;

        let mut table_cps = Vec::with_capacity(tables.len());
        // Strong references pin every chunk until the files are on disk.
        let mut chunks: HashMap<ChunkKey, Arc<Chunk>> = HashMap::new();
        for table in tables {
            let (cp, table_chunks) = table.checkpoint();
            for chunk in table_chunks {
                chunks.entry(chunk.key()).or_insert(chunk);
            }
            table_cps.push(cp);
        }
        let mut chunk_data: Vec<ChunkData> =
            chunks.values().map(|c| c.data().clone()).collect();
        chunk_data.sort_by_key(|c| c.key);

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%9fZ").to_string();
        let dir = self.root_dir.join(timestamp);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(TABLES_FILE), encode(&table_cps)?)?;
        fs::write(dir.join(CHUNKS_FILE), encode(&chunk_data)?)?;
        fs::write(dir.join(DONE_FILE), b"")?;
        info!(
            "saved checkpoint of {} table(s) and {} chunk(s) to {}",
            table_cps.len(),
            chunk_data.len(),
            dir.display()
        );

        self.prune(keep_latest)?;
        Ok(dir)
    }

    /// Loads the checkpoint at `path`, interning its chunks into
    /// `chunk_store` and rebuilding its tables.
    pub fn load(&self, path: &Path, chunk_store: &ChunkStore) -> Result<Vec<Arc<Table>>> {
        if !path.join(DONE_FILE).exists() {
            return Err(ResoundError::FailedPrecondition(format!(
                "checkpoint {} is incomplete (no DONE sentinel)",
                path.display()
            )));
        }
        let chunk_data: Vec<ChunkData> = decode(&fs::read(path.join(CHUNKS_FILE))?)?;
        // Keep the chunks alive until the rebuilt items reference them.
        let pinned: Vec<Arc<Chunk>> = chunk_data
            .into_iter()
            .map(|data| chunk_store.insert(data))
            .collect();

        let table_cps: Vec<TableCheckpoint> = decode(&fs::read(path.join(TABLES_FILE))?)?;
        let tables = table_cps
            .into_iter()
            .map(|cp| Table::from_checkpoint(cp, chunk_store).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "loaded checkpoint {} with {} table(s) and {} chunk(s)",
            path.display(),
            tables.len(),
            pinned.len()
        );
        Ok(tables)
    }

    /// Loads the newest complete checkpoint under the root. Fails
    /// `NotFound` when there is none.
    pub fn load_latest(&self, chunk_store: &ChunkStore) -> Result<Vec<Arc<Table>>> {
        let latest = self
            .complete_checkpoints()?
            .into_iter()
            .last()
            .ok_or_else(|| {
                ResoundError::NotFound(format!(
                    "no complete checkpoint under {}",
                    self.root_dir.display()
                ))
            })?;
        self.load(&latest, chunk_store)
    }

    /// Loads the fallback checkpoint. Fails `NotFound` when none was
    /// configured.
    pub fn load_fallback(&self, chunk_store: &ChunkStore) -> Result<Vec<Arc<Table>>> {
        let path = self.fallback_checkpoint_path.as_ref().ok_or_else(|| {
            ResoundError::NotFound("no fallback checkpoint configured".to_string())
        })?;
        self.load(path, chunk_store)
    }

    // Complete checkpoint directories, sorted oldest first.
    fn complete_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        if !self.root_dir.exists() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.is_dir() && path.join(DONE_FILE).exists() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn prune(&self, keep_latest: usize) -> Result<()> {
        let complete = self.complete_checkpoints()?;
        if complete.len() <= keep_latest {
            return Ok(());
        }
        let excess = complete.len() - keep_latest;
        for dir in &complete[..excess] {
            info!("pruning old checkpoint {}", dir.display());
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ResoundError::Internal(format!("encoding checkpoint: {}", e)))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| ResoundError::Internal(format!("corrupt checkpoint: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ChunkSlice, PrioritizedItem, TrajectoryColumn};
    use crate::rate_limiter::RateLimiterConfig;
    use crate::table::{TableConfig, TableItem};
    use crate::tensor::Tensor;
    use ndarray::{ArrayD, IxDyn};

    fn chunk_data(key: ChunkKey, rows: Vec<f32>) -> ChunkData {
        let n = rows.len();
        ChunkData {
            key,
            episode_id: 7,
            step_range: (0, n - 1),
            delta_encoded: false,
            data: Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[n]), rows).unwrap()),
        }
    }

    fn table_with_items(store: &ChunkStore) -> Arc<Table> {
        let table = Arc::new(
            Table::new(
                TableConfig::default()
                    .name("replay")
                    .sampler(SelectorOptions::Prioritized {
                        priority_exponent: 1.0,
                    })
                    .remover(SelectorOptions::Fifo)
                    .max_size(100)
                    .rate_limiter(RateLimiterConfig::min_size(1)),
            )
            .unwrap(),
        );
        for key in 0..3u64 {
            let chunk = store.insert(chunk_data(100 + key, vec![key as f32, 1.0]));
            let item = TableItem::new(
                PrioritizedItem {
                    key,
                    table: "replay".to_string(),
                    priority: (key + 1) as f64,
                    trajectory: FlatTrajectory {
                        columns: vec![TrajectoryColumn {
                            slices: vec![ChunkSlice {
                                chunk_key: chunk.key(),
                                offset: 0,
                                length: 2,
                            }],
                            squeeze: false,
                        }],
                    },
                },
                vec![chunk],
            );
            table.insert_or_assign(item, None).unwrap();
        }
        table
    }

    #[test]
    fn save_then_load_reconstructs_state() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        let store = ChunkStore::new();
        let table = table_with_items(&store);
        table.sample(None).unwrap();
        let info_before = table.info();

        checkpointer.save(&[table], 1).unwrap();

        let fresh_store = ChunkStore::new();
        let restored = checkpointer.load_latest(&fresh_store).unwrap();
        assert_eq!(restored.len(), 1);
        let info_after = restored[0].info();
        assert_eq!(info_after.name, info_before.name);
        assert_eq!(info_after.size, info_before.size);
        assert_eq!(info_after.num_inserts, info_before.num_inserts);
        assert_eq!(info_after.num_samples, info_before.num_samples);
        assert_eq!(info_after.sampler_options, info_before.sampler_options);

        // Restored items resolve their chunks from the fresh store.
        let sampled = restored[0].sample(None).unwrap();
        assert_eq!(sampled.chunks.len(), 1);
        assert_eq!(sampled.chunks[0].num_rows(), 2);
    }

    #[test]
    fn load_latest_prefers_newest_and_skips_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        let store = ChunkStore::new();
        let table = table_with_items(&store);

        checkpointer.save(&[table.clone()], 10).unwrap();
        table.mutate_items(&[], &[0]).unwrap();
        let newest = checkpointer.save(&[table], 10).unwrap();

        // An interrupted save (no DONE) that sorts after everything.
        let broken = dir.path().join("99991231T235959000000000Z");
        fs::create_dir_all(&broken).unwrap();

        let fresh_store = ChunkStore::new();
        let restored = checkpointer.load_latest(&fresh_store).unwrap();
        assert_eq!(restored[0].size(), 2);
        assert!(newest.join(DONE_FILE).exists());
    }

    #[test]
    fn prune_keeps_only_latest() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        let store = ChunkStore::new();
        let table = table_with_items(&store);

        checkpointer.save(&[table.clone()], 10).unwrap();
        checkpointer.save(&[table.clone()], 10).unwrap();
        let kept = checkpointer.save(&[table], 1).unwrap();

        let complete = checkpointer.complete_checkpoints().unwrap();
        assert_eq!(complete, vec![kept]);
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path().join("empty"));
        let store = ChunkStore::new();
        assert!(matches!(
            checkpointer.load_latest(&store),
            Err(ResoundError::NotFound(_))
        ));
        assert!(matches!(
            checkpointer.load_fallback(&store),
            Err(ResoundError::NotFound(_))
        ));
    }

    #[test]
    fn fallback_seeds_a_fresh_root() {
        let old_root = tempfile::tempdir().unwrap();
        let old = Checkpointer::new(old_root.path());
        let store = ChunkStore::new();
        let path = old.save(&[table_with_items(&store)], 1).unwrap();

        let new_root = tempfile::tempdir().unwrap();
        let seeded = Checkpointer::new(new_root.path()).with_fallback(&path);
        let fresh_store = ChunkStore::new();
        assert!(matches!(
            seeded.load_latest(&fresh_store),
            Err(ResoundError::NotFound(_))
        ));
        let restored = seeded.load_fallback(&fresh_store).unwrap();
        assert_eq!(restored[0].size(), 3);
    }
}
