//! Process-wide interning store of chunks.

use crate::chunk::{Chunk, ChunkData, ChunkKey};
use crate::error::{ResoundError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

// Expired weak entries are purged once this many inserts have happened
// since the last purge.
const PURGE_INTERVAL: usize = 1024;

/// A shared map from chunk key to a weak chunk reference.
///
/// The store never extends a chunk's lifetime: a chunk lives exactly as
/// long as its longest strong holder (items in tables, samples in
/// flight, client-held cell references). [`ChunkStore::get`] fails
/// `NotFound` once the last holder is gone, which is how stale readers
/// learn their data was collected.
#[derive(Debug)]
pub struct ChunkStore {
    inner: Mutex<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    chunks: HashMap<ChunkKey, Weak<Chunk>>,
    inserts_since_purge: usize,
}

impl ChunkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreState {
                chunks: HashMap::new(),
                inserts_since_purge: 0,
            }),
        }
    }

    /// Interns `data`, returning the canonical chunk for its key.
    ///
    /// If a live chunk with the same key already exists it is returned
    /// and `data` is dropped. Keys are random 64-bit integers chosen by
    /// the chunker; inserting different payloads under one key is a
    /// programming error and which payload wins is unspecified.
    pub fn insert(&self, data: ChunkData) -> Arc<Chunk> {
        let mut state = self.inner.lock().unwrap();

        state.inserts_since_purge += 1;
        if state.inserts_since_purge >= PURGE_INTERVAL {
            state.chunks.retain(|_, weak| weak.strong_count() > 0);
            state.inserts_since_purge = 0;
        }

        if let Some(existing) = state.chunks.get(&data.key).and_then(Weak::upgrade) {
            return existing;
        }
        let chunk = Arc::new(Chunk::new(data));
        state.chunks.insert(chunk.key(), Arc::downgrade(&chunk));
        chunk
    }

    /// Looks up a live chunk by key.
    pub fn get(&self, key: ChunkKey) -> Result<Arc<Chunk>> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .get(&key)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ResoundError::NotFound(format!("chunk {} not found", key)))
    }

    /// Looks up several chunks, failing on the first missing key.
    pub fn get_many(&self, keys: &[ChunkKey]) -> Result<Vec<Arc<Chunk>>> {
        let state = self.inner.lock().unwrap();
        keys.iter()
            .map(|key| {
                state
                    .chunks
                    .get(key)
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| ResoundError::NotFound(format!("chunk {} not found", key)))
            })
            .collect()
    }

    /// Number of live chunks.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no live chunk is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use ndarray::{ArrayD, IxDyn};

    fn data(key: ChunkKey) -> ChunkData {
        ChunkData {
            key,
            episode_id: 1,
            step_range: (0, 0),
            delta_encoded: false,
            data: Tensor::F32(ArrayD::from_elem(IxDyn(&[1]), 0.0)),
        }
    }

    #[test]
    fn insert_interns_by_key() {
        let store = ChunkStore::new();
        let a = store.insert(data(1));
        let b = store.insert(data(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_fails_after_last_holder_drops() {
        let store = ChunkStore::new();
        let chunk = store.insert(data(9));
        assert!(store.get(9).is_ok());
        drop(chunk);
        assert!(matches!(store.get(9), Err(ResoundError::NotFound(_))));
    }

    #[test]
    fn get_many_is_all_or_nothing() {
        let store = ChunkStore::new();
        let _a = store.insert(data(1));
        let _b = store.insert(data(2));
        assert_eq!(store.get_many(&[1, 2]).unwrap().len(), 2);
        assert!(matches!(
            store.get_many(&[1, 3]),
            Err(ResoundError::NotFound(_))
        ));
    }

    #[test]
    fn expired_entries_are_purged_during_inserts() {
        let store = ChunkStore::new();
        drop(store.insert(data(42)));
        for key in 0..PURGE_INTERVAL as u64 {
            let _held = store.insert(data(1000 + key));
        }
        let state = store.inner.lock().unwrap();
        assert!(!state.chunks.contains_key(&42));
    }
}
