//! Wire messages and the in-process replay service.
//!
//! The transport shell proper (gRPC, HTTP, ...) lives outside this
//! crate; what the engine defines is the message shapes and a service
//! that multiplexes channel-backed streams onto its tables. Each opened
//! stream is owned by one worker thread, mirroring how writers and
//! samplers each own one connection on the client side.

use crate::checkpoint::Checkpointer;
use crate::chunk::{Chunk, ChunkData, ChunkKey, ItemKey};
use crate::chunk_store::ChunkStore;
use crate::error::{ResoundError, Result};
use crate::item::PrioritizedItem;
use crate::table::{Table, TableInfo, TableItem};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One message of the insert stream.
///
/// `chunks` carries only payloads not previously sent on this stream;
/// `keep_chunk_keys` lists the chunks the client may still reference in
/// later items, letting the stream drop its references to the rest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertRequest {
    /// Chunk payloads new to this stream.
    pub chunks: Vec<ChunkData>,
    /// The item to insert, if any.
    pub item: Option<PrioritizedItem>,
    /// Chunks the client will still reference on this stream.
    pub keep_chunk_keys: Vec<ChunkKey>,
    /// Whether the server should confirm the item.
    pub send_confirmation: bool,
}

/// Confirmation that items reached their tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertResponse {
    /// Keys of the confirmed items.
    pub keys: Vec<ItemKey>,
}

/// Parameters of one sample stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    /// Table to sample from.
    pub table: String,
    /// Total number of samples to stream.
    pub num_samples: usize,
    /// Upper bound on items taken per table lock acquisition.
    pub flexible_batch_size: usize,
    /// Deadline passed to the table's rate limiter per batch; `None`
    /// waits forever.
    pub rate_limiter_timeout: Option<Duration>,
}

/// One sampled item with everything needed to materialize it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleEntry {
    /// The sampled item.
    pub item: PrioritizedItem,
    /// Probability of the draw.
    pub probability: f64,
    /// Table size at draw time.
    pub table_size: usize,
    /// Times the item had been sampled, including this draw.
    pub times_sampled: u32,
    /// Payloads of every chunk the trajectory references.
    pub chunks: Vec<ChunkData>,
}

/// Snapshot returned by the info call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Per-table configuration and counters.
    pub tables: Vec<TableInfo>,
    /// Identifier that changes whenever the set of tables or any
    /// signature changes, so clients can detect stale caches.
    pub tables_state_id: u128,
}

/// Client handle of an insert stream.
///
/// Requests flow to a dedicated worker thread; confirmations and
/// errors come back on the response channel. The first error
/// terminates the stream.
pub struct InsertStream {
    requests: Sender<InsertRequest>,
    responses: Receiver<Result<InsertResponse>>,
}

impl InsertStream {
    /// Sends one request. Fails `Unavailable` once the stream worker
    /// has terminated.
    pub fn send(&self, request: InsertRequest) -> Result<()> {
        self.requests.send(request).map_err(|_| {
            ResoundError::Unavailable("insert stream terminated".to_string())
        })
    }

    /// The channel confirmations arrive on. Disconnection means the
    /// stream ended.
    pub fn responses(&self) -> Receiver<Result<InsertResponse>> {
        self.responses.clone()
    }
}

/// Client handle of a sample stream.
///
/// Entries arrive on a bounded channel filled by a worker thread; the
/// channel disconnects once `num_samples` entries were delivered or an
/// error terminated the stream.
pub struct SampleStream {
    entries: Receiver<Result<SampleEntry>>,
}

impl SampleStream {
    /// Receives the next entry, or `None` at end of stream.
    pub fn recv(&self) -> Option<Result<SampleEntry>> {
        self.entries.recv().ok()
    }

    /// The underlying entry channel.
    pub fn entries(&self) -> Receiver<Result<SampleEntry>> {
        self.entries.clone()
    }
}

/// The in-process replay service: a chunk store shared by a set of
/// named tables, multiplexing insert and sample streams onto them.
pub struct ReplayService {
    chunk_store: Arc<ChunkStore>,
    tables: HashMap<String, Arc<Table>>,
    tables_state_id: u128,
}

impl ReplayService {
    /// Creates a service over `tables`, which must have unique names.
    pub fn new(tables: Vec<Arc<Table>>) -> Result<Self> {
        Self::with_chunk_store(tables, Arc::new(ChunkStore::new()))
    }

    /// Creates a service over `tables` sharing an existing chunk store,
    /// typically the one a checkpoint was just loaded into.
    pub fn with_chunk_store(
        tables: Vec<Arc<Table>>,
        chunk_store: Arc<ChunkStore>,
    ) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(tables.len());
        for table in tables {
            let name = table.name().to_string();
            if by_name.insert(name.clone(), table).is_some() {
                return Err(ResoundError::InvalidArgument(format!(
                    "duplicate table name {}",
                    name
                )));
            }
        }
        Ok(Self {
            chunk_store,
            tables: by_name,
            tables_state_id: rand::random(),
        })
    }

    /// The chunk store backing every table of this service.
    pub fn chunk_store(&self) -> Arc<ChunkStore> {
        self.chunk_store.clone()
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| ResoundError::NotFound(format!("table {} not found", name)))
    }

    /// All tables, sorted by name.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<_> = self.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Per-table info plus the tables-state identifier.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            tables: self.tables().iter().map(|t| t.info()).collect(),
            tables_state_id: self.tables_state_id,
        }
    }

    /// Opens a bidirectional insert stream backed by a worker thread.
    pub fn open_insert_stream(self: &Arc<Self>) -> InsertStream {
        let (request_tx, request_rx) = unbounded::<InsertRequest>();
        let (response_tx, response_rx) = unbounded::<Result<InsertResponse>>();
        let service = self.clone();
        thread::Builder::new()
            .name("resound-insert-stream".to_string())
            .spawn(move || service.run_insert_stream(request_rx, response_tx))
            .expect("failed to spawn insert stream worker");
        InsertStream {
            requests: request_tx,
            responses: response_rx,
        }
    }

    /// Opens a sample stream delivering up to `request.num_samples`
    /// entries, at most `buffer` of them in flight.
    pub fn open_sample_stream(self: &Arc<Self>, request: SampleRequest, buffer: usize) -> SampleStream {
        let (entry_tx, entry_rx) = bounded::<Result<SampleEntry>>(buffer.max(1));
        let service = self.clone();
        thread::Builder::new()
            .name("resound-sample-stream".to_string())
            .spawn(move || service.run_sample_stream(request, entry_tx))
            .expect("failed to spawn sample stream worker");
        SampleStream { entries: entry_rx }
    }

    /// Applies priority updates and deletions to one table.
    pub fn mutate_priorities(
        &self,
        table: &str,
        updates: &[(ItemKey, f64)],
        deletes: &[ItemKey],
    ) -> Result<()> {
        self.table(table)?.mutate_items(updates, deletes)
    }

    /// Resets one table.
    pub fn reset(&self, table: &str) -> Result<()> {
        self.table(table)?.reset();
        Ok(())
    }

    /// Checkpoints every table through `checkpointer`.
    pub fn checkpoint(&self, checkpointer: &Checkpointer, keep_latest: usize) -> Result<PathBuf> {
        checkpointer.save(&self.tables(), keep_latest)
    }

    /// Closes every table, cancelling all blocked operations.
    pub fn close(&self) {
        for table in self.tables.values() {
            table.close();
        }
    }

    fn run_insert_stream(
        &self,
        requests: Receiver<InsertRequest>,
        responses: Sender<Result<InsertResponse>>,
    ) {
        // Chunks already seen on this stream, so items can reference
        // them without re-sending the payload.
        let mut stream_chunks: HashMap<ChunkKey, Arc<Chunk>> = HashMap::new();
        for request in requests.iter() {
            match self.process_insert(request, &mut stream_chunks) {
                Ok(Some(response)) => {
                    if responses.send(Ok(response)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("insert stream terminating: {}", e);
                    let _ = responses.send(Err(e));
                    break;
                }
            }
        }
        debug!("insert stream worker exiting");
    }

    fn process_insert(
        &self,
        request: InsertRequest,
        stream_chunks: &mut HashMap<ChunkKey, Arc<Chunk>>,
    ) -> Result<Option<InsertResponse>> {
        for data in request.chunks {
            let chunk = self.chunk_store.insert(data);
            stream_chunks.insert(chunk.key(), chunk);
        }

        let mut response = None;
        if let Some(item) = request.item {
            let table = self.table(&item.table)?;
            let chunks = item
                .trajectory
                .chunk_keys()
                .into_iter()
                .map(|key| match stream_chunks.get(&key) {
                    Some(chunk) => Ok(chunk.clone()),
                    None => self.chunk_store.get(key).map_err(|_| {
                        ResoundError::InvalidArgument(format!(
                            "item {} references chunk {} which is neither on this \
                             stream nor in the chunk store",
                            item.key, key
                        ))
                    }),
                })
                .collect::<Result<Vec<_>>>()?;
            let key = item.key;
            table.insert_or_assign(TableItem::new(item, chunks), None)?;
            if request.send_confirmation {
                response = Some(InsertResponse { keys: vec![key] });
            }
        }

        // Only after the item holds its chunks is it safe to drop
        // whatever the client no longer references.
        let keep: HashSet<ChunkKey> = request.keep_chunk_keys.iter().copied().collect();
        stream_chunks.retain(|key, _| keep.contains(key));
        Ok(response)
    }

    fn run_sample_stream(&self, request: SampleRequest, entries: Sender<Result<SampleEntry>>) {
        let table = match self.table(&request.table) {
            Ok(table) => table,
            Err(e) => {
                let _ = entries.send(Err(e));
                return;
            }
        };
        let mut remaining = request.num_samples;
        while remaining > 0 {
            let batch_size = request.flexible_batch_size.clamp(1, remaining);
            let batch = match table.sample_flexible_batch(batch_size, request.rate_limiter_timeout)
            {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = entries.send(Err(e));
                    return;
                }
            };
            for sampled in batch {
                remaining -= 1;
                let entry = SampleEntry {
                    chunks: sampled.chunks.iter().map(|c| c.data().clone()).collect(),
                    item: sampled.item,
                    probability: sampled.probability,
                    table_size: sampled.table_size,
                    times_sampled: sampled.times_sampled,
                };
                if entries.send(Ok(entry)).is_err() {
                    return;
                }
            }
        }
        debug!("sample stream worker delivered {} entries", request.num_samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ChunkSlice, FlatTrajectory, TrajectoryColumn};
    use crate::rate_limiter::RateLimiterConfig;
    use crate::selector::SelectorOptions;
    use crate::table::TableConfig;
    use crate::tensor::Tensor;
    use ndarray::{ArrayD, IxDyn};

    fn service() -> Arc<ReplayService> {
        let table = Table::new(
            TableConfig::default()
                .name("queue")
                .sampler(SelectorOptions::Fifo)
                .remover(SelectorOptions::Fifo)
                .max_size(100)
                .rate_limiter(RateLimiterConfig::min_size(1)),
        )
        .unwrap();
        Arc::new(ReplayService::new(vec![Arc::new(table)]).unwrap())
    }

    fn chunk_data(key: ChunkKey, rows: Vec<f32>) -> ChunkData {
        let n = rows.len();
        ChunkData {
            key,
            episode_id: 1,
            step_range: (0, n - 1),
            delta_encoded: false,
            data: Tensor::F32(ArrayD::from_shape_vec(IxDyn(&[n]), rows).unwrap()),
        }
    }

    fn item_over(key: ItemKey, chunk_keys: &[ChunkKey], rows_per_chunk: usize) -> PrioritizedItem {
        PrioritizedItem {
            key,
            table: "queue".to_string(),
            priority: 1.0,
            trajectory: FlatTrajectory {
                columns: vec![TrajectoryColumn {
                    slices: chunk_keys
                        .iter()
                        .map(|&chunk_key| ChunkSlice {
                            chunk_key,
                            offset: 0,
                            length: rows_per_chunk,
                        })
                        .collect(),
                    squeeze: false,
                }],
            },
        }
    }

    #[test]
    fn insert_stream_confirms_items() {
        let service = service();
        let stream = service.open_insert_stream();
        stream
            .send(InsertRequest {
                chunks: vec![chunk_data(1, vec![0.0, 1.0])],
                item: Some(item_over(10, &[1], 2)),
                keep_chunk_keys: vec![1],
                send_confirmation: true,
            })
            .unwrap();
        let response = stream.responses().recv().unwrap().unwrap();
        assert_eq!(response.keys, vec![10]);
        assert_eq!(service.table("queue").unwrap().size(), 1);
    }

    #[test]
    fn later_items_reuse_stream_chunks() {
        let service = service();
        let stream = service.open_insert_stream();
        stream
            .send(InsertRequest {
                chunks: vec![chunk_data(1, vec![0.0, 1.0]), chunk_data(2, vec![2.0, 3.0])],
                item: Some(item_over(10, &[1, 2], 2)),
                keep_chunk_keys: vec![1, 2],
                send_confirmation: true,
            })
            .unwrap();
        // No chunk payloads attached: both are already on the stream.
        stream
            .send(InsertRequest {
                chunks: vec![],
                item: Some(item_over(11, &[1, 2], 2)),
                keep_chunk_keys: vec![1, 2],
                send_confirmation: true,
            })
            .unwrap();
        let responses = stream.responses();
        assert_eq!(responses.recv().unwrap().unwrap().keys, vec![10]);
        assert_eq!(responses.recv().unwrap().unwrap().keys, vec![11]);
        assert_eq!(service.chunk_store().len(), 2);
    }

    #[test]
    fn unknown_chunk_terminates_stream() {
        let service = service();
        let stream = service.open_insert_stream();
        stream
            .send(InsertRequest {
                chunks: vec![],
                item: Some(item_over(10, &[99], 1)),
                keep_chunk_keys: vec![],
                send_confirmation: true,
            })
            .unwrap();
        let err = stream.responses().recv().unwrap().unwrap_err();
        assert!(matches!(err, ResoundError::InvalidArgument(_)));
        // The worker has shut the stream down.
        assert!(stream.responses().recv().is_err());
    }

    #[test]
    fn sample_stream_delivers_requested_count() {
        let service = service();
        let stream = service.open_insert_stream();
        for key in 0..3u64 {
            stream
                .send(InsertRequest {
                    chunks: vec![chunk_data(key + 1, vec![key as f32])],
                    item: Some(item_over(key, &[key + 1], 1)),
                    keep_chunk_keys: vec![],
                    send_confirmation: true,
                })
                .unwrap();
        }
        for _ in 0..3 {
            stream.responses().recv().unwrap().unwrap();
        }

        let samples = service.open_sample_stream(
            SampleRequest {
                table: "queue".to_string(),
                num_samples: 5,
                flexible_batch_size: 2,
                rate_limiter_timeout: None,
            },
            16,
        );
        let mut keys = Vec::new();
        while let Some(entry) = samples.recv() {
            let entry = entry.unwrap();
            assert_eq!(entry.chunks.len(), 1);
            keys.push(entry.item.key);
        }
        // FIFO keeps returning the oldest item.
        assert_eq!(keys, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn sample_stream_propagates_limiter_timeout() {
        let service = service();
        let samples = service.open_sample_stream(
            SampleRequest {
                table: "queue".to_string(),
                num_samples: 1,
                flexible_batch_size: 1,
                rate_limiter_timeout: Some(Duration::from_millis(10)),
            },
            4,
        );
        let err = samples.recv().unwrap().unwrap_err();
        assert!(crate::error::is_rate_limiter_timeout(&err));
        assert!(samples.recv().is_none());
    }

    #[test]
    fn server_info_lists_tables() {
        let service = service();
        let info = service.server_info();
        assert_eq!(info.tables.len(), 1);
        assert_eq!(info.tables[0].name, "queue");
        assert_eq!(info.tables_state_id, service.server_info().tables_state_id);
    }

    #[test]
    fn unknown_table_is_not_found() {
        let service = service();
        assert!(matches!(
            service.mutate_priorities("nope", &[], &[]),
            Err(ResoundError::NotFound(_))
        ));
    }
}
