//! Client-side trajectory writer.

use crate::chunker::{Chunker, ChunkerOptions};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, warn};
use rand::random;
use resound_core::chunk::{CellRef, ChunkKey, EpisodeId, ItemKey, WeakCellRef};
use resound_core::error::{ResoundError, Result};
use resound_core::item::{ChunkSlice, FlatTrajectory, PrioritizedItem, TrajectoryColumn};
use resound_core::service::{InsertRequest, InsertResponse, InsertStream, ReplayService};
use resound_core::tensor::{Signature, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration of [`TrajectoryWriter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryWriterConfig {
    /// Chunking strategy applied to every column.
    pub chunker_options: ChunkerOptions,

    /// Whether integer columns are delta-encoded in their chunks.
    pub delta_encode: bool,

    /// Bound on created items awaiting transmission; `create_item`
    /// blocks once it is reached.
    pub max_in_flight_items: usize,

    /// First backoff after a transient stream failure.
    pub initial_backoff: Duration,

    /// Backoff ceiling; doubling stops here.
    pub max_backoff: Duration,
}

impl Default for TrajectoryWriterConfig {
    fn default() -> Self {
        Self {
            chunker_options: ChunkerOptions::default(),
            delta_encode: false,
            max_in_flight_items: 128,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl TrajectoryWriterConfig {
    /// Sets the chunking strategy.
    pub fn chunker_options(mut self, chunker_options: ChunkerOptions) -> Self {
        self.chunker_options = chunker_options;
        self
    }

    /// Enables or disables delta encoding of integer columns.
    pub fn delta_encode(mut self, delta_encode: bool) -> Self {
        self.delta_encode = delta_encode;
        self
    }

    /// Sets the in-flight item bound.
    pub fn max_in_flight_items(mut self, max_in_flight_items: usize) -> Self {
        self.max_in_flight_items = max_in_flight_items;
        self
    }

    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let rdr = std::io::BufReader::new(file);
        serde_yaml::from_reader(rdr)
            .map_err(|e| ResoundError::InvalidArgument(format!("malformed writer config: {}", e)))
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .map_err(|e| ResoundError::Internal(format!("serializing writer config: {}", e)))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.chunker_options.check()?;
        if self.max_in_flight_items == 0 {
            return Err(ResoundError::InvalidArgument(
                "max_in_flight_items must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One column of a trajectory under construction: references returned
/// by `append`, plus the squeeze flag.
#[derive(Clone, Debug)]
pub struct TrajectoryColumnRefs {
    /// Cell references, in step order.
    pub refs: Vec<WeakCellRef>,
    /// Collapse the step axis when the column holds exactly one cell.
    pub squeeze: bool,
}

struct PendingItem {
    item: PrioritizedItem,
    // Strong references keep the chunks alive until confirmation.
    refs: Vec<CellRef>,
}

struct WriterState {
    unconfirmed: usize,
    error: Option<ResoundError>,
}

struct WriterShared {
    state: Mutex<WriterState>,
    cv: Condvar,
}

/// Buffers appended timesteps into per-column chunks and streams
/// created items to the service.
///
/// A background worker owns the insert stream: it transmits each item
/// together with the chunks not yet sent on the stream, retires items
/// as confirmations arrive, and reconnects with exponential backoff on
/// transient failures, re-sending whatever is still pending. Errors
/// that are not transient park on the writer and surface on the next
/// `create_item` or `flush`.
///
/// The writer is not re-entrant; share it between threads behind a
/// mutex if needed.
pub struct TrajectoryWriter {
    config: TrajectoryWriterConfig,
    columns: Vec<Chunker>,
    episode_id: EpisodeId,
    episode_step: usize,
    step_filled: Vec<bool>,
    // Which writer column produced which chunk, for auto-tuning.
    chunk_columns: HashMap<ChunkKey, usize>,
    signatures: HashMap<String, Option<Signature>>,
    shared: Arc<WriterShared>,
    items_tx: Option<Sender<PendingItem>>,
    worker: Option<JoinHandle<()>>,
}

impl TrajectoryWriter {
    /// Creates a writer connected to `service`.
    pub fn new(service: Arc<ReplayService>, config: TrajectoryWriterConfig) -> Result<Self> {
        config.check()?;
        let signatures = service
            .server_info()
            .tables
            .into_iter()
            .map(|info| (info.name, info.signature))
            .collect();
        let shared = Arc::new(WriterShared {
            state: Mutex::new(WriterState {
                unconfirmed: 0,
                error: None,
            }),
            cv: Condvar::new(),
        });
        let (items_tx, items_rx) = unbounded();
        let worker = {
            let shared = shared.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("resound-writer".to_string())
                .spawn(move || run_writer(service, shared, items_rx, config))
                .expect("failed to spawn writer worker")
        };
        Ok(Self {
            config,
            columns: Vec::new(),
            episode_id: random(),
            episode_step: 0,
            step_filled: Vec::new(),
            chunk_columns: HashMap::new(),
            signatures,
            shared,
            items_tx: Some(items_tx),
            worker: Some(worker),
        })
    }

    /// Appends one timestep: at most one value per column, `None` for
    /// columns without a value this step. Returns one reference per
    /// column entry and advances the step counter.
    pub fn append(&mut self, row: Vec<Option<Tensor>>) -> Result<Vec<Option<WeakCellRef>>> {
        self.append_internal(row, true)
    }

    /// Like [`TrajectoryWriter::append`], but does not advance the step
    /// counter: the remaining columns of this step may be filled by
    /// later calls. Appending twice to one column in the same step
    /// fails `FailedPrecondition`.
    pub fn append_partial(&mut self, row: Vec<Option<Tensor>>) -> Result<Vec<Option<WeakCellRef>>> {
        self.append_internal(row, false)
    }

    fn append_internal(
        &mut self,
        row: Vec<Option<Tensor>>,
        advance: bool,
    ) -> Result<Vec<Option<WeakCellRef>>> {
        self.check_error()?;
        while self.columns.len() < row.len() {
            self.columns.push(Chunker::new(
                self.config.chunker_options.clone(),
                self.episode_id,
                self.config.delta_encode,
            )?);
            self.step_filled.push(false);
        }
        let mut out = Vec::with_capacity(row.len());
        for (column, value) in row.into_iter().enumerate() {
            match value {
                Some(value) => {
                    if self.step_filled[column] {
                        return Err(ResoundError::FailedPrecondition(format!(
                            "column {} already holds a value for step {}",
                            column, self.episode_step
                        )));
                    }
                    let cell = self.columns[column].append(value, self.episode_step)?;
                    self.chunk_columns.insert(cell.chunk_key(), column);
                    self.step_filled[column] = true;
                    out.push(Some(cell.downgrade()));
                }
                None => out.push(None),
            }
        }
        if advance {
            self.episode_step += 1;
            for filled in &mut self.step_filled {
                *filled = false;
            }
        }
        self.prune_chunk_columns();
        Ok(out)
    }

    /// Creates an item over the given columns and enqueues it for
    /// transmission with a fresh random key.
    ///
    /// All references must still be alive (`FailedPrecondition`
    /// otherwise); open chunk runs the item depends on are finalized
    /// here. When the table advertises a signature, every cell is
    /// validated against it before anything is sent. Blocks once
    /// `max_in_flight_items` items await transmission.
    pub fn create_item(
        &mut self,
        table: &str,
        priority: f64,
        columns: Vec<TrajectoryColumnRefs>,
    ) -> Result<()> {
        self.check_error()?;
        if !priority.is_finite() || priority < 0.0 {
            return Err(ResoundError::InvalidArgument(format!(
                "item priority must be finite and non-negative, got {}",
                priority
            )));
        }
        if columns.is_empty() {
            return Err(ResoundError::InvalidArgument(
                "an item needs at least one column".to_string(),
            ));
        }

        let mut strong_columns: Vec<Vec<CellRef>> = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            if column.refs.is_empty() {
                return Err(ResoundError::InvalidArgument(format!(
                    "column {} of the item is empty",
                    index
                )));
            }
            if column.squeeze && column.refs.len() != 1 {
                return Err(ResoundError::InvalidArgument(format!(
                    "column {} has squeeze set but {} cells",
                    index,
                    column.refs.len()
                )));
            }
            let refs = column
                .refs
                .iter()
                .map(|weak| weak.upgrade())
                .collect::<Result<Vec<_>>>()?;
            strong_columns.push(refs);
        }

        // Cells of still-open runs force their chunker to finalize.
        let unresolved: HashSet<ChunkKey> = strong_columns
            .iter()
            .flatten()
            .filter(|cell| !cell.is_resolved())
            .map(|cell| cell.chunk_key())
            .collect();
        if !unresolved.is_empty() {
            for chunker in &mut self.columns {
                if let Some(key) = chunker.active_chunk_key() {
                    if unresolved.contains(&key) {
                        chunker.flush()?;
                    }
                }
            }
        }
        for cell in strong_columns.iter().flatten() {
            if !cell.is_resolved() {
                return Err(ResoundError::Internal(format!(
                    "cell of chunk {} still unresolved after finalization",
                    cell.chunk_key()
                )));
            }
        }

        self.validate_signature(table, &strong_columns)?;

        let trajectory = FlatTrajectory {
            columns: strong_columns
                .iter()
                .zip(&columns)
                .map(|(refs, column)| TrajectoryColumn {
                    slices: slices_from_refs(refs),
                    squeeze: column.squeeze,
                })
                .collect(),
        };

        // Feed observed column lengths back into the chunk tuning.
        let mut lengths: HashMap<usize, usize> = HashMap::new();
        for refs in &strong_columns {
            for cell in refs {
                if let Some(&column) = self.chunk_columns.get(&cell.chunk_key()) {
                    *lengths.entry(column).or_insert(0) += 1;
                }
            }
        }
        for (column, length) in lengths {
            self.columns[column].on_item_created(length);
        }

        let key: ItemKey = random();
        let item = PrioritizedItem {
            key,
            table: table.to_string(),
            priority,
            trajectory,
        };
        debug!("enqueueing item {} for table {}", key, table);

        self.await_in_flight_capacity()?;
        self.shared.state.lock().unwrap().unconfirmed += 1;
        let refs = strong_columns.into_iter().flatten().collect();
        let sender = self.items_tx.as_ref().ok_or_else(|| {
            ResoundError::FailedPrecondition("writer already closed".to_string())
        })?;
        if sender.send(PendingItem { item, refs }).is_err() {
            let mut state = self.shared.state.lock().unwrap();
            state.unconfirmed -= 1;
            return Err(state.error.clone().unwrap_or_else(|| {
                ResoundError::Internal("writer worker terminated".to_string())
            }));
        }
        Ok(())
    }

    /// Blocks until all but the trailing `ignore_last_n` items are
    /// confirmed, or until `timeout` expires with `DeadlineExceeded`.
    /// A parked writer error is returned instead.
    pub fn flush(&mut self, ignore_last_n: usize, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.unconfirmed <= ignore_last_n {
                return Ok(());
            }
            state = match deadline {
                None => self.shared.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ResoundError::DeadlineExceeded(format!(
                            "flush timed out with {} unconfirmed item(s)",
                            state.unconfirmed
                        )));
                    }
                    self.shared.cv.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Finalizes open chunks, waits for every pending item, then starts
    /// a fresh episode. With `clear_buffers` all existing cell
    /// references expire; otherwise the keep-alive windows carry over.
    pub fn end_episode(&mut self, clear_buffers: bool, timeout: Option<Duration>) -> Result<()> {
        for chunker in &mut self.columns {
            chunker.flush()?;
        }
        self.flush(0, timeout)?;
        self.episode_id = random();
        self.episode_step = 0;
        for chunker in &mut self.columns {
            chunker.reset(self.episode_id, clear_buffers);
        }
        for filled in &mut self.step_filled {
            *filled = false;
        }
        Ok(())
    }

    /// Waits for all pending items and shuts the writer down.
    pub fn close(mut self, timeout: Option<Duration>) -> Result<()> {
        self.flush(0, timeout)
    }

    /// The current episode identifier.
    pub fn episode_id(&self) -> EpisodeId {
        self.episode_id
    }

    /// The current step within the episode.
    pub fn episode_step(&self) -> usize {
        self.episode_step
    }

    fn check_error(&self) -> Result<()> {
        match &self.shared.state.lock().unwrap().error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    // Backpressure: the worker drains the queue, confirmations shrink
    // `unconfirmed`; waiting for headroom bounds queued items.
    fn await_in_flight_capacity(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.unconfirmed < self.config.max_in_flight_items {
                return Ok(());
            }
            state = self.shared.cv.wait(state).unwrap();
        }
    }

    fn validate_signature(&self, table: &str, columns: &[Vec<CellRef>]) -> Result<()> {
        let signature = match self.signatures.get(table) {
            Some(Some(signature)) => signature,
            // No signature advertised, or an unknown table the service
            // will reject on insert.
            _ => return Ok(()),
        };
        if signature.len() != columns.len() {
            return Err(ResoundError::InvalidArgument(format!(
                "table {} expects {} column(s), item has {}",
                table,
                signature.len(),
                columns.len()
            )));
        }
        for (index, (spec, refs)) in signature.iter().zip(columns).enumerate() {
            for cell in refs {
                let got = cell.spec();
                let compatible = got.dtype == spec.spec.dtype
                    && got.shape.len() == spec.spec.shape.len()
                    && spec
                        .spec
                        .shape
                        .iter()
                        .zip(&got.shape)
                        .all(|(want, have)| match (want, have) {
                            (None, _) => true,
                            (Some(w), Some(h)) => w == h,
                            (Some(_), None) => false,
                        });
                if !compatible {
                    return Err(ResoundError::InvalidArgument(format!(
                        "column {} ({}) at step {}: cell has spec {}, table {} \
                         expects {}",
                        index,
                        spec.name,
                        cell.episode_step(),
                        got,
                        table,
                        spec.spec
                    )));
                }
            }
        }
        Ok(())
    }

    fn prune_chunk_columns(&mut self) {
        if self.chunk_columns.len() < 4096 {
            return;
        }
        // Anything outside every keep-alive window can no longer be
        // referenced by a new item.
        let live: HashSet<ChunkKey> = self
            .columns
            .iter()
            .flat_map(|c| c.live_chunk_keys())
            .collect();
        self.chunk_columns.retain(|key, _| live.contains(key));
    }
}

impl Drop for TrajectoryWriter {
    fn drop(&mut self) {
        self.items_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// Groups consecutive cells of one chunk into slices.
fn slices_from_refs(refs: &[CellRef]) -> Vec<ChunkSlice> {
    let mut slices: Vec<ChunkSlice> = Vec::new();
    for cell in refs {
        if let Some(last) = slices.last_mut() {
            if last.chunk_key == cell.chunk_key() && cell.offset() == last.offset + last.length {
                last.length += 1;
                continue;
            }
        }
        slices.push(ChunkSlice {
            chunk_key: cell.chunk_key(),
            offset: cell.offset(),
            length: 1,
        });
    }
    slices
}

fn run_writer(
    service: Arc<ReplayService>,
    shared: Arc<WriterShared>,
    items: Receiver<PendingItem>,
    config: TrajectoryWriterConfig,
) {
    let mut stream = service.open_insert_stream();
    let mut responses = stream.responses();
    let mut sent_chunks: HashSet<ChunkKey> = HashSet::new();
    let mut in_flight: VecDeque<PendingItem> = VecDeque::new();
    let mut backoff = config.initial_backoff;

    loop {
        let error = 'serve: loop {
            select! {
                recv(items) -> message => match message {
                    Ok(pending) => {
                        in_flight.push_back(pending);
                        let index = in_flight.len() - 1;
                        if let Err(e) = transmit(&stream, &mut sent_chunks, &in_flight, index) {
                            break 'serve e;
                        }
                    }
                    // Writer dropped; whatever is unconfirmed is
                    // abandoned with it.
                    Err(_) => return,
                },
                recv(responses) -> message => match message {
                    Ok(Ok(response)) => confirm(&shared, &mut in_flight, &response),
                    Ok(Err(e)) => break 'serve e,
                    Err(_) => break 'serve ResoundError::Unavailable(
                        "insert stream closed".to_string(),
                    ),
                },
            }
        };

        if !error.is_transient() {
            park_error(&shared, error);
            return;
        }

        // Transient failure: reconnect and replay the pending items,
        // re-sending only chunks they still reference.
        loop {
            warn!(
                "insert stream failed ({}); reconnecting in {:?}",
                error, backoff
            );
            thread::sleep(backoff);
            backoff = (backoff * 2).min(config.max_backoff);
            stream = service.open_insert_stream();
            responses = stream.responses();
            sent_chunks.clear();
            match resend_all(&stream, &mut sent_chunks, &in_flight) {
                Ok(()) => {
                    backoff = config.initial_backoff;
                    break;
                }
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    park_error(&shared, e);
                    return;
                }
            }
        }
    }
}

fn transmit(
    stream: &InsertStream,
    sent_chunks: &mut HashSet<ChunkKey>,
    in_flight: &VecDeque<PendingItem>,
    index: usize,
) -> Result<()> {
    let pending = &in_flight[index];
    let mut chunks = Vec::new();
    for cell in &pending.refs {
        let chunk = cell.chunk()?;
        if sent_chunks.insert(chunk.key()) {
            chunks.push(chunk.data().clone());
        }
    }
    let keep: HashSet<ChunkKey> = in_flight
        .iter()
        .flat_map(|p| p.refs.iter().map(|cell| cell.chunk_key()))
        .collect();
    stream.send(InsertRequest {
        chunks,
        item: Some(pending.item.clone()),
        keep_chunk_keys: keep.into_iter().collect(),
        send_confirmation: true,
    })
}

fn resend_all(
    stream: &InsertStream,
    sent_chunks: &mut HashSet<ChunkKey>,
    in_flight: &VecDeque<PendingItem>,
) -> Result<()> {
    for index in 0..in_flight.len() {
        transmit(stream, sent_chunks, in_flight, index)?;
    }
    Ok(())
}

fn confirm(shared: &WriterShared, in_flight: &mut VecDeque<PendingItem>, response: &InsertResponse) {
    for key in &response.keys {
        if let Some(position) = in_flight.iter().position(|p| p.item.key == *key) {
            in_flight.remove(position);
        }
        let mut state = shared.state.lock().unwrap();
        state.unconfirmed = state.unconfirmed.saturating_sub(1);
        drop(state);
        shared.cv.notify_all();
    }
}

fn park_error(shared: &WriterShared, error: ResoundError) {
    warn!("writer parking error: {}", error);
    let mut state = shared.state.lock().unwrap();
    state.error = Some(error);
    drop(state);
    shared.cv.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn config_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writer.yaml");
        let config = TrajectoryWriterConfig::default()
            .chunker_options(ChunkerOptions::AutoTuned {
                num_keep_alive_refs: 256,
                throughput_weight: 0.3,
            })
            .delta_encode(true)
            .max_in_flight_items(32);
        config.save(&path).unwrap();
        assert_eq!(TrajectoryWriterConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn slices_group_consecutive_cells() {
        let spec = Tensor::F32(ArrayD::from_elem(IxDyn(&[]), 0.0)).spec();
        let refs: Vec<CellRef> = vec![
            CellRef::new(1, 0, 1, 0, spec.clone()),
            CellRef::new(1, 1, 1, 1, spec.clone()),
            CellRef::new(2, 0, 1, 2, spec.clone()),
            CellRef::new(2, 2, 1, 4, spec),
        ];
        let slices = slices_from_refs(&refs);
        assert_eq!(
            slices,
            vec![
                ChunkSlice {
                    chunk_key: 1,
                    offset: 0,
                    length: 2
                },
                ChunkSlice {
                    chunk_key: 2,
                    offset: 0,
                    length: 1
                },
                ChunkSlice {
                    chunk_key: 2,
                    offset: 2,
                    length: 1
                },
            ]
        );
    }
}
