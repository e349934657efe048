//! The table: a bounded priority store with rate-limited admission.

use super::config::TableConfig;
use super::extension::TableExtension;
use crate::checkpoint::{ItemCheckpoint, TableCheckpoint};
use crate::chunk::{Chunk, ItemKey};
use crate::chunk_store::ChunkStore;
use crate::error::{self, ResoundError, Result};
use crate::item::PrioritizedItem;
use crate::rate_limiter::RateLimiter;
use crate::selector::{ItemSelector, SelectorOptions};
use crate::tensor::Signature;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// An item as stored by a table: the wire item plus strong references
/// to every chunk its trajectory touches.
#[derive(Clone, Debug)]
pub struct TableItem {
    /// The prioritized item.
    pub item: PrioritizedItem,
    /// Strong references keeping the trajectory's chunks alive for the
    /// item's entire lifetime in the table.
    pub chunks: Vec<Arc<Chunk>>,
    /// Number of times this item has been sampled.
    pub times_sampled: u32,
}

impl TableItem {
    /// Wraps a wire item and its resolved chunks.
    pub fn new(item: PrioritizedItem, chunks: Vec<Arc<Chunk>>) -> Self {
        Self {
            item,
            chunks,
            times_sampled: 0,
        }
    }
}

/// The result of one sampled item, captured at selection time.
#[derive(Clone, Debug)]
pub struct SampledItem {
    /// The sampled item.
    pub item: PrioritizedItem,
    /// The chunks backing the item's trajectory.
    pub chunks: Vec<Arc<Chunk>>,
    /// Probability of this draw under the sampler.
    pub probability: f64,
    /// Number of items in the table when the draw happened.
    pub table_size: usize,
    /// Priority of the item when the draw happened.
    pub priority: f64,
    /// Times the item had been sampled, including this draw.
    pub times_sampled: u32,
}

/// Snapshot of a table's configuration and counters.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Current number of items.
    pub size: usize,
    /// Capacity bound.
    pub max_size: usize,
    /// Per-item sample limit; zero or negative is unlimited.
    pub max_times_sampled: i32,
    /// Lifetime insert count.
    pub num_inserts: i64,
    /// Lifetime sample count.
    pub num_samples: i64,
    /// Lifetime delete count.
    pub num_deletes: i64,
    /// Sampling policy.
    pub sampler_options: SelectorOptions,
    /// Eviction policy.
    pub remover_options: SelectorOptions,
    /// Signature advertised to writers, if any.
    pub signature: Option<Signature>,
}

struct TableState {
    items: HashMap<ItemKey, TableItem>,
    sampler: Box<dyn ItemSelector>,
    remover: Box<dyn ItemSelector>,
    rate_limiter: RateLimiter,
    extensions: Vec<Box<dyn TableExtension>>,
    closed: bool,
}

/// A named, bounded store of prioritized items.
///
/// All mutable state sits behind one mutex: the item map, both
/// selectors, the rate limiter and the extensions mutate consistently
/// under it. Blocking operations wait on the table's condition
/// variable, which every state change signals; the mutex is released
/// while waiting so other operations make progress.
pub struct Table {
    name: String,
    max_size: usize,
    max_times_sampled: i32,
    signature: Option<Signature>,
    state: Mutex<TableState>,
    wakeup: Condvar,
}

impl Table {
    /// Builds a table from its configuration.
    pub fn new(config: TableConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            name: config.name,
            max_size: config.max_size,
            max_times_sampled: config.max_times_sampled,
            signature: config.signature,
            state: Mutex::new(TableState {
                items: HashMap::new(),
                sampler: config.sampler.build(),
                remover: config.remover.build(),
                rate_limiter: RateLimiter::new(config.rate_limiter),
                extensions: Vec::new(),
                closed: false,
            }),
            wakeup: Condvar::new(),
        })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity bound.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Signature advertised to writers, if any.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Current number of items.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Registers an extension. Hooks run in registration order.
    pub fn add_extension(&self, extension: Box<dyn TableExtension>) {
        self.state.lock().unwrap().extensions.push(extension);
    }

    /// Inserts an item, or assigns it if the key is already present.
    ///
    /// An insert waits for the rate limiter (up to `timeout`, forever if
    /// `None`) and evicts the remover's victim when the table is full.
    /// Assigning replaces the stored item, re-weights both selectors and
    /// resets the item's sample count; it does not consume insert
    /// budget. Fails `InvalidArgument` when the priority is negative or
    /// the item's chunks do not cover its trajectory, `Cancelled` when
    /// the table is closed, and the rate-limiter-tagged
    /// `DeadlineExceeded` on timeout.
    pub fn insert_or_assign(&self, item: TableItem, timeout: Option<Duration>) -> Result<()> {
        let key = item.item.key;
        let priority = item.item.priority;
        Self::check_priority(priority)?;
        Self::check_chunks(&item)?;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(self.cancelled());
        }
        if !state.items.contains_key(&key) {
            state = self.await_admission(state, timeout, |s| s.rate_limiter.can_insert(1))?;
        }
        if state.items.contains_key(&key) {
            Self::assign_locked(&mut state, item)?;
        } else {
            if state.items.len() >= self.max_size {
                let victim = state.remover.sample().key;
                debug!("table {}: evicting item {}", self.name, victim);
                Self::delete_item_locked(&mut state, victim)?;
            }
            state.sampler.insert(key, priority)?;
            state.remover.insert(key, priority)?;
            state.rate_limiter.insert();
            let TableState {
                items, extensions, ..
            } = &mut *state;
            items.insert(key, item);
            let entry = &items[&key];
            for ext in extensions.iter_mut() {
                ext.on_insert(entry);
            }
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Samples one item. See [`Table::sample_flexible_batch`].
    pub fn sample(&self, timeout: Option<Duration>) -> Result<SampledItem> {
        let mut batch = self.sample_flexible_batch(1, timeout)?;
        batch.pop().ok_or_else(|| {
            ResoundError::Internal("admitted sample batch came back empty".to_string())
        })
    }

    /// Samples up to `max_batch` items under a single mutex hold.
    ///
    /// The first draw waits for the rate limiter (up to `timeout`);
    /// further draws are taken only while the limiter admits them
    /// without blocking, which amortizes lock and wakeup overhead on hot
    /// tables. Items that reach `max_times_sampled` are deleted right
    /// after their draw. Fails `Cancelled` when the table is closed and
    /// the rate-limiter-tagged `DeadlineExceeded` on timeout.
    pub fn sample_flexible_batch(
        &self,
        max_batch: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>> {
        let mut state = self.state.lock().unwrap();
        state = self.await_admission(state, timeout, |s| s.rate_limiter.can_sample(1))?;

        let mut out = Vec::with_capacity(max_batch);
        while out.len() < max_batch {
            if !out.is_empty() && !state.rate_limiter.can_sample(1) {
                break;
            }
            let drawn = state.sampler.sample();
            state.rate_limiter.sample();
            let table_size = state.items.len();
            let sampled = {
                let TableState {
                    items, extensions, ..
                } = &mut *state;
                let entry = items.get_mut(&drawn.key).ok_or_else(|| {
                    ResoundError::Internal(format!(
                        "sampler returned key {} unknown to table {}",
                        drawn.key, self.name
                    ))
                })?;
                entry.times_sampled += 1;
                for ext in extensions.iter_mut() {
                    ext.on_sample(entry);
                }
                SampledItem {
                    item: entry.item.clone(),
                    chunks: entry.chunks.clone(),
                    probability: drawn.probability,
                    table_size,
                    priority: entry.item.priority,
                    times_sampled: entry.times_sampled,
                }
            };
            if self.max_times_sampled > 0
                && sampled.times_sampled >= self.max_times_sampled as u32
            {
                Self::delete_item_locked(&mut state, drawn.key)?;
            }
            out.push(sampled);
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(out)
    }

    /// Applies priority updates and deletions in one mutex hold.
    ///
    /// Keys that are no longer present are skipped: mutations race with
    /// eviction and max-times-sampled deletion by design. Fails
    /// `Cancelled` when the table is closed and `InvalidArgument` on a
    /// malformed priority.
    pub fn mutate_items(&self, updates: &[(ItemKey, f64)], deletes: &[ItemKey]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(self.cancelled());
        }
        for key in deletes {
            if state.items.contains_key(key) {
                Self::delete_item_locked(&mut state, *key)?;
            }
        }
        for (key, priority) in updates {
            Self::check_priority(*priority)?;
            if !state.items.contains_key(key) {
                continue;
            }
            Self::update_priority_locked(&mut state, *key, *priority)?;
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Clears all items, selectors and limiter counters.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        state.sampler.clear();
        state.remover.clear();
        state.rate_limiter.reset();
        for ext in state.extensions.iter_mut() {
            ext.on_reset();
        }
        drop(state);
        self.wakeup.notify_all();
    }

    /// Marks the table closed and wakes every blocked operation, which
    /// then fails `Cancelled`. Closing is terminal.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.wakeup.notify_all();
    }

    /// Whether [`Table::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Snapshot of counters and options.
    pub fn info(&self) -> TableInfo {
        let state = self.state.lock().unwrap();
        TableInfo {
            name: self.name.clone(),
            size: state.items.len(),
            max_size: self.max_size,
            max_times_sampled: self.max_times_sampled,
            num_inserts: state.rate_limiter.num_inserts(),
            num_samples: state.rate_limiter.num_samples(),
            num_deletes: state.rate_limiter.num_deletes(),
            sampler_options: state.sampler.options(),
            remover_options: state.remover.options(),
            signature: self.signature.clone(),
        }
    }

    /// Serializable state plus strong references to every chunk any
    /// stored item needs, so the data outlives the snapshot.
    pub fn checkpoint(&self) -> (TableCheckpoint, Vec<Arc<Chunk>>) {
        let state = self.state.lock().unwrap();
        let mut chunks: HashMap<u64, Arc<Chunk>> = HashMap::new();
        let mut items: Vec<ItemCheckpoint> = state
            .items
            .values()
            .map(|entry| {
                for chunk in &entry.chunks {
                    chunks.entry(chunk.key()).or_insert_with(|| chunk.clone());
                }
                ItemCheckpoint {
                    key: entry.item.key,
                    priority: entry.item.priority,
                    times_sampled: entry.times_sampled,
                    trajectory: entry.item.trajectory.clone(),
                }
            })
            .collect();
        items.sort_by_key(|item| item.key);
        let checkpoint = TableCheckpoint {
            name: self.name.clone(),
            max_size: self.max_size,
            max_times_sampled: self.max_times_sampled,
            sampler: state.sampler.options(),
            remover: state.remover.options(),
            rate_limiter: state.rate_limiter.checkpoint(),
            signature: self.signature.clone(),
            items,
        };
        (checkpoint, chunks.into_values().collect())
    }

    /// Rebuilds a table from a checkpoint, resolving item chunks
    /// against `chunk_store`.
    pub fn from_checkpoint(cp: TableCheckpoint, chunk_store: &ChunkStore) -> Result<Self> {
        let mut sampler = cp.sampler.build();
        let mut remover = cp.remover.build();
        let mut items = HashMap::with_capacity(cp.items.len());
        for item in cp.items {
            let chunks = chunk_store.get_many(&item.trajectory.chunk_keys())?;
            sampler.insert(item.key, item.priority)?;
            remover.insert(item.key, item.priority)?;
            items.insert(
                item.key,
                TableItem {
                    item: PrioritizedItem {
                        key: item.key,
                        table: cp.name.clone(),
                        priority: item.priority,
                        trajectory: item.trajectory,
                    },
                    chunks,
                    times_sampled: item.times_sampled,
                },
            );
        }
        Ok(Self {
            name: cp.name,
            max_size: cp.max_size,
            max_times_sampled: cp.max_times_sampled,
            signature: cp.signature,
            state: Mutex::new(TableState {
                items,
                sampler,
                remover,
                rate_limiter: RateLimiter::from_checkpoint(&cp.rate_limiter),
                extensions: Vec::new(),
                closed: false,
            }),
            wakeup: Condvar::new(),
        })
    }

    fn cancelled(&self) -> ResoundError {
        ResoundError::Cancelled(format!("table {} closed", self.name))
    }

    fn check_priority(priority: f64) -> Result<()> {
        if !priority.is_finite() || priority < 0.0 {
            return Err(ResoundError::InvalidArgument(format!(
                "item priority must be finite and non-negative, got {}",
                priority
            )));
        }
        Ok(())
    }

    // Every chunk the trajectory references must be among the item's
    // strong references; otherwise data could be collected while the
    // item still points at it.
    fn check_chunks(item: &TableItem) -> Result<()> {
        let held: HashSet<u64> = item.chunks.iter().map(|c| c.key()).collect();
        for key in item.item.trajectory.chunk_keys() {
            if !held.contains(&key) {
                return Err(ResoundError::InvalidArgument(format!(
                    "item {} references chunk {} without holding it",
                    item.item.key, key
                )));
            }
        }
        Ok(())
    }

    fn await_admission<'a, F>(
        &self,
        mut guard: MutexGuard<'a, TableState>,
        timeout: Option<Duration>,
        admitted: F,
    ) -> Result<MutexGuard<'a, TableState>>
    where
        F: Fn(&TableState) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if guard.closed {
                return Err(self.cancelled());
            }
            if admitted(&guard) {
                return Ok(guard);
            }
            guard = match deadline {
                None => self.wakeup.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(error::rate_limiter_timeout());
                    }
                    self.wakeup.wait_timeout(guard, deadline - now).unwrap().0
                }
            };
        }
    }

    fn assign_locked(state: &mut TableState, item: TableItem) -> Result<()> {
        let key = item.item.key;
        let priority = item.item.priority;
        state
            .sampler
            .update(key, priority)
            .map_err(|e| ResoundError::Internal(format!("sampler out of sync: {}", e)))?;
        state
            .remover
            .update(key, priority)
            .map_err(|e| ResoundError::Internal(format!("remover out of sync: {}", e)))?;
        let TableState {
            items, extensions, ..
        } = state;
        let entry = items.get_mut(&key).ok_or_else(|| {
            ResoundError::Internal(format!("assigned item {} disappeared", key))
        })?;
        entry.item = item.item;
        entry.chunks = item.chunks;
        entry.times_sampled = 0;
        for ext in extensions.iter_mut() {
            ext.on_update(entry);
        }
        Ok(())
    }

    fn update_priority_locked(state: &mut TableState, key: ItemKey, priority: f64) -> Result<()> {
        state
            .sampler
            .update(key, priority)
            .map_err(|e| ResoundError::Internal(format!("sampler out of sync: {}", e)))?;
        state
            .remover
            .update(key, priority)
            .map_err(|e| ResoundError::Internal(format!("remover out of sync: {}", e)))?;
        let TableState {
            items, extensions, ..
        } = state;
        let entry = items.get_mut(&key).ok_or_else(|| {
            ResoundError::Internal(format!("updated item {} disappeared", key))
        })?;
        entry.item.priority = priority;
        for ext in extensions.iter_mut() {
            ext.on_update(entry);
        }
        Ok(())
    }

    fn delete_item_locked(state: &mut TableState, key: ItemKey) -> Result<TableItem> {
        let entry = state.items.remove(&key).ok_or_else(|| {
            ResoundError::Internal(format!("deleted item {} not in table", key))
        })?;
        state
            .sampler
            .delete(key)
            .map_err(|e| ResoundError::Internal(format!("sampler out of sync: {}", e)))?;
        state
            .remover
            .delete(key)
            .map_err(|e| ResoundError::Internal(format!("remover out of sync: {}", e)))?;
        state.rate_limiter.delete();
        for ext in state.extensions.iter_mut() {
            ext.on_delete(&entry);
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::FlatTrajectory;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::selector::SelectorOptions;
    use std::sync::Arc;
    use std::thread;

    fn item(key: ItemKey, priority: f64) -> TableItem {
        TableItem::new(
            PrioritizedItem {
                key,
                table: "t".to_string(),
                priority,
                trajectory: FlatTrajectory { columns: vec![] },
            },
            vec![],
        )
    }

    fn fifo_queue_table(max_size: usize) -> Table {
        Table::new(
            TableConfig::default()
                .name("queue")
                .sampler(SelectorOptions::Fifo)
                .remover(SelectorOptions::Fifo)
                .max_size(max_size)
                .rate_limiter(RateLimiterConfig::min_size(1)),
        )
        .unwrap()
    }

    #[test]
    fn full_table_evicts_via_remover() {
        let table = fifo_queue_table(2);
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        table.insert_or_assign(item(2, 1.0), None).unwrap();
        table.insert_or_assign(item(3, 1.0), None).unwrap();
        assert_eq!(table.size(), 2);
        // FIFO remover evicted the oldest item; sampling sees 2 then 3.
        assert_eq!(table.sample(None).unwrap().item.key, 2);
        table.mutate_items(&[], &[2]).unwrap();
        assert_eq!(table.sample(None).unwrap().item.key, 3);
    }

    #[test]
    fn duplicate_key_is_an_assign() {
        let table = Table::new(
            TableConfig::default()
                .name("t")
                .sampler(SelectorOptions::Heap { min_heap: false })
                .remover(SelectorOptions::Fifo)
                .max_size(10),
        )
        .unwrap();
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        table.insert_or_assign(item(2, 5.0), None).unwrap();
        assert_eq!(table.info().num_inserts, 2);

        // Re-inserting key 1 replaces its priority without consuming
        // insert budget, and the max-heap sampler re-sorts.
        table.insert_or_assign(item(1, 10.0), None).unwrap();
        assert_eq!(table.info().num_inserts, 2);
        assert_eq!(table.size(), 2);
        assert_eq!(table.sample(None).unwrap().item.key, 1);
    }

    #[test]
    fn max_times_sampled_deletes_after_last_draw() {
        let table = Table::new(
            TableConfig::default()
                .name("queue")
                .sampler(SelectorOptions::Fifo)
                .remover(SelectorOptions::Fifo)
                .max_size(10)
                .max_times_sampled(2)
                .rate_limiter(RateLimiterConfig::min_size(1)),
        )
        .unwrap();
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        assert_eq!(table.sample(None).unwrap().times_sampled, 1);
        assert_eq!(table.size(), 1);
        assert_eq!(table.sample(None).unwrap().times_sampled, 2);
        assert_eq!(table.size(), 0);
        assert_eq!(table.info().num_deletes, 1);
    }

    #[test]
    fn negative_priority_rejected() {
        let table = fifo_queue_table(4);
        assert!(matches!(
            table.insert_or_assign(item(1, -1.0), None),
            Err(ResoundError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sample_times_out_with_limiter_marker() {
        let table = fifo_queue_table(4);
        let err = table
            .sample(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(error::is_rate_limiter_timeout(&err));
    }

    #[test]
    fn close_cancels_blocked_sample() {
        let table = Arc::new(fifo_queue_table(4));
        let sampler = {
            let table = table.clone();
            thread::spawn(move || table.sample(None))
        };
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        table.close();
        let result = sampler.join().unwrap();
        assert!(matches!(result, Err(ResoundError::Cancelled(_))));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn insert_unblocks_waiting_sampler() {
        let config = TableConfig::default()
            .name("coupled")
            .sampler(SelectorOptions::Fifo)
            .remover(SelectorOptions::Fifo)
            .max_size(10)
            .rate_limiter(RateLimiterConfig {
                samples_per_insert: 2.0,
                min_size_to_sample: 1,
                min_diff: 0.0,
                max_diff: 2.0,
            });
        let table = Arc::new(Table::new(config).unwrap());

        // Sampling an empty table blocks on the limiter.
        let sampler = {
            let table = table.clone();
            thread::spawn(move || table.sample(None))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!sampler.is_finished());

        table.insert_or_assign(item(1, 1.0), None).unwrap();
        assert_eq!(sampler.join().unwrap().unwrap().item.key, 1);

        // One insert admits two samples at this ratio; the third blocks.
        table.sample(None).unwrap();
        let err = table
            .sample(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(error::is_rate_limiter_timeout(&err));
    }

    #[test]
    fn mutate_updates_and_skips_missing() {
        let table = Table::new(
            TableConfig::default()
                .name("t")
                .sampler(SelectorOptions::Heap { min_heap: false })
                .remover(SelectorOptions::Fifo)
                .max_size(10),
        )
        .unwrap();
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        table.insert_or_assign(item(2, 2.0), None).unwrap();
        table
            .mutate_items(&[(1, 9.0), (77, 1.0)], &[2, 88])
            .unwrap();
        assert_eq!(table.size(), 1);
        let sampled = table.sample(None).unwrap();
        assert_eq!(sampled.item.key, 1);
        assert_eq!(sampled.priority, 9.0);
    }

    #[test]
    fn reset_clears_counters_and_items() {
        let table = fifo_queue_table(4);
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        table.sample(None).unwrap();
        table.reset();
        let info = table.info();
        assert_eq!(info.size, 0);
        assert_eq!(info.num_inserts, 0);
        assert_eq!(info.num_samples, 0);
        // After a reset the limiter gates sampling again.
        assert!(table.sample(Some(Duration::from_millis(10))).is_err());
    }

    #[test]
    fn flexible_batch_amortizes_draws() {
        let table = Table::new(
            TableConfig::default()
                .name("t")
                .sampler(SelectorOptions::Uniform)
                .remover(SelectorOptions::Fifo)
                .max_size(10)
                .rate_limiter(RateLimiterConfig::min_size(1)),
        )
        .unwrap();
        for key in 0..4 {
            table.insert_or_assign(item(key, 1.0), None).unwrap();
        }
        let batch = table.sample_flexible_batch(8, None).unwrap();
        assert_eq!(batch.len(), 8);
        assert!(batch.iter().all(|s| (s.probability - 0.25).abs() < 1e-12));
        assert_eq!(table.info().num_samples, 8);
    }

    #[test]
    fn flexible_batch_stops_at_limiter_boundary() {
        let table = Table::new(
            TableConfig::default()
                .name("t")
                .sampler(SelectorOptions::Fifo)
                .remover(SelectorOptions::Fifo)
                .max_size(10)
                .rate_limiter(RateLimiterConfig {
                    samples_per_insert: 3.0,
                    min_size_to_sample: 1,
                    min_diff: 0.0,
                    max_diff: 3.0,
                }),
        )
        .unwrap();
        table.insert_or_assign(item(1, 1.0), None).unwrap();
        // One insert funds exactly three samples; the batch must not
        // overdraw even though more were requested.
        let batch = table.sample_flexible_batch(10, None).unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn extension_hooks_observe_operations() {
        use crate::table::OpStatsExtension;
        let table = fifo_queue_table(1);
        let ext = OpStatsExtension::new();
        let stats = ext.stats();
        table.add_extension(Box::new(ext));

        table.insert_or_assign(item(1, 1.0), None).unwrap();
        table.insert_or_assign(item(2, 1.0), None).unwrap(); // evicts 1
        table.sample(None).unwrap();
        table.mutate_items(&[(2, 3.0)], &[]).unwrap();
        table.reset();

        let stats = stats.lock().unwrap();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.resets, 1);
    }
}
