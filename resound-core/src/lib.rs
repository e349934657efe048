#![warn(missing_docs)]
//! Core components of the resound experience-replay engine.
//!
//! # Tables
//!
//! A [`Table`] is a named, bounded store of prioritized items. Three
//! policies govern it: a *sampler* [`ItemSelector`] decides which item a
//! consumer receives, a *remover* selector decides the eviction victim
//! when the table is full, and a [`RateLimiter`] couples insertion and
//! sampling progress so producers and consumers advance at a configured
//! ratio. All three are picked per table through [`TableConfig`].
//!
//! # Chunks and items
//!
//! Heavy step data is stored once: writers pack each column's values
//! into immutable [`Chunk`]s, and an item is merely a prioritized set of
//! references into them (a [`FlatTrajectory`] of chunk slices). The
//! process-wide [`ChunkStore`] interns chunks by key and holds them
//! weakly; strong references from table items keep the data alive for
//! exactly as long as some item needs it.
//!
//! # Service
//!
//! [`ReplayService`] multiplexes channel-backed insert and sample
//! streams onto a set of tables, one worker thread per stream. It is
//! the boundary a transport shell wraps; the client crate's writer and
//! sampler speak to it directly in process.
//!
//! # Checkpointing
//!
//! [`Checkpointer`] saves tables and the union of their chunks into
//! timestamped directories with a `DONE` sentinel, and restores the
//! newest complete one. Checkpointing is best effort: it exists to warm
//! up restarts, not to guarantee durability.
//!
//! [`ItemSelector`]: crate::ItemSelector
//! [`FlatTrajectory`]: crate::FlatTrajectory

pub mod checkpoint;
pub mod chunk;
pub mod chunk_store;
pub mod error;
pub mod item;
pub mod rate_limiter;
pub mod selector;
pub mod service;
pub mod table;
pub mod tensor;

pub use checkpoint::{Checkpointer, ItemCheckpoint, TableCheckpoint};
pub use chunk::{CellRef, Chunk, ChunkData, ChunkKey, EpisodeId, ItemKey, WeakCellRef};
pub use chunk_store::ChunkStore;
pub use error::{
    is_rate_limiter_timeout, rate_limiter_timeout, ResoundError, Result,
    RATE_LIMITER_TIMEOUT_MSG,
};
pub use item::{
    merge_columns, ChunkSlice, FlatTrajectory, PrioritizedItem, TrajectoryColumn,
};
pub use rate_limiter::{RateLimiter, RateLimiterCheckpoint, RateLimiterConfig};
pub use selector::{ItemSelector, KeyWithProbability, SelectorOptions};
pub use service::{
    InsertRequest, InsertResponse, InsertStream, ReplayService, SampleEntry, SampleRequest,
    SampleStream, ServerInfo,
};
pub use table::{
    OpStats, OpStatsExtension, SampledItem, Table, TableConfig, TableExtension, TableInfo,
    TableItem,
};
pub use tensor::{ColumnSpec, Dtype, Signature, Tensor, TensorSpec};
