//! Client-side writer and sampler for the resound replay engine.
//!
//! The code might look like below.
//!
//! ```no_run
//! use resound_client::{
//!     Sampler, SamplerConfig, TrajectoryColumnRefs, TrajectoryWriter,
//!     TrajectoryWriterConfig,
//! };
//! use resound_core::{ReplayService, Result, Table, TableConfig};
//! use std::sync::Arc;
//!
//! fn produce_and_consume(observation: Vec<resound_core::Tensor>) -> Result<()> {
//!     let table = Table::new(TableConfig::default().name("replay"))?;
//!     let service = Arc::new(ReplayService::new(vec![Arc::new(table)])?);
//!
//!     // Producer: append steps, carve items out of the recent history.
//!     let mut writer =
//!         TrajectoryWriter::new(service.clone(), TrajectoryWriterConfig::default())?;
//!     let mut history = Vec::new();
//!     for step in observation {
//!         let refs = writer.append(vec![Some(step)])?;
//!         history.push(refs[0].clone().unwrap());
//!         if history.len() >= 2 {
//!             let window = history[history.len() - 2..].to_vec();
//!             writer.create_item(
//!                 "replay",
//!                 1.0,
//!                 vec![TrajectoryColumnRefs {
//!                     refs: window,
//!                     squeeze: false,
//!                 }],
//!             )?;
//!         }
//!     }
//!     writer.flush(0, None)?;
//!
//!     // Consumer: prefetch trajectories through worker streams.
//!     let mut sampler = Sampler::new(service, "replay", SamplerConfig::default())?;
//!     let trajectory = sampler.next_trajectory()?;
//!     assert_eq!(trajectory.columns.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! Two components mirror the two halves of a replay pipeline:
//!
//! * [`TrajectoryWriter`] buffers appended timesteps into per-column
//!   chunks via [`Chunker`]s and streams created items to the service,
//!   confirming them in the background.
//! * [`Sampler`] owns a pool of worker threads that prefetch sampled
//!   trajectories over sample streams and hands them out one at a time.
//!
//! Both talk to [`ReplayService`](resound_core::ReplayService) through
//! the channel-backed streams it exposes; a remote transport shell can
//! wrap the same message types.
mod chunker;
mod sampler;
mod writer;

pub use chunker::{Chunker, ChunkerOptions};
pub use sampler::{SampledTrajectory, Sampler, SamplerConfig, TimestepSample};
pub use writer::{TrajectoryColumnRefs, TrajectoryWriter, TrajectoryWriterConfig};
