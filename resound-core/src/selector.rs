//! Item selection strategies.
//!
//! A selector maintains the key set of one table and answers `sample()`
//! according to its policy. Tables hold two of them: the *sampler*
//! decides what consumers receive, the *remover* decides the eviction
//! victim when the table is full. Selectors are not synchronized; the
//! owning table's mutex serializes every call, including access to the
//! selector's random generator.

mod fifo;
mod heap;
mod lifo;
mod prioritized;
mod uniform;

pub use fifo::FifoSelector;
pub use heap::HeapSelector;
pub use lifo::LifoSelector;
pub use prioritized::PrioritizedSelector;
pub use uniform::UniformSelector;

use crate::chunk::ItemKey;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A sampled key together with the probability of having drawn it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KeyWithProbability {
    /// The selected key.
    pub key: ItemKey,
    /// Probability of this draw under the selector's current state.
    /// Deterministic selectors report 1.
    pub probability: f64,
}

/// An ordered or weighted key set supporting insert, delete, update and
/// sample.
///
/// Duplicate inserts and unknown updates/deletes fail `InvalidArgument`.
/// `sample()` requires a non-empty selector; callers are expected to
/// check [`ItemSelector::len`] first.
pub trait ItemSelector: Send {
    /// Registers a new key. `priority` is ignored by policies that do
    /// not weigh keys.
    fn insert(&mut self, key: ItemKey, priority: f64) -> Result<()>;

    /// Changes the priority of a registered key.
    fn update(&mut self, key: ItemKey, priority: f64) -> Result<()>;

    /// Removes a registered key.
    fn delete(&mut self, key: ItemKey) -> Result<()>;

    /// Draws a key according to the policy.
    fn sample(&mut self) -> KeyWithProbability;

    /// Removes all keys.
    fn clear(&mut self);

    /// Number of registered keys.
    fn len(&self) -> usize;

    /// Whether no key is registered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The serializable discriminator used to rebuild this selector from
    /// a checkpoint.
    fn options(&self) -> SelectorOptions;
}

/// Serializable description of a selector, usable to construct one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SelectorOptions {
    /// Every key equally likely.
    Uniform,
    /// Oldest key first.
    Fifo,
    /// Newest key first.
    Lifo,
    /// Lowest (`min_heap`) or highest priority first.
    Heap {
        /// Whether the lowest priority is at the root.
        min_heap: bool,
    },
    /// Probability proportional to `priority^priority_exponent`.
    Prioritized {
        /// Exponent applied to priorities. Zero yields uniform weights.
        priority_exponent: f64,
    },
}

impl SelectorOptions {
    /// Builds a fresh, empty selector of the described kind.
    pub fn build(&self) -> Box<dyn ItemSelector> {
        match self {
            SelectorOptions::Uniform => Box::new(UniformSelector::new()),
            SelectorOptions::Fifo => Box::new(FifoSelector::new()),
            SelectorOptions::Lifo => Box::new(LifoSelector::new()),
            SelectorOptions::Heap { min_heap } => Box::new(HeapSelector::new(*min_heap)),
            SelectorOptions::Prioritized { priority_exponent } => {
                Box::new(PrioritizedSelector::new(*priority_exponent))
            }
        }
    }
}
