//! Proportional prioritized selection over a sum tree.

use super::{ItemSelector, KeyWithProbability, SelectorOptions};
use crate::chunk::ItemKey;
use crate::error::{ResoundError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

// Initial node capacity; grows geometrically.
const INITIAL_CAPACITY: usize = 131_072;

// Maximum tolerated deviation between a maintained subtree sum and its
// recomputation before the whole tree is rebuilt.
const MAX_SUM_DEVIATION: f64 = 1e-4;

#[derive(Clone, Copy, Debug, Default)]
struct Node {
    key: ItemKey,
    // Exponentiated priority of this node alone.
    value: f64,
    // value plus the sums of both children, maintained incrementally.
    sum: f64,
}

/// Selects keys with probability proportional to
/// `priority^priority_exponent`.
///
/// The weights live in a complete binary tree stored as a flat vector
/// (children of `i` at `2i + 1` and `2i + 2`) where every node carries
/// its own weight and the total of its subtree, so insert, update,
/// delete and sample are all O(log n).
///
/// Since weights are doubles, repeated incremental updates accumulate
/// rounding error; the residues can even go negative. Whenever a
/// maintained sum drifts more than `1e-4` from its recomputation the
/// tree is rebuilt in O(n). Priorities of roughly similar scale and a
/// modest exponent (below ~2) keep that rare.
pub struct PrioritizedSelector {
    priority_exponent: f64,
    nodes: Vec<Node>,
    key_to_index: HashMap<ItemKey, usize>,
    rng: StdRng,
}

impl PrioritizedSelector {
    /// Creates an empty selector. `priority_exponent` must be finite and
    /// non-negative; zero weighs every key equally.
    pub fn new(priority_exponent: f64) -> Self {
        Self::with_capacity(priority_exponent, INITIAL_CAPACITY)
    }

    fn with_capacity(priority_exponent: f64, capacity: usize) -> Self {
        Self {
            priority_exponent,
            nodes: vec![Node::default(); capacity],
            key_to_index: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    fn node_sum(&self, index: usize) -> f64 {
        if index < self.nodes.len() {
            self.nodes[index].sum
        } else {
            0.0
        }
    }

    // The exact sum at `index` given its own weight and the maintained
    // sums of its children.
    fn local_sum(&self, index: usize) -> f64 {
        self.nodes[index].value + self.node_sum(2 * index + 1) + self.node_sum(2 * index + 2)
    }

    fn set_node(&mut self, index: usize, value: f64) {
        let diff = value - self.nodes[index].value;
        self.nodes[index].value = value;

        let mut needs_reinit = false;
        let mut i = index;
        loop {
            self.nodes[i].sum += diff;
            let drift = (self.nodes[i].sum - self.local_sum(i)).abs();
            if drift > MAX_SUM_DEVIATION || self.nodes[i].sum < -MAX_SUM_DEVIATION {
                needs_reinit = true;
                break;
            }
            if i == 0 {
                break;
            }
            i = (i - 1) / 2;
        }
        if needs_reinit {
            self.reinitialize();
        }
    }

    // Recomputes every subtree sum bottom-up. O(n); only reached when
    // rounding errors have compounded past the tolerance.
    fn reinitialize(&mut self) {
        for i in (0..self.nodes.len()).rev() {
            self.nodes[i].sum = self.local_sum(i);
        }
    }

    fn exponentiated(&self, key: ItemKey, priority: f64) -> Result<f64> {
        if !priority.is_finite() || priority < 0.0 {
            return Err(ResoundError::InvalidArgument(format!(
                "priority of key {} must be finite and non-negative, got {}",
                key, priority
            )));
        }
        Ok(priority.powf(self.priority_exponent))
    }

    // Walks from the root consuming `target` mass until the node whose
    // own weight covers the remainder is reached.
    fn descend(&self, mut target: f64) -> usize {
        let mut i = 0;
        loop {
            if target < self.nodes[i].value {
                return i;
            }
            target -= self.nodes[i].value;
            let left = 2 * i + 1;
            let right = left + 1;
            if left >= self.nodes.len() {
                return i;
            }
            let left_sum = self.node_sum(left);
            let right_sum = self.node_sum(right);
            if (target < left_sum && left_sum > 0.0) || right_sum <= 0.0 {
                i = left;
            } else {
                target -= left_sum;
                i = right;
            }
        }
    }
}

impl ItemSelector for PrioritizedSelector {
    fn insert(&mut self, key: ItemKey, priority: f64) -> Result<()> {
        let value = self.exponentiated(key, priority)?;
        if self.key_to_index.contains_key(&key) {
            return Err(ResoundError::InvalidArgument(format!(
                "key {} already inserted",
                key
            )));
        }
        let index = self.key_to_index.len();
        if index == self.nodes.len() {
            let grown = self.nodes.len() * 2;
            self.nodes.resize(grown, Node::default());
        }
        self.key_to_index.insert(key, index);
        self.nodes[index].key = key;
        self.set_node(index, value);
        Ok(())
    }

    fn update(&mut self, key: ItemKey, priority: f64) -> Result<()> {
        let value = self.exponentiated(key, priority)?;
        let index = *self.key_to_index.get(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        self.set_node(index, value);
        Ok(())
    }

    fn delete(&mut self, key: ItemKey) -> Result<()> {
        let index = self.key_to_index.remove(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        let last = self.key_to_index.len();
        if index != last {
            let moved_key = self.nodes[last].key;
            let moved_value = self.nodes[last].value;
            self.nodes[index].key = moved_key;
            self.set_node(index, moved_value);
            self.key_to_index.insert(moved_key, index);
        }
        self.set_node(last, 0.0);
        self.nodes[last].key = 0;
        Ok(())
    }

    fn sample(&mut self) -> KeyWithProbability {
        assert!(
            !self.key_to_index.is_empty(),
            "sample() called on empty selector"
        );
        let total = self.nodes[0].sum;
        let target = self.rng.gen::<f64>() * total * 0.999_999_9;
        let index = self.descend(target.max(0.0));
        let node = &self.nodes[index];
        KeyWithProbability {
            key: node.key,
            probability: if total > 0.0 {
                node.value / total
            } else {
                0.0
            },
        }
    }

    fn clear(&mut self) {
        for node in &mut self.nodes {
            *node = Node::default();
        }
        self.key_to_index.clear();
    }

    fn len(&self) -> usize {
        self.key_to_index.len()
    }

    fn options(&self) -> SelectorOptions {
        SelectorOptions::Prioritized {
            priority_exponent: self.priority_exponent,
        }
    }
}
