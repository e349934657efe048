//! Heap-ordered selection.

use super::{ItemSelector, KeyWithProbability, SelectorOptions};
use crate::chunk::ItemKey;
use crate::error::{ResoundError, Result};
use std::cmp::Ordering;
use std::collections::HashMap;

struct HeapEntry {
    key: ItemKey,
    // Priority with the heap sign already applied.
    priority: f64,
    update_number: u64,
}

/// Selects the key with the lowest (min heap) or highest priority.
///
/// Entries are ordered by `(sign * priority, update_number)`; among
/// equal priorities the entry updated least recently sits at the root,
/// so repeatedly updating a sampled key cycles fairly through ties.
pub struct HeapSelector {
    sign: f64,
    update_count: u64,
    heap: Vec<HeapEntry>,
    key_to_pos: HashMap<ItemKey, usize>,
}

fn precedes(a: &HeapEntry, b: &HeapEntry) -> bool {
    match a.priority.partial_cmp(&b.priority) {
        Some(Ordering::Less) => true,
        Some(Ordering::Greater) => false,
        _ => a.update_number < b.update_number,
    }
}

impl HeapSelector {
    /// Creates an empty selector. `min_heap` puts the lowest priority at
    /// the root.
    pub fn new(min_heap: bool) -> Self {
        Self {
            sign: if min_heap { 1.0 } else { -1.0 },
            update_count: 0,
            heap: Vec::new(),
            key_to_pos: HashMap::new(),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.key_to_pos.insert(self.heap[a].key, a);
        self.key_to_pos.insert(self.heap[b].key, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !precedes(&self.heap[pos], &self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len() && precedes(&self.heap[right], &self.heap[left]) {
                child = right;
            }
            if !precedes(&self.heap[child], &self.heap[pos]) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    fn check_priority(priority: f64) -> Result<()> {
        if !priority.is_finite() {
            return Err(ResoundError::InvalidArgument(format!(
                "priority must be finite, got {}",
                priority
            )));
        }
        Ok(())
    }
}

impl ItemSelector for HeapSelector {
    fn insert(&mut self, key: ItemKey, priority: f64) -> Result<()> {
        Self::check_priority(priority)?;
        if self.key_to_pos.contains_key(&key) {
            return Err(ResoundError::InvalidArgument(format!(
                "key {} already inserted",
                key
            )));
        }
        let pos = self.heap.len();
        self.heap.push(HeapEntry {
            key,
            priority: priority * self.sign,
            update_number: self.update_count,
        });
        self.update_count += 1;
        self.key_to_pos.insert(key, pos);
        self.sift_up(pos);
        Ok(())
    }

    fn update(&mut self, key: ItemKey, priority: f64) -> Result<()> {
        Self::check_priority(priority)?;
        let pos = *self.key_to_pos.get(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        self.heap[pos].priority = priority * self.sign;
        self.heap[pos].update_number = self.update_count;
        self.update_count += 1;
        self.sift_up(pos);
        self.sift_down(pos);
        Ok(())
    }

    fn delete(&mut self, key: ItemKey) -> Result<()> {
        let pos = self.key_to_pos.remove(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        self.heap.pop();
        self.key_to_pos.remove(&key);
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        Ok(())
    }

    fn sample(&mut self) -> KeyWithProbability {
        assert!(!self.heap.is_empty(), "sample() called on empty selector");
        KeyWithProbability {
            key: self.heap[0].key,
            probability: 1.0,
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.key_to_pos.clear();
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    fn options(&self) -> SelectorOptions {
        SelectorOptions::Heap {
            min_heap: self.sign == 1.0,
        }
    }
}
