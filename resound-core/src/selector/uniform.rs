//! Uniform selection.

use super::{ItemSelector, KeyWithProbability, SelectorOptions};
use crate::chunk::ItemKey;
use crate::error::{ResoundError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Selects among all keys with equal probability.
///
/// Keys live in a dense vector so deletion is swap-with-last and every
/// operation is O(1).
pub struct UniformSelector {
    keys: Vec<ItemKey>,
    key_to_index: HashMap<ItemKey, usize>,
    rng: StdRng,
}

impl UniformSelector {
    /// Creates an empty selector.
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            key_to_index: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for UniformSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemSelector for UniformSelector {
    fn insert(&mut self, key: ItemKey, _priority: f64) -> Result<()> {
        let index = self.keys.len();
        match self.key_to_index.entry(key) {
            Entry::Occupied(_) => {
                return Err(ResoundError::InvalidArgument(format!(
                    "key {} already inserted",
                    key
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(index);
            }
        }
        self.keys.push(key);
        Ok(())
    }

    fn update(&mut self, key: ItemKey, _priority: f64) -> Result<()> {
        if !self.key_to_index.contains_key(&key) {
            return Err(ResoundError::InvalidArgument(format!(
                "key {} not found",
                key
            )));
        }
        Ok(())
    }

    fn delete(&mut self, key: ItemKey) -> Result<()> {
        let index = self.key_to_index.remove(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        let last = self.keys.len() - 1;
        if index != last {
            let moved = self.keys[last];
            self.keys[index] = moved;
            self.key_to_index.insert(moved, index);
        }
        self.keys.pop();
        Ok(())
    }

    fn sample(&mut self) -> KeyWithProbability {
        assert!(!self.keys.is_empty(), "sample() called on empty selector");
        let index = self.rng.gen_range(0..self.keys.len());
        KeyWithProbability {
            key: self.keys[index],
            probability: 1.0 / self.keys.len() as f64,
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.key_to_index.clear();
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn options(&self) -> SelectorOptions {
        SelectorOptions::Uniform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_fails() {
        let mut s = UniformSelector::new();
        s.insert(1, 0.0).unwrap();
        assert!(s.insert(1, 0.0).is_err());
        assert_eq!(s.len(), 1);
        // The original mapping must survive the failed insert.
        s.delete(1).unwrap();
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn unknown_keys_fail() {
        let mut s = UniformSelector::new();
        assert!(s.update(5, 1.0).is_err());
        assert!(s.delete(5).is_err());
    }

    #[test]
    fn delete_swaps_with_last() {
        let mut s = UniformSelector::new();
        for key in 0..4 {
            s.insert(key, 0.0).unwrap();
        }
        s.delete(1).unwrap();
        assert_eq!(s.len(), 3);
        // The remaining keys are all still sampleable.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(s.sample().key);
        }
        assert_eq!(seen, [0u64, 2, 3].into_iter().collect());
    }

    #[test]
    fn probability_is_one_over_n() {
        let mut s = UniformSelector::new();
        for key in 0..8 {
            s.insert(key, 0.0).unwrap();
        }
        assert!((s.sample().probability - 0.125).abs() < 1e-12);
    }
}
