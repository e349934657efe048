//! First-in-first-out selection.

use super::{ItemSelector, KeyWithProbability, SelectorOptions};
use crate::chunk::ItemKey;
use crate::error::{ResoundError, Result};
use std::collections::{BTreeMap, HashMap};

/// Always selects the key that was inserted first.
///
/// Priorities are ignored. Keys are ordered by a monotonically
/// increasing insertion sequence so arbitrary deletion stays cheap.
pub struct FifoSelector {
    keys: BTreeMap<u64, ItemKey>,
    key_to_seq: HashMap<ItemKey, u64>,
    next_seq: u64,
}

impl FifoSelector {
    /// Creates an empty selector.
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            key_to_seq: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl Default for FifoSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemSelector for FifoSelector {
    fn insert(&mut self, key: ItemKey, _priority: f64) -> Result<()> {
        if self.key_to_seq.contains_key(&key) {
            return Err(ResoundError::InvalidArgument(format!(
                "key {} already inserted",
                key
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.key_to_seq.insert(key, seq);
        self.keys.insert(seq, key);
        Ok(())
    }

    // A no-op, but unknown keys must still be reported.
    fn update(&mut self, key: ItemKey, _priority: f64) -> Result<()> {
        if !self.key_to_seq.contains_key(&key) {
            return Err(ResoundError::InvalidArgument(format!(
                "key {} not found",
                key
            )));
        }
        Ok(())
    }

    fn delete(&mut self, key: ItemKey) -> Result<()> {
        let seq = self.key_to_seq.remove(&key).ok_or_else(|| {
            ResoundError::InvalidArgument(format!("key {} not found", key))
        })?;
        self.keys.remove(&seq);
        Ok(())
    }

    fn sample(&mut self) -> KeyWithProbability {
        let (_, &key) = self
            .keys
            .first_key_value()
            .expect("sample() called on empty selector");
        KeyWithProbability {
            key,
            probability: 1.0,
        }
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.key_to_seq.clear();
        self.next_seq = 0;
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn options(&self) -> SelectorOptions {
        SelectorOptions::Fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_in_insertion_order() {
        let mut s = FifoSelector::new();
        for key in [30, 10, 20] {
            s.insert(key, 0.0).unwrap();
        }
        assert_eq!(s.sample().key, 30);
        s.delete(30).unwrap();
        assert_eq!(s.sample().key, 10);
        s.delete(10).unwrap();
        assert_eq!(s.sample().key, 20);
    }

    #[test]
    fn arbitrary_deletes_preserve_order() {
        let mut s = FifoSelector::new();
        for key in 0..5 {
            s.insert(key, 0.0).unwrap();
        }
        s.delete(0).unwrap();
        s.delete(2).unwrap();
        assert_eq!(s.sample().key, 1);
        assert_eq!(s.sample().probability, 1.0);
    }

    #[test]
    fn contract_errors() {
        let mut s = FifoSelector::new();
        s.insert(1, 0.0).unwrap();
        assert!(s.insert(1, 0.0).is_err());
        assert!(s.update(2, 0.0).is_err());
        assert!(s.delete(2).is_err());
    }
}
