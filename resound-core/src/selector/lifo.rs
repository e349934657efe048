//! Last-in-first-out selection.

use super::{ItemSelector, KeyWithProbability, SelectorOptions};
use crate::chunk::ItemKey;
use crate::error::{ResoundError, Result};
use std::collections::{BTreeMap, HashMap};

/// Always selects the key that was inserted most recently.
pub struct LifoSelector {
    keys: BTreeMap<u64, ItemKey>,
    key_to_seq: HashMap<ItemKey, u64>,
    next_seq: u64,
}

impl LifoSelector {
    /// Creates an empty selector.
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            key_to_seq: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl Default for LifoSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemSelector for LifoSelector {
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
            .last_key_value()
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
        SelectorOptions::Lifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_newest_first() {
        let mut s = LifoSelector::new();
        for key in [1, 2, 3] {
            s.insert(key, 0.0).unwrap();
        }
        assert_eq!(s.sample().key, 3);
        s.delete(3).unwrap();
        assert_eq!(s.sample().key, 2);
        s.insert(9, 0.0).unwrap();
        assert_eq!(s.sample().key, 9);
    }
}
