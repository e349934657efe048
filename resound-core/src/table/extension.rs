//! Table extension hooks.

use super::base::TableItem;
use std::sync::{Arc, Mutex};

/// Observer hooks invoked by a table around its mutations.
///
/// Hooks run with the table mutex held, in registration order, in
/// mutex-acquisition order across operations. An extension must never
/// call back into its table; doing so deadlocks. Extensions observe,
/// they do not decide.
pub trait TableExtension: Send {
    /// Called after an item was inserted.
    fn on_insert(&mut self, _item: &TableItem) {}

    /// Called after an item was sampled (before a possible
    /// max-times-sampled deletion).
    fn on_sample(&mut self, _item: &TableItem) {}

    /// Called after an item's priority was updated or assigned.
    fn on_update(&mut self, _item: &TableItem) {}

    /// Called after an item was deleted or evicted.
    fn on_delete(&mut self, _item: &TableItem) {}

    /// Called after the table was reset.
    fn on_reset(&mut self) {}
}

/// Operation counters collected by [`OpStatsExtension`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
    /// Number of observed inserts.
    pub inserts: u64,
    /// Number of observed samples.
    pub samples: u64,
    /// Number of observed priority updates.
    pub updates: u64,
    /// Number of observed deletions.
    pub deletes: u64,
    /// Number of observed resets.
    pub resets: u64,
}

/// A monitoring extension counting table operations.
///
/// The counters are shared: clone the handle returned by
/// [`OpStatsExtension::stats`] before registering the extension.
#[derive(Default)]
pub struct OpStatsExtension {
    stats: Arc<Mutex<OpStats>>,
}

impl OpStatsExtension {
    /// Creates an extension with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared handle to the counters.
    pub fn stats(&self) -> Arc<Mutex<OpStats>> {
        self.stats.clone()
    }
}

impl TableExtension for OpStatsExtension {
    fn on_insert(&mut self, _item: &TableItem) {
        self.stats.lock().unwrap().inserts += 1;
    }

    fn on_sample(&mut self, _item: &TableItem) {
        self.stats.lock().unwrap().samples += 1;
    }

    fn on_update(&mut self, _item: &TableItem) {
        self.stats.lock().unwrap().updates += 1;
    }

    fn on_delete(&mut self, _item: &TableItem) {
        self.stats.lock().unwrap().deletes += 1;
    }

    fn on_reset(&mut self) {
        self.stats.lock().unwrap().resets += 1;
    }
}
