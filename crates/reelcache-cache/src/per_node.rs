//! One-buffer-per-producer cache for output with no frame affiliation.
//!
//! Entries here never take part in the frame-indexed admission and eviction
//! policy. They hold one store reference each and are released only when
//! replaced or cleared.

use crate::store::ObjectStore;
use reelcache_core::{BufferId, NodeKey};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PerNodeCache {
    entries: HashMap<NodeKey, BufferId>,
}

impl PerNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `id` (or nothing) as the buffer held for `node`.
    ///
    /// Returns true if anything changed.
    pub fn set(&mut self, store: &mut ObjectStore, id: Option<&BufferId>, node: &NodeKey) -> bool {
        if self.entries.get(node) == id {
            return false;
        }
        if let Some(old) = self.entries.remove(node) {
            store.dereference(&old);
        }
        if let Some(id) = id {
            if store.reference(id) {
                self.entries.insert(node.clone(), id.clone());
            }
        }
        true
    }

    pub fn contents_of(&self, node: &NodeKey) -> Option<&BufferId> {
        self.entries.get(node)
    }

    /// True if some producer holds `id`.
    pub fn holds(&self, id: &BufferId) -> bool {
        self.entries.values().any(|held| held == id)
    }

    pub fn clear(&mut self, store: &mut ObjectStore) {
        for (_, id) in self.entries.drain() {
            store.dereference(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
