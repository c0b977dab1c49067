//! Reference-counted object store with a lazy trash list.
//!
//! The store is the single owner of every resident [`Buffer`]. Callers hold
//! references by identity and count them through [`ObjectStore::reference`]
//! and [`ObjectStore::dereference`]. A buffer whose count drops to zero is
//! not deleted; it moves to the trash, where it stays reusable until space is
//! needed. Trash is reclaimed oldest first.

use reelcache_core::{Buffer, BufferId};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Outcome of [`ObjectStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored within budget, or already resident.
    Stored,
    /// Forced in while over budget.
    StoredOverBudget,
    /// Not stored: over budget and not forced.
    Rejected,
}

impl Admission {
    /// True if the buffer is resident after the call.
    pub fn is_resident(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

struct Entry {
    buffer: Buffer,
    refs: u32,
    /// Position in the trash list while unreferenced.
    trash_seq: Option<u64>,
}

pub struct ObjectStore {
    entries: HashMap<BufferId, Entry>,
    /// Unreferenced buffers, oldest first.
    trash: BTreeMap<u64, BufferId>,
    next_seq: u64,
    used: usize,
    capacity: usize,
}

impl ObjectStore {
    /// Create a store with the given byte budget.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            trash: BTreeMap::new(),
            next_seq: 0,
            used: 0,
            capacity,
        }
    }

    /// Insert `buffer` unless an identical identity is already resident.
    ///
    /// When the insertion would exceed the budget, trash is reclaimed first.
    /// If that is not enough the buffer is rejected, unless `force` is set,
    /// in which case it is stored anyway so that at least one frame can
    /// always make progress. New buffers start unreferenced.
    pub fn add(&mut self, buffer: Buffer, force: bool) -> Admission {
        if self.entries.contains_key(buffer.id()) {
            return Admission::Stored;
        }

        let size = buffer.memory_size();
        if self.used + size > self.capacity {
            self.free_trash(self.used + size - self.capacity);
        }

        let over = self.used + size > self.capacity;
        if over && !force {
            debug!(
                id = %buffer.id(),
                size,
                used = self.used,
                capacity = self.capacity,
                "store rejected buffer"
            );
            return Admission::Rejected;
        }

        let id = buffer.id().clone();
        self.used += size;
        let seq = self.push_trash(id.clone());
        self.entries.insert(
            id,
            Entry {
                buffer,
                refs: 0,
                trash_seq: Some(seq),
            },
        );

        if over {
            Admission::StoredOverBudget
        } else {
            Admission::Stored
        }
    }

    /// Add one reference. Returns false if `id` is not resident.
    pub fn reference(&mut self, id: &BufferId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.refs += 1;
        if let Some(seq) = entry.trash_seq.take() {
            self.trash.remove(&seq);
        }
        true
    }

    /// Drop one reference, moving the buffer to the trash when none remain.
    /// Returns false if `id` is not resident.
    pub fn dereference(&mut self, id: &BufferId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 && entry.trash_seq.is_none() {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.trash.insert(seq, id.clone());
            if let Some(entry) = self.entries.get_mut(id) {
                entry.trash_seq = Some(seq);
            }
        }
        true
    }

    /// Reclaim at least `bytes` from the trash, oldest first.
    ///
    /// Returns true if enough was reclaimed.
    pub fn free_trash(&mut self, bytes: usize) -> bool {
        let mut freed = 0;
        while freed < bytes {
            let Some((_, id)) = self.trash.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&id) {
                let size = entry.buffer.memory_size();
                self.used -= size;
                freed += size;
                trace!(id = %id, size, "reclaimed trash buffer");
            }
        }
        freed >= bytes
    }

    /// Remove `id` if nothing references it. Returns true if it was removed.
    pub fn flush(&mut self, id: &BufferId) -> bool {
        match self.entries.get(id) {
            Some(entry) if entry.refs == 0 => {
                if let Some(seq) = entry.trash_seq {
                    self.trash.remove(&seq);
                }
                if let Some(entry) = self.entries.remove(id) {
                    self.used -= entry.buffer.memory_size();
                }
                true
            }
            _ => false,
        }
    }

    /// Drop every buffer, referenced or not.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.trash.clear();
        self.used = 0;
    }

    pub fn is_cached(&self, id: &BufferId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &BufferId) -> Option<&Buffer> {
        self.entries.get(id).map(|e| &e.buffer)
    }

    pub fn ref_count(&self, id: &BufferId) -> Option<u32> {
        self.entries.get(id).map(|e| e.refs)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, bytes: usize) {
        self.capacity = bytes;
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of unreferenced buffers awaiting reuse or reclamation.
    pub fn trash_len(&self) -> usize {
        self.trash.len()
    }

    pub fn trash_bytes(&self) -> usize {
        self.trash
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.buffer.memory_size())
            .sum()
    }

    fn push_trash(&mut self, id: BufferId) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.trash.insert(seq, id);
        seq
    }
}
