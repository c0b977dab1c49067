//! Trees of buffer identities.
//!
//! Evaluating a frame's identifier (without decoding) yields one of these:
//! the shape mirrors the image operations that would produce the frame, and
//! every node may name the buffer it would emit.

use crate::buffer::BufferId;
use smallvec::SmallVec;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTree {
    pub id: Option<BufferId>,
    pub children: Vec<IdTree>,
}

impl IdTree {
    pub fn leaf(id: impl Into<BufferId>) -> Self {
        Self {
            id: Some(id.into()),
            children: Vec::new(),
        }
    }

    pub fn node(id: Option<BufferId>, children: Vec<IdTree>) -> Self {
        Self { id, children }
    }

    /// Flat list of a frame with one buffer per identity.
    pub fn from_ids<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<BufferId>,
    {
        Self::node(None, ids.into_iter().map(Self::leaf).collect())
    }

    /// Every identity in the tree, depth first, without duplicates.
    pub fn ids(&self) -> SmallVec<[BufferId; 4]> {
        let mut out = SmallVec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut SmallVec<[BufferId; 4]>) {
        if let Some(id) = &self.id {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        for child in &self.children {
            child.collect(out);
        }
    }

    /// True if no node names a buffer.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.children.iter().all(IdTree::is_empty)
    }
}
