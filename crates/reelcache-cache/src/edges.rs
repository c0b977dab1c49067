//! Frontier index over cached frames.
//!
//! An edge is a cached frame with at least one immediately adjacent uncached
//! neighbour inside `[min, max)`. Walking outward from edges finds the next
//! frame worth caching, and walking inward finds the next frame worth
//! freeing, in O(edges) instead of O(frames).
//!
//! Edge types are recomputed for a frame and its two neighbours whenever the
//! frame changes state, so the index is always exactly what a full rebuild
//! would produce.

use reelcache_core::{Frame, FrameBounds, Playback};
use std::collections::BTreeMap;

/// Which side(s) of a frame border uncached frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    LeftOnly,
    RightOnly,
    BothSides,
    NeitherSide,
}

impl EdgeType {
    fn from_sides(left_open: bool, right_open: bool) -> Self {
        match (left_open, right_open) {
            (true, true) => Self::BothSides,
            (true, false) => Self::LeftOnly,
            (false, true) => Self::RightOnly,
            (false, false) => Self::NeitherSide,
        }
    }

    pub fn left_open(self) -> bool {
        matches!(self, Self::LeftOnly | Self::BothSides)
    }

    pub fn right_open(self) -> bool {
        matches!(self, Self::RightOnly | Self::BothSides)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub frame: Frame,
    pub kind: EdgeType,
}

impl Edge {
    pub fn new(frame: Frame, kind: EdgeType) -> Self {
        Self { frame, kind }
    }
}

/// Range and playback state the candidate queries depend on.
#[derive(Debug, Clone, Copy)]
pub struct FrontierView {
    pub bounds: FrameBounds,
    pub playback: Playback,
    pub active_tail: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrontierIndex {
    edges: BTreeMap<Frame, EdgeType>,
}

impl FrontierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `frame` became cached.
    ///
    /// Narrows or removes neighbouring edges whose open side just closed.
    /// Repeated calls without an intervening state change are no-ops.
    pub fn add_cache_edge(
        &mut self,
        frame: Frame,
        bounds: &FrameBounds,
        is_cached: impl Fn(Frame) -> bool,
    ) {
        if !is_cached(frame) || self.edges.contains_key(&frame) {
            return;
        }
        self.refresh(frame - 1, bounds, &is_cached);
        self.refresh(frame, bounds, &is_cached);
        self.refresh(frame + 1, bounds, &is_cached);
    }

    /// Record that `frame` became uncached.
    ///
    /// Neighbours that are still cached widen, or become edges if they were
    /// interior.
    pub fn remove_cache_edge(
        &mut self,
        frame: Frame,
        bounds: &FrameBounds,
        is_cached: impl Fn(Frame) -> bool,
    ) {
        self.edges.remove(&frame);
        self.refresh(frame - 1, bounds, &is_cached);
        self.refresh(frame + 1, bounds, &is_cached);
    }

    /// Recompute every edge from the set of cached frames.
    pub fn rebuild(
        &mut self,
        cached: impl IntoIterator<Item = Frame>,
        bounds: &FrameBounds,
        is_cached: impl Fn(Frame) -> bool,
    ) {
        self.edges.clear();
        for frame in cached {
            if let Some(kind) = classify(frame, bounds, &is_cached) {
                self.edges.insert(frame, kind);
            }
        }
    }

    fn refresh(&mut self, frame: Frame, bounds: &FrameBounds, is_cached: &impl Fn(Frame) -> bool) {
        match classify(frame, bounds, is_cached) {
            Some(kind) => {
                self.edges.insert(frame, kind);
            }
            None => {
                self.edges.remove(&frame);
            }
        }
    }

    /// Candidates to free: fixed boundary frames followed by every edge.
    ///
    /// The lowest free utility over all cached frames is guaranteed to be in
    /// this set.
    pub fn possible_free_targets(
        &self,
        view: &FrontierView,
        is_cached: impl Fn(Frame) -> bool,
    ) -> Vec<Edge> {
        let b = &view.bounds;
        let mut out = Vec::with_capacity(self.edges.len() + 6);

        if is_cached(b.min) {
            out.push(Edge::new(b.min, EdgeType::RightOnly));
        }
        if is_cached(b.max - 1) {
            out.push(Edge::new(b.max - 1, EdgeType::LeftOnly));
        }
        if b.in_frame != b.min && is_cached(b.in_frame) {
            out.push(Edge::new(b.in_frame, EdgeType::BothSides));
        }
        if b.out_frame != b.max && is_cached(b.out_frame - 1) {
            out.push(Edge::new(b.out_frame - 1, EdgeType::BothSides));
        }
        if let Some(display) = view.playback.display {
            let next = display + 1;
            let prev = display - 1;
            if next < b.max - 1 && is_cached(next) {
                out.push(Edge::new(next, EdgeType::RightOnly));
            }
            if prev > b.min && is_cached(prev) {
                out.push(Edge::new(prev, EdgeType::LeftOnly));
            }
        }

        out.extend(self.edges.iter().map(|(&f, &k)| Edge::new(f, k)));
        out
    }

    /// Candidates to cache: uncached boundary frames, then the uncached
    /// neighbour on each open side of every edge.
    ///
    /// Outside active tail caching only the play direction is explored from
    /// the fixed boundary frames.
    pub fn possible_cache_targets(
        &self,
        view: &FrontierView,
        is_cached: impl Fn(Frame) -> bool,
    ) -> Vec<Edge> {
        let b = &view.bounds;
        let display = view.playback.display;
        let mut out = Vec::with_capacity(self.edges.len() * 2 + 5);

        if view.active_tail {
            if let Some(d) = display.filter(|&d| !is_cached(d)) {
                out.push(Edge::new(d, EdgeType::BothSides));
            }
            if !is_cached(b.min) {
                out.push(Edge::new(b.min, EdgeType::RightOnly));
            }
            if !is_cached(b.max - 1) {
                out.push(Edge::new(b.max - 1, EdgeType::LeftOnly));
            }
            if b.in_frame != b.min && !is_cached(b.in_frame) {
                out.push(Edge::new(b.in_frame, EdgeType::BothSides));
            }
            if b.out_frame != b.max && !is_cached(b.out_frame - 1) {
                out.push(Edge::new(b.out_frame - 1, EdgeType::BothSides));
            }
        } else {
            let forward = view.playback.forward();
            let toward = if forward {
                EdgeType::RightOnly
            } else {
                EdgeType::LeftOnly
            };

            if let Some(d) = display.filter(|&d| !is_cached(d)) {
                out.push(Edge::new(d, toward));
            }
            if forward && !is_cached(b.min) {
                out.push(Edge::new(b.min, EdgeType::RightOnly));
            }
            if !forward && !is_cached(b.max - 1) {
                out.push(Edge::new(b.max - 1, EdgeType::LeftOnly));
            }
            if b.in_frame != b.min && !is_cached(b.in_frame) {
                out.push(Edge::new(b.in_frame, toward));
            }
            if b.out_frame != b.max && !is_cached(b.out_frame - 1) {
                out.push(Edge::new(b.out_frame - 1, toward));
            }
        }

        for (&frame, &kind) in &self.edges {
            if kind.left_open() {
                out.push(Edge::new(frame - 1, EdgeType::LeftOnly));
            }
            if kind.right_open() {
                out.push(Edge::new(frame + 1, EdgeType::RightOnly));
            }
        }
        out
    }

    pub fn get(&self, frame: Frame) -> Option<EdgeType> {
        self.edges.get(&frame).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges.iter().map(|(&f, &k)| Edge::new(f, k))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }
}

/// Edge type of `frame`, or `None` if it is not an edge.
fn classify(frame: Frame, bounds: &FrameBounds, is_cached: &impl Fn(Frame) -> bool) -> Option<EdgeType> {
    if !bounds.contains(frame) || !is_cached(frame) {
        return None;
    }
    let left_open = frame > bounds.min && !is_cached(frame - 1);
    let right_open = frame < bounds.max - 1 && !is_cached(frame + 1);
    match EdgeType::from_sides(left_open, right_open) {
        EdgeType::NeitherSide => None,
        kind => Some(kind),
    }
}
