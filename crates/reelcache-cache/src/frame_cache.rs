//! The frame cache: admission and eviction policy over the object store.
//!
//! Maps frame numbers to the buffer identities that render them and keeps
//! the reverse index from identity to frames. Both maps, the frontier index
//! and the store are only ever changed together through the private
//! reference/dereference helpers, so the cross-references cannot dangle.
//!
//! `FrameCache` is not internally synchronized. The scheduler owns it behind
//! a single coarse lock.

use crate::edges::{Edge, EdgeType, FrontierIndex, FrontierView};
use crate::per_node::PerNodeCache;
use crate::stats::{look_ahead_seconds, CacheStats};
use crate::store::ObjectStore;
use crate::utility::{CacheMode, CachePolicy, Purpose, Utility, UTILITY_MAX, UTILITY_MIN};
use crossbeam_channel::Sender;
use reelcache_core::{
    Buffer, BufferId, CacheError, Frame, FrameBounds, FrameRange, IdTree, NodeKey, Playback,
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// How willing eviction is to give up frames inside the in/out region.
///
/// Candidates are always ranked by utility. The mode only decides whether a
/// region frame may be offered up for an admission worth no more than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FreeMode {
    /// Region frames only give way to strictly more valuable frames.
    #[default]
    Conservative,
    /// Like Conservative, except region frames behind the display frame
    /// are always eligible.
    Active,
    /// Any frame is eligible.
    Greedy,
}

/// How much of an identifier tree is resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMembership {
    All,
    Some,
    None,
}

/// Notifications emitted by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The buffer held for a producer changed.
    TextureCacheUpdated(NodeKey),
}

/// A frame chosen for caching or freeing, with its utility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheTarget {
    pub frame: Option<Frame>,
    pub utility: f32,
    /// Direction to extend a group from this frame.
    pub inc: i32,
}

impl CacheTarget {
    fn none(utility: f32) -> Self {
        Self {
            frame: None,
            utility,
            inc: 1,
        }
    }
}

#[derive(Debug, Default)]
struct FrameEntry {
    ids: BTreeSet<BufferId>,
    /// Identities needed before the frame counts as cached. Without one, any
    /// single identity is enough.
    required: Option<BTreeSet<BufferId>>,
}

impl FrameEntry {
    fn is_complete(&self) -> bool {
        !self.ids.is_empty()
            && self
                .required
                .as_ref()
                .map_or(true, |required| required.is_subset(&self.ids))
    }

    fn is_partial(&self) -> bool {
        !self.ids.is_empty() && !self.is_complete()
    }
}

pub struct FrameCache {
    store: ObjectStore,
    frames: BTreeMap<Frame, FrameEntry>,
    item_map: HashMap<BufferId, BTreeSet<Frame>>,
    edges: FrontierIndex,
    per_node: PerNodeCache,
    /// Frames claimed by a worker, each with the frame it plans to free.
    being_cached: BTreeMap<Frame, Option<Frame>>,
    scheduled_for_freeing: HashSet<Frame>,
    /// Frames holding some but not all of their identities. They are not
    /// frontier edges, so eviction finds them here.
    partial: BTreeSet<Frame>,
    utility: Utility,
    free_mode: FreeMode,
    /// Caching utility of the admission in progress. `free` only evicts
    /// frames worth less than this.
    target_cache_utility: f32,
    overflow_boundary: usize,
    utility_state_changed: bool,
    stats_dirty: bool,
    stats: CacheStats,
    events: Option<Sender<CacheEvent>>,
}

impl FrameCache {
    /// Create an empty cache with a byte budget and default policy.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, CachePolicy::default())
    }

    pub fn with_policy(capacity: usize, policy: CachePolicy) -> Self {
        Self {
            store: ObjectStore::new(capacity),
            frames: BTreeMap::new(),
            item_map: HashMap::new(),
            edges: FrontierIndex::new(),
            per_node: PerNodeCache::new(),
            being_cached: BTreeMap::new(),
            scheduled_for_freeing: HashSet::new(),
            partial: BTreeSet::new(),
            utility: Utility {
                mode: CacheMode::default(),
                bounds: FrameBounds::default(),
                playback: Playback::default(),
                policy,
            },
            free_mode: FreeMode::default(),
            target_cache_utility: UTILITY_MAX,
            overflow_boundary: 0,
            utility_state_changed: false,
            stats_dirty: true,
            stats: CacheStats {
                capacity,
                ..Default::default()
            },
            events: None,
        }
    }

    /// Route cache notifications to `sender`.
    pub fn set_event_sender(&mut self, sender: Sender<CacheEvent>) {
        self.events = Some(sender);
    }

    // ── State and configuration ──────────────────────────────────

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn frontier(&self) -> &FrontierIndex {
        &self.edges
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn used(&self) -> usize {
        self.store.used()
    }

    pub fn mode(&self) -> CacheMode {
        self.utility.mode
    }

    pub fn bounds(&self) -> FrameBounds {
        self.utility.bounds
    }

    pub fn playback(&self) -> Playback {
        self.utility.playback
    }

    pub fn policy(&self) -> CachePolicy {
        self.utility.policy
    }

    pub fn free_mode(&self) -> FreeMode {
        self.free_mode
    }

    pub fn overflow_boundary(&self) -> usize {
        self.overflow_boundary
    }

    /// True once usage is back at the point where admission last had to be
    /// forced over budget, and there is no trash left to reclaim.
    pub fn overflowing(&self) -> bool {
        self.overflow_boundary != 0
            && self.store.used() >= self.overflow_boundary
            && self.store.trash_len() == 0
    }

    pub fn set_mode(&mut self, mode: CacheMode) {
        if self.utility.mode != mode {
            self.utility.mode = mode;
            self.utility_state_changed = true;
        }
    }

    pub fn set_free_mode(&mut self, mode: FreeMode) {
        self.free_mode = mode;
    }

    /// Change the byte budget. The caller applies `emergency_free` if the
    /// cache is now over budget.
    pub fn set_memory_usage(&mut self, bytes: usize) {
        if self.store.capacity() != bytes {
            self.store.set_capacity(bytes);
            self.utility_state_changed = true;
            self.overflow_boundary = 0;
            self.stats_dirty = true;
        }
    }

    pub fn set_display_frame(&mut self, frame: Frame) {
        if self.utility.playback.display != Some(frame) {
            self.utility.playback.display = Some(frame);
            self.stats_dirty = true;
            self.flag_if_look_ahead();
        }
    }

    pub fn set_display_inc(&mut self, inc: i32) {
        if self.utility.playback.inc != inc {
            self.utility.playback.inc = inc;
            self.stats_dirty = true;
            self.flag_if_look_ahead();
        }
    }

    pub fn set_fps(&mut self, fps: f32) {
        if self.utility.playback.fps != fps {
            self.utility.playback.fps = fps;
            self.stats_dirty = true;
        }
    }

    pub fn set_playback(&mut self, playback: Playback) {
        if let Some(display) = playback.display {
            self.set_display_frame(display);
        }
        self.set_display_inc(playback.inc);
        self.set_fps(playback.fps);
    }

    pub fn set_look_behind(&mut self, percent: f32) {
        if self.utility.policy.look_behind_percent != percent {
            self.utility.policy.look_behind_percent = percent;
            self.flag_if_look_ahead();
        }
    }

    pub fn set_active_tail(&mut self, enabled: bool) {
        if self.utility.policy.active_tail_caching != enabled {
            self.utility.policy.active_tail_caching = enabled;
            self.flag_if_look_ahead();
        }
    }

    pub fn set_cache_outside_region(&mut self, enabled: bool) {
        if self.utility.policy.cache_outside_region != enabled {
            self.utility.policy.cache_outside_region = enabled;
            self.utility_state_changed = true;
        }
    }

    pub fn set_policy(&mut self, policy: CachePolicy) {
        self.set_look_behind(policy.look_behind_percent);
        self.set_active_tail(policy.active_tail_caching);
        self.set_cache_outside_region(policy.cache_outside_region);
    }

    pub fn set_in_out(&mut self, in_frame: Frame, out_frame: Frame) {
        let b = &mut self.utility.bounds;
        if b.in_frame != in_frame || b.out_frame != out_frame {
            b.in_frame = in_frame;
            b.out_frame = out_frame;
            self.utility_state_changed = true;
        }
    }

    /// Change the playable range. The frontier is rebuilt because range
    /// boundaries close edge sides.
    pub fn set_min_max(&mut self, min: Frame, max: Frame) {
        let b = &mut self.utility.bounds;
        if b.min != min || b.max != max {
            b.min = min;
            b.max = max;
            self.utility_state_changed = true;
            self.rebuild_frontier();
        }
    }

    pub fn set_bounds(&mut self, bounds: FrameBounds) {
        self.set_in_out(bounds.in_frame, bounds.out_frame);
        self.set_min_max(bounds.min, bounds.max);
    }

    pub fn utility_state_changed(&self) -> bool {
        self.utility_state_changed
    }

    /// Read and reset the "utility state changed" flag.
    pub fn take_utility_state_changed(&mut self) -> bool {
        std::mem::take(&mut self.utility_state_changed)
    }

    fn flag_if_look_ahead(&mut self) {
        if self.utility.mode == CacheMode::Buffer {
            self.utility_state_changed = true;
        }
    }

    fn view(&self) -> FrontierView {
        FrontierView {
            bounds: self.utility.bounds,
            playback: self.utility.playback,
            active_tail: self.utility.policy.active_tail_caching,
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn utility(&self, frame: Frame, purpose: Purpose) -> f32 {
        self.utility.value(frame, purpose)
    }

    /// True iff every identity the frame needs is resident and referenced.
    pub fn is_frame_cached(&self, frame: Frame) -> bool {
        self.frames.get(&frame).is_some_and(FrameEntry::is_complete)
    }

    /// True if the frame holds some but not all of the identities it needs.
    pub fn has_partial_frame_cache(&self, frame: Frame) -> bool {
        self.frames.get(&frame).is_some_and(FrameEntry::is_partial)
    }

    /// Cached frames in ascending order.
    pub fn cached_frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.frames
            .iter()
            .filter(|(_, e)| e.is_complete())
            .map(|(&f, _)| f)
    }

    pub fn cached_frame_count(&self) -> usize {
        self.cached_frames().count()
    }

    pub fn frame_ids(&self, frame: Frame) -> Vec<BufferId> {
        self.frames
            .get(&frame)
            .map(|e| e.ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Frames that reference `id`.
    pub fn frames_of(&self, id: &BufferId) -> Vec<Frame> {
        self.item_map
            .get(id)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &BufferId) -> Option<&Buffer> {
        self.store.get(id)
    }

    pub fn is_being_cached(&self, frame: Frame) -> bool {
        self.being_cached.contains_key(&frame)
    }

    pub fn is_scheduled_for_freeing(&self, frame: Frame) -> bool {
        self.scheduled_for_freeing.contains(&frame)
    }

    pub fn frames_being_cached(&self) -> Vec<Frame> {
        self.being_cached.keys().copied().collect()
    }

    /// How much of `tree` is resident in the store.
    pub fn test_in_cache(&self, tree: &IdTree) -> TreeMembership {
        let ids = tree.ids();
        let present = ids.iter().filter(|id| self.store.is_cached(id)).count();
        if ids.is_empty() || present == 0 {
            TreeMembership::None
        } else if present == ids.len() {
            TreeMembership::All
        } else {
            TreeMembership::Some
        }
    }

    // ── Admission ────────────────────────────────────────────────

    /// Record the identities `frame` needs to count as cached.
    pub fn require_ids(&mut self, frame: Frame, ids: impl IntoIterator<Item = BufferId>) {
        let was = self.is_frame_cached(frame);
        let required: BTreeSet<BufferId> = ids.into_iter().collect();
        self.frames.entry(frame).or_default().required = Some(required);
        self.update_frontier(frame, was);
    }

    /// Admit `buffer` and associate it with `frame`.
    ///
    /// With a `node`, the buffer instead becomes that producer's per-node
    /// entry, and the call always succeeds.
    ///
    /// Returns true once the buffer is resident and referenced by the frame,
    /// even if getting it there meant forcing the store over budget. Returns
    /// false when the cache is full and the frame had no claim to forced
    /// admission. Partial frames, an explicit `force` and an empty store all
    /// force admission, so at least one frame can always be cached.
    pub fn add(&mut self, buffer: Buffer, frame: Frame, force: bool, node: Option<&NodeKey>) -> bool {
        if let Some(node) = node {
            let id = buffer.id().clone();
            self.store.add(buffer, true);
            if self.per_node.set(&mut self.store, Some(&id), node) {
                self.notify(CacheEvent::TextureCacheUpdated(node.clone()));
            }
            return true;
        }

        let id = buffer.id().clone();
        let partial = self.has_partial_frame_cache(frame);

        if self.item_map.get(&id).is_some_and(|f| f.contains(&frame)) {
            // Already associated. Only a full cache turns away a frame that
            // is not mid-completion.
            return !self.store.is_full() || partial;
        }

        if !self.store.is_cached(&id) {
            let size = buffer.memory_size();
            if size + self.store.used() > self.store.capacity() {
                self.store.free_trash(size);
            }
            if size + self.store.used() > self.store.capacity()
                && (self.overflow_boundary == 0 || self.store.used() < self.overflow_boundary)
            {
                self.overflow_boundary = self.store.used();
            }

            let force_admit = partial || force || self.store.is_empty();
            self.target_cache_utility = self.utility(frame, Purpose::ForCaching);

            if size + self.store.used() > self.store.capacity() {
                self.free_for(size, Some(frame));
            }
            let admission = self.store.add(buffer, force_admit);
            if !admission.is_resident() {
                debug!(frame, id = %id, "admission refused, cache full");
                return false;
            }
            debug!(frame, id = %id, ?admission, used = self.store.used(), "admitted buffer");
        }

        let was = self.is_frame_cached(frame);
        self.reference_frame(frame, &id);
        self.stats_dirty = true;
        self.update_frontier(frame, was);
        true
    }

    /// Adopt `frame` as cached if every identity in `tree` is already
    /// resident. Nothing is adopted if even one is missing.
    pub fn promote_frame(&mut self, frame: Frame, tree: &IdTree) -> bool {
        let ids = tree.ids();
        if ids.is_empty() || !ids.iter().all(|id| self.store.is_cached(id)) {
            return false;
        }

        let was = self.is_frame_cached(frame);
        self.frames.entry(frame).or_default().required = Some(ids.iter().cloned().collect());
        for id in &ids {
            self.reference_frame(frame, id);
        }
        self.stats_dirty = true;
        self.update_frontier(frame, was);
        trace!(frame, ids = ids.len(), "promoted frame");
        true
    }

    /// Producer-held buffer for `node`.
    pub fn per_node_contents(&self, node: &NodeKey) -> Option<&Buffer> {
        self.per_node
            .contents_of(node)
            .and_then(|id| self.store.get(id))
    }

    /// Release the buffer held for `node`.
    pub fn clear_node(&mut self, node: &NodeKey) -> bool {
        let changed = self.per_node.set(&mut self.store, None, node);
        if changed {
            self.notify(CacheEvent::TextureCacheUpdated(node.clone()));
        }
        changed
    }

    pub fn clear_per_node(&mut self) {
        self.per_node.clear(&mut self.store);
    }

    // ── Eviction ─────────────────────────────────────────────────

    /// Make room for `bytes` more.
    ///
    /// Evicts the lowest-utility frames whose utility is below that of the
    /// admission that triggered the call, reclaiming trash as it goes.
    /// Frames a worker is caching are never evicted. Returns true if the
    /// headroom now exists; false means no eligible frame was left.
    pub fn free(&mut self, bytes: usize) -> bool {
        self.free_for(bytes, None)
    }

    /// `free`, never evicting `admitting`.
    fn free_for(&mut self, bytes: usize, admitting: Option<Frame>) -> bool {
        let capacity = self.store.capacity();
        if capacity > self.store.used() && capacity - self.store.used() >= bytes {
            return true;
        }

        let target = capacity.saturating_sub(bytes);
        self.store
            .free_trash(self.store.used().saturating_sub(target));

        let mut tried: BTreeSet<Frame> = admitting.into_iter().collect();
        while self.store.used() > capacity || capacity - self.store.used() < bytes {
            let Some(frame) = self.lowest_free_candidate(&tried) else {
                debug!(
                    bytes,
                    used = self.store.used(),
                    bar = self.target_cache_utility,
                    "no frame below the utility bar to free"
                );
                break;
            };
            tried.insert(frame);
            trace!(frame, "freeing frame");
            self.free_id_set(frame);
            if self.store.used() > target {
                self.store.free_trash(self.store.used() - target);
            }
        }

        self.stats_dirty = true;
        let used = self.store.used();
        used <= capacity && capacity - used >= bytes
    }

    /// Bring usage back under budget after an external change, treating any
    /// unprotected frame as eligible.
    pub fn emergency_free(&mut self) {
        if self.store.capacity() < self.store.used() {
            debug!(
                used = self.store.used(),
                capacity = self.store.capacity(),
                "emergency free"
            );
            self.target_cache_utility = UTILITY_MAX;
            self.free(0);
        }
        self.stats_dirty = true;
    }

    fn lowest_free_candidate(&self, tried: &BTreeSet<Frame>) -> Option<Frame> {
        let candidates = self
            .edges
            .possible_free_targets(&self.view(), |f| self.is_frame_cached(f));
        let bar = self.target_cache_utility;
        let mut best = None;
        let mut best_utility = bar;

        for Edge { frame, kind } in candidates {
            let mut f = frame;
            // Walk toward cached territory, away from the open side.
            match kind {
                EdgeType::LeftOnly => {
                    while tried.contains(&f) || self.being_cached.contains_key(&f) {
                        f += 1;
                    }
                }
                EdgeType::RightOnly => {
                    while tried.contains(&f) || self.being_cached.contains_key(&f) {
                        f -= 1;
                    }
                }
                EdgeType::BothSides => {
                    if tried.contains(&f) {
                        continue;
                    }
                }
                EdgeType::NeitherSide => continue,
            }
            self.consider_for_freeing(f, bar, &mut best, &mut best_utility);
        }
        for &f in self.partial.difference(tried) {
            self.consider_for_freeing(f, bar, &mut best, &mut best_utility);
        }
        best
    }

    /// Keep `frame` as the best eviction so far if it is eligible and worth
    /// less than the current best. `bar` is the utility of the frame that
    /// would take its place.
    fn consider_for_freeing(
        &self,
        frame: Frame,
        bar: f32,
        best: &mut Option<Frame>,
        best_utility: &mut f32,
    ) {
        if !self.utility.bounds.contains(frame)
            || self.being_cached.contains_key(&frame)
            || self.utility.playback.display == Some(frame)
            || !self.frames.get(&frame).is_some_and(|e| !e.ids.is_empty())
        {
            return;
        }
        let u = self.utility(frame, Purpose::ForFreeing);
        if u < *best_utility && self.free_mode_allows(frame, u, bar) {
            *best = Some(frame);
            *best_utility = u;
        }
    }

    fn free_mode_allows(&self, frame: Frame, utility: f32, bar: f32) -> bool {
        let b = &self.utility.bounds;
        if !b.has_region() || !b.in_region(frame) || utility < bar {
            return true;
        }
        match self.free_mode {
            FreeMode::Greedy => true,
            FreeMode::Conservative => false,
            FreeMode::Active => match self.utility.playback.display {
                Some(d) if self.utility.playback.forward() => frame < d,
                Some(d) => frame > d,
                None => false,
            },
        }
    }

    // ── Scheduling ───────────────────────────────────────────────

    /// Highest-utility uncached frame reachable from the frontier.
    pub fn find_best_cache_target(&self) -> CacheTarget {
        let candidates = self
            .edges
            .possible_cache_targets(&self.view(), |f| self.is_frame_cached(f));
        let mut result = CacheTarget::none(UTILITY_MIN);

        for Edge { frame, kind } in candidates {
            let mut f = frame;
            let mut f2 = None;
            match kind {
                EdgeType::LeftOnly => {
                    while self.unavailable_for_caching(f) {
                        f -= 1;
                    }
                }
                EdgeType::RightOnly => {
                    while self.unavailable_for_caching(f) {
                        f += 1;
                    }
                }
                EdgeType::BothSides => {
                    let mut g = f;
                    while self.unavailable_for_caching(f) {
                        f -= 1;
                    }
                    while self.unavailable_for_caching(g) {
                        g += 1;
                    }
                    f2 = Some(g);
                }
                EdgeType::NeitherSide => continue,
            }

            trace!(edge = frame, ?kind, f, ?f2, "cache candidate");
            if self.utility.bounds.contains(f) && !self.is_frame_cached(f) {
                let u = self.utility(f, Purpose::ForCaching);
                if u > result.utility {
                    result = CacheTarget {
                        frame: Some(f),
                        utility: u,
                        inc: if kind == EdgeType::RightOnly { 1 } else { -1 },
                    };
                }
            }
            if let Some(g) = f2 {
                if self.utility.bounds.contains(g) && !self.is_frame_cached(g) {
                    let u = self.utility(g, Purpose::ForCaching);
                    if u > result.utility {
                        result = CacheTarget {
                            frame: Some(g),
                            utility: u,
                            inc: 1,
                        };
                    }
                }
            }
        }
        result
    }

    /// Lowest-utility cached or partial frame that could be freed to make
    /// room for `cache_target`. Frames already scheduled for freeing are
    /// skipped.
    pub fn find_best_free_target(&self, cache_target: &CacheTarget) -> CacheTarget {
        let candidates = self
            .edges
            .possible_free_targets(&self.view(), |f| self.is_frame_cached(f));
        let mut best = None;
        let mut best_utility = UTILITY_MAX;

        for Edge { frame, kind } in candidates {
            let mut f = frame;
            match kind {
                EdgeType::LeftOnly => {
                    while self.scheduled_for_freeing.contains(&f) {
                        f += 1;
                    }
                }
                EdgeType::RightOnly => {
                    while self.scheduled_for_freeing.contains(&f) {
                        f -= 1;
                    }
                }
                EdgeType::BothSides => {
                    if self.scheduled_for_freeing.contains(&f) {
                        continue;
                    }
                }
                EdgeType::NeitherSide => continue,
            }
            self.consider_for_freeing(f, cache_target.utility, &mut best, &mut best_utility);
        }
        for &f in &self.partial {
            if !self.scheduled_for_freeing.contains(&f) {
                self.consider_for_freeing(f, cache_target.utility, &mut best, &mut best_utility);
            }
        }

        CacheTarget {
            frame: best,
            utility: best_utility,
            inc: 1,
        }
    }

    fn unavailable_for_caching(&self, frame: Frame) -> bool {
        self.is_frame_cached(frame)
            || self.being_cached.contains_key(&frame)
            || self.scheduled_for_freeing.contains(&frame)
            || self.utility.playback.display == Some(frame)
    }

    /// While overflowing, caching only pays off if what it displaces is
    /// worth less than what it brings in.
    fn trade_is_favorable(&self, cache: &CacheTarget, free: &CacheTarget) -> bool {
        if !self.overflowing() {
            return true;
        }
        let Some(frame) = cache.frame else {
            return false;
        };
        if self.utility.policy.active_tail_caching {
            free.utility < cache.utility
        } else {
            free.utility < self.utility(frame, Purpose::ForFreeing) - 0.001
        }
    }

    fn init_cache_free_pair(&mut self, cache_frame: Frame, free_frame: Option<Frame>) {
        self.being_cached.insert(cache_frame, free_frame);
        if let Some(f) = free_frame {
            self.scheduled_for_freeing.insert(f);
        }
    }

    /// Claim the best frame to cache, plus up to `max_group_size - 1`
    /// following frames in the same direction.
    ///
    /// `out` is cleared and then filled in decreasing frame order. Every
    /// claimed frame must later be passed to
    /// [`complete_caching_of_frame`](Self::complete_caching_of_frame).
    pub fn initiate_caching_of_best_frame_group(&mut self, out: &mut Vec<Frame>, max_group_size: usize) {
        out.clear();

        let target = self.find_best_cache_target();
        let Some(frame) = target.frame else {
            return;
        };
        if target.utility == 0.0 {
            return;
        }

        let free = self.find_best_free_target(&target);
        if !self.trade_is_favorable(&target, &free) {
            trace!(frame, free = ?free.frame, "caching not worth the eviction");
            return;
        }
        self.init_cache_free_pair(frame, free.frame);

        let mut count: usize = 1;
        let mut next = frame + target.inc;
        while count < max_group_size.max(1) {
            if !self.utility.bounds.contains(next) || self.unavailable_for_caching(next) {
                break;
            }
            let u = self.utility(next, Purpose::ForCaching);
            if u == 0.0 {
                break;
            }
            let candidate = CacheTarget {
                frame: Some(next),
                utility: u,
                inc: target.inc,
            };
            let free = self.find_best_free_target(&candidate);
            if !self.trade_is_favorable(&candidate, &free) {
                break;
            }
            self.init_cache_free_pair(next, free.frame);
            next += target.inc;
            count += 1;
        }

        let top = if target.inc > 0 {
            frame + count as Frame - 1
        } else {
            frame
        };
        out.extend((0..count).map(|i| top - i as Frame));
        debug!(frame, count, inc = target.inc, utility = target.utility, "initiated caching");
    }

    /// Release a worker's claim on `frame` and its paired free frame.
    pub fn complete_caching_of_frame(&mut self, frame: Frame) {
        if let Some(Some(paired)) = self.being_cached.remove(&frame) {
            self.scheduled_for_freeing.remove(&paired);
        }
        if self.frames.get(&frame).is_some_and(|e| e.ids.is_empty()) {
            self.frames.remove(&frame);
        }
    }

    // ── Flushing and clearing ────────────────────────────────────

    /// Drop `id` from every frame and remove it from the store unless a
    /// producer still holds it. Returns true if any frame referenced it.
    pub fn flush(&mut self, id: &BufferId) -> bool {
        let Some(frames) = self.item_map.get(id).cloned() else {
            return false;
        };
        for frame in frames {
            self.unlink(frame, id);
        }
        if !self.per_node.holds(id) {
            self.store.flush(id);
        }
        self.stats_dirty = true;
        true
    }

    /// Flush every identity containing any of `patterns`. Returns how many
    /// were flushed.
    pub fn flush_ids_containing(&mut self, patterns: &[&str]) -> usize {
        let matching: Vec<BufferId> = self
            .item_map
            .keys()
            .filter(|id| patterns.iter().any(|p| id.contains(p)))
            .cloned()
            .collect();
        let count = matching.len();
        for id in &matching {
            self.flush(id);
        }
        if count > 0 {
            debug!(count, "flushed identities by pattern");
        }
        count
    }

    /// Drop the listed identities from `frame` only.
    pub fn trim_buffers_of_frame(&mut self, frame: Frame, ids: &[BufferId]) {
        for id in ids {
            self.unlink(frame, id);
        }
        self.stats_dirty = true;
    }

    /// Free all frame-level state, farthest from the display frame first.
    ///
    /// Buffers stay in the store as trash, so a later promotion pass can
    /// adopt them again without decoding.
    pub fn clear_frame_caches(&mut self) {
        self.being_cached.clear();
        self.scheduled_for_freeing.clear();

        let display = self.utility.playback.display.unwrap_or(self.utility.bounds.min);
        let mut frames: Vec<Frame> = self.frames.keys().copied().collect();
        frames.sort_by_key(|&f| std::cmp::Reverse((f - display).abs()));
        for frame in frames {
            self.free_id_set(frame);
        }
        self.frames.clear();
        self.partial.clear();
        self.edges.clear();
        self.stats_dirty = true;
    }

    /// Free every frame except `frame`. With `force` the trash is emptied
    /// too.
    pub fn clear_all_but_frame(&mut self, frame: Frame, force: bool) {
        let others: Vec<Frame> = self.frames.keys().copied().filter(|&f| f != frame).collect();
        for f in others {
            self.free_id_set(f);
        }
        if force {
            self.store.free_trash(self.store.used());
        }
        self.stats_dirty = true;
    }

    /// Drop everything, store included.
    pub fn clear(&mut self) {
        self.per_node.clear(&mut self.store);
        self.frames.clear();
        self.partial.clear();
        self.item_map.clear();
        self.edges.clear();
        self.being_cached.clear();
        self.scheduled_for_freeing.clear();
        self.store.clear();
        self.overflow_boundary = 0;
        self.stats_dirty = true;
    }

    // ── Statistics ───────────────────────────────────────────────

    pub fn mark_stats_dirty(&mut self) {
        self.stats_dirty = true;
    }

    pub fn stats_dirty(&self) -> bool {
        self.stats_dirty
    }

    /// Last computed snapshot.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Recompute the snapshot if anything changed since the last call.
    pub fn refresh_stats(&mut self) -> &CacheStats {
        if self.stats_dirty {
            let cached_ranges = FrameRange::runs(self.cached_frames());
            let look_ahead = look_ahead_seconds(&cached_ranges, &self.utility.playback);
            self.stats = CacheStats {
                capacity: self.store.capacity(),
                used: self.store.used(),
                cached_ranges,
                look_ahead_seconds: look_ahead,
            };
            self.stats_dirty = false;
        }
        &self.stats
    }

    /// Verify the frame/identity cross-references, store references and
    /// frontier against each other.
    pub fn check_consistency(&self) -> Result<()> {
        for (&frame, entry) in &self.frames {
            for id in &entry.ids {
                if !self.item_map.get(id).is_some_and(|f| f.contains(&frame)) {
                    return Err(CacheError::Internal(format!(
                        "frame {frame} references {id} but the reverse index does not"
                    )));
                }
                if !self.store.ref_count(id).is_some_and(|r| r >= 1) {
                    return Err(CacheError::Internal(format!(
                        "frame {frame} references {id} which is not held by the store"
                    )));
                }
            }
        }
        for (id, frames) in &self.item_map {
            if frames.is_empty() {
                return Err(CacheError::Internal(format!("{id} has an empty frame set")));
            }
            for frame in frames {
                if !self.frames.get(frame).is_some_and(|e| e.ids.contains(id)) {
                    return Err(CacheError::Internal(format!(
                        "{id} lists frame {frame} which does not reference it"
                    )));
                }
            }
        }
        for (&frame, entry) in &self.frames {
            if entry.is_partial() != self.partial.contains(&frame) {
                return Err(CacheError::Internal(format!(
                    "partial set out of date for frame {frame}"
                )));
            }
        }
        if let Some(frame) = self
            .partial
            .iter()
            .find(|&f| !self.frames.get(f).is_some_and(FrameEntry::is_partial))
        {
            return Err(CacheError::Internal(format!(
                "partial set lists frame {frame} which is not partial"
            )));
        }
        let mut rebuilt = FrontierIndex::new();
        rebuilt.rebuild(self.cached_frames(), &self.utility.bounds, |f| {
            self.is_frame_cached(f)
        });
        if rebuilt != self.edges {
            return Err(CacheError::Internal("frontier out of date".into()));
        }
        Ok(())
    }

    // ── Internal bookkeeping ─────────────────────────────────────

    /// Drop every identity of `frame`. Identities left unreferenced move to
    /// the trash.
    fn free_id_set(&mut self, frame: Frame) {
        let ids = self.frame_ids(frame);
        for id in &ids {
            self.unlink(frame, id);
        }
        self.frames.remove(&frame);
        self.partial.remove(&frame);
    }

    fn reference_frame(&mut self, frame: Frame, id: &BufferId) {
        let entry = self.frames.entry(frame).or_default();
        if entry.ids.insert(id.clone()) {
            self.item_map.entry(id.clone()).or_default().insert(frame);
            self.store.reference(id);
        }
    }

    /// Remove one frame/identity association and keep the frontier in step.
    fn unlink(&mut self, frame: Frame, id: &BufferId) {
        let was = self.is_frame_cached(frame);
        let Some(entry) = self.frames.get_mut(&frame) else {
            return;
        };
        if !entry.ids.remove(id) {
            return;
        }
        if entry.ids.is_empty() {
            self.frames.remove(&frame);
        }
        if let Some(frames) = self.item_map.get_mut(id) {
            frames.remove(&frame);
            if frames.is_empty() {
                self.item_map.remove(id);
            }
        }
        self.store.dereference(id);
        self.update_frontier(frame, was);
    }

    fn update_frontier(&mut self, frame: Frame, was_cached: bool) {
        if self.has_partial_frame_cache(frame) {
            self.partial.insert(frame);
        } else {
            self.partial.remove(&frame);
        }
        let now = self.is_frame_cached(frame);
        if was_cached == now {
            return;
        }
        let bounds = self.utility.bounds;
        let frames = &self.frames;
        let is_cached = |f: Frame| frames.get(&f).is_some_and(FrameEntry::is_complete);
        if now {
            self.edges.add_cache_edge(frame, &bounds, is_cached);
        } else {
            self.edges.remove_cache_edge(frame, &bounds, is_cached);
        }
    }

    fn rebuild_frontier(&mut self) {
        self.partial = self
            .frames
            .iter()
            .filter(|(_, e)| e.is_partial())
            .map(|(&f, _)| f)
            .collect();
        let bounds = self.utility.bounds;
        let frames = &self.frames;
        let is_cached = |f: Frame| frames.get(&f).is_some_and(FrameEntry::is_complete);
        let cached = frames
            .iter()
            .filter(|(_, e)| e.is_complete())
            .map(|(&f, _)| f);
        self.edges.rebuild(cached, &bounds, is_cached);
    }

    fn notify(&mut self, event: CacheEvent) {
        let disconnected = self
            .events
            .as_ref()
            .is_some_and(|sender| sender.send(event).is_err());
        if disconnected {
            self.events = None;
        }
    }
}
