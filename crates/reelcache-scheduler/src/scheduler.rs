//! The cache scheduler.
//!
//! Owns the frame cache behind one coarse lock, the worker pool, and the
//! display thread's side of caching: mode reconciliation, promotion,
//! dispatch and display evaluation. Dispatch bookkeeping lives behind a
//! second lock that is always taken before the cache lock.

use crate::config::{ModeSizes, SchedulerConfig};
use crate::evaluator::{EvalContext, Evaluator, ImageResult, OutputProducer};
use crate::worker::{Signal, WorkerPool, WorkerState};
use parking_lot::{Mutex, MutexGuard};
use reelcache_cache::{CacheMode, CacheStats, FrameCache, FreeMode};
use reelcache_core::{Buffer, BufferId, Frame, FrameBounds, NodeKey, Playback, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Admit an evaluated frame. Returns false if the cache refused a buffer.
pub(crate) fn admit(cache: &mut FrameCache, frame: Frame, image: ImageResult, force: bool) -> bool {
    if image.buffers.is_empty() {
        return false;
    }
    cache.require_ids(frame, image.required_ids());
    for buffer in image.buffers {
        if !cache.add(buffer, frame, force, None) {
            return false;
        }
    }
    true
}

#[derive(Default)]
struct PublishedStats {
    snapshot: CacheStats,
    at: Option<Instant>,
}

/// State shared with the worker threads.
pub(crate) struct Shared {
    pub(crate) cache: Mutex<FrameCache>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) signal: Signal,
    pub(crate) config: SchedulerConfig,
    pub(crate) slow_media: AtomicBool,
    outputs: Mutex<BTreeSet<NodeKey>>,
    stats: Mutex<PublishedStats>,
}

impl Shared {
    pub(crate) fn pop_output(&self) -> Option<NodeKey> {
        self.outputs.lock().pop_first()
    }

    /// Publish a fresh snapshot if the last one is older than the stats
    /// interval. Called with the cache lock held.
    pub(crate) fn publish_stats_if_due(&self, cache: &mut FrameCache) {
        let due = self
            .stats
            .lock()
            .at
            .map_or(true, |at| at.elapsed() >= self.config.stats_interval());
        if due {
            self.publish_stats(cache);
        }
    }

    /// Publish a fresh snapshot now. Called with the cache lock held.
    pub(crate) fn publish_stats(&self, cache: &mut FrameCache) {
        let mut published = self.stats.lock();
        published.snapshot = cache.refresh_stats().clone();
        published.at = Some(Instant::now());
        trace!(
            used = published.snapshot.used,
            frames = published.snapshot.cached_frame_count(),
            "published cache stats"
        );
    }
}

struct DispatchState {
    mode: CacheMode,
    mode_sizes: ModeSizes,
    mode_changed: bool,
    view_changed: bool,
    invalid: bool,
}

/// Frame returned to the display thread.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub frame: Frame,
    pub buffers: Vec<Buffer>,
    /// Served from the cache without evaluation.
    pub from_cache: bool,
    /// The evaluator pushed back on memory; the cache should be refilled
    /// around this frame.
    pub needs_refill: bool,
}

pub struct CacheScheduler {
    shared: Arc<Shared>,
    dispatch: Mutex<DispatchState>,
    pool: Mutex<WorkerPool>,
}

impl CacheScheduler {
    /// Validate `config`, build the cache and start the workers parked.
    pub fn new(config: SchedulerConfig, evaluator: Arc<dyn Evaluator>) -> Result<Self> {
        config.validate()?;

        let mode = CacheMode::Buffer;
        let mut cache = FrameCache::with_policy(config.mode_sizes.get(mode), config.policy);
        cache.set_mode(mode);
        cache.set_free_mode(free_mode_for(mode));

        let workers = config.worker_threads;
        let mode_sizes = config.mode_sizes;
        let shared = Arc::new(Shared {
            cache: Mutex::new(cache),
            evaluator,
            signal: Signal::new(workers),
            config,
            slow_media: AtomicBool::new(false),
            outputs: Mutex::new(BTreeSet::new()),
            stats: Mutex::new(PublishedStats::default()),
        });
        let pool = WorkerPool::spawn(&shared, workers)?;
        info!(workers, capacity = mode_sizes.get(mode), "cache scheduler started");

        Ok(Self {
            shared,
            dispatch: Mutex::new(DispatchState {
                mode,
                mode_sizes,
                mode_changed: false,
                view_changed: false,
                invalid: false,
            }),
            pool: Mutex::new(pool),
        })
    }

    /// Exclusive access to the frame cache. Workers block on the same lock,
    /// so hold it briefly.
    pub fn lock_cache(&self) -> MutexGuard<'_, FrameCache> {
        self.shared.cache.lock()
    }

    pub fn mode(&self) -> CacheMode {
        self.dispatch.lock().mode
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn worker_count(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_slow_media(&self) -> bool {
        self.shared.slow_media.load(Ordering::Acquire)
    }

    /// Switch caching mode and playable range.
    ///
    /// Workers keep running when nothing but the playback direction
    /// changed; otherwise they are stopped, the cache is reconfigured, and
    /// caching is redispatched.
    pub fn set_caching_mode(&self, mode: CacheMode, bounds: FrameBounds, playback: Playback) {
        let mut d = self.dispatch.lock();
        let bytes = d.mode_sizes.get(mode);
        let unchanged = {
            let cache = self.shared.cache.lock();
            cache.bounds() == bounds
                && cache.capacity() == bytes
                && d.mode == mode
                && self.shared.signal.is_running()
        };

        debug!(?mode, ?bounds, unchanged, "set caching mode");
        if !unchanged && d.mode != CacheMode::Never {
            self.finish_caching_threads();
        }
        if d.mode != mode {
            d.mode_changed = true;
        }
        d.mode = mode;

        {
            let mut cache = self.shared.cache.lock();
            if bytes != 0 {
                cache.set_memory_usage(bytes);
            }
            cache.set_mode(mode);
            cache.set_free_mode(free_mode_for(mode));
            cache.set_bounds(bounds);
            if mode == CacheMode::Never {
                let keep = playback.display.unwrap_or(bounds.min);
                cache.set_playback(playback);
                cache.clear_all_but_frame(keep, false);
            }
            if cache.used() > cache.capacity() {
                cache.emergency_free();
            }
        }

        match mode {
            CacheMode::Never => {}
            _ if !unchanged => self.dispatch_with(&mut d, playback),
            _ => {
                self.shared.cache.lock().set_display_inc(playback.inc);
                drop(d);
                self.awaken_all_caching_threads();
            }
        }
    }

    /// Start or restart caching from the given playback state.
    pub fn dispatch_caching_threads(&self, playback: Playback) {
        let mut d = self.dispatch.lock();
        self.dispatch_with(&mut d, playback);
    }

    fn dispatch_with(&self, d: &mut DispatchState, playback: Playback) {
        if d.mode == CacheMode::Never {
            return;
        }

        {
            let mut cache = self.shared.cache.lock();
            cache.set_playback(playback);
            if cache.used() > cache.capacity() {
                cache.emergency_free();
            }
        }

        if d.mode_changed || d.view_changed || d.invalid {
            debug!(
                mode_changed = d.mode_changed,
                view_changed = d.view_changed,
                invalid = d.invalid,
                "reconciling frame cache"
            );
            self.finish_caching_threads();
            if d.view_changed || d.invalid {
                self.shared.cache.lock().clear_frame_caches();
            }
            self.promote(d.mode, playback);
            d.mode_changed = false;
            d.view_changed = false;
            d.invalid = false;
        }

        self.shared.cache.lock().take_utility_state_changed();
        self.shared.signal.awaken();
    }

    /// Adopt frames whose buffers are still in the store's trash, walking
    /// outward from the display frame in the play direction first.
    fn promote(&self, mode: CacheMode, playback: Playback) -> usize {
        let bounds = self.shared.cache.lock().bounds();
        if bounds.is_empty() {
            return 0;
        }
        let pivot = playback
            .display
            .unwrap_or(bounds.min)
            .clamp(bounds.min, bounds.max - 1);
        let last = bounds.max - 1;
        let passes: Vec<(Frame, Frame, i32)> = match mode {
            CacheMode::Buffer if playback.forward() => vec![(pivot, last, 1), (pivot, bounds.min, -1)],
            CacheMode::Buffer => vec![(pivot, bounds.min, -1), (pivot, last, 1)],
            CacheMode::Greedy => vec![(bounds.min, last, 1)],
            CacheMode::Never => Vec::new(),
        };

        let budget = self.shared.config.promotion_budget();
        let started = Instant::now();
        let mut visited = 0usize;
        let mut promoted = 0usize;

        'passes: for (from, to, inc) in passes {
            let mut f = from;
            while f != to + inc {
                visited += 1;
                if visited % 100 == 0 && started.elapsed() > budget {
                    debug!(frame = f, promoted, "promotion out of time");
                    break 'passes;
                }
                {
                    let cache = self.shared.cache.lock();
                    if cache.store().trash_len() == 0 {
                        trace!(promoted, "nothing left to promote");
                        break 'passes;
                    }
                    if cache.is_frame_cached(f) {
                        f += inc;
                        continue;
                    }
                }
                let tree = match self.shared.evaluator.evaluate_identifier(f) {
                    Ok(tree) => tree,
                    Err(e) => {
                        warn!(frame = f, error = %e, "identifier evaluation failed, promotion aborted");
                        break 'passes;
                    }
                };
                let mut cache = self.shared.cache.lock();
                if cache.promote_frame(f, &tree) {
                    promoted += 1;
                }
                f += inc;
            }
        }

        debug!(promoted, elapsed_ms = started.elapsed().as_millis() as u64, "promotion pass");
        promoted
    }

    /// Stop all workers and wait until they are parked.
    pub fn finish_caching_threads(&self) {
        self.shared.signal.stop_and_wait();
    }

    /// Change the budget for `mode`, applying it at once if `mode` is
    /// current.
    pub fn set_cache_mode_size(&self, mode: CacheMode, bytes: usize) {
        let mut d = self.dispatch.lock();
        d.mode_sizes.set(mode, bytes);
        if d.mode != mode {
            return;
        }
        {
            let mut cache = self.shared.cache.lock();
            debug!(?mode, bytes, used = cache.used(), "cache budget changed");
            cache.set_memory_usage(bytes);
            cache.emergency_free();
        }
        drop(d);
        self.awaken_all_caching_threads();
    }

    /// Wake the workers if anything affecting utility changed since the
    /// last wake. A dispatch in progress wakes them anyway, so this gives up
    /// rather than wait for it. Returns true if the workers were woken.
    pub fn awaken_all_caching_threads(&self) -> bool {
        let Some(d) = self.dispatch.try_lock() else {
            return false;
        };
        if d.mode == CacheMode::Never {
            return false;
        }
        let changed = self.shared.cache.lock().take_utility_state_changed();
        if changed {
            self.shared.signal.awaken();
        }
        changed
    }

    /// Update playback and wake the workers if that changes their targets.
    pub fn set_playback(&self, playback: Playback) {
        self.shared.cache.lock().set_playback(playback);
        self.awaken_all_caching_threads();
    }

    pub fn max_group_size(&self, slow_media: bool) -> usize {
        self.shared.config.max_group_size(slow_media)
    }

    /// The cached frames no longer match what would be rendered. The next
    /// dispatch clears them and promotes what it can.
    pub fn invalidate_frame_cache(&self) {
        self.dispatch.lock().invalid = true;
    }

    /// The viewed output changed. The next dispatch clears frame state and
    /// promotes what it can.
    pub fn set_view_changed(&self) {
        self.dispatch.lock().view_changed = true;
    }

    /// Flush every identity containing one of `patterns` and let the
    /// workers refill.
    pub fn flush_ids_containing(&self, patterns: &[&str]) -> usize {
        let count = self.shared.cache.lock().flush_ids_containing(patterns);
        if count > 0 {
            self.shared.signal.awaken();
        }
        count
    }

    /// Produce `frame` for display.
    ///
    /// A cached frame first gets a cache-only pass. If the evaluator
    /// reports the cached contents stale, or names identities the cache does
    /// not hold for the frame, it is evaluated again with decoding allowed.
    /// Memory back-pressure in either pass retries once with full evaluation
    /// and asks for a refill. Evaluated frames are force-admitted so the
    /// display frame is always resident.
    pub fn evaluate_for_display(&self, frame: Frame) -> Result<DisplayFrame> {
        let cached = {
            let mut cache = self.shared.cache.lock();
            cache.set_display_frame(frame);
            cache.is_frame_cached(frame)
        };

        let evaluator = &self.shared.evaluator;
        let mut needs_refill = false;
        let mut stale = false;
        let mut fresh = None;
        if cached {
            match evaluator.evaluate(frame, &EvalContext::display_cache_only()) {
                Ok(image) if image.buffers.is_empty() => {
                    if let Some(buffers) = self.cached_buffers(frame, &image.required_ids()) {
                        self.awaken_all_caching_threads();
                        return Ok(DisplayFrame {
                            frame,
                            buffers,
                            from_cache: true,
                            needs_refill: false,
                        });
                    }
                    debug!(frame, "cached identities changed, evaluating");
                    stale = true;
                }
                // The evaluator decoded anyway; use what it made.
                Ok(image) => fresh = Some(image),
                Err(e) if e.is_stale() => {
                    debug!(frame, "stale cache pass, evaluating");
                    stale = true;
                }
                Err(e) if e.is_back_pressure() => {
                    debug!(frame, "cache-only pass hit a full cache, evaluating");
                    needs_refill = true;
                }
                Err(e) => return Err(e),
            }
        }

        let image = match fresh {
            Some(image) => image,
            None => self.evaluate_display(frame, &mut needs_refill)?,
        };

        let buffers = image.buffers.clone();
        {
            let mut cache = self.shared.cache.lock();
            if stale {
                let keep: BTreeSet<BufferId> = image.required_ids().into_iter().collect();
                let outdated: Vec<BufferId> = cache
                    .frame_ids(frame)
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();
                cache.trim_buffers_of_frame(frame, &outdated);
            }
            admit(&mut cache, frame, image, true);
        }
        self.awaken_all_caching_threads();

        Ok(DisplayFrame {
            frame,
            buffers,
            from_cache: false,
            needs_refill,
        })
    }

    /// Buffers for `frame` if `ids` are exactly the identities the cache
    /// holds for it and all are resident.
    fn cached_buffers(&self, frame: Frame, ids: &[BufferId]) -> Option<Vec<Buffer>> {
        let cache = self.shared.cache.lock();
        let held: BTreeSet<BufferId> = cache.frame_ids(frame).into_iter().collect();
        let wanted: BTreeSet<BufferId> = ids.iter().cloned().collect();
        if wanted.is_empty() || wanted != held || !cache.is_frame_cached(frame) {
            return None;
        }
        ids.iter().map(|id| cache.get(id).cloned()).collect()
    }

    /// Full display evaluation, retried once on a stale pass or memory
    /// back-pressure.
    fn evaluate_display(&self, frame: Frame, needs_refill: &mut bool) -> Result<ImageResult> {
        let ctx = EvalContext::display();
        let evaluator = &self.shared.evaluator;
        match evaluator.evaluate(frame, &ctx) {
            Ok(image) => Ok(image),
            Err(e) if e.is_stale() => {
                debug!(frame, "stale evaluation, retrying");
                evaluator.evaluate(frame, &ctx)
            }
            Err(e) if e.is_back_pressure() => {
                debug!(frame, "display evaluation hit a full cache, retrying");
                *needs_refill = true;
                evaluator.evaluate(frame, &ctx)
            }
            Err(e) => Err(e),
        }
    }

    /// Last snapshot published by the workers.
    pub fn published_stats(&self) -> CacheStats {
        self.shared.stats.lock().snapshot.clone()
    }

    /// Current statistics. Never waits on the cache lock: if a worker holds
    /// it, the last published snapshot is returned.
    pub fn cache_stats(&self) -> CacheStats {
        match self.shared.cache.try_lock() {
            Some(mut cache) => {
                let snapshot = cache.refresh_stats().clone();
                let mut published = self.shared.stats.lock();
                published.snapshot = snapshot.clone();
                published.at = Some(Instant::now());
                snapshot
            }
            None => self.shared.stats.lock().snapshot.clone(),
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.signal.states()
    }

    /// Block until every worker has finished its pass and parked.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.shared.signal.wait_until_idle(timeout)
    }

    /// Queue a producer's output for caching ahead of frame work. Producers
    /// without the capability are refused.
    pub fn push_cacheable_output(&self, producer: &dyn OutputProducer) -> bool {
        if !producer.is_cacheable_output_producer() {
            return false;
        }
        let key = producer.producer_key();
        trace!(node = %key, tag = producer.tag(), "queued cacheable output");
        self.shared.outputs.lock().insert(key);
        self.shared.signal.awaken();
        true
    }

    /// Stop and join every worker. Idempotent.
    pub fn shutdown(&self) {
        self.shared.signal.shutdown();
        self.pool.lock().join();
        debug!("cache scheduler shut down");
    }
}

impl Drop for CacheScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn free_mode_for(mode: CacheMode) -> FreeMode {
    match mode {
        CacheMode::Buffer => FreeMode::Greedy,
        CacheMode::Greedy | CacheMode::Never => FreeMode::Conservative,
    }
}
