//! Integration tests for the cache scheduler driving real worker threads.

use parking_lot::Mutex;
use reelcache_cache::CacheMode;
use reelcache_core::{
    Buffer, BufferId, CacheError, Frame, FrameBounds, IdTree, NodeKey, Playback, Result,
};
use reelcache_scheduler::{
    AccessReport, CacheScheduler, EvalContext, Evaluator, ImageResult, OutputProducer,
    SchedulerConfig, ThreadRole, WorkerState,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const FRAME: usize = 100;
const IDLE: Duration = Duration::from_secs(10);

// ── Helpers ────────────────────────────────────────────────────

/// Synthetic clip: one plate per frame, with knobs for decode time,
/// seek cost, a corrupt frame and a matte layer added mid-session.
#[derive(Default)]
struct Reel {
    decode_time: Duration,
    slow_seek: bool,
    corrupt: Option<Frame>,
    matte: AtomicBool,
    /// Set when the graph changes; the next cache-only pass misses.
    graph_changed: AtomicBool,
    cache_only: AtomicUsize,
    log: Mutex<Vec<(Frame, ThreadRole)>>,
    in_flight: Mutex<HashSet<Frame>>,
    overlaps: AtomicUsize,
}

impl Reel {
    fn evaluated(&self) -> Vec<Frame> {
        self.log.lock().iter().map(|&(f, _)| f).collect()
    }

    fn ids(&self, frame: Frame) -> Vec<BufferId> {
        let mut ids = vec![BufferId::from(format!("plate.{frame}"))];
        if self.matte.load(Ordering::SeqCst) {
            ids.push(BufferId::from(format!("matte.{frame}")));
        }
        ids
    }

    fn add_matte_layer(&self) {
        self.matte.store(true, Ordering::SeqCst);
        self.graph_changed.store(true, Ordering::SeqCst);
    }

    fn roles(&self) -> BTreeSet<String> {
        self.log
            .lock()
            .iter()
            .map(|(_, role)| format!("{role:?}"))
            .collect()
    }
}

impl Evaluator for Reel {
    fn evaluate(&self, frame: Frame, ctx: &EvalContext) -> Result<ImageResult> {
        if !ctx.allow_eval {
            self.cache_only.fetch_add(1, Ordering::SeqCst);
            if self.graph_changed.swap(false, Ordering::SeqCst) {
                return Err(CacheError::CacheMiss);
            }
            return Ok(ImageResult::cached(self.ids(frame)));
        }
        if !self.in_flight.lock().insert(frame) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.decode_time.is_zero() {
            thread::sleep(self.decode_time);
        }
        self.in_flight.lock().remove(&frame);
        self.log.lock().push((frame, ctx.role));

        if self.corrupt == Some(frame) {
            return Err(CacheError::Evaluation(format!("corrupt packet in frame {frame}")));
        }
        Ok(ImageResult::new(
            self.ids(frame)
                .into_iter()
                .map(|id| Buffer::with_size(id, FRAME))
                .collect(),
        ))
    }

    fn test_evaluate(&self, _frame: Frame) -> Result<AccessReport> {
        Ok(AccessReport {
            poor_random_access: self.slow_seek,
        })
    }

    fn evaluate_identifier(&self, frame: Frame) -> Result<IdTree> {
        Ok(IdTree::from_ids(self.ids(frame)))
    }

    fn evaluate_output(&self, node: &NodeKey, _ctx: &EvalContext) -> Result<Option<Buffer>> {
        Ok(Some(Buffer::with_size(format!("{}.png", node.as_str()), 64)))
    }
}

struct Thumbnail;

impl OutputProducer for Thumbnail {
    fn producer_key(&self) -> NodeKey {
        NodeKey::new("thumbnail")
    }

    fn is_cacheable_output_producer(&self) -> bool {
        true
    }

    fn tag(&self) -> &str {
        "bin thumbnail"
    }
}

fn start(reel: Reel, workers: usize, frames: usize) -> (CacheScheduler, Arc<Reel>) {
    let mut config = SchedulerConfig {
        worker_threads: workers,
        ..Default::default()
    };
    config.mode_sizes.set(CacheMode::Buffer, frames * FRAME);
    config.mode_sizes.set(CacheMode::Greedy, frames * FRAME);

    let reel = Arc::new(reel);
    let scheduler = CacheScheduler::new(config, reel.clone()).unwrap();
    (scheduler, reel)
}

fn cached(scheduler: &CacheScheduler) -> Vec<Frame> {
    scheduler.lock_cache().cached_frames().collect()
}

/// Buffer mode over `[0, 100)` from frame 0, display frame admitted, run
/// to completion.
fn fill_from_start(scheduler: &CacheScheduler) {
    scheduler.set_caching_mode(CacheMode::Buffer, FrameBounds::new(0, 100), Playback::at(0));
    scheduler.evaluate_for_display(0).unwrap();
    assert!(scheduler.wait_until_idle(IDLE));
}

// ── Look-ahead ─────────────────────────────────────────────────

#[test]
fn look_ahead_fill_is_contiguous_from_display() {
    let (scheduler, _) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);

    let frames = cached(&scheduler);
    assert!(!frames.is_empty() && frames.len() <= 10, "{frames:?}");
    assert_eq!(frames, (0..frames.len() as Frame).collect::<Vec<_>>());

    let cache = scheduler.lock_cache();
    assert!(cache.used() <= cache.capacity());
    cache.check_consistency().unwrap();
}

#[test]
fn jump_admits_display_and_refills_around_it() {
    let (scheduler, _) = start(Reel::default(), 2, 10);
    fill_from_start(&scheduler);

    let shown = scheduler.evaluate_for_display(50).unwrap();
    assert!(!shown.from_cache);
    assert!(scheduler.wait_until_idle(IDLE));

    let cache = scheduler.lock_cache();
    assert!(cache.is_frame_cached(50));
    assert!(cache.is_frame_cached(51));
    let near = (51..56).filter(|&f| cache.is_frame_cached(f)).count();
    let far = (1..6).filter(|&f| cache.is_frame_cached(f)).count();
    assert!(near > far, "near {near} far {far}");
    cache.check_consistency().unwrap();
}

#[test]
fn cached_display_frame_skips_evaluation() {
    let (scheduler, reel) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);
    let before = reel.evaluated().len();
    let passes = reel.cache_only.load(Ordering::SeqCst);

    let shown = scheduler.evaluate_for_display(3).unwrap();
    assert!(shown.from_cache);
    assert_eq!(shown.buffers[0].id().as_str(), "plate.3");
    assert_eq!(reel.cache_only.load(Ordering::SeqCst), passes + 1);
    assert!(scheduler.wait_until_idle(IDLE));
    assert!(reel.evaluated()[before..].iter().all(|&f| f != 3));
}

#[test]
fn stale_cached_display_frame_is_reevaluated() {
    let (scheduler, reel) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);
    assert!(scheduler.lock_cache().is_frame_cached(3));
    let passes = reel.cache_only.load(Ordering::SeqCst);

    reel.add_matte_layer();
    let shown = scheduler.evaluate_for_display(3).unwrap();
    assert!(!shown.from_cache);
    assert_eq!(shown.buffers.len(), 2);
    assert_eq!(reel.cache_only.load(Ordering::SeqCst), passes + 1);
    assert!(reel
        .log
        .lock()
        .iter()
        .any(|&(f, role)| f == 3 && role == ThreadRole::Display));
    assert!(scheduler.wait_until_idle(IDLE));

    let cache = scheduler.lock_cache();
    assert!(cache.is_frame_cached(3));
    assert_eq!(cache.frame_ids(3).len(), 2);
    cache.check_consistency().unwrap();
    drop(cache);

    let again = scheduler.evaluate_for_display(3).unwrap();
    assert!(again.from_cache);
    assert_eq!(again.buffers.len(), 2);
}

#[test]
fn changed_identities_are_caught_without_a_miss() {
    let (scheduler, reel) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);
    reel.matte.store(true, Ordering::SeqCst);

    let shown = scheduler.evaluate_for_display(2).unwrap();
    assert!(!shown.from_cache);
    assert_eq!(shown.buffers.len(), 2);
    assert!(scheduler.lock_cache().is_frame_cached(2));
}

// ── Region ─────────────────────────────────────────────────────

#[test]
fn greedy_region_fills_before_outside_frames() {
    let (scheduler, reel) = start(Reel::default(), 1, 20);
    let bounds = FrameBounds::new(0, 100).with_region(10, 20);
    scheduler.set_caching_mode(CacheMode::Greedy, bounds, Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    assert_eq!(cached(&scheduler), (10..20).collect::<Vec<_>>());
    assert!(reel.evaluated().iter().all(|&f| (10..20).contains(&f)));
}

#[test]
fn greedy_region_under_pressure_keeps_in_point_side() {
    let (scheduler, _) = start(Reel::default(), 1, 4);
    let bounds = FrameBounds::new(0, 100).with_region(10, 20);
    scheduler.set_caching_mode(CacheMode::Greedy, bounds, Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    assert_eq!(cached(&scheduler), vec![10, 11, 12, 13]);
}

#[test]
fn moving_in_point_under_pressure_caches_new_in_point() {
    let (scheduler, _) = start(Reel::default(), 1, 4);
    let bounds = FrameBounds::new(0, 100).with_region(10, 20);
    scheduler.set_caching_mode(CacheMode::Greedy, bounds, Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));
    assert_eq!(cached(&scheduler), vec![10, 11, 12, 13]);

    scheduler.set_caching_mode(CacheMode::Greedy, bounds.with_region(8, 20), Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));
    assert_eq!(cached(&scheduler), vec![8, 9, 10, 11]);
    scheduler.lock_cache().check_consistency().unwrap();
}

#[test]
fn switching_to_greedy_on_same_range_keeps_cached_set() {
    let (scheduler, _) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);
    let before = cached(&scheduler);

    scheduler.set_caching_mode(CacheMode::Greedy, FrameBounds::new(0, 100), Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    assert_eq!(scheduler.mode(), CacheMode::Greedy);
    assert_eq!(cached(&scheduler), before);
}

// ── Concurrency ────────────────────────────────────────────────

#[test]
fn concurrent_workers_never_share_a_frame() {
    let reel = Reel {
        decode_time: Duration::from_millis(2),
        ..Default::default()
    };
    let (scheduler, reel) = start(reel, 4, 40);
    scheduler.set_caching_mode(CacheMode::Buffer, FrameBounds::new(0, 200), Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    assert_eq!(reel.overlaps.load(Ordering::SeqCst), 0);
    assert!(reel.evaluated().len() >= 4);

    let cache = scheduler.lock_cache();
    assert!(cache.frames_being_cached().is_empty());
    cache.check_consistency().unwrap();
    drop(cache);
    assert!(scheduler
        .worker_states()
        .iter()
        .all(|&s| s == WorkerState::Idle));
}

#[test]
fn playback_changes_while_workers_run() {
    let reel = Reel {
        decode_time: Duration::from_millis(1),
        ..Default::default()
    };
    let (scheduler, _) = start(reel, 3, 20);
    scheduler.set_caching_mode(CacheMode::Buffer, FrameBounds::new(0, 300), Playback::at(0));
    for frame in (0..60).step_by(3) {
        scheduler.evaluate_for_display(frame).unwrap();
        scheduler.set_playback(Playback::at(frame).with_inc(1));
    }
    assert!(scheduler.wait_until_idle(IDLE));

    // The display thread may decode a frame a worker has claimed, so only
    // the cache's own bookkeeping is checked here.
    let cache = scheduler.lock_cache();
    assert!(cache.is_frame_cached(57));
    assert!(cache.frames_being_cached().is_empty());
    cache.check_consistency().unwrap();
}

#[test]
fn slow_media_is_read_by_one_worker() {
    let reel = Reel {
        slow_seek: true,
        ..Default::default()
    };
    let (scheduler, reel) = start(reel, 3, 10);
    scheduler.set_caching_mode(CacheMode::Buffer, FrameBounds::new(0, 100), Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    assert!(scheduler.is_slow_media());
    assert!(!reel.evaluated().is_empty());
    assert_eq!(reel.roles(), BTreeSet::from([format!("{:?}", ThreadRole::Worker(0))]));
    assert!(scheduler.lock_cache().frames_being_cached().is_empty());
}

// ── Failures ───────────────────────────────────────────────────

#[test]
fn failed_frame_is_abandoned_without_spinning() {
    let reel = Reel {
        corrupt: Some(3),
        ..Default::default()
    };
    let (scheduler, reel) = start(reel, 1, 10);
    fill_from_start(&scheduler);

    let cache = scheduler.lock_cache();
    assert!(cache.is_frame_cached(2));
    assert!(!cache.is_frame_cached(3));
    assert!(cache.frames_being_cached().is_empty());
    drop(cache);
    assert!(reel.evaluated().iter().filter(|&&f| f == 3).count() <= 2);
}

#[test]
fn budget_cut_evicts_farthest_frames() {
    let (scheduler, _) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);

    scheduler.set_cache_mode_size(CacheMode::Buffer, 4 * FRAME);
    assert!(scheduler.wait_until_idle(IDLE));

    let cache = scheduler.lock_cache();
    assert!(cache.used() <= cache.capacity());
    assert!(cache.is_frame_cached(0));
    assert!(cache.is_frame_cached(1));
    assert!(!cache.is_frame_cached(9));
}

// ── Reconciliation ─────────────────────────────────────────────

#[test]
fn view_change_promotes_without_decoding() {
    let (scheduler, reel) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);
    let before = cached(&scheduler);
    let evaluations = reel.evaluated().len();

    scheduler.set_view_changed();
    scheduler.dispatch_caching_threads(Playback::at(0));
    assert!(scheduler.wait_until_idle(IDLE));

    let after = cached(&scheduler);
    assert!(before.iter().all(|f| after.contains(f)), "{before:?} {after:?}");
    assert!(reel.evaluated()[evaluations..]
        .iter()
        .all(|f| !before.contains(f)));
    scheduler.lock_cache().check_consistency().unwrap();
}

#[test]
fn flush_by_pattern_is_refilled() {
    let (scheduler, _) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);

    assert_eq!(scheduler.flush_ids_containing(&["plate.4"]), 1);
    assert!(scheduler.wait_until_idle(IDLE));
    assert!(scheduler.lock_cache().is_frame_cached(4));
}

#[test]
fn cacheable_output_lands_in_per_node_cache() {
    let (scheduler, _) = start(Reel::default(), 2, 10);
    assert!(scheduler.push_cacheable_output(&Thumbnail));
    assert!(scheduler.wait_until_idle(IDLE));

    let cache = scheduler.lock_cache();
    let held = cache.per_node_contents(&NodeKey::new("thumbnail")).unwrap();
    assert_eq!(held.id().as_str(), "thumbnail.png");
}

#[test]
fn stats_report_look_ahead() {
    let (scheduler, _) = start(Reel::default(), 1, 10);
    fill_from_start(&scheduler);

    let stats = scheduler.cache_stats();
    assert_eq!(stats.capacity, 10 * FRAME);
    assert!(stats.used <= stats.capacity);
    assert_eq!(stats.cached_frame_count(), cached(&scheduler).len());
    assert!(stats.look_ahead_seconds > 0.0);
}

#[test]
fn every_worker_publishes_stats_when_its_pass_ends() {
    let mut config = SchedulerConfig {
        worker_threads: 3,
        stats_interval_ms: 60_000,
        ..Default::default()
    };
    config.mode_sizes.set(CacheMode::Buffer, 10 * FRAME);
    let scheduler = CacheScheduler::new(config, Arc::new(Reel::default())).unwrap();
    fill_from_start(&scheduler);
    assert_eq!(scheduler.flush_ids_containing(&["plate.1"]), 1);
    assert!(scheduler.wait_until_idle(IDLE));

    let published = scheduler.published_stats();
    let cache = scheduler.lock_cache();
    assert_eq!(published.used, cache.used());
    assert_eq!(published.cached_frame_count(), cache.cached_frame_count());
}
