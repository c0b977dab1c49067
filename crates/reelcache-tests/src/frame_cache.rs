//! Integration tests for the frame cache, its frontier and the object store
//! underneath.

use proptest::prelude::*;
use reelcache_cache::{CacheMode, EdgeType, FrameCache, FreeMode, TreeMembership};
use reelcache_core::{Buffer, BufferId, Frame, FrameBounds, IdTree, Playback};
use std::collections::BTreeSet;

const FRAME: usize = 100;
const RANGE: Frame = 40;

// ── Helpers ────────────────────────────────────────────────────

fn plate(frame: Frame) -> Buffer {
    Buffer::with_size(format!("plate.{frame}"), FRAME)
}

fn matte(frame: Frame) -> Buffer {
    Buffer::with_size(format!("matte.{frame}"), FRAME / 4)
}

/// A held background shared by runs of four frames.
fn background(frame: Frame) -> Buffer {
    Buffer::with_size(format!("bg.{}", frame / 4), FRAME)
}

fn look_ahead_cache(frames: usize) -> FrameCache {
    let mut cache = FrameCache::new(frames * FRAME);
    cache.set_mode(CacheMode::Buffer);
    cache.set_free_mode(FreeMode::Greedy);
    cache.set_bounds(FrameBounds::new(0, RANGE));
    cache.set_playback(Playback::at(0).with_inc(1));
    cache
}

fn cached_set(cache: &FrameCache) -> BTreeSet<Frame> {
    cache.cached_frames().collect()
}

/// Every frame reported cached has all of its buffers resident.
fn assert_cached_frames_resident(cache: &FrameCache) {
    for frame in cache.cached_frames() {
        for id in cache.frame_ids(frame) {
            assert!(cache.store().is_cached(&id), "frame {frame} lost {id}");
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Admit(Frame),
    AdmitShared(Frame),
    Force(Frame),
    RequireMatte(Frame),
    AdmitMatte(Frame),
    Display(Frame),
    Free(usize),
    Flush(Frame),
    Trim(Frame),
    Select(usize),
    ClearFrames,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..RANGE).prop_map(Op::Admit),
        2 => (0..RANGE).prop_map(Op::AdmitShared),
        1 => (0..RANGE).prop_map(Op::Force),
        1 => (0..RANGE).prop_map(Op::RequireMatte),
        1 => (0..RANGE).prop_map(Op::AdmitMatte),
        1 => (0..RANGE).prop_map(Op::Display),
        2 => (0usize..4).prop_map(|n| Op::Free(n * FRAME)),
        1 => (0..RANGE).prop_map(Op::Flush),
        1 => (0..RANGE).prop_map(Op::Trim),
        2 => (1usize..6).prop_map(Op::Select),
        1 => Just(Op::ClearFrames),
    ]
}

// ── Frame completeness ─────────────────────────────────────────

#[test]
fn partial_frame_becomes_cached_with_one_edge() {
    let mut cache = look_ahead_cache(10);
    let fg = plate(12);
    let mt = matte(12);
    cache.require_ids(12, [fg.id().clone(), mt.id().clone()]);

    assert!(cache.add(fg, 12, false, None));
    assert!(cache.has_partial_frame_cache(12));
    assert!(!cache.is_frame_cached(12));
    assert_eq!(cache.frontier().len(), 0);

    assert!(cache.add(mt, 12, false, None));
    assert!(!cache.has_partial_frame_cache(12));
    assert!(cache.is_frame_cached(12));
    assert_eq!(cache.frontier().len(), 1);
    cache.check_consistency().unwrap();
}

#[test]
fn flushing_a_required_buffer_uncaches_the_frame() {
    let mut cache = look_ahead_cache(10);
    for f in 3..6 {
        cache.require_ids(f, [plate(f).id().clone(), matte(f).id().clone()]);
        cache.add(plate(f), f, false, None);
        cache.add(matte(f), f, false, None);
    }
    assert_eq!(cached_set(&cache), BTreeSet::from([3, 4, 5]));

    assert!(cache.flush(&BufferId::from("matte.4")));
    assert!(!cache.is_frame_cached(4));
    assert!(cache.has_partial_frame_cache(4));
    assert_eq!(cache.frontier().get(3), Some(EdgeType::BothSides));
    assert_eq!(cache.frontier().get(5), Some(EdgeType::BothSides));
    cache.check_consistency().unwrap();
}

#[test]
fn interior_frame_is_not_an_edge() {
    let mut cache = look_ahead_cache(10);
    for f in 4..7 {
        cache.add(plate(f), f, false, None);
    }
    assert_eq!(cache.frontier().get(4), Some(EdgeType::LeftOnly));
    assert_eq!(cache.frontier().get(5), None);
    assert_eq!(cache.frontier().get(6), Some(EdgeType::RightOnly));
}

#[test]
fn forced_admission_is_always_resident() {
    let mut cache = look_ahead_cache(1);
    cache.add(plate(0), 0, false, None);
    // Only the display frame is cached and it is never evicted.
    assert!(!cache.add(plate(30), 30, false, None));
    assert!(cache.add(plate(30), 30, true, None));
    assert!(cache.store().is_cached(plate(30).id()));
    assert!(cache.is_frame_cached(30));
    assert_cached_frames_resident(&cache);
}

#[test]
fn promotion_after_clear_needs_no_decode() {
    let mut cache = look_ahead_cache(10);
    for f in 0..5 {
        cache.add(plate(f), f, false, None);
    }
    cache.clear_frame_caches();
    assert_eq!(cache.cached_frame_count(), 0);
    assert_eq!(cache.store().trash_len(), 5);

    for f in 0..5 {
        let tree = IdTree::leaf(format!("plate.{f}"));
        assert_eq!(cache.test_in_cache(&tree), TreeMembership::All);
        assert!(cache.promote_frame(f, &tree));
    }
    assert_eq!(cached_set(&cache), (0..5).collect());
    assert_eq!(cache.store().trash_len(), 0);
    cache.check_consistency().unwrap();
}

// ── Properties ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random admit, evict, flush and select sequences keep the frame map,
    /// the reverse index, store references and the frontier in agreement.
    #[test]
    fn random_workload_stays_consistent(
        frames in 1usize..12,
        ops in prop::collection::vec(op_strategy(), 0..150)
    ) {
        let mut cache = look_ahead_cache(frames);
        let mut group = Vec::new();

        for op in ops {
            match op {
                Op::Admit(f) => {
                    cache.add(plate(f), f, false, None);
                }
                Op::AdmitShared(f) => {
                    cache.add(background(f), f, false, None);
                }
                Op::Force(f) => {
                    let buffer = plate(f);
                    let id = buffer.id().clone();
                    cache.add(buffer, f, true, None);
                    prop_assert!(cache.store().is_cached(&id));
                    prop_assert!(cache.frame_ids(f).contains(&id));
                }
                Op::RequireMatte(f) => {
                    cache.require_ids(f, [plate(f).id().clone(), matte(f).id().clone()]);
                }
                Op::AdmitMatte(f) => {
                    cache.add(matte(f), f, false, None);
                }
                Op::Display(f) => cache.set_display_frame(f),
                Op::Free(bytes) => {
                    if cache.free(bytes) {
                        prop_assert!(cache.used() <= cache.capacity());
                        prop_assert!(cache.capacity() - cache.used() >= bytes);
                    }
                }
                Op::Flush(f) => {
                    cache.flush(plate(f).id());
                }
                Op::Trim(f) => cache.trim_buffers_of_frame(f, &[background(f).id().clone()]),
                Op::Select(size) => {
                    cache.initiate_caching_of_best_frame_group(&mut group, size);
                    prop_assert!(group.len() <= size);
                    for &f in &group {
                        prop_assert!(cache.is_being_cached(f));
                        prop_assert!(!cache.is_frame_cached(f));
                    }
                    for &f in group.iter().rev() {
                        cache.add(plate(f), f, false, None);
                        cache.complete_caching_of_frame(f);
                    }
                    prop_assert!(cache.frames_being_cached().is_empty());
                }
                Op::ClearFrames => cache.clear_frame_caches(),
            }

            if let Err(e) = cache.check_consistency() {
                return Err(TestCaseError::fail(e.to_string()));
            }
            assert_cached_frames_resident(&cache);
        }
    }

    /// Each identity's frame set and each frame's identity set mirror each
    /// other.
    #[test]
    fn frame_and_identity_maps_mirror(
        admits in prop::collection::vec((0..RANGE, any::<bool>()), 1..80)
    ) {
        let mut cache = look_ahead_cache(60);
        for (f, shared) in admits {
            let buffer = if shared { background(f) } else { plate(f) };
            cache.add(buffer, f, false, None);
        }

        for frame in 0..RANGE {
            for id in cache.frame_ids(frame) {
                prop_assert!(cache.frames_of(&id).contains(&frame));
            }
        }
        let ids: BTreeSet<BufferId> = (0..RANGE).flat_map(|f| cache.frame_ids(f)).collect();
        for id in &ids {
            let holders = cache.frames_of(id);
            prop_assert!(!holders.is_empty());
            for frame in holders {
                prop_assert!(cache.frame_ids(frame).contains(id));
            }
            prop_assert_eq!(
                cache.store().ref_count(id),
                Some(cache.frames_of(id).len() as u32)
            );
        }
    }
}
