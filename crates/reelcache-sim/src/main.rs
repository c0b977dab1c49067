//! reelcache-sim - synthetic playback session
//!
//! Plays a generated clip forward, jumps, switches to region caching and
//! logs cache statistics along the way. Pass a JSON scheduler config path
//! as the first argument to override the defaults.

use anyhow::Result;
use reelcache_cache::CacheMode;
use reelcache_core::{
    Buffer, CacheError, Frame, FrameBounds, IdTree, NodeKey, PixelFormat, Playback,
};
use reelcache_scheduler::{
    AccessReport, CacheScheduler, EvalContext, Evaluator, ImageResult, OutputProducer,
    SchedulerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const CLIP_FRAMES: Frame = 480;
const FPS: f32 = 24.0;

/// A two-layer composite: a plate that decodes quickly everywhere except a
/// long-GOP stretch, and a matte that only exists for the first half.
struct SyntheticClip {
    width: u32,
    height: u32,
    decode_time: Duration,
    slow_from: Frame,
}

impl SyntheticClip {
    fn plate(&self, frame: Frame) -> Buffer {
        Buffer::new(format!("plate.{frame:05}"), self.width, self.height, PixelFormat::Rgba8)
    }

    fn matte(&self, frame: Frame) -> Option<Buffer> {
        (frame < CLIP_FRAMES / 2).then(|| {
            Buffer::new(format!("matte.{frame:05}"), self.width, self.height, PixelFormat::Gray8)
        })
    }
}

impl Evaluator for SyntheticClip {
    fn evaluate(&self, frame: Frame, ctx: &EvalContext) -> reelcache_core::Result<ImageResult> {
        if !(0..CLIP_FRAMES).contains(&frame) {
            return Err(CacheError::NotFound(format!("frame {frame}")));
        }
        if !ctx.allow_eval {
            return Ok(ImageResult::cached(self.evaluate_identifier(frame)?.ids().to_vec()));
        }
        thread::sleep(self.decode_time);
        let mut buffers = vec![self.plate(frame)];
        buffers.extend(self.matte(frame));
        Ok(ImageResult::new(buffers))
    }

    fn test_evaluate(&self, frame: Frame) -> reelcache_core::Result<AccessReport> {
        Ok(AccessReport {
            poor_random_access: frame >= self.slow_from,
        })
    }

    fn evaluate_identifier(&self, frame: Frame) -> reelcache_core::Result<IdTree> {
        let mut ids = vec![self.plate(frame).id().clone()];
        ids.extend(self.matte(frame).map(|b| b.id().clone()));
        Ok(IdTree::from_ids(ids))
    }

    fn evaluate_output(
        &self,
        node: &NodeKey,
        _ctx: &EvalContext,
    ) -> reelcache_core::Result<Option<Buffer>> {
        Ok(Some(Buffer::new(
            format!("{node}.thumb"),
            self.width / 8,
            self.height / 8,
            PixelFormat::Rgba8,
        )))
    }
}

struct Thumbnail;

impl OutputProducer for Thumbnail {
    fn producer_key(&self) -> NodeKey {
        NodeKey::new("clip-thumbnail")
    }

    fn is_cacheable_output_producer(&self) -> bool {
        true
    }

    fn tag(&self) -> &str {
        "thumbnail"
    }
}

fn load_config() -> Result<SchedulerConfig> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!("Loading scheduler config from {}", path.display());
            Ok(SchedulerConfig::load_from_file(&path)?)
        }
        None => {
            let mut config = SchedulerConfig::default();
            // Room for about 100 HD frames with mattes.
            config.mode_sizes.buffer = 1000 * 1024 * 1024;
            config.mode_sizes.greedy = 1000 * 1024 * 1024;
            Ok(config)
        }
    }
}

fn log_stats(scheduler: &CacheScheduler, label: &str) {
    let stats = scheduler.cache_stats();
    info!(
        phase = label,
        used_mb = stats.used / (1024 * 1024),
        capacity_mb = stats.capacity / (1024 * 1024),
        frames = stats.cached_frame_count(),
        ranges = stats.cached_ranges.len(),
        look_ahead_s = stats.look_ahead_seconds,
        slow_media = scheduler.is_slow_media(),
        "cache stats"
    );
}

fn play(scheduler: &CacheScheduler, from: Frame, frames: Frame, inc: i32) -> Result<()> {
    let mut frame = from;
    for _ in 0..frames {
        let shown = scheduler.evaluate_for_display(frame)?;
        if shown.needs_refill {
            info!(frame, "display frame needed a refill");
        }
        scheduler.set_playback(Playback::at(frame).with_inc(inc).with_fps(FPS));
        thread::sleep(Duration::from_secs_f32(1.0 / FPS));
        frame += inc;
    }
    Ok(())
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("reelcache-sim starting...");

    let config = load_config()?;
    let clip = Arc::new(SyntheticClip {
        width: 1920,
        height: 1080,
        decode_time: Duration::from_millis(4),
        slow_from: 400,
    });
    let scheduler = CacheScheduler::new(config, clip)?;
    let bounds = FrameBounds::new(0, CLIP_FRAMES);
    let start = Playback::at(0).with_inc(1).with_fps(FPS);

    scheduler.set_caching_mode(CacheMode::Buffer, bounds, start);
    scheduler.push_cacheable_output(&Thumbnail);
    scheduler.evaluate_for_display(0)?;
    scheduler.wait_until_idle(Duration::from_secs(10));
    log_stats(&scheduler, "initial fill");

    play(&scheduler, 0, 48, 1)?;
    log_stats(&scheduler, "forward playback");

    play(&scheduler, 300, 24, 1)?;
    scheduler.wait_until_idle(Duration::from_secs(10));
    log_stats(&scheduler, "after jump");

    play(&scheduler, 330, 24, -1)?;
    log_stats(&scheduler, "reverse playback");

    let region = bounds.with_region(100, 160);
    scheduler.set_caching_mode(CacheMode::Greedy, region, Playback::at(100).with_fps(FPS));
    scheduler.wait_until_idle(Duration::from_secs(10));
    log_stats(&scheduler, "region caching");

    scheduler.flush_ids_containing(&["matte."]);
    scheduler.wait_until_idle(Duration::from_secs(10));
    log_stats(&scheduler, "after matte flush");

    scheduler.shutdown();
    info!("reelcache-sim finished");
    Ok(())
}
