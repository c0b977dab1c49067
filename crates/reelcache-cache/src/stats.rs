//! Point-in-time cache statistics.

use reelcache_core::{CacheError, Frame, FrameRange, Playback, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Byte budget.
    pub capacity: usize,
    /// Bytes resident, trash included.
    pub used: usize,
    /// Contiguous runs of cached frames, ascending.
    pub cached_ranges: Vec<FrameRange>,
    /// Seconds of cached material ahead of the display frame at the current
    /// playback rate and direction.
    pub look_ahead_seconds: f32,
}

impl CacheStats {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    pub fn cached_frame_count(&self) -> usize {
        self.cached_ranges.iter().map(FrameRange::len).sum()
    }
}

/// Seconds of uninterrupted playback available from the display frame.
///
/// Starts at the run holding the display frame and keeps extending through
/// runs whose gap is no larger than the display increment, since playback at
/// that increment steps over such gaps.
pub fn look_ahead_seconds(ranges: &[FrameRange], playback: &Playback) -> f32 {
    let Some(display) = playback.display else {
        return 0.0;
    };
    if playback.inc == 0 || playback.fps <= 0.0 || ranges.is_empty() {
        return 0.0;
    }
    let Some(start) = ranges.iter().position(|r| r.contains(display)) else {
        return 0.0;
    };

    let step = playback.inc.abs();
    let frames: Frame = if playback.inc > 0 {
        let mut last = ranges[start].end - 1;
        for r in &ranges[start + 1..] {
            if r.start > last + step {
                break;
            }
            last = r.end - 1;
        }
        last - display
    } else {
        let mut first = ranges[start].start;
        for r in ranges[..start].iter().rev() {
            if r.end - 1 < first - step {
                break;
            }
            first = r.start;
        }
        display - first
    };
    frames as f32 / playback.fps
}
