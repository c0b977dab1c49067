//! The utility function that ranks frames for caching and freeing.
//!
//! Frames with high utility are cached first and frames with low utility are
//! freed first; a frame with zero utility is never cached. Values lie in
//! `[0, UTILITY_MAX]`, and over any set of cached frames the extrema fall on
//! one of min/max, in/out, the display frame or a frontier edge. The
//! frontier index relies on that to avoid scanning the whole range.

use reelcache_core::{Frame, FrameBounds, Playback};
use serde::{Deserialize, Serialize};

pub const UTILITY_MAX: f32 = f32::MAX;
pub const UTILITY_MIN: f32 = f32::MIN_POSITIVE;

/// Caching policy selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Keep little more than the display frame.
    Never,
    /// Look-ahead caching peaked at the display frame.
    #[default]
    Buffer,
    /// Region caching, uniform across the in/out region.
    Greedy,
}

/// Which side of the policy is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    ForCaching,
    ForFreeing,
}

/// Tunable parts of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Percentage weighting frames behind the play direction against frames
    /// ahead of it.
    pub look_behind_percent: f32,
    /// Also cache the playback head against the play direction.
    pub active_tail_caching: bool,
    /// Give frames outside the in/out region a small nonzero utility.
    pub cache_outside_region: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            look_behind_percent: 25.0,
            active_tail_caching: false,
            cache_outside_region: false,
        }
    }
}

/// Everything the utility function depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utility {
    pub mode: CacheMode,
    pub bounds: FrameBounds,
    pub playback: Playback,
    pub policy: CachePolicy,
}

impl Utility {
    pub fn value(&self, frame: Frame, purpose: Purpose) -> f32 {
        let u = match self.mode {
            CacheMode::Greedy => self.region(frame),
            CacheMode::Buffer | CacheMode::Never => self.look_ahead(frame, purpose),
        };
        // An exact hit on the reference frame divides by zero.
        if u.is_finite() {
            u
        } else {
            UTILITY_MAX
        }
    }

    fn region(&self, frame: Frame) -> f32 {
        let b = &self.bounds;
        let outside = self.policy.cache_outside_region;
        if frame < b.in_frame {
            if outside {
                1.0 / (1.0 + (b.in_frame - frame) as f32)
            } else {
                0.0
            }
        } else if frame >= b.out_frame {
            if outside {
                1.0 / (2.0 + (frame - b.out_frame) as f32)
            } else {
                0.0
            }
        } else if frame == b.in_frame {
            UTILITY_MAX
        } else {
            1.0 + 1.0 / (frame - b.in_frame).abs() as f32
        }
    }

    fn look_ahead(&self, frame: Frame, purpose: Purpose) -> f32 {
        let display = self.playback.display;
        if display == Some(frame) {
            return UTILITY_MAX;
        }

        let first = self.bounds.in_frame;
        let last = self.bounds.out_frame - 1;
        let inc = self.playback.inc;
        let ahead = display.map_or(true, |d| frame > d);

        let fact = if purpose == Purpose::ForCaching && !self.policy.active_tail_caching {
            0.001
        } else {
            (self.policy.look_behind_percent / 100.0).clamp(0.001, 0.999)
        };

        // Frames in the play direction get `fact`; frames behind get its
        // complement.
        let ffact = if (inc < 0 && ahead) || (inc > 0 && !ahead) {
            1.0 - fact
        } else {
            fact
        };

        let outside = self.policy.cache_outside_region;
        if frame < first {
            return if outside {
                1.0 / (1.0 + (first - frame) as f32)
            } else {
                0.0
            };
        }
        if frame > last {
            return if outside {
                1.0 / (1.0 + (frame - last) as f32)
            } else {
                0.0
            };
        }

        // With the display frame outside the region, playback will restart
        // at the in point.
        let test = match display {
            Some(d) if d >= first && d <= last => d,
            _ => first,
        };

        let direct = ffact * (frame - test).abs() as f32;
        // Wrap-around distances for loop playback; the extra one keeps them
        // nonzero.
        let mut round_front = (1 + test - first + last - frame) as f32;
        let mut round_back = (1 + last - test + frame - first) as f32;
        if inc < 0 {
            round_front *= fact;
            round_back *= 1.0 - fact;
        } else {
            round_front *= 1.0 - fact;
            round_back *= fact;
        }

        let d = direct.min(round_front).min(round_back);
        1.0 + 1.0 / d
    }
}
