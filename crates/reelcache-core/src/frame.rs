//! Frame numbers, playable bounds and playback state.

use serde::{Deserialize, Serialize};

/// An integer index in the playable timeline.
pub type Frame = i32;

/// Half-open run of frames `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: Frame,
    pub end: Frame,
}

impl FrameRange {
    pub fn new(start: Frame, end: Frame) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, frame: Frame) -> bool {
        frame >= self.start && frame < self.end
    }

    /// Collapse an ascending sequence of frames into contiguous runs.
    pub fn runs(frames: impl IntoIterator<Item = Frame>) -> Vec<FrameRange> {
        let mut runs: Vec<FrameRange> = Vec::new();
        for f in frames {
            match runs.last_mut() {
                Some(last) if last.end == f => last.end = f + 1,
                _ => runs.push(FrameRange::new(f, f + 1)),
            }
        }
        runs
    }
}

/// Playable bounds: `[min, max)` with an `[in_frame, out_frame)` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBounds {
    pub min: Frame,
    pub max: Frame,
    pub in_frame: Frame,
    pub out_frame: Frame,
}

impl FrameBounds {
    /// Bounds whose region spans the whole range.
    pub fn new(min: Frame, max: Frame) -> Self {
        Self {
            min,
            max,
            in_frame: min,
            out_frame: max,
        }
    }

    pub fn with_region(mut self, in_frame: Frame, out_frame: Frame) -> Self {
        self.in_frame = in_frame;
        self.out_frame = out_frame;
        self
    }

    pub fn contains(&self, frame: Frame) -> bool {
        frame >= self.min && frame < self.max
    }

    /// True if the in/out region is narrower than the full range.
    pub fn has_region(&self) -> bool {
        self.in_frame > self.min || self.out_frame < self.max
    }

    pub fn in_region(&self, frame: Frame) -> bool {
        frame >= self.in_frame && frame < self.out_frame
    }

    pub fn len(&self) -> usize {
        (self.max - self.min).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.max <= self.min
    }
}

impl Default for FrameBounds {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// What the display thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Playback {
    /// Frame currently on screen.
    pub display: Option<Frame>,
    /// Frame step per tick; negative plays backwards, zero is stopped.
    pub inc: i32,
    pub fps: f32,
}

impl Playback {
    pub fn at(display: Frame) -> Self {
        Self {
            display: Some(display),
            ..Default::default()
        }
    }

    pub fn with_inc(mut self, inc: i32) -> Self {
        self.inc = inc;
        self
    }

    pub fn with_fps(mut self, fps: f32) -> Self {
        self.fps = fps;
        self
    }

    pub fn forward(&self) -> bool {
        self.inc >= 0
    }
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            display: None,
            inc: 1,
            fps: 24.0,
        }
    }
}
