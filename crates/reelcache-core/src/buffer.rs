//! Decoded image buffers and their identities.
//!
//! A buffer is opaque to the cache apart from its identity and its byte
//! size. Only the object store holds the owning allocation; everything else
//! refers to a buffer through its [`BufferId`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Content-derived identity of a buffer.
///
/// Two buffers with the same identity are interchangeable, which is what
/// lets held frames and shared layers reuse one resident copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(Arc<str>);

impl BufferId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the identity string contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.0.contains(pattern)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BufferId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BufferId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Pixel format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit RGBA (32 bits per pixel)
    #[default]
    Rgba8,
    /// 16-bit RGBA half-float (64 bits per pixel)
    Rgba16F,
    /// 32-bit RGBA float (128 bits per pixel)
    Rgba32F,
    /// 8-bit grayscale
    Gray8,
    /// NV12 YUV
    Nv12,
    /// YUV 4:2:0 planar
    Yuv420P,
}

impl PixelFormat {
    /// Calculate total bytes needed for an image of this format.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgba8 => pixels * 4,
            Self::Rgba16F => pixels * 8,
            Self::Rgba32F => pixels * 16,
            Self::Gray8 => pixels,
            // Y plane plus quarter-resolution chroma
            Self::Nv12 | Self::Yuv420P => pixels + pixels / 2,
        }
    }
}

/// A decoded image unit.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    /// Pixel format
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Set when the source could only be partially decoded. The cache still
    /// admits partial images; a partially correct frame beats no frame.
    pub partial: bool,
    size: usize,
    pixels: Vec<u8>,
}

impl Buffer {
    /// Create a buffer that accounts for a full image of the given
    /// dimensions without allocating pixel storage.
    pub fn new(id: impl Into<BufferId>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id: id.into(),
            format,
            width,
            height,
            partial: false,
            size: format.frame_size(width, height),
            pixels: Vec::new(),
        }
    }

    /// Create an opaque buffer of `bytes` bytes.
    pub fn with_size(id: impl Into<BufferId>, bytes: usize) -> Self {
        Self {
            id: id.into(),
            format: PixelFormat::Gray8,
            width: 0,
            height: 0,
            partial: false,
            size: bytes,
            pixels: Vec::new(),
        }
    }

    /// Create a buffer owning decoded pixel data.
    pub fn with_pixels(
        id: impl Into<BufferId>,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Self {
        let size = format.frame_size(width, height).max(pixels.len());
        Self {
            id: id.into(),
            format,
            width,
            height,
            partial: pixels.len() < format.frame_size(width, height),
            size,
            pixels,
        }
    }

    pub fn id(&self) -> &BufferId {
        &self.id
    }

    /// Bytes charged against the cache budget.
    pub fn memory_size(&self) -> usize {
        self.size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mark the buffer as partially decoded.
    pub fn mark_partial(mut self) -> Self {
        self.partial = true;
        self
    }
}
