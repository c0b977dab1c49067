//! reelcache core - shared vocabulary for the frame buffer cache
//!
//! This crate provides the types used throughout reelcache:
//! - Buffers and their content-derived identities
//! - Frame numbers, playable bounds and playback state
//! - Identifier trees produced by evaluating a frame without decoding
//! - The common error type

pub mod buffer;
pub mod error;
pub mod frame;
pub mod id_tree;
pub mod node;

pub use buffer::{Buffer, BufferId, PixelFormat};
pub use error::{CacheError, Result};
pub use frame::{Frame, FrameBounds, FrameRange, Playback};
pub use id_tree::IdTree;
pub use node::NodeKey;

/// Memory budget defaults.
pub mod memory_budget {
    /// Default object store budget.
    pub const DEFAULT_CACHE_BYTES: usize = 250 * 1024 * 1024; // 250 MB

    /// Budget while caching is disabled; enough for the display frame and
    /// its immediate reuse.
    pub const NEVER_CACHE_BYTES: usize = 64 * 1024 * 1024; // 64 MB

    /// Frames grouped per dispatch for media with poor random access.
    pub const SLOW_MEDIA_GROUP_SIZE: usize = 20;

    /// Frames grouped per dispatch otherwise.
    pub const FAST_MEDIA_GROUP_SIZE: usize = 1;
}
