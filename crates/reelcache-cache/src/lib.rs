//! reelcache cache - the frame buffer cache
//!
//! This crate provides:
//! - A reference-counted object store with a lazy trash list
//! - The utility function that ranks frames for caching and freeing
//! - A frontier index over cached frames
//! - The frame cache that ties them together under one admission and
//!   eviction policy
//! - A per-producer cache for output with no frame affiliation

pub mod edges;
pub mod frame_cache;
pub mod per_node;
pub mod stats;
pub mod store;
pub mod utility;

pub use edges::{Edge, EdgeType, FrontierIndex, FrontierView};
pub use frame_cache::{CacheEvent, CacheTarget, FrameCache, FreeMode, TreeMembership};
pub use per_node::PerNodeCache;
pub use stats::{look_ahead_seconds, CacheStats};
pub use store::{Admission, ObjectStore};
pub use utility::{CacheMode, CachePolicy, Purpose, Utility, UTILITY_MAX, UTILITY_MIN};
