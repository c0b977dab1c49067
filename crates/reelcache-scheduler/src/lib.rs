//! reelcache scheduler - fills the frame cache in the background
//!
//! This crate provides:
//! - `SchedulerConfig`, persisted as JSON
//! - The `Evaluator` and `OutputProducer` seams to whatever renders frames
//! - A pool of caching workers with a single-thread lane for slow media
//! - `CacheScheduler`, which drives caching from the display thread

pub mod config;
pub mod evaluator;
pub mod scheduler;
pub mod worker;

pub use config::{ModeSizes, SchedulerConfig};
pub use evaluator::{AccessReport, EvalContext, Evaluator, ImageResult, OutputProducer, ThreadRole};
pub use reelcache_cache::CacheMode;
pub use scheduler::{CacheScheduler, DisplayFrame};
pub use worker::WorkerState;
