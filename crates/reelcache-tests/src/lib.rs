//! Integration test crate for reelcache.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the frame cache directly and through the scheduler.

#[cfg(test)]
mod frame_cache;

#[cfg(test)]
mod scheduler;
