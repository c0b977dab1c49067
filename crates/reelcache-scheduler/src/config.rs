//! Scheduler configuration.
//!
//! Persisted as JSON. Every field has a default, so a partial file only
//! overrides what it names.

use reelcache_cache::{CacheMode, CachePolicy};
use reelcache_core::memory_budget::{
    DEFAULT_CACHE_BYTES, FAST_MEDIA_GROUP_SIZE, NEVER_CACHE_BYTES, SLOW_MEDIA_GROUP_SIZE,
};
use reelcache_core::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Memory budget for each caching mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSizes {
    pub never: usize,
    pub buffer: usize,
    pub greedy: usize,
}

impl Default for ModeSizes {
    fn default() -> Self {
        Self {
            never: NEVER_CACHE_BYTES,
            buffer: DEFAULT_CACHE_BYTES,
            greedy: DEFAULT_CACHE_BYTES,
        }
    }
}

impl ModeSizes {
    pub fn get(&self, mode: CacheMode) -> usize {
        match mode {
            CacheMode::Never => self.never,
            CacheMode::Buffer => self.buffer,
            CacheMode::Greedy => self.greedy,
        }
    }

    pub fn set(&mut self, mode: CacheMode, bytes: usize) {
        match mode {
            CacheMode::Never => self.never = bytes,
            CacheMode::Buffer => self.buffer = bytes,
            CacheMode::Greedy => self.greedy = bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Background caching threads. Worker 0 doubles as the single-thread
    /// lane used for media with poor random access.
    pub worker_threads: usize,
    pub mode_sizes: ModeSizes,
    /// Frames claimed per selection when random access is cheap.
    pub fast_group_size: usize,
    /// Frames claimed per selection on slow media.
    pub slow_group_size: usize,
    /// Replaces both group sizes when set.
    pub group_size_override: Option<usize>,
    /// Time allowed for a promotion pass before it gives up.
    pub promotion_budget_ms: u64,
    /// Minimum interval between published statistics snapshots.
    pub stats_interval_ms: u64,
    pub policy: CachePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            mode_sizes: ModeSizes::default(),
            fast_group_size: FAST_MEDIA_GROUP_SIZE,
            slow_group_size: SLOW_MEDIA_GROUP_SIZE,
            group_size_override: None,
            promotion_budget_ms: 100,
            stats_interval_ms: 100,
            policy: CachePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Group size for the current media speed.
    pub fn max_group_size(&self, slow_media: bool) -> usize {
        match self.group_size_override {
            Some(size) if size > 0 => size,
            _ if slow_media => self.slow_group_size,
            _ => self.fast_group_size,
        }
    }

    pub fn promotion_budget(&self) -> Duration {
        Duration::from_millis(self.promotion_budget_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(CacheError::InvalidParameter(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.fast_group_size == 0 || self.slow_group_size == 0 {
            return Err(CacheError::InvalidParameter(
                "group sizes must be at least 1".into(),
            ));
        }
        if self.group_size_override == Some(0) {
            return Err(CacheError::InvalidParameter(
                "group_size_override must be at least 1 when set".into(),
            ));
        }
        let look_behind = self.policy.look_behind_percent;
        if !(0.0..=100.0).contains(&look_behind) {
            return Err(CacheError::InvalidParameter(format!(
                "look_behind_percent {} outside [0, 100]",
                look_behind
            )));
        }
        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Parse and validate.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| CacheError::Serialization(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
