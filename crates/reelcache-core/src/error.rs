//! Error types for reelcache.

use thiserror::Error;

/// Main error type for cache and evaluation operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Admission could not proceed without exceeding the memory budget.
    #[error("Cache full")]
    CacheFull,

    /// The cache's believed contents are stale relative to the graph.
    #[error("Cache miss")]
    CacheMiss,

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Capacity back-pressure. Expected and never fatal.
    pub fn is_back_pressure(&self) -> bool {
        matches!(self, Self::CacheFull)
    }

    /// Stale cache contents; retry once with evaluation permitted.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::CacheMiss)
    }
}

/// Result type alias for reelcache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
