//! The seam between the scheduler and whatever renders frames.
//!
//! The scheduler never decodes anything itself. It asks an [`Evaluator`] for
//! the buffers of a frame, or for their identities only, and admits what
//! comes back into the cache.

use reelcache_core::{Buffer, BufferId, Frame, IdTree, NodeKey, Result};

/// Which thread is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Display,
    Worker(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    pub role: ThreadRole,
    /// False for a cache-only pass that must not decode.
    pub allow_eval: bool,
}

impl EvalContext {
    pub fn display() -> Self {
        Self {
            role: ThreadRole::Display,
            allow_eval: true,
        }
    }

    /// Display pass that may only read what is already cached.
    pub fn display_cache_only() -> Self {
        Self {
            role: ThreadRole::Display,
            allow_eval: false,
        }
    }

    pub fn worker(id: usize) -> Self {
        Self {
            role: ThreadRole::Worker(id),
            allow_eval: true,
        }
    }
}

/// Buffers produced for one frame.
#[derive(Debug, Clone, Default)]
pub struct ImageResult {
    pub buffers: Vec<Buffer>,
    /// Identities the frame needs to count as cached. Defaults to the
    /// identities of `buffers`.
    pub required: Option<Vec<BufferId>>,
}

impl ImageResult {
    pub fn new(buffers: Vec<Buffer>) -> Self {
        Self {
            buffers,
            required: None,
        }
    }

    /// Answer to a cache-only pass: the identities to read back, no pixels.
    pub fn cached(ids: Vec<BufferId>) -> Self {
        Self {
            buffers: Vec::new(),
            required: Some(ids),
        }
    }

    pub fn with_required(mut self, required: Vec<BufferId>) -> Self {
        self.required = Some(required);
        self
    }

    pub fn required_ids(&self) -> Vec<BufferId> {
        match &self.required {
            Some(ids) => ids.clone(),
            None => self.buffers.iter().map(|b| b.id().clone()).collect(),
        }
    }
}

/// Result of a cheap probe before evaluating a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessReport {
    /// The frame's sources are slow to seek, so only one thread should read
    /// them, in large sequential groups.
    pub poor_random_access: bool,
}

/// Produces frame buffers on demand. Called concurrently from every worker
/// and the display thread, never under the cache lock.
pub trait Evaluator: Send + Sync {
    /// Render `frame`.
    ///
    /// Without `ctx.allow_eval` nothing may be decoded: answer with
    /// [`ImageResult::cached`] naming the identities the frame reads, or
    /// `CacheError::CacheMiss` if the graph no longer matches what was
    /// cached. `CacheError::CacheFull` signals memory back-pressure.
    /// Anything else is a failure of this frame only.
    fn evaluate(&self, frame: Frame, ctx: &EvalContext) -> Result<ImageResult>;

    /// Probe the frame's sources without rendering.
    fn test_evaluate(&self, _frame: Frame) -> Result<AccessReport> {
        Ok(AccessReport::default())
    }

    /// Identities the frame would produce, without decoding.
    fn evaluate_identifier(&self, frame: Frame) -> Result<IdTree>;

    /// Render the output of a producer with no frame affiliation.
    fn evaluate_output(&self, _node: &NodeKey, _ctx: &EvalContext) -> Result<Option<Buffer>> {
        Ok(None)
    }
}

/// Capability query for producers whose output the scheduler may cache
/// outside the frame cache.
pub trait OutputProducer {
    fn producer_key(&self) -> NodeKey;

    fn is_cacheable_output_producer(&self) -> bool {
        false
    }

    /// Free-form label used in logs.
    fn tag(&self) -> &str {
        ""
    }
}
