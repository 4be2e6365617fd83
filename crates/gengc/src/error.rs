use thiserror::Error;

/// Invalid heap configuration, detected at [`Heap::new`](crate::Heap::new).
///
/// Configuration errors are never recoverable at runtime; the embedder must
/// fix the sizes and construct a new heap.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "max heap size {max_heap} is smaller than the fixed spaces plus the \
         minimum generational footprint ({required})"
    )]
    CapacityTooSmall { max_heap: usize, required: usize },

    #[error("semi-space bounds invalid: min {min} must not exceed max {max}")]
    SemiSpaceBounds { min: usize, max: usize },

    #[error("semi-space size {size} is smaller than one region ({region})")]
    SemiSpaceTooSmall { size: usize, region: usize },

    #[error("growing factor bounds invalid: min {min} must be >= 1.0 and <= max {max}")]
    GrowingFactorBounds { min: f64, max: f64 },

    #[error("survival rate window must be nonzero")]
    EmptySurvivalWindow,
}

/// Allocation failure surfaced to the mutator.
///
/// Only user-object spaces report this; structural spaces (non-movable,
/// machine-code, read-only) abort the process on exhaustion because their
/// objects cannot be absent without corrupting runtime invariants.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("out of memory: {size} bytes in {space} space")]
    OutOfMemory { space: &'static str, size: usize },
}
