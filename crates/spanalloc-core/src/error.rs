//! Error taxonomy for the allocator.
//!
//! Allocation has exactly one recoverable failure: the environment could
//! not supply memory. Misuse (freeing an unknown or already-freed address)
//! is not an error value; it is a programming error that debug builds
//! abort on and release builds count and ignore.

use thiserror::Error;

/// A fallible allocator operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The region provider could not supply the requested bytes.
    ///
    /// The allocator's own state is unchanged: no block was freed or
    /// moved, and further allocation attempts are allowed.
    #[error("out of memory: provider could not supply {requested} bytes")]
    OutOfMemory {
        /// Byte length requested from the provider (post-rounding).
        requested: usize,
    },
}

impl From<spanalloc_region::OutOfMemory> for AllocError {
    fn from(err: spanalloc_region::OutOfMemory) -> Self {
        Self::OutOfMemory {
            requested: err.requested,
        }
    }
}

/// An [`AllocatorConfig`](crate::config::AllocatorConfig) failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("size-class table is empty")]
    EmptyTable,

    #[error("size class {value} at index {index} is not a positive multiple of {align}")]
    MisalignedClass {
        index: usize,
        value: usize,
        align: usize,
    },

    #[error("size-class table must be strictly increasing at index {index}")]
    NonIncreasingClass { index: usize },

    #[error("span_bytes {span_bytes} cannot hold one block of the largest class {largest_class}")]
    SpanTooSmall {
        span_bytes: usize,
        largest_class: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_carries_requested_bytes() {
        let err: AllocError = spanalloc_region::OutOfMemory { requested: 65536 }.into();
        assert_eq!(err, AllocError::OutOfMemory { requested: 65536 });
        assert!(err.to_string().contains("65536"));
    }
}
