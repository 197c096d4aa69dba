//! # spanalloc-core
//!
//! A general-purpose size-class memory allocator. Small requests are
//! rounded to a fixed table of size classes and served from per-class
//! free-list pools that carve blocks out of mmap-backed spans; requests
//! above the largest class map one-to-one onto regions from the provider.
//!
//! Two facades cover the two scheduling models:
//!
//! - [`Allocator`]: single-threaded, no internal synchronization, for
//!   thread-local allocator instances.
//! - [`SharedAllocator`]: fine-grained locking per size class plus a
//!   sharded block table, safe to call from any thread.
//!
//! No `unsafe` code is permitted at the crate level; raw byte work is
//! delegated to `spanalloc-region`.

#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod events;
pub mod large;
pub mod pool;
pub mod shared;
pub mod size_class;
pub mod span;
pub mod stats;

pub use allocator::{Allocator, ZERO_SIZE_SENTINEL};
pub use config::AllocatorConfig;
pub use error::{AllocError, ConfigError};
pub use events::{AllocatorEvent, EventLevel};
pub use shared::SharedAllocator;
pub use stats::AllocatorStats;
