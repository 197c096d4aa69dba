//! # spanalloc-region
//!
//! Raw-memory layer for the spanalloc allocator. Every `unsafe` byte
//! operation lives in this crate: acquiring and releasing anonymous
//! mappings from the operating environment, and bounds-checked zero,
//! copy, read and write primitives inside a live region.
//!
//! The policy crate (`spanalloc-core`) denies `unsafe` code at the crate
//! level and goes through this crate for anything that touches memory.

pub mod provider;
pub mod registry;

pub use provider::{MmapProvider, OutOfMemory, Region, RegionProvider, copy_bytes};
