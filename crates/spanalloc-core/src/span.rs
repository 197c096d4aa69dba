//! Spans: provider regions carved into fixed-size blocks.
//!
//! A span is owned by exactly one size class. Blocks are carved lazily:
//! the carve high-water mark splits the span into a recycled area (blocks
//! that have been handed out at least once) and a pristine tail. Spans
//! are acquired with the provider's zero flag set and uncarved bytes are
//! never written, so the tail stays zero. That distinction is what lets
//! the facade skip explicit clearing for zero-requested allocations
//! served from fresh memory.

use spanalloc_region::Region;

/// Where a block handed out by [`Span::take`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    /// Carved from memory the provider guaranteed to be zero.
    Fresh,
    /// Popped off the free list; contents are stale.
    Recycled,
}

/// One provider region subdivided into equal blocks for a size class.
#[derive(Debug)]
pub struct Span {
    region: Region,
    class: usize,
    block_size: usize,
    capacity: usize,
    carved: usize,
    live: usize,
    free: Vec<usize>,
}

impl Span {
    pub fn new(region: Region, class: usize, block_size: usize) -> Self {
        let capacity = region.len() / block_size;
        debug_assert!(capacity > 0, "span cannot hold a single block");
        Self {
            region,
            class,
            block_size,
            capacity,
            carved: 0,
            live: 0,
            free: Vec::new(),
        }
    }

    pub fn base(&self) -> usize {
        self.region.base()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn class(&self) -> usize {
        self.class
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks this span can hold in total.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// No blocks outstanding; the span may be retained or released.
    pub fn is_idle(&self) -> bool {
        self.live == 0
    }

    /// Whether `take` would succeed.
    pub fn has_block(&self) -> bool {
        !self.free.is_empty() || self.carved < self.capacity
    }

    /// Whether `addr` is a block boundary inside this span.
    pub fn owns(&self, addr: usize) -> bool {
        let base = self.base();
        addr >= base
            && addr < base + self.capacity * self.block_size
            && (addr - base) % self.block_size == 0
    }

    /// Hand out one block, preferring recycled blocks over carving.
    pub fn take(&mut self) -> Option<(usize, BlockOrigin)> {
        if let Some(addr) = self.free.pop() {
            self.live += 1;
            return Some((addr, BlockOrigin::Recycled));
        }
        if self.carved < self.capacity {
            let addr = self.base() + self.carved * self.block_size;
            self.carved += 1;
            self.live += 1;
            return Some((addr, BlockOrigin::Fresh));
        }
        None
    }

    /// Return a block to this span's free list.
    pub fn give(&mut self, addr: usize) {
        debug_assert!(self.owns(addr), "block {addr:#x} is not from this span");
        debug_assert!(self.live > 0);
        self.free.push(addr);
        self.live -= 1;
    }

    /// Surrender the backing region (span is being released).
    pub fn into_region(self) -> Region {
        self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanalloc_region::{MmapProvider, RegionProvider};

    fn test_span(block_size: usize) -> (MmapProvider, Span) {
        let provider = MmapProvider::new();
        let region = provider.acquire(4096, false).unwrap();
        (provider, Span::new(region, 0, block_size))
    }

    #[test]
    fn carves_blocks_in_address_order() {
        let (provider, mut span) = test_span(64);
        let base = span.base();
        assert_eq!(span.capacity(), 4096 / 64);
        let (first, origin) = span.take().unwrap();
        assert_eq!(first, base);
        assert_eq!(origin, BlockOrigin::Fresh);
        let (second, _) = span.take().unwrap();
        assert_eq!(second, base + 64);
        provider.release(span.into_region());
    }

    #[test]
    fn recycles_freed_blocks_first() {
        let (provider, mut span) = test_span(64);
        let (a, _) = span.take().unwrap();
        let (_b, _) = span.take().unwrap();
        span.give(a);
        let (again, origin) = span.take().unwrap();
        assert_eq!(again, a);
        assert_eq!(origin, BlockOrigin::Recycled);
        provider.release(span.into_region());
    }

    #[test]
    fn exhausts_then_refills() {
        let (provider, mut span) = test_span(1024);
        let blocks: Vec<usize> = std::iter::from_fn(|| span.take().map(|(a, _)| a)).collect();
        assert_eq!(blocks.len(), 4);
        assert!(span.take().is_none());
        assert!(!span.has_block());
        for &addr in &blocks {
            span.give(addr);
        }
        assert!(span.is_idle());
        assert!(span.has_block());
        provider.release(span.into_region());
    }

    #[test]
    fn owns_checks_alignment_and_range() {
        let (provider, span) = test_span(64);
        let base = span.base();
        assert!(span.owns(base));
        assert!(span.owns(base + 64));
        assert!(!span.owns(base + 1));
        assert!(!span.owns(base + 4096));
        provider.release(span.into_region());
    }
}
