//! Per-size-class free-list pools.
//!
//! Each pool owns the spans carved for its class. `take` never calls the
//! region provider itself: when the pool runs dry the facade acquires a
//! span (without holding any pool lock across the provider call) and
//! installs it. `give` recycles blocks and decides, against the retention
//! cap, whether a fully-free span is kept or surrendered for release.

use std::collections::HashMap;

use spanalloc_region::Region;

use crate::span::{BlockOrigin, Span};

/// A block handed out by [`ClassPool::take`].
#[derive(Debug, Clone, Copy)]
pub struct TakenBlock {
    pub addr: usize,
    pub span_base: usize,
    pub origin: BlockOrigin,
}

/// Free-list pool for one size class.
#[derive(Debug)]
pub struct ClassPool {
    class: usize,
    block_size: usize,
    retain_cap: usize,
    /// Spans keyed by base address.
    spans: HashMap<usize, Span>,
    /// Bases of spans with at least one available block; each base appears
    /// at most once.
    avail: Vec<usize>,
}

impl ClassPool {
    pub fn new(class: usize, block_size: usize, retain_cap: usize) -> Self {
        Self {
            class,
            block_size,
            retain_cap,
            spans: HashMap::new(),
            avail: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether `take` would fail and a new span must be installed first.
    pub fn needs_span(&self) -> bool {
        self.avail.is_empty()
    }

    /// Adopt a freshly acquired region as a span of this class.
    pub fn install_span(&mut self, region: Region) {
        let span = Span::new(region, self.class, self.block_size);
        let base = span.base();
        self.spans.insert(base, span);
        self.avail.push(base);
    }

    /// Pop one block, or `None` when every span is exhausted.
    pub fn take(&mut self) -> Option<TakenBlock> {
        while let Some(&span_base) = self.avail.last() {
            let Some(span) = self.spans.get_mut(&span_base) else {
                self.avail.pop();
                continue;
            };
            match span.take() {
                Some((addr, origin)) => {
                    if !span.has_block() {
                        self.avail.pop();
                    }
                    return Some(TakenBlock {
                        addr,
                        span_base,
                        origin,
                    });
                }
                None => {
                    self.avail.pop();
                }
            }
        }
        None
    }

    /// Return a block to its span.
    ///
    /// When this leaves the span fully free and the class already retains
    /// enough idle spans, the span is evicted and its region returned for
    /// release; the caller performs the provider call.
    pub fn give(&mut self, addr: usize, span_base: usize) -> Option<Region> {
        let span = self
            .spans
            .get_mut(&span_base)
            .unwrap_or_else(|| panic!("no span at {span_base:#x} for class {}", self.class));
        let was_exhausted = !span.has_block();
        span.give(addr);
        if was_exhausted {
            self.avail.push(span_base);
        }
        if span.is_idle() {
            let idle = self.spans.values().filter(|s| s.is_idle()).count();
            if idle > self.retain_cap {
                self.avail.retain(|&base| base != span_base);
                let span = self.spans.remove(&span_base)?;
                return Some(span.into_region());
            }
        }
        None
    }

    /// Region backing a span, for byte operations on its blocks.
    pub fn region_of(&self, span_base: usize) -> Option<&Region> {
        self.spans.get(&span_base).map(Span::region)
    }

    /// Pointer to a block, derived from its span's mapping.
    pub fn block_ptr(&self, span_base: usize, addr: usize) -> Option<*mut u8> {
        let region = self.region_of(span_base)?;
        Some(region.base_ptr().wrapping_add(addr - region.base()))
    }

    /// Zero `len` bytes of a block in place.
    pub fn zero_block(&self, span_base: usize, addr: usize, offset: usize, len: usize) {
        if let Some(region) = self.region_of(span_base) {
            region.zero(addr - region.base() + offset, len);
        }
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn idle_span_count(&self) -> usize {
        self.spans.values().filter(|s| s.is_idle()).count()
    }

    /// Surrender every span for teardown.
    pub fn drain_regions(&mut self) -> Vec<Region> {
        self.avail.clear();
        self.spans
            .drain()
            .map(|(_, span)| span.into_region())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanalloc_region::{MmapProvider, RegionProvider};

    fn pool_with_span(block_size: usize, retain_cap: usize) -> (MmapProvider, ClassPool) {
        let provider = MmapProvider::new();
        let mut pool = ClassPool::new(0, block_size, retain_cap);
        pool.install_span(provider.acquire(4096, false).unwrap());
        (provider, pool)
    }

    fn teardown(provider: &MmapProvider, mut pool: ClassPool) {
        for region in pool.drain_regions() {
            provider.release(region);
        }
    }

    #[test]
    fn take_until_exhausted() {
        let (provider, mut pool) = pool_with_span(1024, 1);
        for _ in 0..4 {
            assert!(pool.take().is_some());
        }
        assert!(pool.take().is_none());
        assert!(pool.needs_span());
        teardown(&provider, pool);
    }

    #[test]
    fn give_makes_block_available_again() {
        let (provider, mut pool) = pool_with_span(1024, 1);
        let blocks: Vec<TakenBlock> = std::iter::from_fn(|| pool.take()).collect();
        assert_eq!(blocks.len(), 4);
        let first = blocks[0];
        assert!(pool.give(first.addr, first.span_base).is_none());
        assert!(!pool.needs_span());
        let again = pool.take().unwrap();
        assert_eq!(again.addr, first.addr);
        assert_eq!(again.origin, BlockOrigin::Recycled);
        // Drop the rest before teardown.
        for block in &blocks[1..] {
            pool.give(block.addr, block.span_base);
        }
        pool.give(again.addr, again.span_base);
        teardown(&provider, pool);
    }

    #[test]
    fn retention_cap_zero_releases_idle_span() {
        let (provider, mut pool) = pool_with_span(1024, 0);
        let block = pool.take().unwrap();
        let released = pool.give(block.addr, block.span_base);
        let region = released.expect("idle span should be evicted with cap 0");
        provider.release(region);
        assert_eq!(pool.span_count(), 0);
        assert!(pool.needs_span());
        teardown(&provider, pool);
    }

    #[test]
    fn retention_cap_keeps_one_idle_span() {
        let (provider, mut pool) = pool_with_span(1024, 1);
        let block = pool.take().unwrap();
        assert!(pool.give(block.addr, block.span_base).is_none());
        assert_eq!(pool.idle_span_count(), 1);
        // The retained span serves the next request without a new span.
        assert!(!pool.needs_span());
        let again = pool.take().unwrap();
        pool.give(again.addr, again.span_base);
        teardown(&provider, pool);
    }

    #[test]
    fn second_idle_span_is_released() {
        let provider = MmapProvider::new();
        let mut pool = ClassPool::new(0, 1024, 1);
        pool.install_span(provider.acquire(4096, false).unwrap());
        // Exhaust the first span so a second one is needed.
        let first: Vec<TakenBlock> = std::iter::from_fn(|| pool.take()).collect();
        pool.install_span(provider.acquire(4096, false).unwrap());
        let second = pool.take().unwrap();
        assert_ne!(second.span_base, first[0].span_base);

        // Free everything: one span is retained, the other evicted.
        assert!(pool.give(second.addr, second.span_base).is_none());
        let mut evicted = 0;
        for block in &first {
            if let Some(region) = pool.give(block.addr, block.span_base) {
                provider.release(region);
                evicted += 1;
            }
        }
        assert_eq!(evicted, 1);
        assert_eq!(pool.idle_span_count(), 1);
        teardown(&provider, pool);
    }
}
