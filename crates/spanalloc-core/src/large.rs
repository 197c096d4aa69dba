//! Large-object registry.
//!
//! Requests above the largest size class bypass the pools: each maps to
//! exactly one provider region, rounded to provider granularity, released
//! immediately on free. No pooling here; large allocations are assumed
//! infrequent and pooling them risks unbounded retained memory.

use std::collections::HashMap;

use spanalloc_region::Region;

/// Metadata for one large allocation.
#[derive(Debug)]
pub struct LargeAllocation {
    region: Region,
    user_size: usize,
}

impl LargeAllocation {
    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Mapped length (request rounded to provider granularity).
    pub fn mapped_size(&self) -> usize {
        self.region.len()
    }

    /// Surrender the backing region for release.
    pub fn into_region(self) -> Region {
        self.region
    }
}

/// Registry of active large allocations, keyed by base address.
#[derive(Debug, Default)]
pub struct LargeObjects {
    allocations: HashMap<usize, LargeAllocation>,
    total_mapped: usize,
}

impl LargeObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a region acquired for a large request. Returns the base
    /// address handed to the caller.
    pub fn insert(&mut self, region: Region, user_size: usize) -> usize {
        let base = region.base();
        self.total_mapped += region.len();
        self.allocations
            .insert(base, LargeAllocation { region, user_size });
        base
    }

    /// Detach an allocation; the caller releases the region.
    pub fn remove(&mut self, base: usize) -> Option<LargeAllocation> {
        let allocation = self.allocations.remove(&base)?;
        self.total_mapped -= allocation.mapped_size();
        Some(allocation)
    }

    pub fn get(&self, base: usize) -> Option<&LargeAllocation> {
        self.allocations.get(&base)
    }

    /// Record an in-place resize within the same mapped region.
    pub fn set_user_size(&mut self, base: usize, user_size: usize) {
        if let Some(allocation) = self.allocations.get_mut(&base) {
            allocation.user_size = user_size;
        }
    }

    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }

    /// Surrender every region for teardown.
    pub fn drain_regions(&mut self) -> Vec<Region> {
        self.total_mapped = 0;
        self.allocations
            .drain()
            .map(|(_, allocation)| allocation.region)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanalloc_region::{MmapProvider, RegionProvider};

    #[test]
    fn insert_and_remove_track_mapped_bytes() {
        let provider = MmapProvider::new();
        let mut large = LargeObjects::new();
        let region = provider.acquire(100_000, false).unwrap();
        let mapped = region.len();
        let base = large.insert(region, 100_000);
        assert_eq!(large.active_count(), 1);
        assert_eq!(large.total_mapped(), mapped);
        assert_eq!(large.get(base).map(LargeAllocation::user_size), Some(100_000));

        let allocation = large.remove(base).unwrap();
        assert_eq!(large.active_count(), 0);
        assert_eq!(large.total_mapped(), 0);
        provider.release(allocation.region);
    }

    #[test]
    fn remove_unknown_base_is_none() {
        let mut large = LargeObjects::new();
        assert!(large.remove(0xDEAD).is_none());
    }

    #[test]
    fn set_user_size_updates_in_place() {
        let provider = MmapProvider::new();
        let mut large = LargeObjects::new();
        let base = large.insert(provider.acquire(50_000, false).unwrap(), 50_000);
        large.set_user_size(base, 60_000);
        assert_eq!(large.get(base).map(LargeAllocation::user_size), Some(60_000));
        for region in large.drain_regions() {
            provider.release(region);
        }
    }
}
