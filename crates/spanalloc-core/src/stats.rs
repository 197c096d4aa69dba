//! Allocator accounting counters.
//!
//! Snapshots are serializable so harnesses can export them as JSON. The
//! accounting invariant surfaced for tests: live user bytes never exceed
//! what has been acquired from the provider minus what was released.

use serde::Serialize;

/// Counters for one allocator instance.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Currently outstanding allocations (excluding zero-size sentinels).
    pub active_count: usize,
    /// User-requested bytes currently outstanding.
    pub live_bytes: usize,
    /// Total bytes ever acquired from the region provider.
    pub bytes_acquired: usize,
    /// Total bytes released back to the provider.
    pub bytes_released: usize,
    /// Pool spans acquired.
    pub spans_acquired: usize,
    /// Pool spans released (retention cap exceeded or teardown).
    pub spans_released: usize,
    /// Small allocations served without a new span.
    pub pool_hits: u64,
    /// Blocks carved from pristine span memory.
    pub fresh_carves: u64,
    /// Recycled blocks explicitly cleared for a zero-requested allocation.
    pub recycled_zeroed: u64,
    /// Zero-length allocations answered with the sentinel.
    pub zero_size_allocs: u64,
    /// Frees of an address already freed (misuse, release builds only).
    pub double_frees: u64,
    /// Frees of an address this allocator never issued (misuse).
    pub foreign_frees: u64,
}

impl AllocatorStats {
    /// Provider bytes currently held by the allocator.
    #[must_use]
    pub fn provider_bytes_held(&self) -> usize {
        self.bytes_acquired - self.bytes_released
    }

    /// Accounting invariant: outstanding user bytes fit inside held
    /// provider bytes.
    #[must_use]
    pub fn accounting_consistent(&self) -> bool {
        self.bytes_acquired >= self.bytes_released
            && self.live_bytes <= self.provider_bytes_held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_consistent() {
        let stats = AllocatorStats::default();
        assert!(stats.accounting_consistent());
        assert_eq!(stats.provider_bytes_held(), 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = AllocatorStats {
            active_count: 3,
            live_bytes: 96,
            bytes_acquired: 65536,
            ..AllocatorStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["active_count"], 3);
        assert_eq!(json["bytes_acquired"], 65536);
    }
}
