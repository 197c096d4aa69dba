//! Thread-safe allocator facade.
//!
//! Same semantics as [`Allocator`](crate::Allocator), shared freely
//! across threads. Locking is deliberately fine-grained and flat: one
//! mutex per size class, one for the large-object table, the live-block
//! side table sharded sixteen ways by address, and atomic counters. No
//! code path ever holds two locks at once, and no lock is held across a
//! provider call, so lock ordering never arises.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use spanalloc_region::{MmapProvider, Region, RegionProvider};

use crate::allocator::{BlockKind, BlockRecord, ZERO_SIZE_SENTINEL, round_up, sentinel_ptr};
use crate::config::AllocatorConfig;
use crate::error::{AllocError, ConfigError};
use crate::events::{AllocatorEvent, EventLevel, EventLog};
use crate::large::LargeObjects;
use crate::pool::{ClassPool, TakenBlock};
use crate::size_class::SizeClassMap;
use crate::span::BlockOrigin;
use crate::stats::AllocatorStats;

const SHARD_COUNT: usize = 16;
const COPY_CHUNK: usize = 4096;

fn shard_index(addr: usize) -> usize {
    (addr >> 12) % SHARD_COUNT
}

/// One slice of the live-block side table.
#[derive(Debug, Default)]
struct Shard {
    records: HashMap<usize, BlockRecord>,
    recently_freed: HashSet<usize>,
}

/// Lock-free mirror of [`AllocatorStats`]; read out with [`snapshot`].
///
/// [`snapshot`]: SharedStats::snapshot
#[derive(Debug, Default)]
struct SharedStats {
    active_count: AtomicUsize,
    live_bytes: AtomicUsize,
    bytes_acquired: AtomicUsize,
    bytes_released: AtomicUsize,
    spans_acquired: AtomicUsize,
    spans_released: AtomicUsize,
    pool_hits: AtomicU64,
    fresh_carves: AtomicU64,
    recycled_zeroed: AtomicU64,
    zero_size_allocs: AtomicU64,
    double_frees: AtomicU64,
    foreign_frees: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            active_count: self.active_count.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            bytes_acquired: self.bytes_acquired.load(Ordering::Relaxed),
            bytes_released: self.bytes_released.load(Ordering::Relaxed),
            spans_acquired: self.spans_acquired.load(Ordering::Relaxed),
            spans_released: self.spans_released.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            fresh_carves: self.fresh_carves.load(Ordering::Relaxed),
            recycled_zeroed: self.recycled_zeroed.load(Ordering::Relaxed),
            zero_size_allocs: self.zero_size_allocs.load(Ordering::Relaxed),
            double_frees: self.double_frees.load(Ordering::Relaxed),
            foreign_frees: self.foreign_frees.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe size-class allocator.
pub struct SharedAllocator<P: RegionProvider = MmapProvider> {
    provider: P,
    map: SizeClassMap,
    pools: Vec<Mutex<ClassPool>>,
    large: Mutex<LargeObjects>,
    shards: Vec<Mutex<Shard>>,
    stats: SharedStats,
    events: Mutex<EventLog>,
    span_bytes: usize,
}

impl SharedAllocator<MmapProvider> {
    /// Shared allocator with the default configuration over mmap regions.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(AllocatorConfig::default(), MmapProvider::new())
    }

    /// Shared allocator with a custom configuration over mmap regions.
    pub fn with_config(config: AllocatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, MmapProvider::new()))
    }
}

impl Default for SharedAllocator<MmapProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RegionProvider> SharedAllocator<P> {
    /// Shared allocator over a caller-supplied region provider.
    pub fn with_provider(config: AllocatorConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, provider))
    }

    fn from_parts(config: AllocatorConfig, provider: P) -> Self {
        let map = SizeClassMap::new(&config.size_classes);
        let pools = (0..map.len())
            .map(|class| {
                Mutex::new(ClassPool::new(
                    class,
                    map.class_size(class),
                    config.retain_spans,
                ))
            })
            .collect();
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            provider,
            map,
            pools,
            large: Mutex::new(LargeObjects::new()),
            shards,
            stats: SharedStats::default(),
            events: Mutex::new(EventLog::new(config.event_capacity)),
            span_bytes: config.span_bytes,
        }
    }

    fn record_event(
        &self,
        level: EventLevel,
        op: &'static str,
        outcome: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
    ) {
        self.events.lock().record(level, op, outcome, addr, size, class);
    }

    /// Allocate `len` bytes. See [`Allocator::allocate`](crate::Allocator::allocate).
    pub fn allocate(&self, len: usize, zero: bool) -> Result<*mut u8, AllocError> {
        if len == 0 {
            self.stats.zero_size_allocs.fetch_add(1, Ordering::Relaxed);
            self.record_event(
                EventLevel::Trace,
                "allocate",
                "zero_size_sentinel",
                Some(ZERO_SIZE_SENTINEL),
                Some(0),
                None,
            );
            return Ok(sentinel_ptr());
        }
        match self.map.classify(len) {
            Some(class) => self.allocate_small(class, len, zero),
            None => self.allocate_large(len, zero),
        }
    }

    fn allocate_small(&self, class: usize, len: usize, zero: bool) -> Result<*mut u8, AllocError> {
        let (block, ptr) = self.take_small(class, zero)?;
        let mut shard = self.shards[shard_index(block.addr)].lock();
        shard.records.insert(
            block.addr,
            BlockRecord {
                kind: BlockKind::Small {
                    class,
                    span_base: block.span_base,
                },
                user_size: len,
            },
        );
        shard.recently_freed.remove(&block.addr);
        drop(shard);
        self.stats.active_count.fetch_add(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_add(len, Ordering::Relaxed);
        self.record_event(
            EventLevel::Trace,
            "allocate",
            "success",
            Some(block.addr),
            Some(len),
            Some(class),
        );
        Ok(ptr)
    }

    fn take_small(&self, class: usize, zero: bool) -> Result<(TakenBlock, *mut u8), AllocError> {
        let mut replenished = false;
        loop {
            let mut pool = self.pools[class].lock();
            if let Some(block) = pool.take() {
                let prepared = self.prepare_block(&pool, class, block, zero);
                if !replenished {
                    self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
                }
                if block.origin == BlockOrigin::Fresh {
                    self.stats.fresh_carves.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(prepared);
            }
            drop(pool);
            // Replenish without holding the class lock: the provider call
            // may be slow, and another thread may race in a span of its
            // own. Both get installed; the retry loop picks a block up.
            let region = match self.provider.acquire(self.span_bytes, true) {
                Ok(region) => region,
                Err(err) => {
                    self.record_event(
                        EventLevel::Info,
                        "allocate",
                        "oom",
                        None,
                        Some(self.span_bytes),
                        Some(class),
                    );
                    return Err(err.into());
                }
            };
            self.stats.bytes_acquired.fetch_add(region.len(), Ordering::Relaxed);
            self.stats.spans_acquired.fetch_add(1, Ordering::Relaxed);
            self.pools[class].lock().install_span(region);
            replenished = true;
        }
    }

    fn prepare_block(
        &self,
        pool: &ClassPool,
        class: usize,
        block: TakenBlock,
        zero: bool,
    ) -> (TakenBlock, *mut u8) {
        if zero && block.origin == BlockOrigin::Recycled {
            pool.zero_block(block.span_base, block.addr, 0, self.map.class_size(class));
            self.stats.recycled_zeroed.fetch_add(1, Ordering::Relaxed);
        }
        let Some(ptr) = pool.block_ptr(block.span_base, block.addr) else {
            unreachable!("span {:#x} missing from class {class}", block.span_base)
        };
        (block, ptr)
    }

    fn allocate_large(&self, len: usize, zero: bool) -> Result<*mut u8, AllocError> {
        let region = match self.provider.acquire(len, zero) {
            Ok(region) => region,
            Err(err) => {
                self.record_event(EventLevel::Info, "allocate", "oom", None, Some(len), None);
                return Err(err.into());
            }
        };
        self.stats.bytes_acquired.fetch_add(region.len(), Ordering::Relaxed);
        let ptr = region.base_ptr();
        let base = self.large.lock().insert(region, len);
        let mut shard = self.shards[shard_index(base)].lock();
        shard.records.insert(
            base,
            BlockRecord {
                kind: BlockKind::Large,
                user_size: len,
            },
        );
        shard.recently_freed.remove(&base);
        drop(shard);
        self.stats.active_count.fetch_add(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_add(len, Ordering::Relaxed);
        self.record_event(
            EventLevel::Trace,
            "allocate",
            "success",
            Some(base),
            Some(len),
            None,
        );
        Ok(ptr)
    }

    /// Free a block. See [`Allocator::free`](crate::Allocator::free).
    pub fn free(&self, ptr: *mut u8) {
        let addr = ptr as usize;
        if ptr.is_null() {
            self.record_event(EventLevel::Trace, "free", "null_noop", None, None, None);
            return;
        }
        if addr == ZERO_SIZE_SENTINEL {
            self.record_event(
                EventLevel::Trace,
                "free",
                "zero_size_sentinel",
                Some(addr),
                None,
                None,
            );
            return;
        }
        let record = {
            let mut shard = self.shards[shard_index(addr)].lock();
            match shard.records.remove(&addr) {
                Some(record) => {
                    shard.recently_freed.insert(addr);
                    record
                }
                None => {
                    let doubled = shard.recently_freed.contains(&addr);
                    drop(shard);
                    self.invalid_free(addr, doubled);
                    return;
                }
            }
        };
        self.stats.active_count.fetch_sub(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_sub(record.user_size, Ordering::Relaxed);
        match record.kind {
            BlockKind::Large => {
                let removed = self.large.lock().remove(addr);
                if let Some(allocation) = removed {
                    let region = allocation.into_region();
                    self.stats.bytes_released.fetch_add(region.len(), Ordering::Relaxed);
                    self.provider.release(region);
                }
                self.record_event(
                    EventLevel::Trace,
                    "free",
                    "success",
                    Some(addr),
                    Some(record.user_size),
                    None,
                );
            }
            BlockKind::Small { class, span_base } => {
                let evicted = self.pools[class].lock().give(addr, span_base);
                if let Some(region) = evicted {
                    // The span's addresses are leaving the allocator for
                    // good; its pages straddle shards, so sweep the freed
                    // set of every shard (one lock at a time).
                    let (lo, hi) = (region.base(), region.base() + region.len());
                    for shard in &self.shards {
                        shard.lock().recently_freed.retain(|&a| a < lo || a >= hi);
                    }
                    self.stats.bytes_released.fetch_add(region.len(), Ordering::Relaxed);
                    self.stats.spans_released.fetch_add(1, Ordering::Relaxed);
                    self.provider.release(region);
                }
                self.record_event(
                    EventLevel::Trace,
                    "free",
                    "success",
                    Some(addr),
                    Some(record.user_size),
                    Some(class),
                );
            }
        }
    }

    fn invalid_free(&self, addr: usize, doubled: bool) {
        if doubled {
            self.stats.double_frees.fetch_add(1, Ordering::Relaxed);
            self.record_event(EventLevel::Warn, "free", "double_free", Some(addr), None, None);
            #[cfg(debug_assertions)]
            panic!("double free of block {addr:#x}");
        } else {
            self.stats.foreign_frees.fetch_add(1, Ordering::Relaxed);
            self.record_event(EventLevel::Warn, "free", "foreign_free", Some(addr), None, None);
            #[cfg(debug_assertions)]
            panic!("free of address {addr:#x} this allocator never issued");
        }
    }

    /// Resize a block. See [`Allocator::reallocate`](crate::Allocator::reallocate).
    pub fn reallocate(
        &self,
        ptr: *mut u8,
        new_len: usize,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        let addr = ptr as usize;
        if ptr.is_null() || addr == ZERO_SIZE_SENTINEL {
            return self.allocate(new_len, zero);
        }
        if new_len == 0 {
            self.free(ptr);
            self.stats.zero_size_allocs.fetch_add(1, Ordering::Relaxed);
            self.record_event(
                EventLevel::Trace,
                "reallocate",
                "zero_size_sentinel",
                Some(addr),
                Some(0),
                None,
            );
            return Ok(sentinel_ptr());
        }
        let looked_up = self.shards[shard_index(addr)].lock().records.get(&addr).copied();
        let Some(record) = looked_up else {
            self.record_event(
                EventLevel::Warn,
                "reallocate",
                "unknown_address",
                Some(addr),
                Some(new_len),
                None,
            );
            #[cfg(debug_assertions)]
            panic!("reallocate of address {addr:#x} this allocator never issued");
            #[cfg(not(debug_assertions))]
            return self.allocate(new_len, zero);
        };
        match record.kind {
            BlockKind::Small { class, span_base } => {
                if self.map.classify(new_len) == Some(class) {
                    let old_len = record.user_size;
                    if zero && new_len > old_len {
                        self.pools[class]
                            .lock()
                            .zero_block(span_base, addr, old_len, new_len - old_len);
                    }
                    self.resize_record(addr, old_len, new_len);
                    self.record_event(
                        EventLevel::Trace,
                        "reallocate",
                        "in_place",
                        Some(addr),
                        Some(new_len),
                        Some(class),
                    );
                    return Ok(ptr);
                }
                self.move_block(ptr, record, new_len, zero)
            }
            BlockKind::Large => {
                let in_place = {
                    let large = self.large.lock();
                    let mapped = large.get(addr).map(|a| a.mapped_size());
                    let rounded = round_up(new_len, self.provider.granularity());
                    self.map.classify(new_len).is_none() && rounded == mapped
                };
                if in_place {
                    let old_len = record.user_size;
                    {
                        let mut large = self.large.lock();
                        if zero && new_len > old_len {
                            if let Some(allocation) = large.get(addr) {
                                allocation.region().zero(old_len, new_len - old_len);
                            }
                        }
                        large.set_user_size(addr, new_len);
                    }
                    self.resize_record(addr, old_len, new_len);
                    self.record_event(
                        EventLevel::Trace,
                        "reallocate",
                        "in_place",
                        Some(addr),
                        Some(new_len),
                        None,
                    );
                    return Ok(ptr);
                }
                self.move_block(ptr, record, new_len, zero)
            }
        }
    }

    fn resize_record(&self, addr: usize, old_len: usize, new_len: usize) {
        let mut shard = self.shards[shard_index(addr)].lock();
        if let Some(live) = shard.records.get_mut(&addr) {
            live.user_size = new_len;
        }
        drop(shard);
        if new_len >= old_len {
            self.stats.live_bytes.fetch_add(new_len - old_len, Ordering::Relaxed);
        } else {
            self.stats.live_bytes.fetch_sub(old_len - new_len, Ordering::Relaxed);
        }
    }

    fn move_block(
        &self,
        old_ptr: *mut u8,
        record: BlockRecord,
        new_len: usize,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        let old_addr = old_ptr as usize;
        // Allocate before freeing so the original survives OutOfMemory.
        let new_ptr = self.allocate(new_len, false)?;
        let new_addr = new_ptr as usize;
        let new_kind = self.shards[shard_index(new_addr)]
            .lock()
            .records
            .get(&new_addr)
            .map(|r| r.kind);
        let copy_len = record.user_size.min(new_len);
        if let Some(new_kind) = new_kind {
            // Chunked bounce copy through a stack buffer, one lock at a
            // time. Source and destination may live under the same class
            // mutex, so they are never locked together.
            let mut buf = [0u8; COPY_CHUNK];
            let mut done = 0;
            while done < copy_len {
                let chunk = (copy_len - done).min(COPY_CHUNK);
                self.with_block_region(old_addr, record.kind, |region, offset| {
                    region.read(offset + done, &mut buf[..chunk]);
                });
                self.with_block_region(new_addr, new_kind, |region, offset| {
                    region.write(offset + done, &buf[..chunk]);
                });
                done += chunk;
            }
            if zero && new_len > copy_len {
                self.with_block_region(new_addr, new_kind, |region, offset| {
                    region.zero(offset + copy_len, new_len - copy_len);
                });
            }
        }
        self.free(old_ptr);
        self.record_event(
            EventLevel::Trace,
            "reallocate",
            "moved",
            Some(new_addr),
            Some(new_len),
            None,
        );
        Ok(new_ptr)
    }

    fn with_block_region<F>(&self, addr: usize, kind: BlockKind, f: F)
    where
        F: FnOnce(&Region, usize),
    {
        match kind {
            BlockKind::Small { class, span_base } => {
                let pool = self.pools[class].lock();
                if let Some(region) = pool.region_of(span_base) {
                    f(region, addr - region.base());
                }
            }
            BlockKind::Large => {
                let large = self.large.lock();
                if let Some(allocation) = large.get(addr) {
                    f(allocation.region(), 0);
                }
            }
        }
    }

    /// User size of a live block, or `None` for unknown addresses.
    #[must_use]
    pub fn lookup(&self, ptr: *mut u8) -> Option<usize> {
        let addr = ptr as usize;
        self.shards[shard_index(addr)]
            .lock()
            .records
            .get(&addr)
            .map(|r| r.user_size)
    }

    /// Point-in-time snapshot of the counters. Individual fields are
    /// relaxed loads; cross-field relations may be momentarily torn while
    /// other threads allocate.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.stats.snapshot()
    }

    /// Drain buffered lifecycle events.
    pub fn drain_events(&self) -> Vec<AllocatorEvent> {
        self.events.lock().drain()
    }
}

impl<P: RegionProvider> Drop for SharedAllocator<P> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let outstanding: usize = self.shards.iter_mut().map(|s| s.get_mut().records.len()).sum();
            debug_assert!(
                outstanding == 0,
                "shared allocator torn down with {outstanding} outstanding allocations"
            );
        }
        for pool in &mut self.pools {
            for region in pool.get_mut().drain_regions() {
                self.provider.release(region);
            }
        }
        for region in self.large.get_mut().drain_regions() {
            self.provider.release(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shard_index_spreads_by_page() {
        assert_eq!(shard_index(0x1000), 1);
        assert_eq!(shard_index(0x2000), 2);
        assert_eq!(shard_index(0x10000), 0);
    }

    #[test]
    fn allocate_and_free_across_threads() {
        let alloc = Arc::new(SharedAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let ptr = alloc.allocate(64, false).unwrap();
                    assert!(!ptr.is_null());
                    alloc.free(ptr);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = alloc.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.live_bytes, 0);
        assert!(stats.accounting_consistent());
    }

    #[test]
    fn blocks_handed_to_another_thread_free_cleanly() {
        let alloc = Arc::new(SharedAllocator::new());
        let producer = Arc::clone(&alloc);
        let ptrs: Vec<usize> = std::thread::spawn(move || {
            (0..32)
                .map(|_| producer.allocate(128, false).unwrap() as usize)
                .collect()
        })
        .join()
        .unwrap();
        for addr in ptrs {
            alloc.free(addr as *mut u8);
        }
        assert_eq!(alloc.stats().active_count, 0);
    }

    #[test]
    fn reallocate_moves_between_paths() {
        let alloc = SharedAllocator::new();
        let small = alloc.allocate(64, false).unwrap();
        let large = alloc.reallocate(small, 100_000, false).unwrap();
        assert_ne!(small, large);
        assert_eq!(alloc.lookup(large), Some(100_000));
        let back = alloc.reallocate(large, 64, false).unwrap();
        assert_eq!(alloc.lookup(back), Some(64));
        alloc.free(back);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn double_free_panics_in_debug() {
        let alloc = SharedAllocator::new();
        let ptr = alloc.allocate(48, false).unwrap();
        alloc.free(ptr);
        alloc.free(ptr);
    }

    #[test]
    fn snapshot_reflects_live_blocks() {
        let alloc = SharedAllocator::new();
        let a = alloc.allocate(100, false).unwrap();
        let b = alloc.allocate(200, false).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.live_bytes, 300);
        alloc.free(a);
        alloc.free(b);
    }
}
