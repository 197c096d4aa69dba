//! Single-threaded allocator facade.
//!
//! The allocator is an explicit context object: construct one per thread
//! (or per subsystem), allocate and free through it, and drop it only
//! after every outstanding allocation has been returned. There is no
//! hidden global instance and no internal synchronization; the caller
//! guarantees exclusive access. [`SharedAllocator`](crate::SharedAllocator)
//! is the concurrent variant.

use std::collections::{HashMap, HashSet};

use spanalloc_region::{MmapProvider, Region, RegionProvider, copy_bytes};

use crate::config::{AllocatorConfig, BLOCK_ALIGN};
use crate::error::{AllocError, ConfigError};
use crate::events::{AllocatorEvent, EventLevel, EventLog};
use crate::large::LargeObjects;
use crate::pool::{ClassPool, TakenBlock};
use crate::size_class::SizeClassMap;
use crate::span::BlockOrigin;
use crate::stats::AllocatorStats;

/// Address returned for zero-length requests.
///
/// Non-null, never part of any mapping (it sits in the zero page), never
/// dereferenceable. `free` and `reallocate` accept it.
pub const ZERO_SIZE_SENTINEL: usize = BLOCK_ALIGN;

pub(crate) fn sentinel_ptr() -> *mut u8 {
    std::ptr::null_mut::<u8>().wrapping_add(ZERO_SIZE_SENTINEL)
}

/// Which path owns a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Small { class: usize, span_base: usize },
    Large,
}

/// Out-of-band record for one live block, keyed by address in the side
/// table. The caller never supplies sizes to `free`; this is how the
/// facade recovers the owning pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockRecord {
    pub(crate) kind: BlockKind,
    pub(crate) user_size: usize,
}

pub(crate) fn round_up(len: usize, granularity: usize) -> Option<usize> {
    debug_assert!(granularity.is_power_of_two());
    len.checked_add(granularity - 1).map(|v| v & !(granularity - 1))
}

/// Single-threaded size-class allocator.
pub struct Allocator<P: RegionProvider = MmapProvider> {
    provider: P,
    map: SizeClassMap,
    pools: Vec<ClassPool>,
    large: LargeObjects,
    /// Side table: block address -> record.
    active: HashMap<usize, BlockRecord>,
    /// Addresses seen by `free`, to tell double frees from foreign ones.
    recently_freed: HashSet<usize>,
    stats: AllocatorStats,
    events: EventLog,
    span_bytes: usize,
}

impl Allocator<MmapProvider> {
    /// Allocator with the default configuration over mmap regions.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(AllocatorConfig::default(), MmapProvider::new())
    }

    /// Allocator with a custom configuration over mmap regions.
    pub fn with_config(config: AllocatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, MmapProvider::new()))
    }
}

impl Default for Allocator<MmapProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RegionProvider> Allocator<P> {
    /// Allocator over a caller-supplied region provider (the seam used by
    /// failure-injection tests).
    pub fn with_provider(config: AllocatorConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, provider))
    }

    fn from_parts(config: AllocatorConfig, provider: P) -> Self {
        let map = SizeClassMap::new(&config.size_classes);
        let pools = (0..map.len())
            .map(|class| ClassPool::new(class, map.class_size(class), config.retain_spans))
            .collect();
        Self {
            provider,
            map,
            pools,
            large: LargeObjects::new(),
            active: HashMap::new(),
            recently_freed: HashSet::new(),
            stats: AllocatorStats::default(),
            events: EventLog::new(config.event_capacity),
            span_bytes: config.span_bytes,
        }
    }

    /// Allocate `len` bytes.
    ///
    /// Zero-length requests return the non-null sentinel. When `zero` is
    /// set, the first `len` bytes of the returned block are zero: fresh
    /// blocks rely on the provider's zero-on-acquire guarantee, recycled
    /// blocks are cleared explicitly.
    pub fn allocate(&mut self, len: usize, zero: bool) -> Result<*mut u8, AllocError> {
        if len == 0 {
            self.stats.zero_size_allocs += 1;
            self.events.record(
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

    fn allocate_small(
        &mut self,
        class: usize,
        len: usize,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        let block = self.take_small(class)?;
        match block.origin {
            BlockOrigin::Fresh => self.stats.fresh_carves += 1,
            BlockOrigin::Recycled if zero => {
                // The whole block, not just `len`: recycled contents must
                // never leak through a zero-requested allocation.
                self.pools[class].zero_block(
                    block.span_base,
                    block.addr,
                    0,
                    self.map.class_size(class),
                );
                self.stats.recycled_zeroed += 1;
            }
            BlockOrigin::Recycled => {}
        }
        let Some(ptr) = self.pools[class].block_ptr(block.span_base, block.addr) else {
            unreachable!("span {:#x} missing from class {class}", block.span_base)
        };
        self.active.insert(
            block.addr,
            BlockRecord {
                kind: BlockKind::Small {
                    class,
                    span_base: block.span_base,
                },
                user_size: len,
            },
        );
        self.recently_freed.remove(&block.addr);
        self.stats.active_count += 1;
        self.stats.live_bytes += len;
        self.events.record(
            EventLevel::Trace,
            "allocate",
            "success",
            Some(block.addr),
            Some(len),
            Some(class),
        );
        Ok(ptr)
    }

    fn allocate_large(&mut self, len: usize, zero: bool) -> Result<*mut u8, AllocError> {
        let region = match self.provider.acquire(len, zero) {
            Ok(region) => region,
            Err(err) => {
                self.events.record(
                    EventLevel::Info,
                    "allocate",
                    "oom",
                    None,
                    Some(len),
                    None,
                );
                return Err(err.into());
            }
        };
        self.stats.bytes_acquired += region.len();
        let ptr = region.base_ptr();
        let base = self.large.insert(region, len);
        self.active.insert(
            base,
            BlockRecord {
                kind: BlockKind::Large,
                user_size: len,
            },
        );
        self.recently_freed.remove(&base);
        self.stats.active_count += 1;
        self.stats.live_bytes += len;
        self.events.record(
            EventLevel::Trace,
            "allocate",
            "success",
            Some(base),
            Some(len),
            None,
        );
        Ok(ptr)
    }

    fn take_small(&mut self, class: usize) -> Result<TakenBlock, AllocError> {
        if let Some(block) = self.pools[class].take() {
            self.stats.pool_hits += 1;
            return Ok(block);
        }
        // Pool exhausted: exactly one span acquisition replenishes it.
        // Spans are acquired zeroed so carving yields zero blocks without
        // touching them; uncarved bytes are never written.
        let region = match self.provider.acquire(self.span_bytes, true) {
            Ok(region) => region,
            Err(err) => {
                self.events.record(
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
        self.stats.bytes_acquired += region.len();
        self.stats.spans_acquired += 1;
        self.pools[class].install_span(region);
        self.pools[class].take().ok_or(AllocError::OutOfMemory {
            requested: self.span_bytes,
        })
    }

    /// Resize a block.
    ///
    /// Stays in place when the new length classifies into the same size
    /// class (or the same large rounding); otherwise allocates, copies
    /// `min(old, new)` bytes, and frees the original. On failure the
    /// original block is untouched and still live. With `zero` set, bytes
    /// past the preserved prefix are zero when growing.
    pub fn reallocate(
        &mut self,
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
            self.stats.zero_size_allocs += 1;
            self.events.record(
                EventLevel::Trace,
                "reallocate",
                "zero_size_sentinel",
                Some(addr),
                Some(0),
                None,
            );
            return Ok(sentinel_ptr());
        }
        let Some(&record) = self.active.get(&addr) else {
            self.events.record(
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
                        self.pools[class].zero_block(span_base, addr, old_len, new_len - old_len);
                    }
                    if let Some(live) = self.active.get_mut(&addr) {
                        live.user_size = new_len;
                    }
                    self.stats.live_bytes = self.stats.live_bytes - old_len + new_len;
                    self.events.record(
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
                let mapped = self.large.get(addr).map(|a| a.mapped_size());
                let rounded = round_up(new_len, self.provider.granularity());
                if self.map.classify(new_len).is_none() && rounded == mapped {
                    let old_len = record.user_size;
                    if zero && new_len > old_len {
                        if let Some(allocation) = self.large.get(addr) {
                            allocation.region().zero(old_len, new_len - old_len);
                        }
                    }
                    self.large.set_user_size(addr, new_len);
                    if let Some(live) = self.active.get_mut(&addr) {
                        live.user_size = new_len;
                    }
                    self.stats.live_bytes = self.stats.live_bytes - old_len + new_len;
                    self.events.record(
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

    fn move_block(
        &mut self,
        old_ptr: *mut u8,
        record: BlockRecord,
        new_len: usize,
        zero: bool,
    ) -> Result<*mut u8, AllocError> {
        let old_addr = old_ptr as usize;
        // Allocate before freeing so the original survives OutOfMemory.
        let new_ptr = self.allocate(new_len, false)?;
        let new_addr = new_ptr as usize;
        let copy_len = record.user_size.min(new_len);
        {
            let new_kind = self.active.get(&new_addr).map(|r| r.kind);
            let old_place = self.region_and_offset(old_addr, record.kind);
            let new_place =
                new_kind.and_then(|kind| self.region_and_offset(new_addr, kind));
            if let (Some((old_region, old_off)), Some((new_region, new_off))) =
                (old_place, new_place)
            {
                copy_bytes(old_region, old_off, new_region, new_off, copy_len);
                if zero && new_len > copy_len {
                    new_region.zero(new_off + copy_len, new_len - copy_len);
                }
            }
        }
        self.free(old_ptr);
        self.events.record(
            EventLevel::Trace,
            "reallocate",
            "moved",
            Some(new_addr),
            Some(new_len),
            None,
        );
        Ok(new_ptr)
    }

    fn region_and_offset(&self, addr: usize, kind: BlockKind) -> Option<(&Region, usize)> {
        match kind {
            BlockKind::Small { class, span_base } => {
                let region = self.pools[class].region_of(span_base)?;
                Some((region, addr - region.base()))
            }
            BlockKind::Large => {
                let allocation = self.large.get(addr)?;
                Some((allocation.region(), 0))
            }
        }
    }

    /// Free a block previously returned by this facade.
    ///
    /// Null and the zero-size sentinel are no-ops. Anything else the side
    /// table does not recognize is a usage error: debug builds panic with
    /// a diagnostic, release builds count it and return.
    pub fn free(&mut self, ptr: *mut u8) {
        let addr = ptr as usize;
        if ptr.is_null() {
            self.events
                .record(EventLevel::Trace, "free", "null_noop", None, None, None);
            return;
        }
        if addr == ZERO_SIZE_SENTINEL {
            self.events.record(
                EventLevel::Trace,
                "free",
                "zero_size_sentinel",
                Some(addr),
                None,
                None,
            );
            return;
        }
        let Some(record) = self.active.remove(&addr) else {
            self.invalid_free(addr);
            return;
        };
        self.recently_freed.insert(addr);
        self.stats.active_count -= 1;
        self.stats.live_bytes -= record.user_size;
        match record.kind {
            BlockKind::Large => {
                if let Some(allocation) = self.large.remove(addr) {
                    let region = allocation.into_region();
                    self.stats.bytes_released += region.len();
                    self.provider.release(region);
                }
                self.events.record(
                    EventLevel::Trace,
                    "free",
                    "success",
                    Some(addr),
                    Some(record.user_size),
                    None,
                );
            }
            BlockKind::Small { class, span_base } => {
                if let Some(region) = self.pools[class].give(addr, span_base) {
                    // The span's addresses are leaving this allocator for
                    // good; dropping them from the freed set keeps it from
                    // growing without bound across evictions.
                    let (lo, hi) = (region.base(), region.base() + region.len());
                    self.recently_freed.retain(|&a| a < lo || a >= hi);
                    self.stats.bytes_released += region.len();
                    self.stats.spans_released += 1;
                    self.provider.release(region);
                }
                self.events.record(
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

    fn invalid_free(&mut self, addr: usize) {
        if self.recently_freed.contains(&addr) {
            self.stats.double_frees += 1;
            self.events
                .record(EventLevel::Warn, "free", "double_free", Some(addr), None, None);
            #[cfg(debug_assertions)]
            panic!("double free of block {addr:#x}");
        } else {
            self.stats.foreign_frees += 1;
            self.events.record(
                EventLevel::Warn,
                "free",
                "foreign_free",
                Some(addr),
                None,
                None,
            );
            #[cfg(debug_assertions)]
            panic!("free of address {addr:#x} this allocator never issued");
        }
    }

    /// User size of a live block, or `None` for unknown addresses.
    #[must_use]
    pub fn lookup(&self, ptr: *mut u8) -> Option<usize> {
        self.active.get(&(ptr as usize)).map(|r| r.user_size)
    }

    #[must_use]
    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    /// Drain buffered lifecycle events.
    pub fn drain_events(&mut self) -> Vec<AllocatorEvent> {
        self.events.drain()
    }
}

impl<P: RegionProvider> Drop for Allocator<P> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.active.is_empty(),
                "allocator torn down with {} outstanding allocations",
                self.active.len()
            );
        }
        for pool in &mut self.pools {
            for region in pool.drain_regions() {
                self.provider.release(region);
            }
        }
        for region in self.large.drain_regions() {
            self.provider.release(region);
        }
    }
}
