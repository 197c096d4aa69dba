//! Region acquisition and release.
//!
//! A [`Region`] is a contiguous slab of memory obtained from the operating
//! environment through a [`RegionProvider`]. The default provider maps
//! anonymous private pages with `mmap` and returns them with `munmap`.
//!
//! Regions have no destructor: release is an explicit call, and releasing
//! a region twice (or one that was never acquired) is a usage error that
//! debug builds catch through the liveness registry.

use std::ptr;

use thiserror::Error;

use crate::registry;

/// The operating environment could not supply a region.
///
/// Recoverable: the caller's state is unchanged and further requests are
/// allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("could not acquire a {requested}-byte region from the operating environment")]
pub struct OutOfMemory {
    /// Rounded byte length that was requested from the environment.
    pub requested: usize,
}

/// Handle to one acquired region.
///
/// The region stays valid until it is passed back to
/// [`RegionProvider::release`]. All byte operations are bounds-checked
/// against the region length, so holders can manipulate region contents
/// without writing `unsafe` themselves.
#[derive(Debug)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: a Region is an exclusively owned mapping; the raw base pointer
// carries no thread affinity. Shared `&Region` byte operations are
// bounds-checked and target memory no safe reference points into.
unsafe impl Send for Region {}
// SAFETY: see above; `&Region` methods only touch bytes inside the mapping.
unsafe impl Sync for Region {}

impl Region {
    fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Base address of the region.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Base pointer of the region. Offsetting within `len` bytes keeps
    /// the mapping's provenance.
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Region length in bytes (already rounded to provider granularity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[offset, offset + len)` lies inside the region.
    #[must_use]
    pub fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len)
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            self.in_bounds(offset, len),
            "range {offset}..{} out of bounds for {}-byte region",
            offset.wrapping_add(len),
            self.len
        );
        debug_assert!(
            registry::is_live(self.base()),
            "byte operation on released region at {:#x}",
            self.base()
        );
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        self.check_range(offset, len);
        // SAFETY: range checked against the live mapping; no safe Rust
        // reference can alias region bytes.
        unsafe {
            ptr::write_bytes(self.base.add(offset), 0, len);
        }
    }

    /// Copy bytes out of the region into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        self.check_range(offset, out.len());
        // SAFETY: source range checked; `out` is an exclusive slice.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        // SAFETY: destination range checked; `data` is a shared slice that
        // cannot alias the mapping.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
    }
}

/// Copy `len` bytes between two regions.
///
/// The ranges are bounds-checked against both regions. Overlapping ranges
/// are handled (`memmove` semantics), although the allocator never hands
/// out overlapping blocks.
pub fn copy_bytes(src: &Region, src_offset: usize, dst: &Region, dst_offset: usize, len: usize) {
    src.check_range(src_offset, len);
    dst.check_range(dst_offset, len);
    // SAFETY: both ranges checked against their live mappings.
    unsafe {
        ptr::copy(src.base.add(src_offset), dst.base.add(dst_offset), len);
    }
}

/// Source of coarse memory regions.
///
/// Implementations round requested lengths up to [`granularity`]. The
/// trait is the seam for failure injection in tests: the core allocator is
/// generic over its provider.
///
/// [`granularity`]: RegionProvider::granularity
pub trait RegionProvider {
    /// Acquire a region of at least `byte_len` bytes.
    ///
    /// When `zero` is set, every byte of the returned region is zero.
    fn acquire(&self, byte_len: usize, zero: bool) -> Result<Region, OutOfMemory>;

    /// Return a region to the environment.
    ///
    /// Releasing a region twice, or one not currently held, is undefined;
    /// debug builds abort with a diagnostic through the liveness registry.
    fn release(&self, region: Region);

    /// Native allocation granularity in bytes (a power of two).
    fn granularity(&self) -> usize;
}

/// Default provider: anonymous private `mmap` regions.
///
/// Anonymous mappings are zero-filled by the kernel, so the zero-on-acquire
/// policy costs nothing on this provider.
#[derive(Debug, Clone)]
pub struct MmapProvider {
    page_size: usize,
}

impl MmapProvider {
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sysconf with a valid name has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if raw > 0 { raw as usize } else { 4096 };
        Self { page_size }
    }
}

impl Default for MmapProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(value: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    value
        .checked_add(granularity - 1)
        .map_or(usize::MAX & !(granularity - 1), |v| v & !(granularity - 1))
}

impl RegionProvider for MmapProvider {
    fn acquire(&self, byte_len: usize, zero: bool) -> Result<Region, OutOfMemory> {
        let len = round_up(byte_len.max(1), self.page_size);
        // Anonymous pages come back zeroed regardless of the flag.
        let _ = zero;
        // SAFETY: anonymous private mapping with no address hint; the
        // kernel picks placement and the result is checked below.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(OutOfMemory { requested: len });
        }
        let base = raw.cast::<u8>();
        registry::note_acquired(base as usize, len);
        Ok(Region::new(base, len))
    }

    fn release(&self, region: Region) {
        registry::note_released(region.base(), region.len());
        // SAFETY: the region was produced by `acquire` with exactly this
        // base and length, and the registry confirmed it is still live.
        unsafe {
            libc::munmap(region.base.cast(), region.len);
        }
    }

    fn granularity(&self) -> usize {
        self.page_size
    }
}
