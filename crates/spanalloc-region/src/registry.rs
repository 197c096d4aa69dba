//! Debug liveness registry for acquired regions.
//!
//! Release of a region is idempotent-unsafe: releasing twice, or releasing
//! a handle the provider never issued, is undefined. Debug builds keep a
//! process-wide map of live regions and abort with a diagnostic when that
//! contract is broken. Release builds compile all of this out.

#[cfg(debug_assertions)]
use parking_lot::Mutex;
#[cfg(debug_assertions)]
use std::collections::BTreeMap;

#[cfg(debug_assertions)]
static LIVE_REGIONS: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

/// Record a freshly acquired region.
#[cfg(debug_assertions)]
pub fn note_acquired(base: usize, len: usize) {
    let previous = LIVE_REGIONS.lock().insert(base, len);
    assert!(
        previous.is_none(),
        "provider returned an already-live region at {base:#x}"
    );
}

#[cfg(not(debug_assertions))]
pub fn note_acquired(_base: usize, _len: usize) {}

/// Record a release, aborting on double release or a foreign handle.
#[cfg(debug_assertions)]
pub fn note_released(base: usize, len: usize) {
    let removed = LIVE_REGIONS.lock().remove(&base);
    assert!(
        removed == Some(len),
        "release of region at {base:#x} (len {len}) that is not live"
    );
}

#[cfg(not(debug_assertions))]
pub fn note_released(_base: usize, _len: usize) {}

/// Whether a region with this base is currently live. Release builds
/// always answer yes.
#[must_use]
pub fn is_live(base: usize) -> bool {
    #[cfg(debug_assertions)]
    {
        LIVE_REGIONS.lock().contains_key(&base)
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = base;
        true
    }
}

#[cfg(all(test, debug_assertions))]
mod tests {
    use crate::provider::{MmapProvider, RegionProvider};

    #[test]
    fn registry_tracks_region_lifecycle() {
        let provider = MmapProvider::new();
        let region = provider.acquire(4096, false).unwrap();
        let base = region.base();
        assert!(super::is_live(base));
        provider.release(region);
        assert!(!super::is_live(base));
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn double_release_is_detected() {
        super::note_acquired(0xDEAD_0000, 4096);
        super::note_released(0xDEAD_0000, 4096);
        super::note_released(0xDEAD_0000, 4096);
    }
}
