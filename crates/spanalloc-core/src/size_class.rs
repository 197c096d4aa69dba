//! Size-class index.
//!
//! Maps requested byte lengths to entries of the configured class table in
//! constant time via a dense lookup table indexed by 16-byte cells. Sizes
//! above the largest class return `None` and take the large-object path.

use crate::config::BLOCK_ALIGN;

/// Immutable size-class index built from a validated class table.
#[derive(Debug, Clone)]
pub struct SizeClassMap {
    classes: Vec<usize>,
    /// `lut[(bytes - 1) / BLOCK_ALIGN]` is the class index for `bytes`.
    lut: Vec<u16>,
    threshold: usize,
}

impl SizeClassMap {
    /// Build the index. The table must already satisfy
    /// [`AllocatorConfig::validate`](crate::config::AllocatorConfig::validate).
    #[must_use]
    pub fn new(classes: &[usize]) -> Self {
        let threshold = classes.last().copied().unwrap_or(0);
        debug_assert!(classes.len() < usize::from(u16::MAX));
        let cells = threshold / BLOCK_ALIGN;
        let mut lut = Vec::with_capacity(cells);
        let mut class = 0usize;
        for cell in 0..cells {
            let size = (cell + 1) * BLOCK_ALIGN;
            while classes[class] < size {
                class += 1;
            }
            lut.push(class as u16);
        }
        Self {
            classes: classes.to_vec(),
            lut,
            threshold,
        }
    }

    /// Class index for a request, or `None` for the large-object path.
    ///
    /// Zero-length requests classify like one byte; the facade intercepts
    /// them before classification.
    #[must_use]
    pub fn classify(&self, bytes: usize) -> Option<usize> {
        if bytes > self.threshold {
            return None;
        }
        let cell = (bytes.max(1) - 1) / BLOCK_ALIGN;
        Some(usize::from(self.lut[cell]))
    }

    /// Canonical allocation size of a class.
    #[must_use]
    pub fn class_size(&self, index: usize) -> usize {
        self.classes[index]
    }

    /// Number of classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Largest class; requests above it are large objects.
    #[must_use]
    pub fn large_threshold(&self) -> usize {
        self.threshold
    }
}
