//! Allocator configuration.
//!
//! All tunables are init-time values with documented defaults. The
//! concurrency model is not a config knob: it is the choice between
//! [`Allocator`](crate::Allocator) and
//! [`SharedAllocator`](crate::SharedAllocator).

use crate::error::ConfigError;

/// Minimum block alignment and the granularity of the class table.
pub const BLOCK_ALIGN: usize = 16;

/// Default span length requested from the region provider for pool spans.
pub const DEFAULT_SPAN_BYTES: usize = 64 * 1024;

/// Largest size class in the default table. Requests above this take the
/// large-object path.
pub const DEFAULT_LARGE_THRESHOLD: usize = 32 * 1024;

/// Init-time allocator tunables.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Size-class table: strictly increasing, every entry a positive
    /// multiple of [`BLOCK_ALIGN`]. The last entry is the large-object
    /// threshold. Default: [`default_size_classes`].
    pub size_classes: Vec<usize>,
    /// Bytes requested from the provider for each pool span; the batch of
    /// blocks a span yields is `span_bytes / class_size`. Default 64 KiB.
    pub span_bytes: usize,
    /// How many fully-free spans each class keeps around instead of
    /// releasing them to the provider. Default 1.
    pub retain_spans: usize,
    /// Capacity of the lifecycle event ring; 0 disables event recording.
    /// Default 256.
    pub event_capacity: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            size_classes: default_size_classes(),
            span_bytes: DEFAULT_SPAN_BYTES,
            retain_spans: 1,
            event_capacity: 256,
        }
    }
}

/// Default size-class table.
///
/// 16-byte steps up to 256 bytes, then powers of two up to 32 KiB:
/// 16, 32, ..., 256, 512, 1024, 2048, 4096, 8192, 16384, 32768.
/// Worst-case internal fragmentation is just under 50% in the doubling
/// segment (e.g. 257 bytes lands in the 512 class) and bounded by
/// 15 bytes per block in the 16-byte-step segment.
#[must_use]
pub fn default_size_classes() -> Vec<usize> {
    let mut table: Vec<usize> = (1..=16).map(|step| step * BLOCK_ALIGN).collect();
    let mut size = 512;
    while size <= DEFAULT_LARGE_THRESHOLD {
        table.push(size);
        size *= 2;
    }
    table
}

impl AllocatorConfig {
    /// Largest size class; requests above it route to the large-object
    /// allocator.
    #[must_use]
    pub fn large_threshold(&self) -> usize {
        self.size_classes.last().copied().unwrap_or(0)
    }

    /// Check the invariants the allocator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_classes.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        for (index, &value) in self.size_classes.iter().enumerate() {
            if value == 0 || value % BLOCK_ALIGN != 0 {
                return Err(ConfigError::MisalignedClass {
                    index,
                    value,
                    align: BLOCK_ALIGN,
                });
            }
            if index > 0 && value <= self.size_classes[index - 1] {
                return Err(ConfigError::NonIncreasingClass { index });
            }
        }
        let largest_class = self.large_threshold();
        if self.span_bytes < largest_class {
            return Err(ConfigError::SpanTooSmall {
                span_bytes: self.span_bytes,
                largest_class,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AllocatorConfig::default().validate().unwrap();
    }

    #[test]
    fn default_table_shape() {
        let table = default_size_classes();
        assert_eq!(table.first(), Some(&16));
        assert_eq!(table.last(), Some(&DEFAULT_LARGE_THRESHOLD));
        assert!(table.windows(2).all(|w| w[0] < w[1]));
        assert!(table.iter().all(|&c| c % BLOCK_ALIGN == 0));
    }

    #[test]
    fn rejects_empty_table() {
        let config = AllocatorConfig {
            size_classes: Vec::new(),
            ..AllocatorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyTable));
    }

    #[test]
    fn rejects_misaligned_class() {
        let config = AllocatorConfig {
            size_classes: vec![16, 40],
            ..AllocatorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MisalignedClass {
                index: 1,
                value: 40,
                align: BLOCK_ALIGN
            })
        );
    }

    #[test]
    fn rejects_non_increasing_table() {
        let config = AllocatorConfig {
            size_classes: vec![16, 64, 64],
            ..AllocatorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonIncreasingClass { index: 2 })
        );
    }

    #[test]
    fn rejects_span_smaller_than_largest_class() {
        let config = AllocatorConfig {
            size_classes: vec![16, 32, 4096],
            span_bytes: 2048,
            ..AllocatorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SpanTooSmall {
                span_bytes: 2048,
                largest_class: 4096
            })
        );
    }
}
