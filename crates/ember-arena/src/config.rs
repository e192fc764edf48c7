//! Arena configuration parameters.

use ember_core::record::MAX_ENCODABLE_OFFSET;

use crate::error::ArenaError;

/// Configuration for the arena.
///
/// Sizes are in `f64` fields, not bytes.
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Fields reserved when the arena is created.
    ///
    /// Default: 65_536 (512KB).
    pub initial_capacity: usize,

    /// Hard ceiling on the arena size.
    ///
    /// Default: 268_435_456 (2GB). Must not exceed the largest offset that
    /// round-trips exactly through an `f64` record field.
    pub max_size: usize,
}

impl ArenaConfig {
    /// Default initial reservation: 64K fields.
    pub const DEFAULT_INITIAL_CAPACITY: usize = 1 << 16;

    /// Default size ceiling: 256M fields.
    pub const DEFAULT_MAX_SIZE: usize = 1 << 28;

    /// Create a config with default limits.
    pub fn new() -> Self {
        Self {
            initial_capacity: Self::DEFAULT_INITIAL_CAPACITY,
            max_size: Self::DEFAULT_MAX_SIZE,
        }
    }

    /// Check the limits against each other and the offset encoding.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.max_size > MAX_ENCODABLE_OFFSET {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_size {} exceeds the largest encodable offset {MAX_ENCODABLE_OFFSET}",
                    self.max_size
                ),
            });
        }
        if self.initial_capacity > self.max_size {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "initial_capacity {} exceeds max_size {}",
                    self.initial_capacity, self.max_size
                ),
            });
        }
        Ok(())
    }

    /// Size ceiling in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_size * std::mem::size_of::<f64>()
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}
