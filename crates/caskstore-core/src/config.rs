//! Configuration for CaskStore
//!
//! Provides a default engine profile, a couple of presets for common
//! deployments, and chainable setters for custom configurations.

use crate::error::{CaskError, CaskResult};

/// Default rollover threshold for the active segment (10 MiB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Default maximum key size in bytes
pub const DEFAULT_MAX_KEY_SIZE: usize = 4 * 1024;

/// Upper bound accepted for `max_key_size`
const KEY_SIZE_CEILING: usize = 1024 * 1024;

/// CaskStore engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active segment rolls over once its size reaches this many bytes
    pub max_segment_size: u64,
    /// Maximum key size in bytes; also bounds key lengths read from hint files
    pub max_key_size: usize,
    /// Durable-sync the active segment after every append
    pub sync_on_write: bool,
}

impl Config {
    /// Sync after every write. Slowest, nothing acknowledged is lost on power failure.
    pub fn durable() -> Self {
        Self {
            sync_on_write: true,
            ..Self::default()
        }
    }

    /// Small 1 MiB segments: merges run often and touch little data each time.
    pub fn compact() -> Self {
        Self {
            max_segment_size: 1024 * 1024,
            ..Self::default()
        }
    }

    /// Set the rollover threshold
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Set the maximum key size
    pub fn with_max_key_size(mut self, bytes: usize) -> Self {
        self.max_key_size = bytes;
        self
    }

    /// Toggle durable sync on every write
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> CaskResult<()> {
        // value offsets are stored as u32
        if self.max_segment_size == 0 || self.max_segment_size > u32::MAX as u64 {
            return Err(CaskError::InvalidConfig(format!(
                "max_segment_size must be in [1, {}], got {}",
                u32::MAX,
                self.max_segment_size
            )));
        }
        if self.max_key_size == 0 || self.max_key_size > KEY_SIZE_CEILING {
            return Err(CaskError::InvalidConfig(format!(
                "max_key_size must be in [1, {}], got {}",
                KEY_SIZE_CEILING, self.max_key_size
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            sync_on_write: false,
        }
    }
}
