//! Engine configuration
//!
//! Limits on record sizes and the durability policy applied at commit.

use crate::format::PAYLOAD_PREFIX;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Call `durable_sync` on the log after every commit
    pub sync_on_commit: bool,
}

impl Config {
    /// Every commit reaches persistent storage before `commit` returns.
    pub fn durable() -> Self {
        Self {
            max_key_size: 4 * 1024,
            max_value_size: 64 * 1024 * 1024,
            sync_on_commit: true,
        }
    }

    /// Commits are written to the OS page cache only. Survives process
    /// crashes, not power loss.
    pub fn relaxed() -> Self {
        Self {
            sync_on_commit: false,
            ..Self::durable()
        }
    }

    /// Set the maximum key size.
    pub fn with_max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    /// Set the maximum value size.
    pub fn with_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_size == 0 || self.max_key_size > u32::MAX as usize {
            return Err("max_key_size must be in [1, 4GB)".into());
        }
        if self.max_value_size == 0 || self.max_value_size > u32::MAX as usize {
            return Err("max_value_size must be in [1, 4GB)".into());
        }
        let largest_record = self.max_key_size as u64 + self.max_value_size as u64 + PAYLOAD_PREFIX as u64;
        if largest_record > u32::MAX as u64 {
            return Err(format!(
                "max_key_size + max_value_size leaves a {} byte record, beyond the 4GB record limit",
                largest_record
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}
