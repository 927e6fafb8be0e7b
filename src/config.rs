//! Store configuration.
//!
//! [`StoreConfig`] carries every tunable of a [`VersionedStore`](crate::storage::VersionedStore):
//! node fan-out, the arena size limit, how a second writer is treated and
//! whether free-space backdating is enabled. The defaults suit a general purpose
//! store; tests shrink the fan-out to exercise splits and merges.
use std::time::Duration;

use crate::storage::{StorageError, header::file::HEADER_SIZE};

pub const DEFAULT_MAX_FANOUT: usize = 256;
pub const DEFAULT_MAX_ARENA_SIZE: u64 = 4 << 30;

/// What `begin_write` does while another write transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Wait until the open writer commits or rolls back.
    Block,
    /// Return `WriteConflict` immediately.
    Fail,
    /// Wait at most the given duration, then return `WriteTimeout`.
    Wait(Duration),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Entries a node may hold before it splits.
    pub max_fanout: usize,
    /// Entries a non-root node must keep before it merges or rebalances.
    pub min_fanout: usize,
    /// Upper bound of the arena in bytes, file header included.
    pub max_arena_size: u64,
    pub write_policy: WritePolicy,
    pub backdating: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_fanout: DEFAULT_MAX_FANOUT,
            min_fanout: DEFAULT_MAX_FANOUT / 2,
            max_arena_size: DEFAULT_MAX_ARENA_SIZE,
            write_policy: WritePolicy::Block,
            backdating: true,
        }
    }
}

impl StoreConfig {
    /// Sets `max_fanout` and derives `min_fanout` as half of it.
    pub fn with_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout;
        self.min_fanout = max_fanout / 2;
        self
    }

    pub fn with_max_arena_size(mut self, bytes: u64) -> Self {
        self.max_arena_size = bytes;
        self
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_backdating(mut self, enabled: bool) -> Self {
        self.backdating = enabled;
        self
    }

    pub fn fanout(&self) -> Fanout {
        Fanout {
            min: self.min_fanout,
            max: self.max_fanout,
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_fanout < 4 {
            return Err(StorageError::Config(format!(
                "max_fanout must be at least 4, got {}",
                self.max_fanout
            )));
        }
        if self.min_fanout < 2 || self.min_fanout > self.max_fanout / 2 {
            return Err(StorageError::Config(format!(
                "min_fanout must be within [2, {}], got {}",
                self.max_fanout / 2,
                self.min_fanout
            )));
        }
        if self.max_arena_size <= HEADER_SIZE as u64 {
            return Err(StorageError::Config(format!(
                "max_arena_size must exceed the {HEADER_SIZE} byte header, got {}",
                self.max_arena_size
            )));
        }
        Ok(())
    }
}

/// Occupancy bounds for cluster nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub min: usize,
    pub max: usize,
}

impl Fanout {
    pub fn new(min: usize, max: usize) -> Result<Self, StorageError> {
        StoreConfig {
            min_fanout: min,
            max_fanout: max,
            ..StoreConfig::default()
        }
        .validate()?;
        Ok(Self { min, max })
    }
}
