// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tunables for a doubling array, in the teacher crate's builder style
//! (see `Config` in `lsm-tree`).

/// Maximum depth of a component tree's B-tree (root..leaf).
///
/// A merge that would need to cascade a completed node past this depth
/// fails (spec §4.4 step 7).
pub const MAX_BTREE_DEPTH: usize = 12;

/// Size of the fixed token pool: one token per possible level.
pub const MAX_DA_LEVEL: usize = 32;

/// Frequency, in Hz, at which the foreground `ios_budget` is replenished.
pub const REPLENISH_FREQUENCY: u32 = 10;

/// Target size, in chunks, of a dynamic (level 0/1) tree's tree extent
/// before a total merge considers it for a new output level.
pub const MAX_DYNAMIC_TREE_SIZE: u64 = 20;

/// Target size, in chunks, of a dynamic tree's data extent, used the same
/// way as [`MAX_DYNAMIC_TREE_SIZE`].
pub const MAX_DYNAMIC_DATA_SIZE: u64 = 20;

/// Bytes per allocator chunk. An implementation detail of the reference
/// extent allocator, exposed here since several size computations in the
/// merge pipeline are chunk-denominated.
pub const CHUNK_SIZE: u64 = 4_096;

/// Tree configuration.
///
/// Mirrors the builder pattern of the teacher crate's `Config`: cheap to
/// clone, constructed with sensible defaults and customized via chained
/// `#[must_use]` setters.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of levels a DA may grow to before total merges are forced
    /// to cap at the top level.
    pub level_count: u8,

    /// Number of request CPUs; determines the number of per-CPU level-0
    /// trees and wait queues (spec §3 invariant 5, §4.7).
    pub cpu_count: usize,

    /// Allow the extent allocator to place leaf nodes on SSD-backed
    /// redundant storage (spec §4.4 step 2 allocation policy).
    pub use_ssd_leaf_nodes: bool,

    /// Pick the lowest eligible level as the driver merge (`true`) or fix
    /// the driver at level 1 (`false`). Spec §4.6.
    pub dynamic_driver_merge: bool,

    /// Bits per key used when constructing a CT's Bloom filter.
    pub bloom_bits_per_key: u8,

    /// Merge-failure retry backoff.
    pub merge_retry_backoff: std::time::Duration,

    /// OS thread-priority hint for merge threads, relative to foreground
    /// request threads. This is a documented no-op on this portable
    /// implementation (see `DESIGN.md` open questions); embedders that
    /// need real scheduling priority should wrap the merge threads
    /// themselves.
    pub merge_thread_priority: i8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level_count: 16,
            cpu_count: 1,
            use_ssd_leaf_nodes: true,
            dynamic_driver_merge: true,
            bloom_bits_per_key: 10,
            merge_retry_backoff: std::time::Duration::from_secs(10),
            merge_thread_priority: 0,
        }
    }
}

impl Config {
    /// Creates a new config with default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of request CPUs (and thus per-CPU level-0 trees
    /// and wait queues).
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn cpu_count(mut self, n: usize) -> Self {
        assert!(n > 0, "cpu_count must be >= 1");
        self.cpu_count = n;
        self
    }

    /// Sets the maximum number of levels.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn level_count(mut self, n: u8) -> Self {
        assert!(n > 0, "level_count must be >= 1");
        self.level_count = n;
        self
    }

    /// Enables or disables SSD placement for leaf nodes.
    #[must_use]
    pub fn use_ssd_leaf_nodes(mut self, yes: bool) -> Self {
        self.use_ssd_leaf_nodes = yes;
        self
    }

    /// Chooses whether the driver merge floats to the lowest eligible
    /// level, or is pinned to level 1.
    #[must_use]
    pub fn dynamic_driver_merge(mut self, yes: bool) -> Self {
        self.dynamic_driver_merge = yes;
        self
    }

    /// Sets the Bloom filter bits-per-key used by merge output CTs.
    ///
    /// Use 0 to disable filter construction.
    #[must_use]
    pub fn bloom_bits_per_key(mut self, bits: u8) -> Self {
        self.bloom_bits_per_key = bits;
        self
    }
}
