// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The block cache external collaborator (spec §1, §6).
//!
//! Grounded almost directly on the teacher crate's `src/block_cache.rs`:
//! same `quick_cache::sync::Cache` plus weighter approach, generalized
//! from segment-relative `(GlobalSegmentId, BlockOffset)` keys to raw
//! `(ExtentId, offset)` block pointers (a CEP, "current extent pointer",
//! in the vocabulary of spec §6), and extended with the
//! `lock_write`/`uptodate`/`submit_sync`/`dirty`/`advise` surface the
//! specification's block cache interface names.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quick_cache::sync::Cache;
use quick_cache::{Equivalent, Weighter};

use crate::extent::ExtentId;

/// A pointer to a block: which extent, and the byte offset within it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Cep {
    pub ext_id: ExtentId,
    pub offset: u64,
}

impl Cep {
    #[must_use]
    pub fn new(ext_id: ExtentId, offset: u64) -> Self {
        Self { ext_id, offset }
    }
}

impl Equivalent<Cep> for Cep {
    fn equivalent(&self, key: &Cep) -> bool {
        self == key
    }
}

/// Prefetch/pin hints passed to [`BlockCache::advise`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AdviseFlags {
    /// Read the block's forward neighbours speculatively.
    pub prefetch_frwd: bool,
    /// Pin the entire extent, not just this block.
    pub extent_hardpin: bool,
    /// A soft pin: the block may still be evicted under memory pressure,
    /// but is exempt from ordinary LRU-style eviction.
    pub softpin: bool,
}

/// An in-memory block, either freshly read or still being written.
///
/// The `dirty`/`uptodate` bits mirror the two-state buffer protocol the
/// specification's block cache interface names: a block becomes
/// `uptodate` once its contents are known-good (post read, or post
/// construction in the merge pipeline), and `dirty` once modified and
/// awaiting a future `submit_sync`.
pub struct Block {
    bytes: Arc<[u8]>,
    uptodate: AtomicBool,
    dirty: AtomicBool,
}

impl Block {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<Cep, Arc<Block>> for BlockWeighter {
    fn weight(&self, _: &Cep, block: &Arc<Block>) -> u64 {
        block.as_bytes().len() as u64
    }
}

/// Block cache, in which blocks are cached in-memory after being
/// retrieved from their backing extent.
///
/// This speeds up consecutive queries to nearby data, improving read
/// performance for hot leaf/internal nodes.
pub struct BlockCache {
    data: Cache<Cep, Arc<Block>, BlockWeighter, rustc_hash::FxBuildHasher>,
    capacity: u64,
}

impl BlockCache {
    /// Creates a new block cache with roughly `bytes` of capacity.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let quick_cache = Cache::with(
            1_000_000,
            bytes,
            BlockWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data: quick_cache,
            capacity: bytes,
        }
    }

    /// Amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fetches a block if present, without touching the backing store
    /// (spec §6 `get(cep, size)`, cache-hit path).
    #[must_use]
    pub fn get(&self, cep: Cep) -> Option<Arc<Block>> {
        self.data.get(&cep)
    }

    /// Inserts a freshly constructed or read block (spec §6 `put`).
    pub fn put(&self, cep: Cep, block: Arc<Block>) {
        if self.capacity > 0 {
            self.data.insert(cep, block);
        }
    }

    /// Marks a cached block dirty ahead of an in-place write, the write
    /// counterpart of `lock_write` (spec §6). The returned block must be
    /// the caller's only writer; the cache itself does not serialize
    /// writers.
    #[must_use]
    pub fn lock_write(&self, cep: Cep) -> Option<Arc<Block>> {
        let block = self.data.get(&cep)?;
        block.mark_dirty();
        Some(block)
    }

    /// Returns `true` if the block at `cep` is cached and up to date
    /// (spec §6 `uptodate`).
    #[must_use]
    pub fn uptodate(&self, cep: Cep) -> bool {
        self.data.get(&cep).is_some_and(|b| b.is_uptodate())
    }

    /// Returns `true` if the block at `cep` is cached and dirty
    /// (spec §6 `dirty`).
    #[must_use]
    pub fn dirty(&self, cep: Cep) -> bool {
        self.data.get(&cep).is_some_and(|b| b.is_dirty())
    }

    /// Clears the dirty bit after a synchronous write-back
    /// (spec §6 `submit_sync(WRITE, ...)`/`update`).
    pub fn update(&self, cep: Cep) {
        if let Some(block) = self.data.get(&cep) {
            block.mark_uptodate();
            block.clear_dirty();
        }
    }

    /// Prefetch/pin advisory; a pure hint on this reference
    /// implementation (spec §6 `advise(cep, flags)`). A persistent
    /// allocator-backed cache would use this to warm neighbouring blocks
    /// or extend a block's pin past ordinary LRU eviction.
    pub fn advise(&self, _cep: Cep, _flags: AdviseFlags) {}
}
