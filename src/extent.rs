// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Extents and the extent allocator external collaborator (spec §1, §6).
//!
//! An extent is a contiguous run of chunks on some backing store. The
//! real allocator — with its freespace accounting, SSD-vs-RDA placement
//! policy, and on-disk persistence — is out of scope (spec §1); this
//! module defines the trait boundary the merge pipeline and component
//! trees are written against, plus an in-memory bump allocator adequate
//! for tests and for embedding behind a real allocator.
//!
//! Grounded conceptually on the teacher crate's segment/block offset
//! handling (chunked storage, `used`/`blocked` style counters), though no
//! teacher file implements an allocator directly — segments there are
//! whole files, not sub-allocated extents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};

/// Identifies an extent. Opaque beyond equality/ordering; the allocator
/// assigns these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ExtentId(pub u64);

/// Placement policy for a new extent allocation (spec §4.4 step 2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocPolicy {
    /// Redundant, SSD-backed placement for leaf nodes when
    /// [`crate::config::Config::use_ssd_leaf_nodes`] is set.
    SsdRda,
    /// The default redundant placement for everything else (internal
    /// nodes, data extents, large objects).
    DefaultRda,
}

/// The extent allocator: reserves contiguous chunk ranges and tracks
/// their liveness.
pub trait ExtentAllocator: Send + Sync {
    /// Allocates a new extent of at least `chunks` chunks under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if no freespace handle could satisfy
    /// the request.
    fn alloc(&self, chunks: u64, policy: AllocPolicy) -> Result<ExtentId>;

    /// The size, in chunks, of a previously allocated extent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is unknown.
    fn size(&self, id: ExtentId) -> Result<u64>;

    /// Marks an extent as part of the live, reachable graph (i.e. not a
    /// merge-input candidate for reclamation once the merge completes).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is unknown.
    fn mark_live(&self, id: ExtentId) -> Result<()>;

    /// Releases an extent, making its chunks available for reuse. Used
    /// when a merge's input CTs are torn down after `merge_complete`
    /// (spec §4.4 step 11).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is unknown.
    fn put(&self, id: ExtentId) -> Result<()>;
}

/// A byte-granular bump allocator within a single extent, used by the
/// merge pipeline to hand out node/data offsets as it writes
/// (spec §4.4's extent cursor bookkeeping).
pub struct FreespaceHandle {
    capacity: u64,
    used: AtomicU64,
}

impl FreespaceHandle {
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
            used: AtomicU64::new(0),
        }
    }

    /// Bumps the cursor by `len` bytes, returning the offset the
    /// allocation starts at.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSpace`] if `len` would overrun the handle's
    /// capacity.
    pub fn alloc(&self, len: u64) -> Result<u64> {
        loop {
            let cur = self.used.load(Ordering::Acquire);
            let next = cur.checked_add(len).ok_or(Error::NoSpace)?;
            if next > self.capacity {
                return Err(Error::NoSpace);
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(cur);
            }
        }
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

struct ExtentRecord {
    chunks: u64,
    live: bool,
}

/// An in-memory bump allocator: every extent is just a chunk-range
/// reservation tracked in a table, with no real backing store. Enough to
/// drive the merge pipeline and its tests; a real deployment would swap
/// this for an allocator backed by a freespace bitmap on disk.
pub struct InMemoryExtentAllocator {
    next_id: AtomicU64,
    next_chunk: AtomicU64,
    total_chunks: u64,
    records: Mutex<HashMap<ExtentId, ExtentRecord>>,
}

impl InMemoryExtentAllocator {
    /// Creates an allocator with `total_chunks` chunks of freespace (each
    /// [`CHUNK_SIZE`] bytes).
    #[must_use]
    pub fn new(total_chunks: u64) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_chunk: AtomicU64::new(0),
            total_chunks,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.total_chunks * CHUNK_SIZE
    }
}

impl ExtentAllocator for InMemoryExtentAllocator {
    fn alloc(&self, chunks: u64, _policy: AllocPolicy) -> Result<ExtentId> {
        loop {
            let cur = self.next_chunk.load(Ordering::Acquire);
            let next = cur.checked_add(chunks).ok_or(Error::NoSpace)?;
            if next > self.total_chunks {
                return Err(Error::NoSpace);
            }
            if self
                .next_chunk
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let id = ExtentId(self.next_id.fetch_add(1, Ordering::AcqRel));
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.records.lock().expect("lock poisoned").insert(
            id,
            ExtentRecord {
                chunks,
                live: true,
            },
        );
        Ok(id)
    }

    fn size(&self, id: ExtentId) -> Result<u64> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let records = self.records.lock().expect("lock poisoned");
        records.get(&id).map(|r| r.chunks).ok_or(Error::NotFound)
    }

    fn mark_live(&self, id: ExtentId) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut records = self.records.lock().expect("lock poisoned");
        let rec = records.get_mut(&id).ok_or(Error::NotFound)?;
        rec.live = true;
        Ok(())
    }

    fn put(&self, id: ExtentId) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut records = self.records.lock().expect("lock poisoned");
        let rec = records.get_mut(&id).ok_or(Error::NotFound)?;
        rec.live = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_capacity() {
        let alloc = InMemoryExtentAllocator::new(10);
        let a = alloc.alloc(4, AllocPolicy::DefaultRda).unwrap();
        let b = alloc.alloc(6, AllocPolicy::SsdRda).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.size(a).unwrap(), 4);
        assert_eq!(alloc.size(b).unwrap(), 6);
    }

    #[test]
    fn out_of_space_errors() {
        let alloc = InMemoryExtentAllocator::new(4);
        assert!(matches!(
            alloc.alloc(5, AllocPolicy::DefaultRda),
            Err(Error::NoSpace)
        ));
    }

    #[test]
    fn put_then_size_still_queryable() {
        let alloc = InMemoryExtentAllocator::new(10);
        let a = alloc.alloc(2, AllocPolicy::DefaultRda).unwrap();
        alloc.put(a).unwrap();
        assert_eq!(alloc.size(a).unwrap(), 2);
    }

    #[test]
    fn unknown_extent_is_not_found() {
        let alloc = InMemoryExtentAllocator::new(10);
        assert!(matches!(alloc.size(ExtentId(999)), Err(Error::NotFound)));
    }

    #[test]
    fn freespace_handle_bumps_and_rejects_overrun() {
        let handle = FreespaceHandle::new(16);
        assert_eq!(handle.alloc(10).unwrap(), 0);
        assert_eq!(handle.alloc(5).unwrap(), 10);
        assert!(matches!(handle.alloc(5), Err(Error::NoSpace)));
        assert_eq!(handle.used(), 15);
    }
}
