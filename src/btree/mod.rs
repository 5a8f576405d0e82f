// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The B-tree vtable (spec §4.1, §6) and its two concrete tree types:
//! `RW_VLBA_TREE_TYPE` for dynamic (level 0/1) trees, `RO_VLBA_TREE_TYPE`
//! for immutable merge output.
//!
//! The node format itself is an external collaborator per spec §1 — no
//! teacher file implements this directly (the on-disk block formats in
//! `src/segment/` and `src/super_segment/` are a different design we are
//! explicitly not reusing). The vtable shape and the node's
//! entries-plus-`next_node`-cursor bookkeeping are grounded on
//! `src/segment/mod.rs`'s extent/cursor handling, generalized to the
//! spec's per-type operation set.

use std::sync::Arc;

use crate::key::{BoundKey, Key, KeyComparator};
use crate::value::{Cvt, VersionedEntry};
use crate::version::Version;

/// A node's on-disk location: an extent plus a byte offset within it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeRef {
    pub ext_id: crate::extent::ExtentId,
    pub offset: u64,
}

/// Distinguishes the two concrete tree types the spec names. The
/// distinction matters for `node_size` (dynamic nodes size for
/// in-place growth; immutable nodes are packed tight) and for whether
/// `entry_add`/`entry_replace`/`entry_drop` are legal at all (immutable
/// nodes only ever get built once, by the merge pipeline).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TreeType {
    /// `RW_VLBA_TREE_TYPE`: dynamic, levels 0-1, mutable in place.
    RwVlba,
    /// `RO_VLBA_TREE_TYPE`: immutable, merge output.
    RoVlba,
}

impl TreeType {
    /// The magic tag persisted in a CT's checkpoint record.
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            Self::RwVlba => 0x5256_4C42, // "RVLB"
            Self::RoVlba => 0x524F_564C, // "ROVL"
        }
    }
}

/// A single entry in a node: key, version, and its tagged value.
pub type Entry = VersionedEntry;

/// A B-tree node: an ordered run of entries plus a forward cursor to the
/// next node at the same depth (the leaf/internal chain the
/// specification's iterators walk, spec §4.2/§4.3's `next_node`).
#[derive(Clone, Debug)]
pub struct Node {
    pub entries: Vec<Entry>,
    /// Forward pointer to the next node at the same depth, or `None` at
    /// the chain's end.
    pub next_node: Option<NodeRef>,
    /// The node's own version, assigned at cascade-complete time
    /// (spec §4.4 step 7c). `0` before completion.
    pub version: Version,
    /// Depth within the tree; `0` is the leaf depth.
    pub depth: usize,
    /// Set on the rightmost node at its depth once `merge_complete`
    /// rewrites that root-to-leaf path's keys to the distinguished
    /// maximum (spec §4.4 step 9, "maxify"). The rewrite itself only
    /// touches the last entry's version (to `0`); `maxified` records
    /// that this node's last key should compare as [`BoundKey::Max`]
    /// rather than its literal bytes.
    pub maxified: bool,
}

impl Node {
    #[must_use]
    pub fn empty(depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_node: None,
            version: 0,
            depth,
            maxified: false,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    /// The key of the node's last entry, or `None` if empty.
    #[must_use]
    pub fn last_key(&self) -> Option<&Key> {
        self.entries.last().map(|e| &e.key)
    }
}

/// The B-tree vtable: the set of per-type operations the specification
/// names in §4.1/§6. A concrete tree is built against one `NodeOps`
/// implementation for its whole lifetime.
pub trait NodeOps: Send + Sync {
    /// The tree type this vtable implements.
    fn tree_type(&self) -> TreeType;

    /// Byte footprint of `node`, used to decide packing and extent
    /// sizing. Takes the tree's depth since internal nodes are typically
    /// sized differently from leaves.
    fn node_size(&self, node: &Node) -> u64;

    /// Whether `node` must be completed (no further entries admitted)
    /// before accepting one more entry of `incoming_size` bytes.
    fn need_split(&self, node: &Node, incoming_size: u64) -> bool;

    /// Appends an entry to a node under construction. Only legal for
    /// dynamic (`RwVlba`) trees and for the merge pipeline building a
    /// `RoVlba` output; never called on a published immutable node.
    fn entry_add(&self, node: &mut Node, entry: Entry);

    /// Looks up the entry exactly matching `key` at `version`, if any.
    fn entry_get(&self, node: &Node, key: &Key, version: Version) -> Option<&Entry>;

    /// Replaces an existing entry in place (dynamic trees only: an
    /// overwrite of the same `(key, version)` pair without growing the
    /// node).
    fn entry_replace(&self, node: &mut Node, index: usize, entry: Entry);

    /// Drops a single entry by index.
    fn entry_drop(&self, node: &mut Node, index: usize);

    /// Drops every entry in `range`, used by cascade-complete (spec §4.4
    /// step 7a/7b) to move the overflow tail into the next node.
    fn entries_drop(&self, node: &mut Node, range: std::ops::Range<usize>);

    /// Compares two real keys per this tree's dimension ordering.
    fn key_compare(&self, a: &Key, b: &Key) -> std::cmp::Ordering;

    /// The distinguished strict maximum for this tree's key space.
    fn max_key(&self) -> BoundKey {
        BoundKey::Max
    }

    /// Allocates a fresh, empty node at `depth`.
    fn node_create(&self, depth: usize) -> Node {
        Node::empty(depth)
    }

    /// The tag persisted alongside a CT identifying which vtable built
    /// it, so recovery can re-bind the right `NodeOps` implementation.
    fn magic(&self) -> u32 {
        self.tree_type().magic()
    }
}

/// Default node byte budget before `need_split` fires, shared by both
/// concrete tree types. Chunk-aligned so a completed node packs cleanly
/// into an extent (spec §4.4 step 2).
pub const DEFAULT_NODE_BUDGET: u64 = crate::config::CHUNK_SIZE;

fn entry_overhead(entry: &Entry) -> u64 {
    // length-prefixed key + 4-byte version + tag byte + CVT payload,
    // the shape `value::encode_entry` actually writes.
    4 + entry.key.as_bytes().len() as u64 + 4 + 1 + entry.cvt.value_len()
}

/// Shared vtable body used by both `RwVlba`/`RoVlba`: the admission and
/// lookup rules are identical between the two tree types, only the
/// reported [`TreeType`]/mutability expectations differ (the merge
/// pipeline never calls `entry_replace`/`entry_drop` on a `RoVlba` tree
/// after publication, but nothing here enforces that at the type level —
/// callers are expected to honor it, mirroring the vtable's C heritage).
struct VlbaOps<C> {
    tree_type: TreeType,
    comparator: Arc<C>,
    node_budget: u64,
}

impl<C: KeyComparator> NodeOps for VlbaOps<C> {
    fn tree_type(&self) -> TreeType {
        self.tree_type
    }

    fn node_size(&self, node: &Node) -> u64 {
        node.entries.iter().map(entry_overhead).sum()
    }

    fn need_split(&self, node: &Node, incoming_size: u64) -> bool {
        self.node_size(node) + incoming_size > self.node_budget
    }

    fn entry_add(&self, node: &mut Node, entry: Entry) {
        node.entries.push(entry);
    }

    fn entry_get(&self, node: &Node, key: &Key, version: Version) -> Option<&Entry> {
        node.entries
            .iter()
            .find(|e| self.comparator.compare(&e.key, key) == std::cmp::Ordering::Equal && e.version == version)
    }

    fn entry_replace(&self, node: &mut Node, index: usize, entry: Entry) {
        if let Some(slot) = node.entries.get_mut(index) {
            *slot = entry;
        }
    }

    fn entry_drop(&self, node: &mut Node, index: usize) {
        if index < node.entries.len() {
            node.entries.remove(index);
        }
    }

    fn entries_drop(&self, node: &mut Node, range: std::ops::Range<usize>) {
        let end = range.end.min(node.entries.len());
        let start = range.start.min(end);
        node.entries.drain(start..end);
    }

    fn key_compare(&self, a: &Key, b: &Key) -> std::cmp::Ordering {
        self.comparator.compare(a, b)
    }
}

/// Builds the vtable for a dynamic (level 0/1) tree.
#[must_use]
pub fn rw_vlba<C: KeyComparator + 'static>(comparator: Arc<C>) -> Arc<dyn NodeOps> {
    Arc::new(VlbaOps {
        tree_type: TreeType::RwVlba,
        comparator,
        node_budget: DEFAULT_NODE_BUDGET,
    })
}

/// Builds the vtable for an immutable merge-output tree.
#[must_use]
pub fn ro_vlba<C: KeyComparator + 'static>(comparator: Arc<C>) -> Arc<dyn NodeOps> {
    Arc::new(VlbaOps {
        tree_type: TreeType::RoVlba,
        comparator,
        node_budget: DEFAULT_NODE_BUDGET,
    })
}
