// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The component tree (CT): a single B-tree instance, stored as three
//! extents plus a large-object list and an optional Bloom filter
//! (spec §3).
//!
//! Grounded on the teacher crate's `src/segment/mod.rs` (extent triple,
//! ref-counting, `first_node`/`last_node` cursors), crossed with the
//! CT data model of spec §3.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::btree::{Node, NodeOps, NodeRef};
use crate::config::MAX_BTREE_DEPTH;
use crate::error::{Error, Result};
use crate::extent::{ExtentAllocator, ExtentId};
use crate::filter::BloomFilter;
use crate::version::Version;

/// Monotonically allocated CT identifier. At levels 0-1 the high bits
/// encode the owning CPU index so per-CPU trees preserve insertion
/// ordering within a level (spec §3 `seq`).
pub type Seq = u64;

const CPU_INDEX_SHIFT: u32 = 48;

/// Packs a CPU index and a per-CPU counter into a single `seq`, high
/// bits first so that, for trees at the same level, a numeric `seq`
/// comparison preserves per-CPU ordering before interleaving CPUs.
#[must_use]
pub fn pack_seq(cpu_index: u16, counter: u64) -> Seq {
    ((cpu_index as u64) << CPU_INDEX_SHIFT) | (counter & ((1 << CPU_INDEX_SHIFT) - 1))
}

/// Per-extent bookkeeping: chunks handed out versus chunks the extent is
/// sized for, mirroring the `used`/`blocked` counters of spec §3.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExtentUsage {
    pub used: u64,
    pub blocked: u64,
}

/// A cursor into a tree: where a node lives plus its size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeCursor {
    pub node_ref: NodeRef,
    pub size: u64,
}

/// A single large-object list entry: ownership of one external extent.
#[derive(Clone, Copy, Debug)]
pub struct LargeObjectEntry {
    pub ext_id: ExtentId,
    pub chunks: u64,
}

struct Counters {
    item_count: AtomicU64,
    node_count: AtomicU64,
    large_ext_chk_cnt: AtomicU64,
    ref_count: AtomicU64,
    write_ref_count: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            item_count: AtomicU64::new(0),
            node_count: AtomicU64::new(0),
            large_ext_chk_cnt: AtomicU64::new(0),
            ref_count: AtomicU64::new(1),
            write_ref_count: AtomicU64::new(0),
        }
    }
}

/// Mutable tree state guarded by a single lock: cursors, per-depth node
/// sizes, and the large-object list. Split from [`ComponentTree`]'s
/// atomic counters because cursor updates during a merge or a dynamic
/// insert are multi-field and must be observed atomically as a group.
struct TreeState {
    tree_depth: usize,
    root_node: Option<NodeCursor>,
    first_node: Option<NodeCursor>,
    last_node: Option<NodeCursor>,
    node_sizes: [u64; MAX_BTREE_DEPTH],
    large_objects: Vec<LargeObjectEntry>,
    /// The data extent medium values were packed into, if any were
    /// written (spec §4.4 step 9). `None` for a dynamic CT, or an
    /// immutable CT packaged with no medium-sized values at all.
    data_ext_id: Option<ExtentId>,
    /// In-place leaf chain for dynamic trees: leaves are appended here in
    /// insertion order (unsorted across leaves, spec §4.2), rather than
    /// reached through `root_node`/vtable traversal, since a dynamic CT's
    /// "tree" is really just a chain of leaf buffers until it is demoted
    /// and merged.
    dynamic_leaves: Vec<Node>,
    /// The published leaf chain for an immutable tree, in `next_node`
    /// order (spec §4.4 step 8). Node storage itself sits behind the
    /// block cache/extent allocator boundary (spec §1); this reference
    /// implementation keeps the packaged chain in memory rather than
    /// re-deriving real extent-relative paging, since the cache/
    /// allocator traits are consumed as interfaces, not reimplemented as
    /// a full disk path.
    immutable_leaves: Vec<Arc<Node>>,
}

impl Default for TreeState {
    fn default() -> Self {
        Self {
            tree_depth: 1,
            root_node: None,
            first_node: None,
            last_node: None,
            node_sizes: [0; MAX_BTREE_DEPTH],
            large_objects: Vec::new(),
            data_ext_id: None,
            dynamic_leaves: Vec::new(),
            immutable_leaves: Vec::new(),
        }
    }
}

/// A single B-tree instance: one CT per spec §3.
pub struct ComponentTree {
    pub seq: Seq,
    pub dynamic: bool,
    pub level: u8,
    pub bloom: Option<BloomFilter>,
    ops: Arc<dyn NodeOps>,
    counters: Counters,
    state: RwLock<TreeState>,
    internal_usage: RwLock<ExtentUsage>,
    tree_usage: RwLock<ExtentUsage>,
    data_usage: RwLock<ExtentUsage>,
}

impl ComponentTree {
    /// Creates a fresh, empty dynamic CT for level 0 or 1.
    #[must_use]
    pub fn new_dynamic(seq: Seq, level: u8, ops: Arc<dyn NodeOps>) -> Self {
        assert!(level <= 1, "dynamic CTs only exist at level 0/1");
        Self {
            seq,
            dynamic: true,
            level,
            bloom: None,
            ops,
            counters: Counters::default(),
            state: RwLock::new(TreeState::default()),
            internal_usage: RwLock::new(ExtentUsage::default()),
            tree_usage: RwLock::new(ExtentUsage::default()),
            data_usage: RwLock::new(ExtentUsage::default()),
        }
    }

    /// Creates an immutable CT shell (the merge pipeline fills in its
    /// cursors/counters as it packages output, spec §4.4 step 10).
    #[must_use]
    pub fn new_immutable(seq: Seq, level: u8, ops: Arc<dyn NodeOps>) -> Self {
        assert!(level >= 2, "immutable CTs only exist at level >= 2");
        Self {
            seq,
            dynamic: false,
            level,
            bloom: None,
            ops,
            counters: Counters::default(),
            state: RwLock::new(TreeState::default()),
            internal_usage: RwLock::new(ExtentUsage::default()),
            tree_usage: RwLock::new(ExtentUsage::default()),
            data_usage: RwLock::new(ExtentUsage::default()),
        }
    }

    /// Attaches a Bloom filter built for this tree's final contents. Only
    /// meaningful before the CT is shared (the field has no interior
    /// mutability), so the merge pipeline calls this on the freshly
    /// constructed shell before wrapping it in an `Arc` and packaging it.
    #[must_use]
    pub fn with_bloom(mut self, bloom: BloomFilter) -> Self {
        self.bloom = Some(bloom);
        self
    }

    #[must_use]
    pub fn ops(&self) -> &Arc<dyn NodeOps> {
        &self.ops
    }

    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.counters.item_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn node_count(&self) -> u64 {
        self.counters.node_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn large_ext_chk_cnt(&self) -> u64 {
        self.counters.large_ext_chk_cnt.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.counters.ref_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn write_ref_count(&self) -> u64 {
        self.counters.write_ref_count.load(Ordering::Acquire)
    }

    /// Takes a reader/general reference (invariant 1: reachability
    /// requires `ref_count >= 1`).
    pub fn get(&self) {
        self.counters.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference. Returns `true` if this was the last
    /// reference (the caller must then free owned extents, invariant 3).
    ///
    /// # Panics
    ///
    /// Panics (invariant 3) if the last reference is dropped while
    /// `write_ref_count` is still non-zero.
    pub fn put(&self) -> bool {
        let prev = self.counters.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "ref_count underflow");
        if prev == 1 {
            assert_eq!(
                self.write_ref_count(),
                0,
                "invariant violated: CT destroyed with live writers"
            );
            true
        } else {
            false
        }
    }

    /// Takes a writer reference. Only legal at level 0 (invariant 2).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] if this CT is not at level 0.
    pub fn get_write(&self) -> Result<()> {
        if self.level != 0 {
            return Err(Error::Invalid("write_ref_count taken on non-level-0 CT"));
        }
        self.counters.write_ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn put_write(&self) {
        let prev = self.counters.write_ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "write_ref_count underflow");
    }

    /// Spin-waits for `write_ref_count` to reach 0 (spec §4.4 step 1,
    /// merge pipeline iterator creation precondition).
    pub fn wait_no_writers(&self) {
        while self.write_ref_count() > 0 {
            std::hint::spin_loop();
        }
    }

    #[must_use]
    pub fn internal_usage(&self) -> ExtentUsage {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.internal_usage.read().expect("lock poisoned")
    }

    #[must_use]
    pub fn tree_usage(&self) -> ExtentUsage {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.tree_usage.read().expect("lock poisoned")
    }

    #[must_use]
    pub fn data_usage(&self) -> ExtentUsage {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.data_usage.read().expect("lock poisoned")
    }

    pub fn add_tree_used(&self, chunks: u64) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.tree_usage.write().expect("lock poisoned").used += chunks;
    }

    pub fn add_data_used(&self, chunks: u64) {
        #[expect(clippy::expect_used, reason = "lock poisoned")]
        self.data_usage.write().expect("lock poisoned").used += chunks;
    }

    /// Inserts (or overwrites, for the same key/version pair) an entry
    /// directly into this dynamic tree's current leaf, appending a new
    /// leaf whenever the current one would overflow
    /// ([`NodeOps::need_split`]).
    ///
    /// # Panics
    ///
    /// Panics if called on a non-dynamic tree.
    pub fn insert(&self, entry: crate::value::VersionedEntry) {
        assert!(self.dynamic, "insert is only valid on dynamic CTs");

        let entry_size = self.ops.node_size(&{
            let mut probe = Node::empty(0);
            probe.entries.push(entry.clone());
            probe
        });

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.write().expect("lock poisoned");

        let needs_new_leaf = match state.dynamic_leaves.last() {
            Some(leaf) => self.ops.need_split(leaf, entry_size),
            None => true,
        };

        if needs_new_leaf {
            state.dynamic_leaves.push(Node::empty(0));
            self.counters.node_count.fetch_add(1, Ordering::AcqRel);
        }

        #[expect(clippy::expect_used, reason = "just pushed if empty")]
        let leaf = state.dynamic_leaves.last_mut().expect("leaf present");
        self.ops.entry_add(leaf, entry);
        self.counters.item_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns every dynamic leaf, in insertion order, for the modlist
    /// sort iterator to consume (spec §4.2 step 1).
    #[must_use]
    pub fn dynamic_leaves(&self) -> Vec<Node> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").dynamic_leaves.clone()
    }

    /// Looks up the newest entry for `key` at or below `version` by
    /// scanning dynamic leaves newest-first. A real implementation would
    /// also consult the Bloom filter and any root/internal index; this
    /// reference CT has none for dynamic trees (they are small enough
    /// that a linear scan over leaves suffices, matching the modlist
    /// iterator's own approach).
    #[must_use]
    pub fn get_newest(
        &self,
        key: &crate::key::Key,
        version: Version,
        versions: &dyn crate::version::VersionService,
    ) -> Option<crate::value::VersionedEntry> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let state = self.state.read().expect("lock poisoned");
        let mut best: Option<crate::value::VersionedEntry> = None;

        for leaf in state.dynamic_leaves.iter().rev() {
            for e in &leaf.entries {
                if self.ops.key_compare(&e.key, key) != std::cmp::Ordering::Equal {
                    continue;
                }
                if e.version != version && !versions.is_ancestor(e.version, version) {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(cur) => versions.compare(e.version, cur.version) == std::cmp::Ordering::Less,
                };
                if better {
                    best = Some(e.clone());
                }
            }
        }

        best
    }

    #[must_use]
    pub fn root_node(&self) -> Option<NodeCursor> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").root_node
    }

    #[must_use]
    pub fn first_node(&self) -> Option<NodeCursor> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").first_node
    }

    #[must_use]
    pub fn last_node(&self) -> Option<NodeCursor> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").last_node
    }

    #[must_use]
    pub fn tree_depth(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").tree_depth
    }

    /// Publishes packaging results after a merge finishes building this
    /// CT (spec §4.4 step 10). Sets cursors, depth, counters, the
    /// published leaf chain, and takes ownership of the large-object
    /// list.
    #[allow(clippy::too_many_arguments)]
    pub fn package(
        &self,
        root_node: NodeCursor,
        first_node: NodeCursor,
        last_node: NodeCursor,
        node_sizes: [u64; MAX_BTREE_DEPTH],
        tree_depth: usize,
        leaves: Vec<Arc<Node>>,
        large_objects: Vec<LargeObjectEntry>,
        data_ext_id: Option<ExtentId>,
    ) {
        let large_ext_chk_cnt: u64 = large_objects.iter().map(|e| e.chunks).sum();
        let item_count: u64 = leaves.iter().map(|n| n.entries.len() as u64).sum();
        #[allow(clippy::cast_possible_truncation)]
        let node_count = leaves.len() as u64;

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.write().expect("lock poisoned");
        state.root_node = Some(root_node);
        state.first_node = Some(first_node);
        state.last_node = Some(last_node);
        state.node_sizes = node_sizes;
        state.tree_depth = tree_depth;
        state.large_objects = large_objects;
        state.data_ext_id = data_ext_id;
        state.immutable_leaves = leaves;
        drop(state);

        self.counters.item_count.store(item_count, Ordering::Release);
        self.counters.node_count.store(node_count, Ordering::Release);
        self.counters
            .large_ext_chk_cnt
            .store(large_ext_chk_cnt, Ordering::Release);
    }

    /// The published leaf chain, in iteration order. Empty for dynamic
    /// trees or trees not yet packaged.
    #[must_use]
    pub fn immutable_leaves(&self) -> Vec<Arc<Node>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").immutable_leaves.clone()
    }

    #[must_use]
    pub fn large_objects(&self) -> Vec<LargeObjectEntry> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").large_objects.clone()
    }

    #[must_use]
    pub fn data_ext_id(&self) -> Option<ExtentId> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.state.read().expect("lock poisoned").data_ext_id
    }

    /// Releases every extent this CT owns back to `allocator`: its tree
    /// extent (the `root_node`'s, since internal and leaf nodes share one
    /// extent), its data extent if it packaged any medium-sized values,
    /// and every large object still on its large-object list.
    ///
    /// Called once a CT's last reference is dropped (invariant 3); the
    /// large objects here are the ones that *survived* to this CT's own
    /// retirement, not ones superseded mid-merge (those stay on the
    /// losing input's list untouched, spec §4.3).
    ///
    /// A dynamic CT owns no extents (its leaves live in memory until it is
    /// merged away), so this is a no-op for one.
    pub fn free_owned_extents(&self, allocator: &dyn ExtentAllocator) {
        if let Some(root) = self.root_node() {
            let _ = allocator.put(root.node_ref.ext_id);
        }
        if let Some(data_ext_id) = self.data_ext_id() {
            let _ = allocator.put(data_ext_id);
        }
        for lo in self.large_objects() {
            let _ = allocator.put(lo.ext_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::rw_vlba;
    use crate::key::{Key, LexicographicComparator};
    use crate::value::{Cvt, VersionedEntry};
    use crate::version::InMemoryVersionService;

    fn ops() -> Arc<dyn NodeOps> {
        rw_vlba(Arc::new(LexicographicComparator))
    }

    #[test]
    fn insert_and_lookup_newest_version() {
        let ct = ComponentTree::new_dynamic(pack_seq(0, 1), 0, ops());
        let versions = InMemoryVersionService::new();
        let v1 = versions.new_version(crate::version::ROOT_VERSION);
        let v2 = versions.new_version(v1);

        ct.insert(VersionedEntry::new(Key::new(*b"k"), v1, Cvt::Inline(Box::from(*b"old"))));
        ct.insert(VersionedEntry::new(Key::new(*b"k"), v2, Cvt::Inline(Box::from(*b"new"))));

        let found = ct.get_newest(&Key::new(*b"k"), v2, &versions).unwrap();
        assert_eq!(found.cvt, Cvt::Inline(Box::from(*b"new")));
        assert_eq!(ct.item_count(), 2);
    }

    #[test]
    fn ref_counting_guards_destruction() {
        let ct = ComponentTree::new_dynamic(pack_seq(1, 0), 0, ops());
        ct.get();
        assert_eq!(ct.ref_count(), 2);
        assert!(!ct.put());
        assert!(ct.put());
    }

    #[test]
    fn write_ref_only_valid_at_level_zero() {
        let ct = ComponentTree::new_immutable(pack_seq(0, 0), 2, ops());
        assert!(matches!(ct.get_write(), Err(Error::Invalid(_))));
    }

    #[test]
    #[should_panic(expected = "invariant violated")]
    fn destroying_ct_with_live_writer_panics() {
        let ct = ComponentTree::new_dynamic(pack_seq(0, 0), 0, ops());
        ct.get_write().unwrap();
        ct.put();
    }

    #[test]
    fn seq_packing_orders_by_cpu_then_counter() {
        let a = pack_seq(0, 5);
        let b = pack_seq(1, 0);
        assert!(a < b);
    }
}
