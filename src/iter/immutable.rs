// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The immutable leaf iterator (spec §4.1): walks an immutable CT's
//! published leaf chain, skipping LEAF-POINTER entries, and invokes a
//! `node_start` callback on every new node — the hook the modlist sort
//! iterator relies on to detect leaf boundaries.
//!
//! Grounded on the teacher crate's `src/segment/reader.rs`-style
//! sequential forward scan (prefetch advisory, synchronous fallback on
//! miss), adapted to walk the in-memory leaf chain a [`ComponentTree`]
//! publishes at merge time rather than re-deriving extent-relative
//! block reads, since the block cache/extent allocator are external
//! collaborators (spec §1) rather than reimplemented disk paths here.

use std::sync::Arc;

use crate::btree::Node;
use crate::component_tree::ComponentTree;
use crate::value::{Cvt, VersionedEntry};

use super::{PrepResult, PullIterator};

/// Walks the leaf chain of an immutable [`ComponentTree`].
pub struct ImmutableLeafIter {
    leaves: Vec<Arc<Node>>,
    leaf_idx: usize,
    entry_idx: usize,
    prepared: Option<VersionedEntry>,
    cancelled: bool,
    node_start_cb: Option<Box<dyn FnMut(usize) + Send>>,
    last_emitted_leaf: Option<usize>,
}

impl ImmutableLeafIter {
    /// Creates an iterator over `ct`'s published leaf chain. `ct` must
    /// not be dynamic: dynamic trees have no native order and are
    /// iterated via [`super::modlist::ModlistIter`] instead.
    #[must_use]
    pub fn new(ct: &ComponentTree) -> Self {
        assert!(!ct.dynamic, "ImmutableLeafIter requires an immutable CT");
        Self {
            leaves: ct.immutable_leaves(),
            leaf_idx: 0,
            entry_idx: 0,
            prepared: None,
            cancelled: false,
            node_start_cb: None,
            last_emitted_leaf: None,
        }
    }

    /// Registers the `node_start` callback, invoked with the new leaf's
    /// index whenever the iterator crosses a node boundary (spec §4.1).
    pub fn on_node_start(&mut self, cb: Box<dyn FnMut(usize) + Send>) {
        self.node_start_cb = Some(cb);
    }

    fn advance_to_next_real_entry(&mut self) -> Option<VersionedEntry> {
        loop {
            if self.cancelled || self.leaf_idx >= self.leaves.len() {
                return None;
            }

            let leaf = &self.leaves[self.leaf_idx];

            if self.last_emitted_leaf != Some(self.leaf_idx) {
                self.last_emitted_leaf = Some(self.leaf_idx);
                if let Some(cb) = self.node_start_cb.as_mut() {
                    cb(self.leaf_idx);
                }
            }

            if self.entry_idx >= leaf.entries.len() {
                self.leaf_idx += 1;
                self.entry_idx = 0;
                continue;
            }

            let entry = &leaf.entries[self.entry_idx];
            self.entry_idx += 1;

            if matches!(entry.cvt, Cvt::LeafPointer { .. }) {
                continue;
            }

            return Some(entry.clone());
        }
    }
}

impl PullIterator for ImmutableLeafIter {
    fn prep_next(&mut self) -> PrepResult {
        if self.prepared.is_some() {
            return PrepResult::Ready;
        }
        self.prepared = self.advance_to_next_real_entry();
        if self.prepared.is_some() {
            PrepResult::Ready
        } else {
            PrepResult::Done
        }
    }

    fn has_next(&self) -> bool {
        self.prepared.is_some()
    }

    fn next(&mut self) -> Option<VersionedEntry> {
        self.prepared.take()
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.leaves.clear();
        self.prepared = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{rw_vlba, NodeRef};
    use crate::component_tree::{ComponentTree, NodeCursor};
    use crate::extent::ExtentId;
    use crate::key::{Key, LexicographicComparator};
    use crate::value::VersionedEntry;

    fn cursor(offset: u64) -> NodeCursor {
        NodeCursor {
            node_ref: NodeRef { ext_id: ExtentId(1), offset },
            size: 0,
        }
    }

    fn leaf(entries: Vec<VersionedEntry>) -> Arc<Node> {
        Arc::new(Node {
            entries,
            next_node: None,
            version: 0,
            depth: 0,
            maxified: false,
        })
    }

    #[test]
    fn walks_leaves_skipping_leaf_pointers() {
        let ops = rw_vlba(Arc::new(LexicographicComparator));
        let ct = ComponentTree::new_immutable(1, 2, ops);

        let l0 = leaf(vec![
            VersionedEntry::new(Key::new(*b"a"), 1, Cvt::Tombstone),
            VersionedEntry::new(Key::new(*b"b"), 1, Cvt::LeafPointer { ext_id: ExtentId(9), node_offset: 0 }),
        ]);
        let l1 = leaf(vec![VersionedEntry::new(Key::new(*b"c"), 1, Cvt::Tombstone)]);

        ct.package(
            cursor(0),
            cursor(0),
            cursor(1),
            [0; crate::config::MAX_BTREE_DEPTH],
            1,
            vec![l0, l1],
            vec![],
            None,
        );

        let mut iter = ImmutableLeafIter::new(&ct);
        let mut seen = Vec::new();
        while iter.prep_next() == PrepResult::Ready {
            seen.push(iter.next().unwrap());
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].key, Key::new(*b"a"));
        assert_eq!(seen[1].key, Key::new(*b"c"));
    }

    #[test]
    fn node_start_fires_once_per_leaf() {
        let ops = rw_vlba(Arc::new(LexicographicComparator));
        let ct = ComponentTree::new_immutable(2, 2, ops);
        let l0 = leaf(vec![VersionedEntry::new(Key::new(*b"a"), 1, Cvt::Tombstone)]);
        let l1 = leaf(vec![VersionedEntry::new(Key::new(*b"b"), 1, Cvt::Tombstone)]);
        ct.package(cursor(0), cursor(0), cursor(1), [0; crate::config::MAX_BTREE_DEPTH], 1, vec![l0, l1], vec![], None);

        let mut iter = ImmutableLeafIter::new(&ct);
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let starts_clone = starts.clone();
        iter.on_node_start(Box::new(move |idx| starts_clone.lock().unwrap().push(idx)));

        while iter.prep_next() == PrepResult::Ready {
            iter.next();
        }
        assert_eq!(*starts.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn cancel_releases_state() {
        let ops = rw_vlba(Arc::new(LexicographicComparator));
        let ct = ComponentTree::new_immutable(3, 2, ops);
        let l0 = leaf(vec![VersionedEntry::new(Key::new(*b"a"), 1, Cvt::Tombstone)]);
        ct.package(cursor(0), cursor(0), cursor(0), [0; crate::config::MAX_BTREE_DEPTH], 1, vec![l0], vec![], None);

        let mut iter = ImmutableLeafIter::new(&ct);
        iter.cancel();
        assert_eq!(iter.prep_next(), PrepResult::Done);
    }
}
