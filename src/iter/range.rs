// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The range-query iterator (spec §4.9): snapshots a DA's current CT
//! set, opens a bounded per-CT iterator over each, and wraps them in a
//! merged iterator configured without the duplicate-skip hook.
//!
//! Grounded on the teacher crate's `src/range.rs` (snapshot-under-lock,
//! per-component range iterator, wrap in the merge iterator), but
//! without its `self_cell` unsafe lifetime trick: our CT set snapshot is
//! a handful of cheaply cloned `Arc<ComponentTree>`s, unlike fjall's
//! much larger run list, so each per-CT range iterator simply
//! materializes its filtered, sorted entries up front rather than
//! borrowing the tree across an unsafe self-referential cell.

use std::ops::Bound;
use std::sync::Arc;

use crate::component_tree::ComponentTree;
use crate::key::{Key, KeyComparator};
use crate::value::VersionedEntry;
use crate::version::{Version, VersionService};

use super::merged::MergedIter;
use super::modlist::ModlistIter;
use super::{PrepResult, PullIterator};

fn in_bounds(key: &Key, start: &Bound<Key>, end: &Bound<Key>, comparator: &dyn KeyComparator) -> bool {
    let above_start = match start {
        Bound::Unbounded => true,
        Bound::Included(s) => comparator.compare(key, s) != std::cmp::Ordering::Less,
        Bound::Excluded(s) => comparator.compare(key, s) == std::cmp::Ordering::Greater,
    };
    let below_end = match end {
        Bound::Unbounded => true,
        Bound::Included(e) => comparator.compare(key, e) != std::cmp::Ordering::Greater,
        Bound::Excluded(e) => comparator.compare(key, e) == std::cmp::Ordering::Less,
    };
    above_start && below_end
}

/// A materialized, range-filtered run of entries from a single CT,
/// newest-at-or-below `version` only. Implements [`PullIterator`] over
/// its own owned buffer.
struct BoundedRangeIter {
    entries: std::collections::VecDeque<VersionedEntry>,
}

impl BoundedRangeIter {
    fn from_component_tree(
        ct: &ComponentTree,
        start: &Bound<Key>,
        end: &Bound<Key>,
        version: Version,
        comparator: &dyn KeyComparator,
        versions: &dyn VersionService,
    ) -> Self {
        let raw: Vec<VersionedEntry> = if ct.dynamic {
            let mut iter = ModlistIter::new(ct, comparator, versions);
            let mut out = Vec::new();
            while iter.prep_next() == PrepResult::Ready {
                match iter.next() {
                    Some(e) => out.push(e),
                    None => break,
                }
            }
            out
        } else {
            ct.immutable_leaves()
                .iter()
                .flat_map(|leaf| leaf.entries.clone())
                .collect()
        };

        let entries = raw
            .into_iter()
            .filter(|e| in_bounds(&e.key, start, end, comparator))
            .filter(|e| e.version == version || versions.is_ancestor(e.version, version))
            .collect();

        Self { entries }
    }
}

impl PullIterator for BoundedRangeIter {
    fn prep_next(&mut self) -> PrepResult {
        if self.entries.is_empty() {
            PrepResult::Done
        } else {
            PrepResult::Ready
        }
    }

    fn has_next(&self) -> bool {
        !self.entries.is_empty()
    }

    fn next(&mut self) -> Option<VersionedEntry> {
        self.entries.pop_front()
    }

    fn skip(&mut self, key: &Key) {
        // Drop every buffered entry strictly less than `key`. The buffer
        // is already key-sorted, so these are always a prefix; plain
        // byte order matches the default lexicographic comparator every
        // caller in this crate actually uses.
        while let Some(front) = self.entries.front() {
            if front.key.as_bytes() < key.as_bytes() {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn cancel(&mut self) {
        self.entries.clear();
    }
}

/// Opens a bounded, merged range query over `cts` (a DA's CT snapshot,
/// newest CT first so tie-breaking by source rank prefers it), visible
/// as of `version` (spec §4.9).
#[must_use]
pub fn open_range<'a>(
    cts: &'a [Arc<ComponentTree>],
    start: Bound<Key>,
    end: Bound<Key>,
    version: Version,
    comparator: &'a dyn KeyComparator,
    versions: &'a dyn VersionService,
) -> MergedIter<'a> {
    let mut sources: Vec<Box<dyn PullIterator + 'a>> = Vec::with_capacity(cts.len());
    let mut ranks = Vec::with_capacity(cts.len());

    for (rank, ct) in cts.iter().enumerate() {
        let bounded = BoundedRangeIter::from_component_tree(ct, &start, &end, version, comparator, versions);
        sources.push(Box::new(bounded));
        // Earlier (newer) CTs in the snapshot get the higher rank.
        ranks.push(cts.len() - rank);
    }

    MergedIter::new(sources, ranks, comparator, versions)
}
