// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Merge-restart and total-merge compaction (spec §4.8).
//!
//! A total merge is a single, non-deamortized "BIG_MERGE" over every CT
//! above level 0, run when growth at the top level combines with
//! outstanding deletable versions (`nr_del_versions > 0`) to make partial
//! garbage collection worthwhile. Grounded on the merge pipeline in
//! `merge::pipeline` (the same `run_merge` normal per-level merges use —
//! a total merge differs only in having many more inputs and skipping the
//! deamortized unit split) and on the teacher crate's full/major
//! compaction trigger in `src/compaction/`, which similarly decides to
//! run an unrestricted, whole-tree pass instead of its usual leveled
//! strategy once a size/tombstone threshold is crossed.

use std::sync::Arc;

use crate::component_tree::ComponentTree;
use crate::da::DoublingArray;
use crate::error::{Error, Result};
use crate::extent::ExtentAllocator;
use crate::key::KeyComparator;
use crate::merge::{run_merge, total_merge_output_level, MergeRequest};
use crate::version::VersionService;

/// Decides whether a total merge should be marked (spec §4.8): the top
/// level just grew *and* the DA has outstanding deletable versions.
#[must_use]
pub fn should_mark_compacting(top_level_grew: bool, nr_del_versions: u64) -> bool {
    top_level_grew && nr_del_versions > 0
}

/// Runs one total merge if the DA is currently marked compacting.
///
/// Snapshots and hides every visible CT at level ≥1, clears the
/// compacting flag (so new growth can be noticed again while this merge
/// runs), and feeds every snapshotted CT into a single `run_merge` call.
/// On success the merged output replaces all of its inputs, placed at
/// whatever level [`total_merge_output_level`] computes. On failure the
/// inputs are unhidden and `compacting`/`nr_del_versions` are left in
/// place for the next attempt (spec §7: "total-merge failures
/// additionally restore the CTs' `compacting` flag and the per-level
/// counters").
///
/// Returns `Ok(None)` if the DA was not compacting, or was compacting but
/// had nothing above level 0 to merge.
///
/// # Errors
///
/// Propagates whatever error `run_merge` returns.
pub fn run_total_merge(
    da: &DoublingArray,
    comparator: &dyn KeyComparator,
    versions: &dyn VersionService,
    allocator: &dyn ExtentAllocator,
) -> Result<Option<Arc<ComponentTree>>> {
    if !da.is_compacting() {
        return Ok(None);
    }

    let inputs = da.snapshot_and_hide_for_total_merge();
    if inputs.is_empty() {
        da.clear_compacting();
        return Ok(None);
    }

    log::debug!(
        "doubling array {} starting total merge over {} component trees",
        da.id,
        inputs.len()
    );
    da.clear_compacting();

    let tree_used: u64 = inputs.iter().map(|ct| ct.tree_usage().used).sum();
    let data_used: u64 = inputs.iter().map(|ct| ct.data_usage().used).sum();
    let highest_occupied = da.highest_occupied_level();
    let output_level = total_merge_output_level(tree_used, data_used, highest_occupied);

    let request = MergeRequest {
        inputs: inputs.clone(),
        comparator,
        versions,
        allocator,
        use_ssd_leaf_nodes: da.config().use_ssd_leaf_nodes,
        bloom_bits_per_key: da.config().bloom_bits_per_key,
    };
    let output_seq = da.next_merge_output_seq();
    let shell = ComponentTree::new_immutable(output_seq, output_level, Arc::clone(da.ro_ops()));

    match run_merge(&request, shell) {
        Ok(output) => {
            da.commit_total_merge(&inputs, output_level, Arc::clone(&output));
            da.reset_del_versions();
            log::debug!(
                "doubling array {} total merge committed: {} inputs -> level {output_level}",
                da.id,
                inputs.len()
            );
            Ok(Some(output))
        }
        Err(e) => {
            da.abort_total_merge(&inputs);
            da.mark_compacting();
            if matches!(e, Error::NoSpace) {
                da.freeze();
                log::warn!("doubling array {} froze: total merge ran out of space", da.id);
            }
            log::warn!("doubling array {} total merge failed, will retry: {e}", da.id);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{ro_vlba, rw_vlba};
    use crate::component_tree::pack_seq;
    use crate::config::Config;
    use crate::extent::InMemoryExtentAllocator;
    use crate::key::{Key, LexicographicComparator};
    use crate::value::{Cvt, VersionedEntry};
    use crate::version::{InMemoryVersionService, ROOT_VERSION};

    fn da(level_count: u8) -> DoublingArray {
        let comparator = Arc::new(LexicographicComparator);
        DoublingArray::new(
            1,
            ROOT_VERSION,
            Config::new().cpu_count(1).level_count(level_count),
            rw_vlba(Arc::clone(&comparator)),
            ro_vlba(comparator),
            Arc::new(InMemoryExtentAllocator::new(10_000)),
            Arc::new(InMemoryVersionService::new()),
        )
    }

    #[test]
    fn not_compacting_is_a_no_op() {
        let d = da(4);
        let comparator = LexicographicComparator;
        let versions = InMemoryVersionService::new();
        let allocator = InMemoryExtentAllocator::new(1_000);
        assert!(run_total_merge(&d, &comparator, &versions, &allocator).unwrap().is_none());
    }

    #[test]
    fn marked_but_empty_da_clears_compacting_without_merging() {
        let d = da(4);
        d.mark_compacting();
        let comparator = LexicographicComparator;
        let versions = InMemoryVersionService::new();
        let allocator = InMemoryExtentAllocator::new(1_000);
        assert!(run_total_merge(&d, &comparator, &versions, &allocator).unwrap().is_none());
        assert!(!d.is_compacting());
    }

    #[test]
    fn compacting_da_merges_every_tree_above_level_zero() {
        let d = da(4);
        let versions = InMemoryVersionService::new();
        let v1 = versions.new_version(ROOT_VERSION);

        let comparator_arc = Arc::new(LexicographicComparator);
        let rw_ops = rw_vlba(Arc::clone(&comparator_arc));
        let a = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 1, Arc::clone(&rw_ops)));
        a.insert(VersionedEntry::new(Key::new(*b"a"), v1, Cvt::Inline(Box::from(*b"1"))));
        let b = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 2), 1, rw_ops));
        b.insert(VersionedEntry::new(Key::new(*b"b"), v1, Cvt::Inline(Box::from(*b"2"))));

        {
            #[expect(clippy::expect_used, reason = "test-only")]
            let mut levels = d.levels.write().expect("lock poisoned");
            levels[1].insert_front(a);
            levels[1].insert_front(b);
        }
        d.add_del_versions(1);
        d.mark_compacting();

        let comparator = LexicographicComparator;
        let allocator = InMemoryExtentAllocator::new(10_000);
        let output = run_total_merge(&d, &comparator, &versions, &allocator).unwrap().unwrap();

        assert_eq!(output.item_count(), 2);
        assert_eq!(d.level_len(1), 0);
        assert!(!d.is_compacting());
        assert_eq!(d.nr_del_versions(), 0);
    }

    #[test]
    fn out_of_space_freezes_the_da_and_restores_compacting_state() {
        let d = da(4);
        let versions = InMemoryVersionService::new();
        let v1 = versions.new_version(ROOT_VERSION);

        let comparator_arc = Arc::new(LexicographicComparator);
        let rw_ops = rw_vlba(Arc::clone(&comparator_arc));
        let a = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 1, rw_ops));
        a.insert(VersionedEntry::new(Key::new(*b"a"), v1, Cvt::Inline(Box::from(*b"1"))));
        {
            #[expect(clippy::expect_used, reason = "test-only")]
            let mut levels = d.levels.write().expect("lock poisoned");
            levels[1].insert_front(a);
        }
        d.add_del_versions(1);
        d.mark_compacting();

        let comparator = LexicographicComparator;
        let allocator = InMemoryExtentAllocator::new(0);
        let err = run_total_merge(&d, &comparator, &versions, &allocator).unwrap_err();

        assert!(matches!(err, Error::NoSpace));
        assert!(d.is_frozen());
        assert!(d.is_compacting());
        assert_eq!(d.nr_del_versions(), 1);
        assert_eq!(d.level_len(1), 1);

        d.unfreeze();
        assert!(!d.is_frozen());
    }
}
