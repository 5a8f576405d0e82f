// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-depth merge scratch state (spec §4.4 step 3): fresh, grounded
//! directly on the specification's explicit field list — no teacher
//! analogue, since the teacher crate's compaction worker flushes whole
//! sorted runs rather than constructing nodes entry-by-entry with a
//! version-ordering boundary.

use crate::btree::Node;
use crate::key::Key;
use crate::version::Version;

/// Per-depth construction state for one in-progress output tree.
pub struct DepthScratch {
    /// The node currently being built at this depth.
    pub node: Node,
    /// The last key written to this depth, used to detect key
    /// transitions (spec §4.4 step 6).
    pub last_key: Option<Key>,
    /// Last index that would be a legal node boundary under version
    /// ordering.
    pub valid_end_idx: Option<usize>,
    /// The version that makes `valid_end_idx` a legal boundary.
    pub valid_version: Version,
    /// Write cursor. `None` once the node has been marked complete
    /// (`next_idx = -1` in the specification's vocabulary).
    pub next_idx: Option<usize>,
}

impl DepthScratch {
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            node: Node::empty(depth),
            last_key: None,
            valid_end_idx: None,
            valid_version: 0,
            next_idx: Some(0),
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_idx.is_none()
    }

    pub fn mark_complete(&mut self) {
        self.next_idx = None;
    }

    /// Recomputes `valid_end_idx`/`valid_version` after appending the
    /// entry at `new_idx` with key `key` and version `v` (spec §4.4 step
    /// 6's four-way rule).
    pub fn observe_insertion(
        &mut self,
        new_idx: usize,
        key: &Key,
        v: Version,
        key_cmp: std::cmp::Ordering,
        is_strict_ancestor: impl FnOnce(Version, Version) -> bool,
    ) {
        if self.last_key.is_none() {
            // First entry.
            self.valid_end_idx = Some(0);
            self.valid_version = v;
        } else {
            match key_cmp {
                std::cmp::Ordering::Greater => {
                    // Key strictly greater than previous: boundary is the
                    // previous index, any version is valid there.
                    self.valid_end_idx = Some(new_idx.saturating_sub(1));
                    self.valid_version = 0;
                }
                std::cmp::Ordering::Equal if is_strict_ancestor(v, self.valid_version) => {
                    self.valid_end_idx = Some(new_idx);
                    self.valid_version = v;
                }
                _ => {
                    // Boundary unchanged.
                }
            }
        }
        self.last_key = Some(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_sets_boundary_at_zero() {
        let mut scratch = DepthScratch::new(0);
        scratch.observe_insertion(0, &Key::new(*b"a"), 5, std::cmp::Ordering::Equal, |_, _| false);
        assert_eq!(scratch.valid_end_idx, Some(0));
        assert_eq!(scratch.valid_version, 5);
    }

    #[test]
    fn greater_key_moves_boundary_to_previous_index() {
        let mut scratch = DepthScratch::new(0);
        scratch.observe_insertion(0, &Key::new(*b"a"), 1, std::cmp::Ordering::Equal, |_, _| false);
        scratch.observe_insertion(1, &Key::new(*b"b"), 2, std::cmp::Ordering::Greater, |_, _| false);
        assert_eq!(scratch.valid_end_idx, Some(0));
        assert_eq!(scratch.valid_version, 0);
    }

    #[test]
    fn same_key_ancestor_version_extends_boundary() {
        let mut scratch = DepthScratch::new(0);
        scratch.observe_insertion(0, &Key::new(*b"a"), 10, std::cmp::Ordering::Equal, |_, _| false);
        scratch.observe_insertion(1, &Key::new(*b"a"), 5, std::cmp::Ordering::Equal, |_, _| true);
        assert_eq!(scratch.valid_end_idx, Some(1));
        assert_eq!(scratch.valid_version, 5);
    }
}
