// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Output-tree level assignment (spec §4.5). Fresh, grounded on the
//! specification directly and cross-checked against `castle_da.c`'s
//! total-merge level placement logic.

use crate::config::{MAX_DYNAMIC_DATA_SIZE, MAX_DYNAMIC_TREE_SIZE};

/// A normal pairwise merge always outputs one level above its inputs.
#[must_use]
pub fn normal_merge_output_level(input_level: u8) -> u8 {
    input_level + 1
}

/// Total-merge output level: dynamically sized by how much data the
/// merge actually produced, then bumped above any already-occupied
/// higher level (spec §4.5).
///
/// `tree_used`/`data_used` are summed input-extent usage in chunks.
/// `highest_occupied_level` is the highest DA level (if any) that
/// already holds a CT, prior to this merge's output being placed.
#[must_use]
pub fn total_merge_output_level(
    tree_used: u64,
    data_used: u64,
    highest_occupied_level: Option<u8>,
) -> u8 {
    let nr_units = (tree_used / MAX_DYNAMIC_TREE_SIZE).max(data_used / MAX_DYNAMIC_DATA_SIZE);
    let nr_units = nr_units.max(1);

    #[allow(clippy::cast_possible_truncation)]
    let log2_units = (u64::BITS - nr_units.leading_zeros()).saturating_sub(1) as u8;
    // Round up to the next power of two unless `nr_units` already is one.
    let log2_units = if nr_units.is_power_of_two() {
        log2_units
    } else {
        log2_units + 1
    };

    let from_size = log2_units.max(2);

    match highest_occupied_level {
        Some(highest) if highest + 1 > from_size => highest + 1,
        _ => from_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_merge_promotes_one_level() {
        assert_eq!(normal_merge_output_level(1), 2);
        assert_eq!(normal_merge_output_level(5), 6);
    }

    #[test]
    fn total_merge_clamps_to_minimum_level_two() {
        assert_eq!(total_merge_output_level(1, 1, None), 2);
    }

    #[test]
    fn total_merge_scales_with_units() {
        // nr_units = 4 (tree_used / 20 = 80/20 = 4) => log2(4) = 2, clamped to >=2 => 2.
        assert_eq!(total_merge_output_level(80, 0, None), 2);
        // nr_units = 8 => log2(8) = 3.
        assert_eq!(total_merge_output_level(160, 0, None), 3);
    }

    #[test]
    fn total_merge_respects_higher_occupied_level() {
        assert_eq!(total_merge_output_level(80, 0, Some(4)), 5);
    }

    #[test]
    fn total_merge_output_placement_worked_example() {
        // tree_used = 80, data_used = 10, nr_units = 4, log2 = 2,
        // highest occupied among {1, 2} is 2 -> output level 3.
        assert_eq!(total_merge_output_level(80, 10, Some(2)), 3);
    }
}
