// Copyright 2024 fstransform contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Property-based tests for the extent-map invariants spec §8 names.
//! Complements the example-based unit tests alongside each module with
//! randomized coverage over many disjoint-extent layouts.

use proptest::prelude::*;

use libfsremap::extent::{compare, Extent, Relation, Tag};
use libfsremap::map::ExtentMap;
use libfsremap::vector::ExtentVector;

/// A vector of disjoint, ascending, non-touching `(physical, length)` runs,
/// all tagged `Device`, generated from a sorted list of non-overlapping
/// gaps + lengths so no two runs touch or overlap by construction.
fn disjoint_runs(max_runs: usize, max_gap: u64, max_len: u64) -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((1..=max_gap, 1..=max_len), 0..=max_runs).prop_map(|steps| {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for (gap, len) in steps {
            cursor += gap; // always leave at least one free block, so runs never touch
            out.push((cursor, len));
            cursor += len;
        }
        out
    })
}

fn extent_map_of(runs: &[(u64, u64)]) -> ExtentMap {
    let mut m = ExtentMap::new();
    for &(p, len) in runs {
        m.insert(p, p, len, Tag::Device);
    }
    m
}

fn extent_vector_of(runs: &[(u64, u64)]) -> ExtentVector {
    let mut v = ExtentVector::new();
    for &(p, len) in runs {
        v.push(Extent::new(p, p, len, Tag::Device));
    }
    v
}

proptest! {
    /// Invariant 1 (spec §8): after any sequence of inserts, every pair of
    /// physically adjacent entries compares as `Before` — never touching or
    /// intersecting (a mergeable touch would already have been folded in).
    #[test]
    fn adjacent_entries_are_always_before(runs in disjoint_runs(30, 5, 20)) {
        let m = extent_map_of(&runs);
        let entries: Vec<Extent> = m.iter().collect();
        for w in entries.windows(2) {
            prop_assert_eq!(compare(&w[0], &w[1]), Relation::Before);
        }
    }

    /// Invariant 2 (spec §8): removing a subrange of a single entry and
    /// reinserting the identical triple restores the map exactly.
    #[test]
    fn remove_then_reinsert_is_identity(runs in disjoint_runs(10, 5, 30)) {
        prop_assume!(!runs.is_empty());
        let mut m = extent_map_of(&runs);
        let before: Vec<(u64, u64, u64)> = m.iter().map(|e| (e.physical, e.logical, e.length)).collect();

        // carve a subrange out of the first entry.
        let (p, len) = runs[0];
        let offset = len / 2;
        let sub_len = (len - offset).max(1).min(len);
        m.remove(p + offset, p + offset, sub_len);
        m.insert(p + offset, p + offset, sub_len, Tag::Device);

        let after: Vec<(u64, u64, u64)> = m.iter().map(|e| (e.physical, e.logical, e.length)).collect();
        prop_assert_eq!(before, after);
    }

    /// Invariant 3 (spec §8): the `Both`-mode intersection of two maps is a
    /// physical subset of each, and its total length never exceeds the
    /// smaller of the two inputs.
    #[test]
    fn intersection_is_bounded_by_both_inputs(
        a_runs in disjoint_runs(15, 4, 15),
        b_runs in disjoint_runs(15, 4, 15),
    ) {
        let a = extent_map_of(&a_runs);
        let b = extent_map_of(&b_runs);
        let i = ExtentMap::intersect_all_all(&a, &b, libfsremap::map::MatchMode::Both);

        prop_assert!(i.total_length() <= a.total_length().min(b.total_length()));
        for extent in i.iter() {
            let covered_by_a = a.iter().any(|e| e.physical <= extent.physical && extent.physical_end() <= e.physical_end());
            let covered_by_b = b.iter().any(|e| e.physical <= extent.physical && extent.physical_end() <= e.physical_end());
            prop_assert!(covered_by_a);
            prop_assert!(covered_by_b);
        }
    }

    /// Invariant 4 (spec §8): the physical complement of a disjoint vector
    /// within `[0, dev_length)` has total length `dev_length - used`, and no
    /// produced hole overlaps any of the original runs.
    #[test]
    fn complement_total_length_matches_device_minus_used(runs in disjoint_runs(15, 4, 20)) {
        let vector = extent_vector_of(&runs);
        let used: u64 = runs.iter().map(|&(_, len)| len).sum();
        let last_end = runs.last().map(|&(p, len)| p + len).unwrap_or(0);
        let dev_length = last_end + 50;

        let complement = ExtentMap::complement0_physical_shift(&vector, 0, dev_length);
        prop_assert_eq!(complement.total_length(), dev_length - used);

        for hole in complement.iter() {
            for &(p, len) in &runs {
                let used_end = p + len;
                prop_assert!(hole.physical_end() <= p || hole.physical >= used_end);
            }
        }
    }

    /// Invariant 5 (spec §8): after `allocate_all`, the physical union of the
    /// renumbered output and the leftover requests equals the initial
    /// requests map, and every request's length is preserved.
    #[test]
    fn best_fit_allocation_preserves_total_length(
        hole_runs in disjoint_runs(10, 4, 50),
        request_runs in disjoint_runs(10, 4, 15),
    ) {
        use libfsremap::pool::BestFitPool;

        let holes = extent_map_of(&hole_runs);
        let requests = extent_map_of(&request_runs);
        let requests_total = requests.total_length();

        let mut pool = BestFitPool::from_map(&holes);
        let (renumbered, unsatisfied) = pool.allocate_all(&requests);

        prop_assert_eq!(renumbered.total_length() + unsatisfied.total_length(), requests_total);
    }
}
