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

//! Extent map (spec §4.1, component C3): the canonical container for the
//! whole engine. Keys are physical block offsets; adjacent entries are
//! always disjoint and non-touching (touching, mergeable entries are
//! folded together on insert). A `BTreeMap` gives the ordered traversal
//! merge-detection and complement need, without building an explicit
//! pointer graph (spec §9).

use std::collections::BTreeMap;

use crate::extent::{compare, intersect_both, intersect_physical, Extent, Relation, Tag};
use crate::vector::ExtentVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapEntry {
    logical: u64,
    length: u64,
    tag: Tag,
}

impl MapEntry {
    fn extent(&self, physical: u64) -> Extent {
        Extent::new(physical, self.logical, self.length, self.tag)
    }
}

/// Which axis/side an [`ExtentMap::intersect_all_all`] match selects its
/// `logical` value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Physical overlap; `logical` taken from side 1 (`self`/`map1`).
    Physical1,
    /// Physical overlap; `logical` taken from side 2 (`other`/`map2`).
    Physical2,
    /// Overlap only where both physical and logical axes are aligned.
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct ExtentMap {
    entries: BTreeMap<u64, MapEntry>,
}

impl ExtentMap {
    pub fn new() -> Self {
        ExtentMap {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn total_length(&self) -> u64 {
        self.entries.values().map(|v| v.length).sum()
    }

    /// Overwrite every entry's tag in place, without touching physical or
    /// logical addresses. Used once a map's ownership classification changes
    /// wholesale, e.g. the analyzer's physical-complement holes becoming
    /// `Device` once they're known to hold old-filesystem data.
    pub fn retag(&mut self, tag: Tag) {
        for entry in self.entries.values_mut() {
            entry.tag = tag;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.entries.iter().map(|(&p, v)| v.extent(p))
    }

    pub fn first(&self) -> Option<Extent> {
        self.entries.iter().next().map(|(&p, v)| v.extent(p))
    }

    /// Minimum physical and maximum physical+length across all entries, or
    /// `(0, 0)` if empty.
    pub fn bounds(&self) -> (u64, u64) {
        match (self.entries.iter().next(), self.entries.iter().next_back()) {
            (Some((&lo, _)), Some((&hi, v))) => (lo, hi + v.length),
            _ => (0, 0),
        }
    }

    /// Insert a single extent, merging transitively with at most the
    /// immediate predecessor and successor (the map's invariant guarantees
    /// no merge chain can extend further, since every pre-existing pair of
    /// adjacent entries is already non-mergeable).
    ///
    /// Panics (via `debug_assert`) if the new extent would overlap an
    /// existing one; overlapping inserts are a caller bug, not a supported
    /// operation (spec §4.1).
    pub fn insert(&mut self, physical: u64, logical: u64, length: u64, tag: Tag) -> u64 {
        let new = Extent::new(physical, logical, length, tag);

        // Check predecessor.
        if let Some((&prev_p, prev_v)) = self.entries.range(..physical).next_back() {
            let prev = prev_v.extent(prev_p);
            match compare(&prev, &new) {
                Relation::TouchBefore => {
                    return self.merge_into_predecessor(prev_p, length);
                }
                Relation::Intersect => debug_assert!(false, "overlapping insert into ExtentMap"),
                _ => {}
            }
        }
        // Check successor.
        if let Some((&next_p, next_v)) = self.entries.range(physical..).next() {
            let next = next_v.extent(next_p);
            match compare(&new, &next) {
                Relation::TouchBefore => {
                    return self.merge_into_successor(physical, logical, length, tag, next_p);
                }
                Relation::Intersect => debug_assert!(false, "overlapping insert into ExtentMap"),
                _ => {}
            }
        }

        self.entries.insert(
            physical,
            MapEntry {
                logical,
                length,
                tag,
            },
        );
        physical
    }

    pub fn insert_extent(&mut self, extent: Extent) -> u64 {
        self.insert(extent.physical, extent.logical, extent.length, extent.tag)
    }

    /// Grow the entry at `prev_physical` to absorb `extra_length` more
    /// blocks on its high end, then check whether the result now also
    /// touches its (new) successor and fold that in too.
    fn merge_into_predecessor(&mut self, prev_physical: u64, extra_length: u64) -> u64 {
        let entry = self.entries.get_mut(&prev_physical).expect("predecessor must exist");
        entry.length += extra_length;
        self.maybe_merge_with_successor(prev_physical);
        prev_physical
    }

    /// Extend the entry at `next_physical` backward to start at `physical`,
    /// re-keying it, then check whether the result now also touches its
    /// (new) predecessor.
    fn merge_into_successor(
        &mut self,
        physical: u64,
        logical: u64,
        length: u64,
        tag: Tag,
        next_physical: u64,
    ) -> u64 {
        let next = self.entries.remove(&next_physical).expect("successor must exist");
        self.entries.insert(
            physical,
            MapEntry {
                logical,
                length: length + next.length,
                tag,
            },
        );
        self.maybe_merge_with_predecessor(physical);
        physical
    }

    fn maybe_merge_with_successor(&mut self, physical: u64) {
        let entry = *self.entries.get(&physical).unwrap();
        let this_extent = entry.extent(physical);
        if let Some((&next_p, next_v)) = self.entries.range((physical + 1)..).next() {
            let next_extent = next_v.extent(next_p);
            if compare(&this_extent, &next_extent) == Relation::TouchBefore {
                let next = self.entries.remove(&next_p).unwrap();
                let e = self.entries.get_mut(&physical).unwrap();
                e.length += next.length;
            }
        }
    }

    fn maybe_merge_with_predecessor(&mut self, physical: u64) {
        if let Some((&prev_p, prev_v)) = self.entries.range(..physical).next_back() {
            let prev_extent = prev_v.extent(prev_p);
            let this_entry = *self.entries.get(&physical).unwrap();
            let this_extent = this_entry.extent(physical);
            if compare(&prev_extent, &this_extent) == Relation::TouchBefore {
                let this = self.entries.remove(&physical).unwrap();
                let p = self.entries.get_mut(&prev_p).unwrap();
                p.length += this.length;
            }
        }
    }

    /// Insert without merging or overlap checking. Used internally by
    /// `intersect`/`complement0_*` to build maps whose entries are known to
    /// be pairwise disjoint by construction.
    fn insert0(&mut self, physical: u64, logical: u64, length: u64, tag: Tag) {
        self.entries.insert(
            physical,
            MapEntry {
                logical,
                length,
                tag,
            },
        );
    }

    /// Remove the entry whose key is exactly `physical`.
    pub fn remove_key(&mut self, physical: u64) -> Option<Extent> {
        self.entries.remove(&physical).map(|v| v.extent(physical))
    }

    /// Remove `[physical, physical+length)` / `[logical, logical+length)`
    /// from this map, which must be a subset of a *single* existing entry.
    /// The containing entry is split into zero, one, or two residual
    /// pieces, preserving logical continuity (spec §4.1's `remove`).
    pub fn remove(&mut self, physical: u64, logical: u64, length: u64) {
        let (&last_p, last_v) = self
            .entries
            .range(..=physical)
            .next_back()
            .expect("remove() range must be a subset of an existing entry");
        let last_v = *last_v;

        let last_logical = last_v.logical;
        let last_length = last_v.length;
        let tag = last_v.tag;

        assert!(last_p <= physical, "remove() range starts before any entry");
        assert!(last_logical <= logical, "remove() logical predates entry");
        assert_eq!(
            physical - last_p,
            logical - last_logical,
            "remove() range is not logically aligned with its containing entry"
        );
        assert!(
            last_p + last_length >= physical + length,
            "remove() range is not a subset of a single entry"
        );

        if last_p < physical {
            // Shrink the entry to end where the removed range begins.
            self.entries.get_mut(&last_p).unwrap().length = physical - last_p;
        } else {
            self.entries.remove(&last_p);
        }

        if last_p + last_length > physical + length {
            let new_physical = physical + length;
            let new_logical = logical + length;
            let new_length = last_p + last_length - new_physical;
            self.insert0(new_physical, new_logical, new_length, tag);
        }
    }

    pub fn remove_extent(&mut self, extent: &Extent) {
        self.remove(extent.physical, extent.logical, extent.length);
    }

    /// Shrink the entry at `physical` by `shrink_length` blocks from its low
    /// (physical/logical) end. Returns the new key if anything remains,
    /// `None` if the whole entry was consumed.
    pub fn remove_front(&mut self, physical: u64, shrink_length: u64) -> Option<u64> {
        let entry = self
            .entries
            .remove(&physical)
            .expect("remove_front() key must exist");
        assert!(entry.length >= shrink_length, "remove_front() shrinks past entry end");

        if entry.length == shrink_length {
            return None;
        }
        let new_physical = physical + shrink_length;
        self.entries.insert(
            new_physical,
            MapEntry {
                logical: entry.logical + shrink_length,
                length: entry.length - shrink_length,
                tag: entry.tag,
            },
        );
        Some(new_physical)
    }

    /// Subtract every block of `other` from this map, splitting entries as
    /// needed. After this call, no physical block of `other` remains
    /// present in `self`.
    pub fn remove_all(&mut self, other: &ExtentMap) {
        let to_remove = ExtentMap::intersect_all_all(self, other, MatchMode::Both);
        for extent in to_remove.iter() {
            self.remove(extent.physical, extent.logical, extent.length);
        }
    }

    /// Replace this map's contents with a copy where every `physical` and
    /// `logical` are swapped. Used to flip the direction of a relocation
    /// plan.
    pub fn transpose(&self) -> ExtentMap {
        let mut out = ExtentMap::new();
        for extent in self.iter() {
            out.insert0(extent.logical, extent.physical, extent.length, extent.tag);
        }
        out
    }

    /// Compute every intersection (by `mode`) between `map1` and `map2`,
    /// iterating whichever map is smaller and seeking into the larger one —
    /// `O((n+m) log(n+m))` (spec §4.1).
    pub fn intersect_all_all(map1: &ExtentMap, map2: &ExtentMap, mode: MatchMode) -> ExtentMap {
        let mut out = ExtentMap::new();
        if map1.is_empty() || map2.is_empty() {
            return out;
        }

        let (iterate, other, effective_mode, swapped) = if map1.len() <= map2.len() {
            (map1, map2, mode, false)
        } else {
            (map2, map1, transpose_mode(mode), true)
        };

        for extent in iterate.iter() {
            for cand in other.overlapping(extent.physical, extent.physical_end()) {
                // `extent` is always from `iterate`, `cand` from `other`; but
                // `effective_mode` already accounts for `swapped` by naming
                // whichever one is really side 1 in the original `map1`/
                // `map2` terms, except for `Both`, where the result tag is
                // always side 1's regardless of match axis.
                let result = match effective_mode {
                    MatchMode::Physical1 => intersect_physical(&extent, &cand, true, extent.tag),
                    MatchMode::Physical2 => intersect_physical(&extent, &cand, false, cand.tag),
                    MatchMode::Both => {
                        let side1_tag = if swapped { cand.tag } else { extent.tag };
                        intersect_both(&extent, &cand, side1_tag)
                    }
                };
                if let Some(hit) = result {
                    out.insert0(hit.physical, hit.logical, hit.length, hit.tag);
                }
            }
        }
        out
    }

    /// Entries whose physical range intersects `[lo, hi)`. A `range`-backed
    /// query (spec §9: "look up ... by a physical-range query on the same
    /// map"), not a full scan — `O(log n + matches)`.
    pub(crate) fn overlapping(&self, lo: u64, hi: u64) -> impl Iterator<Item = Extent> + '_ {
        // Any entry starting before `lo` might still extend into [lo, hi);
        // back up to the last entry at or before `lo`, then walk forward
        // while entries start before `hi`.
        let start = self
            .entries
            .range(..lo)
            .next_back()
            .map(|(&p, _)| p)
            .unwrap_or(lo);
        self.entries
            .range(start..hi)
            .map(|(&p, v)| v.extent(p))
            .filter(move |e| e.physical_end() > lo && e.physical < hi)
    }

    /// Physical complement of `vector` (pre-sorted by physical) within
    /// `[0, dev_length)`: every "hole" not covered by `vector`. Each
    /// produced extent has `logical == physical` (spec §4.1).
    pub fn complement0_physical_shift(vector: &ExtentVector, shift_log2: u32, dev_length: u64) -> ExtentMap {
        let mut out = ExtentMap::new();
        let mut last: u64 = 0;

        for extent in vector.iter() {
            let physical = extent.physical >> shift_log2;
            if physical > last {
                out.insert0(last, last, physical - last, Tag::Default);
            } else {
                assert!(
                    physical == last,
                    "complement0_physical_shift() requires a vector sorted by physical"
                );
            }
            last = physical + (extent.length >> shift_log2);
        }

        let dev_length = dev_length >> shift_log2;
        if last < dev_length {
            out.insert0(last, last, dev_length - last, Tag::Default);
        }
        out
    }

    /// Logical complement of `vector` (pre-sorted by logical) within
    /// `[0, dev_length)`: every logical address range *not* covered by
    /// `vector`, i.e. the destinations still free to receive relocated
    /// blocks. Each produced extent has `logical == physical`, mirroring
    /// `complement0_physical_shift` but walking the logical axis (used by
    /// the analyzer to compute `loop_holes_map`, spec §4.3 step 5).
    pub fn complement0_logical_shift(vector: &ExtentVector, shift_log2: u32, dev_length: u64) -> ExtentMap {
        let mut out = ExtentMap::new();
        let mut last: u64 = 0;

        let mut sorted: Vec<Extent> = vector.iter().copied().collect();
        sorted.sort_by_key(|e| e.logical);

        for extent in &sorted {
            let logical = extent.logical >> shift_log2;
            if logical > last {
                out.insert0(last, last, logical - last, Tag::Default);
            } else {
                assert!(
                    logical == last,
                    "complement0_logical_shift() requires non-overlapping logical ranges"
                );
            }
            last = logical + (extent.length >> shift_log2);
        }

        let dev_length = dev_length >> shift_log2;
        if last < dev_length {
            out.insert0(last, last, dev_length - last, Tag::Default);
        }
        out
    }
}

fn transpose_mode(mode: MatchMode) -> MatchMode {
    match mode {
        MatchMode::Physical1 => MatchMode::Physical2,
        MatchMode::Physical2 => MatchMode::Physical1,
        MatchMode::Both => MatchMode::Both,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(m: &ExtentMap) -> Vec<(u64, u64, u64)> {
        m.iter().map(|e| (e.physical, e.logical, e.length)).collect()
    }

    #[test]
    fn insert_merges_touching_neighbours() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 2, Tag::Device);
        m.insert(4, 4, 2, Tag::Device);
        m.insert(2, 2, 2, Tag::Device); // fills the gap, should merge all three
        assert_eq!(collect(&m), vec![(0, 0, 6)]);
    }

    #[test]
    fn insert_keeps_disjoint_entries_separate() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 2, Tag::Device);
        m.insert(10, 10, 2, Tag::Device);
        assert_eq!(collect(&m), vec![(0, 0, 2), (10, 10, 2)]);
    }

    #[test]
    fn insert_does_not_merge_mismatched_tags() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 2, Tag::Device);
        m.insert(2, 2, 2, Tag::LoopFile);
        assert_eq!(collect(&m), vec![(0, 0, 2), (2, 2, 2)]);
    }

    #[test]
    fn adjacent_entries_invariant_holds_after_inserts() {
        let mut m = ExtentMap::new();
        for i in 0..20u64 {
            if i % 3 != 1 {
                m.insert(i * 4, i * 4, 4, Tag::Device);
            }
        }
        let extents: Vec<Extent> = m.iter().collect();
        for w in extents.windows(2) {
            assert_eq!(compare(&w[0], &w[1]), Relation::Before);
        }
    }

    #[test]
    fn remove_splits_containing_entry() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Device);
        m.remove(3, 3, 4); // remove middle [3,7) -> residuals [0,3) and [7,10)
        assert_eq!(collect(&m), vec![(0, 0, 3), (7, 7, 3)]);
    }

    #[test]
    fn remove_whole_entry_drops_it() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Device);
        m.remove(0, 0, 10);
        assert!(m.is_empty());
    }

    #[test]
    fn remove_then_reinsert_is_identity() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Device);
        let before = collect(&m);
        m.remove(3, 3, 4);
        m.insert(3, 3, 4, Tag::Device);
        assert_eq!(collect(&m), before);
    }

    #[test]
    fn remove_front_shrinks_from_low_end() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Device);
        let k = m.remove_front(0, 4).unwrap();
        assert_eq!(k, 4);
        assert_eq!(collect(&m), vec![(4, 4, 6)]);
    }

    #[test]
    fn remove_front_whole_entry_returns_none() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Device);
        assert_eq!(m.remove_front(0, 10), None);
        assert!(m.is_empty());
    }

    #[test]
    fn intersect_all_all_both_mode_tag_follows_side1_even_when_iterating_side2() {
        // map1 (a) is the larger map, so intersect_all_all iterates map2 (b)
        // internally; the result must still carry a's tag for MatchMode::Both.
        let mut a = ExtentMap::new();
        a.insert(0, 0, 10, Tag::LoopFile);
        a.insert(100, 100, 10, Tag::LoopFile);
        let mut b = ExtentMap::new();
        b.insert(5, 5, 10, Tag::Device);

        let i = ExtentMap::intersect_all_all(&a, &b, MatchMode::Both);
        for extent in i.iter() {
            assert_eq!(extent.tag, Tag::LoopFile);
        }
    }

    #[test]
    fn complement_logical_covers_gaps_between_destinations() {
        use crate::extent::Extent as E;
        let mut v = ExtentVector::new();
        v.push(E::new(0, 2, 3, Tag::LoopFile));
        v.push(E::new(100, 8, 1, Tag::LoopFile));
        let c = ExtentMap::complement0_logical_shift(&v, 0, 20);
        assert_eq!(collect(&c), vec![(0, 0, 2), (5, 5, 3), (9, 9, 11)]);
    }

    #[test]
    fn intersect_all_all_both_mode() {
        let mut a = ExtentMap::new();
        a.insert(0, 0, 10, Tag::Device);
        let mut b = ExtentMap::new();
        b.insert(5, 5, 10, Tag::Device);
        let i = ExtentMap::intersect_all_all(&a, &b, MatchMode::Both);
        assert_eq!(collect(&i), vec![(5, 5, 5)]);
    }

    #[test]
    fn intersect_all_all_is_subset_of_both_inputs() {
        let mut a = ExtentMap::new();
        a.insert(0, 100, 10, Tag::Device);
        a.insert(20, 120, 10, Tag::Device);
        let mut b = ExtentMap::new();
        b.insert(5, 5, 20, Tag::LoopFile);
        let i = ExtentMap::intersect_all_all(&a, &b, MatchMode::Physical1);
        assert!(i.total_length() <= a.total_length().min(b.total_length()));
        for extent in i.iter() {
            assert!(a.overlapping(extent.physical, extent.physical_end()).count() > 0);
            assert!(b.overlapping(extent.physical, extent.physical_end()).count() > 0);
        }
    }

    #[test]
    fn remove_all_leaves_no_overlap() {
        let mut a = ExtentMap::new();
        a.insert(0, 0, 20, Tag::Device);
        let mut b = ExtentMap::new();
        b.insert(5, 5, 5, Tag::Device);
        b.insert(15, 15, 2, Tag::Device);
        a.remove_all(&b);
        let overlap = ExtentMap::intersect_all_all(&a, &b, MatchMode::Both);
        assert!(overlap.is_empty());
    }

    #[test]
    fn complement_of_empty_vector_is_whole_device() {
        let v = ExtentVector::new();
        let c = ExtentMap::complement0_physical_shift(&v, 0, 10);
        assert_eq!(collect(&c), vec![(0, 0, 10)]);
    }

    #[test]
    fn complement_total_length_matches_device_minus_used() {
        use crate::extent::Extent as E;
        let mut v = ExtentVector::new();
        v.push(E::new(2, 2, 3, Tag::LoopFile));
        v.push(E::new(8, 8, 1, Tag::LoopFile));
        let c = ExtentMap::complement0_physical_shift(&v, 0, 20);
        assert_eq!(c.total_length(), 20 - 4);
        for hole in c.iter() {
            for used in v.iter() {
                assert!(hole.physical_end() <= used.physical || hole.physical >= used.physical_end());
            }
        }
    }

    #[test]
    fn transpose_swaps_physical_and_logical() {
        let mut m = ExtentMap::new();
        m.insert(0, 5, 3, Tag::Device);
        let t = m.transpose();
        assert_eq!(collect(&t), vec![(5, 0, 3)]);
    }
}
