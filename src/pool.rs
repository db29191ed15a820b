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

//! Best-fit allocation pool (spec §4.2, component C4).
//!
//! Wraps a map of free extents ("holes") ordered by length, and hands them
//! out to satisfy allocation requests with the smallest hole that still
//! fits, splitting off the unused remainder. Used by the analyzer to
//! renumber the extents it cannot place directly at their own physical
//! offset (spec §4.4's "spread the remaining logical numbers across the
//! rest of the holes").

use std::collections::BTreeMap;

use crate::extent::{Extent, Tag};
use crate::map::ExtentMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    logical: u64,
    tag: Tag,
}

/// A pool of free extents, indexed by `(length, physical)` so the smallest
/// sufficiently large hole can be found with a single range query.
pub struct BestFitPool {
    by_length: BTreeMap<(u64, u64), Hole>,
}

impl BestFitPool {
    pub fn from_map(map: &ExtentMap) -> Self {
        let mut by_length = BTreeMap::new();
        for extent in map.iter() {
            by_length.insert((extent.length, extent.physical), Hole {
                logical: extent.logical,
                tag: extent.tag,
            });
        }
        BestFitPool { by_length }
    }

    pub fn is_empty(&self) -> bool {
        self.by_length.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.by_length.keys().map(|&(len, _)| len).sum()
    }

    /// Allocate exactly `length` blocks from the smallest hole that is at
    /// least that large, splitting off and keeping the remainder (taken
    /// from the high end, so the allocated piece keeps the hole's original
    /// `(physical, logical)` start). Returns `None` if no hole is large
    /// enough.
    pub fn allocate(&mut self, length: u64) -> Option<Extent> {
        let &(found_len, found_phys) = self
            .by_length
            .range((length, 0)..)
            .next()
            .map(|(k, _)| k)?;
        let hole = self.by_length.remove(&(found_len, found_phys)).unwrap();

        let allocated = Extent::new(found_phys, hole.logical, length, hole.tag);
        if found_len > length {
            self.by_length.insert(
                (found_len - length, found_phys + length),
                Hole {
                    logical: hole.logical + length,
                    tag: hole.tag,
                },
            );
        }
        Some(allocated)
    }

    /// Return this pool's remaining holes as an [`ExtentMap`], e.g. to
    /// replace the map it was built from once allocation is done.
    pub fn into_remaining_map(self) -> ExtentMap {
        let mut out = ExtentMap::new();
        for ((length, physical), hole) in self.by_length {
            out.insert(physical, hole.logical, length, hole.tag);
        }
        out
    }

    /// Try to satisfy every extent in `requests`, longest first (best-fit
    /// greedy: placing the largest requests while the most choices of hole
    /// size remain available). Each satisfied request keeps its own
    /// `physical` (its current, unmoved location) and is given the
    /// allocated hole's address as its new `logical` (its destination) —
    /// the renumbering the analyzer needs before these blocks can be
    /// scheduled for relocation. Requests that cannot be satisfied (pool
    /// exhausted) are returned separately so the caller can decide how to
    /// proceed (an unsatisfiable request means the device truly has no
    /// free space left for it, a `NoSpace` condition one level up).
    pub fn allocate_all(&mut self, requests: &ExtentMap) -> (ExtentMap, ExtentMap) {
        let mut allocated = Vec::from_iter(requests.iter());
        allocated.sort_by(|a, b| b.length.cmp(&a.length));

        let mut renumbered = ExtentMap::new();
        let mut unsatisfied = ExtentMap::new();

        for request in allocated {
            match self.allocate(request.length) {
                Some(hole) => {
                    renumbered.insert(request.physical, hole.physical, request.length, request.tag);
                }
                None => {
                    unsatisfied.insert(request.physical, request.logical, request.length, request.tag);
                }
            }
        }

        (renumbered, unsatisfied)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocate_picks_smallest_sufficient_hole() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Default);
        m.insert(100, 100, 3, Tag::Default);
        m.insert(200, 200, 5, Tag::Default);
        let mut pool = BestFitPool::from_map(&m);

        let got = pool.allocate(3).unwrap();
        assert_eq!(got.physical, 100);
        assert_eq!(got.length, 3);
    }

    #[test]
    fn allocate_splits_remainder_from_high_end() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 10, Tag::Default);
        let mut pool = BestFitPool::from_map(&m);

        let got = pool.allocate(4).unwrap();
        assert_eq!((got.physical, got.logical, got.length), (0, 0, 4));
        let remaining = pool.into_remaining_map();
        let rest: Vec<_> = remaining.iter().collect();
        assert_eq!(rest, vec![Extent::new(4, 4, 6, Tag::Default)]);
    }

    #[test]
    fn allocate_fails_when_no_hole_is_large_enough() {
        let mut m = ExtentMap::new();
        m.insert(0, 0, 2, Tag::Default);
        let mut pool = BestFitPool::from_map(&m);
        assert!(pool.allocate(5).is_none());
    }

    #[test]
    fn allocate_all_prefers_longest_requests_first() {
        let mut holes = ExtentMap::new();
        holes.insert(0, 0, 5, Tag::Default);
        holes.insert(100, 100, 5, Tag::Default);
        let mut pool = BestFitPool::from_map(&holes);

        let mut requests = ExtentMap::new();
        requests.insert(1000, 1000, 5, Tag::Device);
        requests.insert(2000, 2000, 5, Tag::Device);
        requests.insert(3000, 3000, 1, Tag::Device);

        let (renumbered, unsatisfied) = pool.allocate_all(&requests);
        assert_eq!(renumbered.total_length(), 10);
        assert_eq!(unsatisfied.total_length(), 1);
    }

    #[test]
    fn allocate_all_reports_unsatisfiable_requests() {
        let mut holes = ExtentMap::new();
        holes.insert(0, 0, 2, Tag::Default);
        let mut pool = BestFitPool::from_map(&holes);

        let mut requests = ExtentMap::new();
        requests.insert(1000, 1000, 10, Tag::Device);

        let (renumbered, unsatisfied) = pool.allocate_all(&requests);
        assert!(renumbered.is_empty());
        assert_eq!(unsatisfied.total_length(), 10);
    }
}
