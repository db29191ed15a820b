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

//! Extent algebra (spec §4.1, component C1).
//!
//! An [`Extent`] is the immutable-shape quintuple `(physical, logical,
//! length, tag)`: `length` consecutive blocks starting at physical block
//! `physical`, carrying logical block addresses `[logical, logical+length)`.
//! All quantities are in units of the effective block size `B`.

use std::cmp::{max, min};

/// Identifies who owns the data currently occupying an extent's physical
/// range: the old filesystem's device blocks, the target loop-file's
/// payload, the zero-file used to probe free space, blocks parked in
/// scratch storage, or an uninterpreted default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Device,
    LoopFile,
    ZeroFile,
    Storage,
    Default,
}

/// A contiguous run of `length` blocks at physical block offset `physical`,
/// holding logical block addresses `[logical, logical+length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub physical: u64,
    pub logical: u64,
    pub length: u64,
    pub tag: Tag,
}

impl Extent {
    pub fn new(physical: u64, logical: u64, length: u64, tag: Tag) -> Self {
        debug_assert!(length > 0, "extent length must be positive");
        Extent {
            physical,
            logical,
            length,
            tag,
        }
    }

    pub fn physical_end(&self) -> u64 {
        self.physical + self.length
    }

    pub fn logical_end(&self) -> u64 {
        self.logical + self.length
    }
}

/// Relative position of two extents along the physical axis, combined with
/// a logical-continuity and tag-equality check (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Disjoint, or touching but not mergeable (logical or tag mismatch).
    Before,
    /// Contiguous in both physical and logical, same tag: mergeable.
    TouchBefore,
    /// Overlap by at least one block.
    Intersect,
    /// Symmetric of `TouchBefore`.
    TouchAfter,
    /// Symmetric of `Before`.
    After,
}

/// Classify the relation of `e1` to `e2` on the physical axis.
///
/// Mirrors `ft_map<T>::compare()` in the original engine: two extents merge
/// (`TouchBefore`/`TouchAfter`) only when they are physically contiguous,
/// logically contiguous in the same direction, and share a tag.
pub fn compare(e1: &Extent, e2: &Extent) -> Relation {
    let (p1, l1, len1, t1) = (e1.physical, e1.logical, e1.length, e1.tag);
    let (p2, l2, len2, t2) = (e2.physical, e2.logical, e2.length, e2.tag);

    if p1 < p2 {
        if p1 + len1 == p2 && l1 + len1 == l2 && t1 == t2 {
            Relation::TouchBefore
        } else if p1 + len1 <= p2 {
            Relation::Before
        } else {
            Relation::Intersect
        }
    } else if p1 == p2 {
        Relation::Intersect
    } else if p1 == p2 + len2 && l1 == l2 + len2 && t1 == t2 {
        Relation::TouchAfter
    } else if p2 + len2 <= p1 {
        Relation::After
    } else {
        Relation::Intersect
    }
}

/// Physical overlap of `e1` and `e2`, or `None` if they don't intersect.
///
/// `logical` of the result is taken from side 1 (`physical1_side = true`) or
/// side 2; callers pass the side whose logical addressing they want
/// preserved for the overlap range. This is the single-extent primitive
/// behind [`crate::map::ExtentMap::intersect_all_all`]'s `Physical1`/
/// `Physical2` match modes.
pub fn intersect_physical(e1: &Extent, e2: &Extent, take_logical_from_1: bool, tag: Tag) -> Option<Extent> {
    let (p1, l1, end1) = (e1.physical, e1.logical, e1.physical_end());
    let (p2, l2, end2) = (e2.physical, e2.logical, e2.physical_end());
    if end1 > p2 && p1 < end2 {
        let physical = max(p1, p2);
        let logical = if take_logical_from_1 {
            l1 + (physical - p1)
        } else {
            l2 + (physical - p2)
        };
        let length = min(end1, end2) - physical;
        Some(Extent::new(physical, logical, length, tag))
    } else {
        None
    }
}

/// Overlap of `e1` and `e2` on *both* axes simultaneously: the physical
/// ranges must overlap and the logical offset must track the physical
/// offset identically on both sides (`logical2 - logical1 == physical2 -
/// physical1`).
pub fn intersect_both(e1: &Extent, e2: &Extent, tag: Tag) -> Option<Extent> {
    let (p1, l1, end1) = (e1.physical, e1.logical, e1.physical_end());
    let (p2, l2, end2) = (e2.physical, e2.logical, e2.physical_end());
    if end1 > p2 && p1 < end2 && (l2 as i128 - l1 as i128) == (p2 as i128 - p1 as i128) {
        let physical = max(p1, p2);
        let logical = max(l1, l2);
        let length = min(end1, end2) - physical;
        Some(Extent::new(physical, logical, length, tag))
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn e(p: u64, l: u64, len: u64) -> Extent {
        Extent::new(p, l, len, Tag::Device)
    }

    #[test]
    fn touch_before_requires_same_tag() {
        let a = e(0, 0, 2);
        let mut b = e(2, 2, 2);
        assert_eq!(compare(&a, &b), Relation::TouchBefore);
        b.tag = Tag::LoopFile;
        assert_eq!(compare(&a, &b), Relation::Before);
    }

    #[test]
    fn touch_before_requires_logical_continuity() {
        let a = e(0, 0, 2);
        let b = e(2, 5, 2);
        assert_eq!(compare(&a, &b), Relation::Before);
    }

    #[test]
    fn disjoint_is_before_or_after() {
        let a = e(0, 0, 2);
        let b = e(10, 10, 2);
        assert_eq!(compare(&a, &b), Relation::Before);
        assert_eq!(compare(&b, &a), Relation::After);
    }

    #[test]
    fn overlap_is_intersect() {
        let a = e(0, 0, 4);
        let b = e(2, 2, 4);
        assert_eq!(compare(&a, &b), Relation::Intersect);
    }

    #[test]
    fn intersect_physical_takes_requested_side_logical() {
        let a = Extent::new(0, 100, 10, Tag::Device);
        let b = Extent::new(5, 200, 10, Tag::LoopFile);
        let overlap = intersect_physical(&a, &b, true, Tag::Device).unwrap();
        assert_eq!(overlap.physical, 5);
        assert_eq!(overlap.logical, 105);
        assert_eq!(overlap.length, 5);

        let overlap2 = intersect_physical(&a, &b, false, Tag::LoopFile).unwrap();
        assert_eq!(overlap2.logical, 200);
    }

    #[test]
    fn intersect_both_requires_aligned_axes() {
        let a = Extent::new(0, 0, 10, Tag::Device);
        let b = Extent::new(5, 5, 10, Tag::Device);
        let overlap = intersect_both(&a, &b, Tag::Device).unwrap();
        assert_eq!((overlap.physical, overlap.logical, overlap.length), (5, 5, 5));

        let c = Extent::new(5, 50, 10, Tag::Device);
        assert!(intersect_both(&a, &c, Tag::Device).is_none());
    }
}
