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

//! Extent vector (spec §4, component C2): an insertion-ordered sequence of
//! extents, used for ingesting raw extent-discovery output before it is
//! folded into an [`crate::map::ExtentMap`].

use crate::extent::{compare, Extent, Relation};

#[derive(Debug, Clone, Default)]
pub struct ExtentVector {
    extents: Vec<Extent>,
}

impl ExtentVector {
    pub fn new() -> Self {
        ExtentVector { extents: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ExtentVector {
            extents: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn push(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    pub fn total_length(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// Append `extent`, merging it into the previous entry if they touch
    /// exactly on both physical and logical axes with the same tag (the
    /// vector equivalent of `ft_map::append0` immediately followed by a
    /// merge check, used when ingesting extents that are already sorted and
    /// likely to be contiguous, e.g. straight off a FIEMAP walk).
    pub fn append_with_merge(&mut self, extent: Extent) {
        if let Some(last) = self.extents.last_mut() {
            if compare(last, &extent) == Relation::TouchBefore {
                last.length += extent.length;
                return;
            }
        }
        self.extents.push(extent);
    }

    pub fn sort_by_physical(&mut self) {
        self.extents.sort_by_key(|e| e.physical);
    }

    pub fn sort_by_logical(&mut self) {
        self.extents.sort_by_key(|e| e.logical);
    }

    /// Sort with the longest extents first, used by the best-fit pool (C4)
    /// and by the scheduler's "prefer long extents" lookahead (§4.5).
    pub fn sort_by_length_desc(&mut self) {
        self.extents.sort_by(|a, b| b.length.cmp(&a.length));
    }

    pub fn into_vec(self) -> Vec<Extent> {
        self.extents
    }
}

impl IntoIterator for ExtentVector {
    type Item = Extent;
    type IntoIter = std::vec::IntoIter<Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.into_iter()
    }
}

impl FromIterator<Extent> for ExtentVector {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        ExtentVector {
            extents: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extent::Tag;

    #[test]
    fn append_with_merge_coalesces_touching_extents() {
        let mut v = ExtentVector::new();
        v.append_with_merge(Extent::new(0, 0, 5, Tag::Device));
        v.append_with_merge(Extent::new(5, 5, 5, Tag::Device));
        assert_eq!(v.len(), 1);
        assert_eq!(v.as_slice()[0].length, 10);
    }

    #[test]
    fn append_with_merge_keeps_disjoint_extents_separate() {
        let mut v = ExtentVector::new();
        v.append_with_merge(Extent::new(0, 0, 5, Tag::Device));
        v.append_with_merge(Extent::new(10, 10, 5, Tag::Device));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn sort_by_length_desc_orders_longest_first() {
        let mut v = ExtentVector::new();
        v.push(Extent::new(0, 0, 2, Tag::Device));
        v.push(Extent::new(10, 10, 8, Tag::Device));
        v.push(Extent::new(20, 20, 4, Tag::Device));
        v.sort_by_length_desc();
        let lens: Vec<u64> = v.iter().map(|e| e.length).collect();
        assert_eq!(lens, vec![8, 4, 2]);
    }
}
