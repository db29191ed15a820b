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

//! Analyzer (spec §4.3, component C5): turns raw loop-file and free-space
//! extent vectors plus a device length into a unified relocation map and a
//! set of primary-storage candidates, ready for the storage planner and
//! scheduler.

use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::map::{ExtentMap, MatchMode};
use crate::pool::BestFitPool;
use crate::vector::ExtentVector;

/// Everything the analyzer derives from one (loop-file, free-space,
/// device-length) triple.
pub struct AnalyzerOutput {
    pub eff_block_size_log2: u32,
    /// The unified relocation map: `Device`-tagged entries still carry old
    /// filesystem data that must move; `LoopFile`-tagged entries carry the
    /// target filesystem's payload that must move. Empty iff no work
    /// remains (spec §3's "Relocation map").
    pub relocation_map: ExtentMap,
    /// Aligned, disjoint, invariant-free regions of the device usable as
    /// primary (in-device) scratch storage, already filtered by the
    /// size/alignment threshold (spec §4.3 step 8).
    pub primary_storage_candidates: ExtentVector,
    pub work_count: u64,
    /// The device's free-space extents, shifted to block units but
    /// otherwise as discovered (i.e. before the invariant-hole bookkeeping
    /// in steps 5 and 8 consumes parts of it). Used by `--x-clear=all` to
    /// zero every free block once relocation is done (spec §6's `x-clear`
    /// option); not otherwise consumed by the core pipeline.
    pub free_space_map: ExtentMap,
}

/// Drives one run of the analysis pipeline. `force` demotes alignment
/// sanity-check failures to warnings (spec §4.5's force-mode rule, spec §8
/// scenario S5); `page_size_bytes` is the host's page size, used to size and
/// align primary-storage candidates.
pub struct Analyzer {
    force: bool,
    page_size_bytes: u64,
}

impl Analyzer {
    pub fn new(force: bool, page_size_bytes: u64) -> Self {
        Analyzer {
            force,
            page_size_bytes,
        }
    }

    pub fn analyze(&self, loop_vec: &ExtentVector, free_vec: &ExtentVector, dev_length: u128) -> Result<AnalyzerOutput> {
        let dev_length = checked_dev_length(dev_length)?;
        let eff_block_size_log2 = derive_block_size_log2(loop_vec, free_vec);
        self.check_alignment(dev_length, eff_block_size_log2)?;

        let loop_map = self.build_shifted_map(loop_vec, eff_block_size_log2, Tag::LoopFile)?;
        let free_map = self.build_shifted_map(free_vec, eff_block_size_log2, Tag::Default)?;

        let mut union_vec = ExtentVector::with_capacity(loop_vec.len() + free_vec.len());
        for e in loop_vec.iter().chain(free_vec.iter()) {
            union_vec.push(*e);
        }
        union_vec.sort_by_physical();
        check_no_overlap(&union_vec)?;

        let mut dev_map = ExtentMap::complement0_physical_shift(&union_vec, eff_block_size_log2, dev_length);
        dev_map.retag(Tag::Device);

        let mut loop_holes_map = ExtentMap::complement0_logical_shift(loop_vec, eff_block_size_log2, dev_length);

        // 5a. Device blocks whose current physical address happens to also
        // be a free logical destination: already home, no work needed.
        let invariant_dev = ExtentMap::intersect_all_all(&dev_map, &loop_holes_map, MatchMode::Both);
        dev_map.remove_all(&invariant_dev);
        loop_holes_map.remove_all(&invariant_dev);

        // 5b. Spread the remaining device extents across the remaining
        // holes with best-fit allocation.
        let mut pool = BestFitPool::from_map(&loop_holes_map);
        let (renumbered_dev, unsatisfied) = pool.allocate_all(&dev_map);
        if !unsatisfied.is_empty() {
            return Err(EngineError::new(
                ErrorKind::NoSpace,
                "not enough free destination slots to renumber every device extent",
            ));
        }
        let loop_holes_map = pool.into_remaining_map();

        // 6. Loop-file invariants: already-placed entries drop out.
        let mut loop_map = loop_map;
        let invariant_loop: Vec<Extent> = loop_map.iter().filter(|e| e.physical == e.logical).collect();
        for e in &invariant_loop {
            loop_map.remove_extent(e);
        }

        // 7. Unified relocation map.
        let mut relocation_map = loop_map;
        for e in renumbered_dev.iter() {
            relocation_map.insert(e.physical, e.logical, e.length, Tag::Device);
        }
        let work_count = relocation_map.total_length();

        // 8. Primary storage candidates.
        let primary_storage_candidates =
            self.primary_storage_candidates(&free_map, &loop_holes_map, eff_block_size_log2, work_count);

        Ok(AnalyzerOutput {
            eff_block_size_log2,
            relocation_map,
            primary_storage_candidates,
            work_count,
            free_space_map: free_map,
        })
    }

    /// Shift every extent of `vec` right by `shift` and insert it into a
    /// fresh map tagged `tag`. Free-space extents (`Tag::Default`) get their
    /// `logical` reset to `physical`, per spec §4.3 step 3 ("we must
    /// manually set ->logical = ->physical for all free_space_extents" — the
    /// discovery backend may have reported some other value there, e.g. a
    /// zero-file's own logical addressing).
    fn build_shifted_map(&self, vec: &ExtentVector, shift: u32, tag: Tag) -> Result<ExtentMap> {
        let mut map = ExtentMap::new();
        for e in vec.iter() {
            let length = e.length >> shift;
            if length == 0 {
                if !self.force {
                    return Err(EngineError::new(
                        ErrorKind::InvalidInput,
                        format!("extent (physical={}, length={}) is smaller than the effective block size", e.physical, e.length),
                    ));
                }
                log::warn!(
                    "dropping sub-block extent physical={} length={} (force mode)",
                    e.physical,
                    e.length
                );
                continue;
            }
            let physical = e.physical >> shift;
            let logical = if tag == Tag::Default { physical } else { e.logical >> shift };
            map.insert(physical, logical, length, tag);
        }
        Ok(map)
    }

    fn check_alignment(&self, dev_length: u64, eff_block_size_log2: u32) -> Result<()> {
        if eff_block_size_log2 == 0 {
            return Ok(());
        }
        let block_size = 1u64 << eff_block_size_log2;
        if dev_length % block_size != 0 {
            if !self.force {
                return Err(EngineError::new(
                    ErrorKind::InvalidInput,
                    format!("device length {dev_length} is not a multiple of the effective block size {block_size}"),
                ));
            }
            log::warn!(
                "device length {dev_length} is not a multiple of the effective block size {block_size} (force mode, truncating)"
            );
        }
        Ok(())
    }

    fn primary_storage_candidates(
        &self,
        free_map: &ExtentMap,
        loop_holes_map: &ExtentMap,
        eff_block_size_log2: u32,
        work_count: u64,
    ) -> ExtentVector {
        let candidates = ExtentMap::intersect_all_all(free_map, loop_holes_map, MatchMode::Both);

        let page_size_blocks = (self.page_size_bytes >> eff_block_size_log2).max(1);
        let threshold = (work_count / 1024)
            .max(page_size_blocks)
            .min(page_size_blocks.saturating_mul(4096));

        let mut out = ExtentVector::new();
        for e in candidates.iter() {
            if e.length < threshold {
                continue;
            }
            let aligned_physical = round_up(e.physical, page_size_blocks);
            let aligned_end = round_down(e.physical_end(), page_size_blocks);
            if aligned_end <= aligned_physical {
                continue;
            }
            let length = aligned_end - aligned_physical;
            if length < threshold {
                continue;
            }
            out.push(Extent::new(aligned_physical, aligned_physical, length, Tag::Storage));
        }
        out
    }
}

fn checked_dev_length(dev_length: u128) -> Result<u64> {
    u64::try_from(dev_length).map_err(|_| EngineError::new(ErrorKind::Overflow, format!("device length {dev_length} does not fit in 64 bits")))
}

/// Effective block size is derived from the extents alone, not from the
/// device length: folding `dev_length` into the same bitmask would make the
/// derived block size always divide it by construction (it's one of the
/// OR'd terms), which would make the alignment check in
/// [`Analyzer::check_alignment`] unfailable. Keeping the two separate lets
/// that check catch a genuinely inconsistent (device length, block size)
/// pair, which is what it exists for.
fn derive_block_size_log2(loop_vec: &ExtentVector, free_vec: &ExtentVector) -> u32 {
    let mut mask = 0u64;
    for e in loop_vec.iter().chain(free_vec.iter()) {
        mask |= e.physical | e.logical | e.length;
    }
    if mask == 0 {
        0
    } else {
        mask.trailing_zeros()
    }
}

fn check_no_overlap(vec: &ExtentVector) -> Result<()> {
    let mut last_end: Option<u64> = None;
    for e in vec.iter() {
        if let Some(end) = last_end {
            if e.physical < end {
                return Err(EngineError::new(
                    ErrorKind::InvalidInput,
                    "loop-file and free-space extents overlap physically",
                ));
            }
        }
        last_end = Some(e.physical_end());
    }
    Ok(())
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn round_down(value: u64, align: u64) -> u64 {
    value / align * align
}
