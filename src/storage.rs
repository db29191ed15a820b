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

//! Storage planner (spec §4.4, component C6): decides how much scratch
//! storage the scheduler gets to work with, and where it comes from — a
//! prefix of the analyzer's primary storage candidates, topped up by a
//! secondary storage file when the device doesn't have enough invariant
//! free space of its own.

use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::vector::ExtentVector;

const MIB: u64 = 1 << 20;

/// User-specified scratch budget, in blocks (already divided by `B`), or
/// "let the planner decide".
#[derive(Debug, Clone, Copy)]
pub enum ScratchBudget {
    Auto,
    Fixed(u64),
}

/// What the planner decided: a prefix of the device's own free space to use
/// as primary storage, plus the length of a secondary storage file to
/// request from the I/O backend (spec §3's "secondary storage descriptor").
#[derive(Debug, Clone)]
pub struct StoragePlan {
    pub primary_extents: ExtentVector,
    pub secondary_length: u64,
}

impl StoragePlan {
    pub fn primary_length(&self) -> u64 {
        self.primary_extents.total_length()
    }
}

/// Plans scratch storage given the host's page size and a notion of
/// "addressable memory" (the width of the process's virtual address space,
/// used to cap mmap windows at a quarter of that space per spec §5).
pub struct StoragePlanner {
    page_size_bytes: u64,
    free_ram_bytes: u64,
    addressable_memory_bytes: u64,
}

impl StoragePlanner {
    pub fn new(page_size_bytes: u64, free_ram_bytes: u64, addressable_memory_bytes: u64) -> Self {
        StoragePlanner {
            page_size_bytes,
            free_ram_bytes,
            addressable_memory_bytes,
        }
    }

    /// Implements the `plan_storage(work_count, primary_storage_pool)`
    /// contract of spec §4.4. `block_size_bytes` converts the block-counted
    /// `work_count`/pool lengths back to bytes for the RAM/page-size math,
    /// which is natively byte-denominated.
    pub fn plan(
        &self,
        budget: ScratchBudget,
        work_count_blocks: u64,
        block_size_bytes: u64,
        primary_storage_pool: &ExtentVector,
    ) -> Result<StoragePlan> {
        let quarter_addressable = self.addressable_memory_bytes / 4;
        let page = self.page_size_bytes.max(1);

        let scratch_total_bytes = match budget {
            ScratchBudget::Fixed(blocks) => round_up(blocks.saturating_mul(block_size_bytes), MIB),
            ScratchBudget::Auto => {
                let ram_share = (self.free_ram_bytes / 3).max(16 * MIB);
                let work_share = work_count_blocks
                    .saturating_mul(block_size_bytes)
                    .saturating_div(10);
                round_up(ram_share.min(work_share.max(1)), MIB)
            }
        };

        let primary_extents = take_prefix_up_to(primary_storage_pool, quarter_addressable, page, block_size_bytes)?;
        let primary_length_bytes = primary_extents.total_length().saturating_mul(block_size_bytes);

        let secondary_length_bytes = if scratch_total_bytes <= primary_length_bytes {
            0
        } else {
            let raw = round_up(scratch_total_bytes - primary_length_bytes, page);
            raw.min(quarter_addressable).min(i64::MAX as u64)
        };

        Ok(StoragePlan {
            primary_extents,
            secondary_length: secondary_length_bytes,
        })
    }
}

/// Walk `pool` in order, taking whole extents (never splitting one) while the
/// running total stays within `cap_bytes`, after rounding `pool`'s total down
/// to page size per spec §4.4 ("align primary_storage_pool's total length
/// down to page size; cap to addressable_memory / 4").
fn take_prefix_up_to(pool: &ExtentVector, cap_bytes: u64, page_bytes: u64, block_size_bytes: u64) -> Result<ExtentVector> {
    if block_size_bytes == 0 {
        return Err(EngineError::new(ErrorKind::Internal, "block size must be nonzero"));
    }
    let cap_blocks = round_down(cap_bytes, page_bytes.max(1)) / block_size_bytes;

    let mut out = ExtentVector::new();
    let mut taken = 0u64;
    for e in pool.iter() {
        if taken >= cap_blocks {
            break;
        }
        let remaining = cap_blocks - taken;
        if e.length <= remaining {
            out.push(*e);
            taken += e.length;
        } else if remaining > 0 {
            out.push(Extent::new(e.physical, e.logical, remaining, Tag::Storage));
            taken += remaining;
        }
    }
    Ok(out)
}

fn round_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    (value + align - 1) / align * align
}

fn round_down(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value / align * align
}

/// One contiguous piece of the flat scratch address space the scheduler
/// addresses (spec §4.5 treats primary + secondary storage "as a single
/// logical storage address space"): either a byte range carved out of the
/// device itself, or a byte range of the secondary storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSegment {
    pub in_primary: bool,
    /// Device physical byte offset (`in_primary`) or secondary-file byte
    /// offset (otherwise).
    pub real_offset: u64,
    pub length: u64,
}

/// Translates the scheduler's flat scratch addresses (`0..total_bytes()`)
/// into real locations: a prefix backed by [`StoragePlan::primary_extents`]
/// (carved from the device's own invariant free space), the remainder
/// backed by the secondary storage file. This is the piece of plumbing that
/// makes spec §2's "some in RAM, some carved out as on-device primary
/// storage, the rest in a secondary storage file" concrete for an I/O
/// backend: [`crate::io_backend::IoBackend`] implementations hold one of
/// these and call [`resolve`](StorageAddressSpace::resolve) before issuing
/// the underlying read/write for a `Dev2Storage`/`Storage2Dev` move.
#[derive(Debug, Clone, Default)]
pub struct StorageAddressSpace {
    /// `(device_physical_byte_offset, length_bytes)`, in the same order as
    /// the flat address space: the first segment starts at flat offset 0.
    primary_segments: Vec<(u64, u64)>,
    primary_total_bytes: u64,
    secondary_length_bytes: u64,
}

impl StorageAddressSpace {
    pub fn from_plan(plan: &StoragePlan, block_size_bytes: u64) -> Self {
        let primary_segments: Vec<(u64, u64)> = plan
            .primary_extents
            .iter()
            .map(|e| (e.physical * block_size_bytes, e.length * block_size_bytes))
            .collect();
        let primary_total_bytes = primary_segments.iter().map(|&(_, len)| len).sum();
        StorageAddressSpace {
            primary_segments,
            primary_total_bytes,
            secondary_length_bytes: plan.secondary_length,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.primary_total_bytes + self.secondary_length_bytes
    }

    /// Split `[offset, offset+length)` of the flat address space into the
    /// ordered sequence of real segments it touches. A single scheduler
    /// move can straddle a primary-segment boundary or the primary/
    /// secondary boundary; callers must issue one real I/O per returned
    /// piece, in order.
    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<StorageSegment>> {
        if offset.saturating_add(length) > self.total_bytes() {
            return Err(EngineError::new(
                ErrorKind::Internal,
                format!("storage address {offset}+{length} exceeds scratch capacity {}", self.total_bytes()),
            ));
        }

        let mut out = Vec::new();
        let mut cursor = offset;
        let mut remaining = length;
        let mut flat_base = 0u64;

        for &(real_offset, seg_len) in &self.primary_segments {
            if remaining == 0 {
                break;
            }
            let seg_start = flat_base;
            let seg_end = flat_base + seg_len;
            flat_base = seg_end;
            if cursor >= seg_end {
                continue;
            }
            let take_start = cursor.max(seg_start);
            let take_len = remaining.min(seg_end - take_start);
            out.push(StorageSegment {
                in_primary: true,
                real_offset: real_offset + (take_start - seg_start),
                length: take_len,
            });
            cursor += take_len;
            remaining -= take_len;
        }

        if remaining > 0 {
            let secondary_cursor = cursor - self.primary_total_bytes;
            out.push(StorageSegment {
                in_primary: false,
                real_offset: secondary_cursor,
                length: remaining,
            });
        }

        Ok(out)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn pool_of(extents: &[(u64, u64, u64)]) -> ExtentVector {
        let mut v = ExtentVector::new();
        for &(p, l, len) in extents {
            v.push(Extent::new(p, l, len, Tag::Storage));
        }
        v
    }

    #[test]
    fn fixed_budget_under_primary_needs_no_secondary() {
        let planner = StoragePlanner::new(4096, 64 * MIB, 1 << 34);
        let pool = pool_of(&[(0, 0, 1 << 20)]); // 1<<20 blocks * 1 byte/block = 1 MiB
        let plan = planner
            .plan(ScratchBudget::Fixed(1024), 100, 1, &pool)
            .unwrap();
        assert_eq!(plan.secondary_length, 0);
        assert!(plan.primary_length() > 0);
    }

    #[test]
    fn auto_budget_is_rounded_up_to_one_mebibyte() {
        let planner = StoragePlanner::new(4096, 3 * MIB, 1 << 34);
        let pool = ExtentVector::new();
        let plan = planner.plan(ScratchBudget::Auto, 1, 1, &pool).unwrap();
        // free_ram/3 == 1 MiB exactly; work_share is tiny, so scratch_total ==
        // max(16MiB, work_share) rounded to MiB == 16 MiB (ram_share floor).
        assert_eq!(plan.secondary_length % MIB, 0);
        assert!(plan.secondary_length >= MIB);
    }

    #[test]
    fn secondary_length_is_clamped_to_quarter_addressable_memory() {
        let planner = StoragePlanner::new(4096, u64::MAX / 2, 16 * MIB);
        let pool = ExtentVector::new();
        let plan = planner
            .plan(ScratchBudget::Fixed(u64::MAX / 1024), 0, 1, &pool)
            .unwrap();
        assert!(plan.secondary_length <= 4 * MIB);
    }

    #[test]
    fn primary_prefix_never_splits_an_extent_but_stops_at_the_cap() {
        let planner = StoragePlanner::new(1, 0, 20); // addressable/4 == 5 bytes == 5 blocks at block_size=1
        let pool = pool_of(&[(0, 0, 3), (10, 10, 3)]);
        let plan = planner.plan(ScratchBudget::Fixed(0), 0, 1, &pool).unwrap();
        let got: Vec<_> = plan.primary_extents.iter().map(|e| e.length).collect();
        assert_eq!(got, vec![3, 2]);
    }
}
