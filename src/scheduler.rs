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

//! Relocation scheduler (spec §4.5, component C7): drains the unified
//! relocation map produced by the analyzer, issuing move requests through
//! the [`crate::io_backend::IoBackend`] until every block sits at its
//! destination.

use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::io_backend::{Direction, IoBackend};
use crate::map::ExtentMap;
use crate::pool::BestFitPool;

/// A single atomic move, in blocks (not yet shifted to bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub from_physical: u64,
    pub to_physical: u64,
    pub length: u64,
    pub direction: Direction,
}

/// Coalescing queue of pending move requests (spec §4.5's "Coalescence
/// rule"): two consecutive requests of the same direction fuse when one's
/// `(from+len, to+len)` equals the other's `(from, to)` in either order.
#[derive(Default)]
struct RequestQueue {
    pending: Vec<MoveRequest>,
}

impl RequestQueue {
    fn push(&mut self, request: MoveRequest) {
        if let Some(last) = self.pending.last_mut() {
            if last.direction == request.direction {
                if last.from_physical + last.length == request.from_physical && last.to_physical + last.length == request.to_physical {
                    last.length += request.length;
                    return;
                }
                if request.from_physical + request.length == last.from_physical && request.to_physical + request.length == last.to_physical
                {
                    last.from_physical = request.from_physical;
                    last.to_physical = request.to_physical;
                    last.length += request.length;
                    return;
                }
            }
        }
        self.pending.push(request);
    }

    fn drain(&mut self) -> Vec<MoveRequest> {
        std::mem::take(&mut self.pending)
    }
}

/// Drives one run of the relocation scheduler over a given block size and
/// scratch pool length (the storage planner's combined primary + secondary
/// budget, already flattened into a single logical address space by the
/// caller).
pub struct Scheduler {
    block_size_log2: u32,
    storage_capacity: u64,
}

impl Scheduler {
    pub fn new(block_size_log2: u32, storage_capacity: u64) -> Self {
        Scheduler {
            block_size_log2,
            storage_capacity,
        }
    }

    /// Execute `relocation_map` to completion against `backend`, flushing in
    /// coalesced batches. Consumes the map; returns the number of blocks
    /// moved. Fails with [`ErrorKind::NoSpace`] if scratch is exhausted and
    /// no `STORAGE2DEV` move can free any of it (spec §4.5's termination
    /// guarantee).
    pub fn run(&self, mut relocation_map: ExtentMap, backend: &mut dyn IoBackend) -> Result<u64> {
        let mut storage_map = ExtentMap::new();
        let mut storage_free = initial_storage_free(self.storage_capacity);
        let mut queue = RequestQueue::default();
        let mut moved = 0u64;

        while !relocation_map.is_empty() {
            let next = relocation_map.first().expect("checked non-empty above");
            let dest_lo = next.logical;
            let dest_hi = next.logical + next.length;

            match first_conflict(&relocation_map, dest_lo, dest_hi, Some(next.physical)) {
                Some(conflict) => {
                    let overlap_start = conflict.physical.max(dest_lo);
                    let safe_len = overlap_start - dest_lo;
                    if safe_len > 0 {
                        self.issue_dev2dev(&mut relocation_map, &next, safe_len, &mut queue);
                        moved += safe_len;
                    } else {
                        self.evict(&mut relocation_map, &mut storage_map, &mut storage_free, &conflict, &mut queue)?;
                    }
                    moved += self.maybe_drain_storage(&relocation_map, &mut storage_map, &mut storage_free, &mut queue);
                    self.flush(&mut queue, backend)?;
                    continue;
                }
                None => {
                    self.issue_dev2dev(&mut relocation_map, &next, next.length, &mut queue);
                    moved += next.length;
                }
            }

            moved += self.maybe_drain_storage(&relocation_map, &mut storage_map, &mut storage_free, &mut queue);
            self.flush(&mut queue, backend)?;
        }

        self.flush(&mut queue, backend)?;
        if !storage_map.is_empty() {
            return Err(EngineError::new(
                ErrorKind::Internal,
                "relocation finished with blocks still parked in scratch storage",
            ));
        }
        Ok(moved)
    }

    /// Queue a move of the first `length` blocks of `entry` from its current
    /// physical position to its logical destination, shrinking `entry` out
    /// of `relocation_map` from the front. Does not touch the backend: the
    /// actual I/O happens once, coalesced, in [`Scheduler::flush`].
    fn issue_dev2dev(&self, relocation_map: &mut ExtentMap, entry: &Extent, length: u64, queue: &mut RequestQueue) {
        let shift = self.block_size_log2;
        queue.push(MoveRequest {
            from_physical: entry.physical << shift,
            to_physical: entry.logical << shift,
            length: length << shift,
            direction: Direction::Dev2Dev,
        });
        relocation_map.remove_front(entry.physical, length);
    }

    /// Move (a prefix of) `occupant` out to scratch storage so the mover
    /// stuck behind it can proceed, per spec §4.5's eviction algorithm.
    /// Queues the move only; actual I/O happens in [`Scheduler::flush`].
    fn evict(
        &self,
        relocation_map: &mut ExtentMap,
        storage_map: &mut ExtentMap,
        storage_free: &mut ExtentMap,
        occupant: &Extent,
        queue: &mut RequestQueue,
    ) -> Result<()> {
        let largest_hole = storage_free.iter().map(|e| e.length).max().unwrap_or(0);
        if largest_hole == 0 {
            return Err(EngineError::new(
                ErrorKind::NoSpace,
                "scratch storage exhausted and no eviction is possible",
            ));
        }
        let move_len = occupant.length.min(largest_hole);
        let shift = self.block_size_log2;

        let mut pool = BestFitPool::from_map(storage_free);
        let slot = pool.allocate(move_len).expect("largest_hole already bounds move_len");
        *storage_free = pool.into_remaining_map();

        queue.push(MoveRequest {
            from_physical: occupant.physical << shift,
            to_physical: slot.physical << shift,
            length: move_len << shift,
            direction: Direction::Dev2Storage,
        });

        storage_map.insert(slot.physical, occupant.logical, move_len, Tag::Storage);
        relocation_map.remove_front(occupant.physical, move_len);
        Ok(())
    }

    /// After freeing destination space, queue a flush of any storage-parked
    /// extent whose entire destination range is now vacant back to the
    /// device, releasing its scratch slot back to `storage_free`.
    fn maybe_drain_storage(
        &self,
        relocation_map: &ExtentMap,
        storage_map: &mut ExtentMap,
        storage_free: &mut ExtentMap,
        queue: &mut RequestQueue,
    ) -> u64 {
        let shift = self.block_size_log2;
        let drainable: Vec<Extent> = storage_map
            .iter()
            .filter(|s| first_conflict(relocation_map, s.logical, s.logical + s.length, None).is_none())
            .collect();

        let mut drained = 0u64;
        for slot in drainable {
            queue.push(MoveRequest {
                from_physical: slot.physical << shift,
                to_physical: slot.logical << shift,
                length: slot.length << shift,
                direction: Direction::Storage2Dev,
            });
            storage_map.remove_extent(&slot);
            storage_free.insert(slot.physical, slot.physical, slot.length, Tag::Default);
            drained += slot.length;
        }
        drained
    }

    /// Replay the drained, coalesced requests through the backend and flush
    /// them as a batch (spec §4.5's "Coalescence rule").
    fn flush(&self, queue: &mut RequestQueue, backend: &mut dyn IoBackend) -> Result<()> {
        let drained = queue.drain();
        if drained.is_empty() {
            return Ok(());
        }
        for request in &drained {
            backend.copy_bytes(request.from_physical, request.to_physical, request.length, request.direction)?;
        }
        backend.flush_bytes()
    }
}

/// The flat scratch address space `[0, capacity)`, entirely free at the
/// start of a run.
fn initial_storage_free(capacity: u64) -> ExtentMap {
    let mut map = ExtentMap::new();
    if capacity > 0 {
        map.insert(0, 0, capacity, Tag::Default);
    }
    map
}

/// Find the lowest-physical entry in `map`, if any, whose physical range
/// intersects the destination range `[lo, hi)` — "who currently occupies
/// this slice of my target" — excluding `exclude_physical` (a mover's own
/// current position, which can otherwise overlap its own destination range).
/// Backed by `ExtentMap`'s range query (spec §9), not a full scan.
fn first_conflict(map: &ExtentMap, lo: u64, hi: u64, exclude_physical: Option<u64>) -> Option<Extent> {
    map.overlapping(lo, hi).find(|e| Some(e.physical) != exclude_physical)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io_backend::NullIoBackend;

    #[test]
    fn direct_move_with_vacant_destination_completes_without_storage() {
        let mut map = ExtentMap::new();
        map.insert(4, 0, 4, Tag::LoopFile);

        let scheduler = Scheduler::new(0, 16);
        let mut backend = NullIoBackend::new(0, 16);
        let moved = scheduler.run(map, &mut backend).unwrap();
        assert_eq!(moved, 4);
    }

    #[test]
    fn eviction_path_drains_storage_back_once_the_destination_is_freed() {
        // E at phys 4 wants dest 0; F at phys 0 wants dest 4: classic swap,
        // F must be evicted to storage before E can land, then flushed back.
        let mut map = ExtentMap::new();
        map.insert(4, 0, 2, Tag::LoopFile);
        map.insert(0, 4, 2, Tag::Device);

        let scheduler = Scheduler::new(0, 16);
        let mut backend = NullIoBackend::new(0, 16);
        let moved = scheduler.run(map, &mut backend).unwrap();
        assert_eq!(moved, 4);
    }

    #[test]
    fn exhausted_storage_with_no_drain_fails_with_no_space() {
        let mut map = ExtentMap::new();
        map.insert(4, 0, 2, Tag::LoopFile);
        map.insert(0, 4, 2, Tag::Device);
        map.insert(10, 6, 2, Tag::Device);

        let scheduler = Scheduler::new(0, 0);
        let mut backend = NullIoBackend::new(0, 16);
        let err = scheduler.run(map, &mut backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn request_queue_coalesces_contiguous_same_direction_moves() {
        let mut q = RequestQueue::default();
        q.push(MoveRequest { from_physical: 0, to_physical: 100, length: 4, direction: Direction::Dev2Dev });
        q.push(MoveRequest { from_physical: 4, to_physical: 104, length: 4, direction: Direction::Dev2Dev });
        assert_eq!(q.pending.len(), 1);
        assert_eq!(q.pending[0].length, 8);
    }

    #[test]
    fn request_queue_does_not_fuse_across_direction_change() {
        let mut q = RequestQueue::default();
        q.push(MoveRequest { from_physical: 0, to_physical: 100, length: 4, direction: Direction::Dev2Dev });
        q.push(MoveRequest { from_physical: 4, to_physical: 104, length: 4, direction: Direction::Dev2Storage });
        assert_eq!(q.pending.len(), 2);
    }
}
