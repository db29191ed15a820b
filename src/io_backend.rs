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

//! I/O backend interface (spec §4.6, component C8): the abstract capability
//! the analyzer and scheduler consume to discover extents and move bytes.
//!
//! A real run uses [`PosixIoBackend`] against the actual device and loop
//! file. Tests use [`NullIoBackend`] (every copy is a no-op) or
//! [`TestIoBackend`] (extents come from in-memory vectors instead of a
//! FIEMAP walk), matching the original engine's `ft_io_null`/`ft_io_test`
//! split so the scheduler can be exercised headless.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, ErrorKind, Result};
use crate::storage::{StorageAddressSpace, StoragePlan};
use crate::vector::ExtentVector;

/// Direction of a single move request (spec §4.5's move-request quadruple).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Dev2Dev,
    Dev2Storage,
    Storage2Dev,
}

/// Raw extent-discovery output: the two vectors `read_extents()` returns,
/// plus the bitmask used to derive the effective block size (spec §4.3).
pub struct DiscoveredExtents {
    pub loop_file_extents: ExtentVector,
    pub free_space_extents: ExtentVector,
    pub block_size_bitmask: u64,
}

/// Abstract capability consumed by the analyzer and scheduler (spec §4.6).
/// All offsets and lengths here are in bytes; callers are responsible for
/// the block-size shift.
pub trait IoBackend {
    fn effective_block_size_log2(&self) -> u32;

    fn device_length_bytes(&self) -> u64;

    /// Populate the two extent vectors and the block-size bitmask. May fail
    /// with [`ErrorKind::NotConnected`] if the backend has not been opened.
    fn read_extents(&mut self) -> Result<DiscoveredExtents>;

    /// Materialize secondary storage of `length` bytes, pre-allocated with
    /// zeros. Must reset any partial file on failure.
    fn create_storage(&mut self, length: u64) -> Result<()>;

    /// Tell the backend how the scheduler's flat scratch addresses (passed
    /// to `copy_bytes` for `Dev2Storage`/`Storage2Dev` moves) map onto real
    /// storage: a prefix backed by on-device primary extents, the rest by
    /// the secondary storage file `create_storage` materialized (spec §4.4's
    /// storage plan, spec §4.5's "primary and secondary treated as a single
    /// logical storage address space"). Backends that don't distinguish
    /// real storage locations (e.g. [`NullIoBackend`]) may ignore this.
    fn configure_storage(&mut self, _plan: &StoragePlan, _block_size_bytes: u64) -> Result<()> {
        Ok(())
    }

    /// Enqueue a copy of `length` bytes from `from` to `to`. Returns
    /// immediately; the copy is not guaranteed durable until `flush_bytes`.
    fn copy_bytes(&mut self, from: u64, to: u64, length: u64, dir: Direction) -> Result<()>;

    /// Zero-fill `[at, at+length)` of the device. Used by `--x-clear` once
    /// relocation is complete (spec §6); not part of the core relocation
    /// path. Default implementation is a no-op, suitable for backends that
    /// don't touch real bytes.
    fn zero_device_range(&mut self, _at: u64, _length: u64) -> Result<()> {
        Ok(())
    }

    /// Bytes currently queued for copying but not yet flushed.
    fn queued_bytes(&self) -> u64;

    /// Perform every queued copy. After this returns, `queued_bytes() == 0`
    /// and every previously enqueued byte is durable.
    fn flush_bytes(&mut self) -> Result<()>;
}

/// "Dummy" backend: every `copy_bytes` is a no-op that is immediately
/// considered flushed. Used by unit and property tests that only need to
/// drive the scheduler's bookkeeping, not real bytes (spec §4.6's "null
/// backend (sim)").
pub struct NullIoBackend {
    block_size_log2: u32,
    device_length: u64,
    loop_file_extents: ExtentVector,
    free_space_extents: ExtentVector,
    block_size_bitmask: u64,
}

impl NullIoBackend {
    pub fn new(block_size_log2: u32, device_length: u64) -> Self {
        NullIoBackend {
            block_size_log2,
            device_length,
            loop_file_extents: ExtentVector::new(),
            free_space_extents: ExtentVector::new(),
            block_size_bitmask: 1 << block_size_log2,
        }
    }

    /// Preload the extents `read_extents()` will return, so a test can drive
    /// the analyzer/scheduler pipeline without a real device.
    pub fn with_extents(mut self, loop_file_extents: ExtentVector, free_space_extents: ExtentVector) -> Self {
        self.loop_file_extents = loop_file_extents;
        self.free_space_extents = free_space_extents;
        self
    }
}

impl IoBackend for NullIoBackend {
    fn effective_block_size_log2(&self) -> u32 {
        self.block_size_log2
    }

    fn device_length_bytes(&self) -> u64 {
        self.device_length
    }

    fn read_extents(&mut self) -> Result<DiscoveredExtents> {
        Ok(DiscoveredExtents {
            loop_file_extents: self.loop_file_extents.clone(),
            free_space_extents: self.free_space_extents.clone(),
            block_size_bitmask: self.block_size_bitmask,
        })
    }

    fn create_storage(&mut self, _length: u64) -> Result<()> {
        Ok(())
    }

    fn copy_bytes(&mut self, _from: u64, _to: u64, _length: u64, _dir: Direction) -> Result<()> {
        Ok(())
    }

    fn queued_bytes(&self) -> u64 {
        0
    }

    fn flush_bytes(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend whose `read_extents()` is preloaded from in-memory vectors (the
/// Rust analogue of `ft_io_test`'s text-file-backed extents), but whose
/// `copy_bytes`/`flush_bytes` actually touch a real scratch file so that
/// move sequencing can be tested end to end without a real block device.
pub struct TestIoBackend {
    block_size_log2: u32,
    device_length: u64,
    loop_file_extents: ExtentVector,
    free_space_extents: ExtentVector,
    block_size_bitmask: u64,
    storage: Option<File>,
    address_space: StorageAddressSpace,
    queued: Vec<(u64, u64, u64, Direction)>,
}

impl TestIoBackend {
    pub fn new(
        block_size_log2: u32,
        device_length: u64,
        loop_file_extents: ExtentVector,
        free_space_extents: ExtentVector,
        block_size_bitmask: u64,
    ) -> Self {
        TestIoBackend {
            block_size_log2,
            device_length,
            loop_file_extents,
            free_space_extents,
            block_size_bitmask,
            storage: None,
            address_space: StorageAddressSpace::default(),
            queued: Vec::new(),
        }
    }
}

impl IoBackend for TestIoBackend {
    fn effective_block_size_log2(&self) -> u32 {
        self.block_size_log2
    }

    fn device_length_bytes(&self) -> u64 {
        self.device_length
    }

    fn read_extents(&mut self) -> Result<DiscoveredExtents> {
        Ok(DiscoveredExtents {
            loop_file_extents: self.loop_file_extents.clone(),
            free_space_extents: self.free_space_extents.clone(),
            block_size_bitmask: self.block_size_bitmask,
        })
    }

    fn create_storage(&mut self, length: u64) -> Result<()> {
        let file = tempfile::tempfile().map_err(|e| EngineError::io(e, "creating in-memory secondary storage"))?;
        file.set_len(length).map_err(|e| EngineError::io(e, "zero-filling secondary storage"))?;
        self.storage = Some(file);
        Ok(())
    }

    fn configure_storage(&mut self, plan: &StoragePlan, block_size_bytes: u64) -> Result<()> {
        self.address_space = StorageAddressSpace::from_plan(plan, block_size_bytes);
        Ok(())
    }

    fn copy_bytes(&mut self, from: u64, to: u64, length: u64, dir: Direction) -> Result<()> {
        // Validate the scratch-side offset against the configured address
        // space even though this backend doesn't move real bytes, so a
        // scheduler bug that addresses scratch out of bounds is still
        // caught under `--io=test`.
        match dir {
            Direction::Dev2Storage => {
                self.address_space.resolve(to, length)?;
            }
            Direction::Storage2Dev => {
                self.address_space.resolve(from, length)?;
            }
            Direction::Dev2Dev => {}
        }
        self.queued.push((from, to, length, dir));
        Ok(())
    }

    fn queued_bytes(&self) -> u64 {
        self.queued.iter().map(|(_, _, len, _)| len).sum()
    }

    fn flush_bytes(&mut self) -> Result<()> {
        self.queued.clear();
        Ok(())
    }
}

/// Extent discovery backed by the actual FIEMAP-derived extent layout of a
/// loop file and device, for a real run. The byte-copy half of this backend
/// goes through ordinary `pread`/`pwrite`, buffering requests identically to
/// [`TestIoBackend`]; only `read_extents` differs (it walks the real
/// filesystem instead of returning preloaded vectors).
pub struct PosixIoBackend {
    device: File,
    loop_file_path: PathBuf,
    zero_file_path: Option<PathBuf>,
    storage_path: PathBuf,
    storage: Option<File>,
    address_space: StorageAddressSpace,
    block_size_log2: u32,
    device_length: u64,
    queued: Vec<(u64, u64, u64, Direction)>,
}

impl PosixIoBackend {
    pub fn open(device_path: &Path, loop_file_path: &Path, zero_file_path: Option<&Path>, storage_path: PathBuf) -> Result<Self> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| EngineError::io(e, format!("opening device {}", device_path.display())))?;
        let device_length = device
            .metadata()
            .map_err(|e| EngineError::io(e, "stat device"))?
            .len();
        Ok(PosixIoBackend {
            device,
            loop_file_path: loop_file_path.to_path_buf(),
            zero_file_path: zero_file_path.map(Path::to_path_buf),
            storage_path,
            storage: None,
            address_space: StorageAddressSpace::default(),
            block_size_log2: 0,
            device_length,
            queued: Vec::new(),
        })
    }

    /// Read `[from, from+length)` of the device into `buf` (`buf.len() ==
    /// length`).
    fn device_read(&mut self, from: u64, buf: &mut [u8]) -> Result<()> {
        self.device.seek(SeekFrom::Start(from))?;
        std::io::Read::read_exact(&mut self.device, buf)?;
        Ok(())
    }

    fn device_write(&mut self, to: u64, buf: &[u8]) -> Result<()> {
        self.device.seek(SeekFrom::Start(to))?;
        self.device.write_all(buf)?;
        Ok(())
    }

    /// Read `[storage_offset, storage_offset+buf.len())` of the flat
    /// scratch address space, routing each piece through the device (for a
    /// primary segment) or the secondary storage file, per
    /// [`StorageAddressSpace::resolve`].
    fn storage_read(&mut self, storage_offset: u64, buf: &mut [u8]) -> Result<()> {
        let segments = self.address_space.resolve(storage_offset, buf.len() as u64)?;
        let mut pos = 0usize;
        for seg in segments {
            let chunk = &mut buf[pos..pos + seg.length as usize];
            if seg.in_primary {
                self.device.seek(SeekFrom::Start(seg.real_offset))?;
                std::io::Read::read_exact(&mut self.device, chunk)?;
            } else {
                let storage = self
                    .storage
                    .as_mut()
                    .ok_or_else(|| EngineError::new(ErrorKind::Internal, "secondary storage not created"))?;
                storage.seek(SeekFrom::Start(seg.real_offset))?;
                std::io::Read::read_exact(storage, chunk)?;
            }
            pos += seg.length as usize;
        }
        Ok(())
    }

    fn storage_write(&mut self, storage_offset: u64, buf: &[u8]) -> Result<()> {
        let segments = self.address_space.resolve(storage_offset, buf.len() as u64)?;
        let mut pos = 0usize;
        for seg in segments {
            let chunk = &buf[pos..pos + seg.length as usize];
            if seg.in_primary {
                self.device.seek(SeekFrom::Start(seg.real_offset))?;
                self.device.write_all(chunk)?;
            } else {
                let storage = self
                    .storage
                    .as_mut()
                    .ok_or_else(|| EngineError::new(ErrorKind::Internal, "secondary storage not created"))?;
                storage.seek(SeekFrom::Start(seg.real_offset))?;
                storage.write_all(chunk)?;
            }
            pos += seg.length as usize;
        }
        Ok(())
    }

    fn device_read_write(&mut self, from: u64, to: u64, length: u64, dir: Direction) -> Result<()> {
        let mut buf = vec![0u8; length as usize];
        match dir {
            Direction::Dev2Dev => {
                self.device_read(from, &mut buf)?;
                self.device_write(to, &buf)?;
            }
            Direction::Dev2Storage => {
                self.device_read(from, &mut buf)?;
                self.storage_write(to, &buf)?;
            }
            Direction::Storage2Dev => {
                self.storage_read(from, &mut buf)?;
                self.device_write(to, &buf)?;
            }
        }
        Ok(())
    }
}

impl IoBackend for PosixIoBackend {
    fn effective_block_size_log2(&self) -> u32 {
        self.block_size_log2
    }

    fn device_length_bytes(&self) -> u64 {
        self.device_length
    }

    fn read_extents(&mut self) -> Result<DiscoveredExtents> {
        let loop_extents = crate::fiemap::probe(&self.loop_file_path)?;
        let free_extents = match &self.zero_file_path {
            Some(path) => crate::fiemap::probe(path)?,
            None => {
                return Err(EngineError::new(
                    ErrorKind::NotConnected,
                    "free-space discovery requires a ZERO-FILE argument",
                ))
            }
        };

        let mut bitmask = 0u64;
        for e in loop_extents.iter().chain(free_extents.iter()) {
            bitmask |= e.physical | e.logical | e.length;
        }
        bitmask |= self.device_length;
        self.block_size_log2 = if bitmask == 0 { 0 } else { bitmask.trailing_zeros() };

        Ok(DiscoveredExtents {
            loop_file_extents: loop_extents,
            free_space_extents: free_extents,
            block_size_bitmask: bitmask,
        })
    }

    fn create_storage(&mut self, length: u64) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.storage_path)
            .map_err(|e| EngineError::io(e, format!("creating secondary storage at {}", self.storage_path.display())))?;
        file.set_len(length)
            .map_err(|e| EngineError::io(e, "zero-filling secondary storage"))?;
        self.storage = Some(file);
        Ok(())
    }

    fn configure_storage(&mut self, plan: &StoragePlan, block_size_bytes: u64) -> Result<()> {
        self.address_space = StorageAddressSpace::from_plan(plan, block_size_bytes);
        Ok(())
    }

    fn copy_bytes(&mut self, from: u64, to: u64, length: u64, dir: Direction) -> Result<()> {
        self.queued.push((from, to, length, dir));
        Ok(())
    }

    fn zero_device_range(&mut self, at: u64, length: u64) -> Result<()> {
        let zeros = vec![0u8; length as usize];
        self.device_write(at, &zeros)
    }

    fn queued_bytes(&self) -> u64 {
        self.queued.iter().map(|(_, _, len, _)| len).sum()
    }

    fn flush_bytes(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.queued);
        for (from, to, length, dir) in pending {
            self.device_read_write(from, to, length, dir)?;
        }
        self.device.sync_all().map_err(|e| EngineError::io(e, "fsync device"))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extent::{Extent, Tag};

    #[test]
    fn null_backend_reports_preloaded_extents() {
        let mut loop_vec = ExtentVector::new();
        loop_vec.push(Extent::new(0, 0, 4, Tag::LoopFile));
        let mut backend = NullIoBackend::new(0, 100).with_extents(loop_vec, ExtentVector::new());
        let discovered = backend.read_extents().unwrap();
        assert_eq!(discovered.loop_file_extents.len(), 1);
        assert_eq!(discovered.free_space_extents.len(), 0);
    }

    #[test]
    fn null_backend_copy_bytes_never_queues_anything() {
        let mut backend = NullIoBackend::new(0, 100);
        backend.copy_bytes(0, 10, 5, Direction::Dev2Dev).unwrap();
        assert_eq!(backend.queued_bytes(), 0);
        backend.flush_bytes().unwrap();
    }

    #[test]
    fn test_backend_tracks_queued_bytes_until_flush() {
        let mut backend = TestIoBackend::new(0, 100, ExtentVector::new(), ExtentVector::new(), 0);
        backend.create_storage(16).unwrap();
        backend.copy_bytes(0, 0, 8, Direction::Dev2Storage).unwrap();
        assert_eq!(backend.queued_bytes(), 8);
        backend.flush_bytes().unwrap();
        assert_eq!(backend.queued_bytes(), 0);
    }
}
