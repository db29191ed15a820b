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

//! `FS_IOC_FIEMAP` extent discovery, the concrete primitive behind
//! [`crate::io_backend::PosixIoBackend::read_extents`]. Walks a single file
//! and returns its physical layout in bytes; offsets are relative to the
//! start of the block device the file resides on.

use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::vector::ExtentVector;

pub fn probe(path: &Path) -> Result<ExtentVector> {
    let file = std::fs::File::open(path).map_err(|e| EngineError::io(e, format!("opening {}", path.display())))?;
    let raw = fiemap(file.as_raw_fd()).map_err(|e| EngineError::io(e, format!("FS_IOC_FIEMAP on {}", path.display())))?;

    let mut out = ExtentVector::new();
    for e in raw {
        if e.flags & ffi::FIEMAP_EXTENT_NOT_ALIGNED != 0 {
            return Err(EngineError::new(ErrorKind::InvalidInput, "extent offsets are not block aligned"));
        }
        if e.flags & ffi::FIEMAP_EXTENT_MERGED != 0 {
            return Err(EngineError::new(ErrorKind::InvalidInput, "filesystem does not support extents"));
        }
        if e.flags & ffi::FIEMAP_EXTENT_UNKNOWN != 0 {
            return Err(EngineError::new(ErrorKind::InvalidInput, "extent data location unknown"));
        }
        out.append_with_merge(Extent::new(e.physical, e.logical, e.length, Tag::Default));
    }
    Ok(out)
}

struct RawExtent {
    logical: u64,
    physical: u64,
    length: u64,
    flags: u32,
}

fn fiemap(fd: std::os::unix::io::RawFd) -> std::io::Result<Vec<RawExtent>> {
    let mut m = ffi::Fiemap::new();
    let mut extents = Vec::new();

    loop {
        m.fm_start = extents
            .last()
            .map(|e: &RawExtent| e.logical + e.length)
            .unwrap_or(0);

        // SAFETY: `m` is a valid, correctly sized fiemap struct for the duration of the call.
        unsafe { ffi::fs_ioc_fiemap(fd, &mut m)? };
        if m.fm_mapped_extents == 0 {
            break;
        }

        let mut found_last = false;
        for e in m.fm_extents.iter().take(m.fm_mapped_extents as usize) {
            extents.push(RawExtent {
                logical: e.fe_logical,
                physical: e.fe_physical,
                length: e.fe_length,
                flags: e.fe_flags,
            });
            if e.fe_flags & ffi::FIEMAP_EXTENT_LAST != 0 {
                found_last = true;
            }
        }
        if found_last {
            break;
        }
    }

    Ok(extents)
}

mod ffi {
    use std::mem::{size_of, zeroed};

    const EXTENT_COUNT: usize = 32;
    const FIEMAP_SIZE: u32 = (size_of::<Fiemap>() as u32) - (size_of::<[FiemapExtent; EXTENT_COUNT]>() as u32);

    pub const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
    pub const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;
    pub const FIEMAP_EXTENT_MERGED: u32 = 0x0000_1000;
    pub const FIEMAP_EXTENT_NOT_ALIGNED: u32 = 0x0000_0100;

    #[repr(C)]
    #[derive(Debug)]
    pub struct Fiemap {
        pub fm_start: u64,
        pub fm_length: u64,
        pub fm_flags: u32,
        pub fm_mapped_extents: u32,
        pub fm_extent_count: u32,
        pub fm_reserved: u32,
        pub fm_extents: [FiemapExtent; EXTENT_COUNT],
    }

    #[repr(C)]
    #[derive(Debug)]
    pub struct FiemapExtent {
        pub fe_logical: u64,
        pub fe_physical: u64,
        pub fe_length: u64,
        pub fe_reserved64: [u64; 2],
        pub fe_flags: u32,
        pub fe_reserved: [u32; 3],
    }

    impl Fiemap {
        pub fn new() -> Self {
            let mut r: Self = unsafe { zeroed() };
            r.fm_extent_count = EXTENT_COUNT as u32;
            r.fm_length = u64::MAX;
            r
        }
    }

    nix::ioctl_readwrite_bad!(fs_ioc_fiemap, nix::request_code_readwrite!(b'f', 11, FIEMAP_SIZE), Fiemap);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn probing_a_missing_file_reports_io_error() {
        let err = probe(Path::new("/nonexistent/path/for/fiemap/test")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
