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

//! Job directory bookkeeping (spec §3's "Job directory", §5's exclusive-lock
//! requirement): a per-run folder holding the persisted extent files and,
//! optionally, the secondary storage file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;

use crate::error::{EngineError, ErrorKind, Result};

/// An acquired, exclusively-locked job directory. The lock is released (and
/// the underlying file descriptor closed) when this value is dropped.
pub struct JobDir {
    path: PathBuf,
    job_id: u64,
    _lock_file: File,
}

impl JobDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn loop_extents_path(&self) -> PathBuf {
        self.path.join("loop_extents.txt")
    }

    pub fn free_extents_path(&self) -> PathBuf {
        self.path.join("free_space_extents.txt")
    }

    pub fn secondary_storage_path(&self) -> PathBuf {
        self.path.join("storage.bin")
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join("fstransform.log")
    }

    /// Create (or, for a user-specified `job_id`, reuse) a job directory
    /// under `root` (defaults to `~/.fstransform`), then take an exclusive
    /// lock on it. If `job_id` is `None`, tries `job.1`, `job.2`, ... and
    /// keeps the first directory that did not already exist — the "lowest
    /// unused integer ≥ 1" rule of spec §3.
    pub fn create(root: Option<&Path>, job_id: Option<u64>) -> Result<JobDir> {
        let base = match root {
            Some(root) => root.to_path_buf(),
            None => {
                let home = std::env::var_os("HOME").ok_or_else(|| {
                    EngineError::new(ErrorKind::InvalidInput, "$HOME is not set and no --job-dir was given")
                })?;
                PathBuf::from(home).join(".fstransform")
            }
        };
        fs::create_dir_all(&base).map_err(|e| EngineError::io(e, format!("creating {}", base.display())))?;

        let (path, id) = match job_id {
            Some(id) => {
                let path = base.join(format!("job.{id}"));
                fs::create_dir_all(&path).map_err(|e| EngineError::io(e, format!("creating {}", path.display())))?;
                (path, id)
            }
            None => {
                let mut found = None;
                for candidate in 1u64.. {
                    let path = base.join(format!("job.{candidate}"));
                    match fs::create_dir(&path) {
                        Ok(()) => {
                            found = Some((path, candidate));
                            break;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                        Err(e) => return Err(EngineError::io(e, format!("creating {}", path.display()))),
                    }
                }
                found.ok_or_else(|| EngineError::new(ErrorKind::Internal, "failed to locate a free job id"))?
            }
        };

        let lock_path = path.join(".lock");
        let lock_file = File::create(&lock_path).map_err(|e| EngineError::io(e, format!("creating {}", lock_path.display())))?;
        flock(lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|_| {
            EngineError::new(
                ErrorKind::AlreadyConnected,
                format!("job directory {} is locked by another running instance", path.display()),
            )
        })?;

        Ok(JobDir {
            path,
            job_id: id,
            _lock_file: lock_file,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_picks_lowest_unused_job_id() {
        let tmp = tempfile::tempdir().unwrap();
        let first = JobDir::create(Some(tmp.path()), None).unwrap();
        assert_eq!(first.job_id(), 1);
        drop(first);

        // job.1's directory still exists on disk (only the lock was
        // released), so the next unused id is job.2.
        let second = JobDir::create(Some(tmp.path()), None).unwrap();
        assert_eq!(second.job_id(), 2);
    }

    #[test]
    fn create_with_explicit_job_id_reuses_that_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let job = JobDir::create(Some(tmp.path()), Some(42)).unwrap();
        assert_eq!(job.job_id(), 42);
        assert!(job.path().ends_with("job.42"));
    }

    #[test]
    fn concurrent_create_on_same_explicit_job_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = JobDir::create(Some(tmp.path()), Some(7)).unwrap();
        let second = JobDir::create(Some(tmp.path()), Some(7));
        assert!(second.is_err());
    }
}
