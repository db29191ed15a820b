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

//! Top-level orchestration (spec §3, §5): wires the job directory, I/O
//! backend, analyzer, storage planner and scheduler together into one
//! end-to-end relocation run.

use crate::analyzer::Analyzer;
use crate::cmdline::{Cli, ClearMode, IoMode};
use crate::error::{EngineError, ErrorKind, Result};
use crate::extent::{Extent, Tag};
use crate::io_backend::{IoBackend, NullIoBackend, PosixIoBackend, TestIoBackend};
use crate::job::JobDir;
use crate::persist;
use crate::scheduler::Scheduler;
use crate::storage::{StoragePlan, StoragePlanner};
use crate::vector::ExtentVector;
use rand::Rng;

/// Outcome of one completed (or no-op) run, for `main()` to report.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub job_id: u64,
    pub blocks_moved: u64,
    pub block_size_bytes: u64,
}

/// Runs one full relocation job as described by `cli`: acquires the job
/// directory, discovers extents, analyzes them into a relocation plan,
/// sizes scratch storage, and drains the plan through the scheduler.
pub fn run(cli: &Cli) -> Result<RunReport> {
    let job = JobDir::create(cli.job_dir.as_deref(), cli.job_id)?;
    log::info!("using job directory {}", job.path().display());

    let mut backend = open_backend(cli)?;
    let discovered = backend.read_extents()?;
    let device_length = backend.device_length_bytes();

    persist::write_extents(&job.loop_extents_path(), device_length, &discovered.loop_file_extents)?;
    persist::write_extents(&job.free_extents_path(), device_length, &discovered.free_space_extents)?;

    let page_size_bytes = page_size_bytes();
    let analyzer = Analyzer::new(cli.force_run, page_size_bytes);
    let analysis = analyzer.analyze(&discovered.loop_file_extents, &discovered.free_space_extents, device_length as u128)?;
    let block_size_bytes = 1u64 << analysis.eff_block_size_log2;

    if analysis.relocation_map.is_empty() {
        log::info!("device already matches the target layout; nothing to relocate");
        return Ok(RunReport {
            job_id: job.job_id(),
            blocks_moved: 0,
            block_size_bytes,
        });
    }

    let planner = StoragePlanner::new(page_size_bytes, free_ram_bytes(), addressable_memory_bytes());
    let plan = planner.plan(
        cli.scratch_budget(),
        analysis.work_count,
        block_size_bytes,
        &analysis.primary_storage_candidates,
    )?;

    let storage_capacity_blocks = plan
        .primary_length()
        .saturating_add(plan.secondary_length / block_size_bytes.max(1));
    let scheduler = Scheduler::new(analysis.eff_block_size_log2, storage_capacity_blocks);

    let eff_block_size_log2 = analysis.eff_block_size_log2;
    let free_space_map = analysis.free_space_map;

    let blocks_moved = if cli.no_action {
        log::info!("--no-action given: simulating {} blocks of work against a null backend", analysis.work_count);
        let mut null_backend = NullIoBackend::new(eff_block_size_log2, device_length);
        scheduler.run(analysis.relocation_map, &mut null_backend)?
    } else {
        backend.create_storage(plan.secondary_length)?;
        backend.configure_storage(&plan, block_size_bytes)?;
        let moved = scheduler.run(analysis.relocation_map, backend.as_mut())?;
        apply_clear(cli, backend.as_mut(), eff_block_size_log2, &free_space_map, &plan)?;
        moved
    };

    log::info!("relocation finished: {blocks_moved} blocks moved ({block_size_bytes} bytes each)");

    Ok(RunReport {
        job_id: job.job_id(),
        blocks_moved,
        block_size_bytes,
    })
}

/// Build the I/O backend named by `--io` (spec §6). `Posix` opens the real
/// device and loop file; `Test` re-reads the wire-format extent files named
/// by the DEVICE/LOOP-FILE/ZERO-FILE positionals (the original engine's
/// `ft_io_test`, driven from text files instead of FIEMAP); `SelfTest`
/// ignores its positionals entirely and exercises the pipeline against a
/// synthesized scenario.
fn open_backend(cli: &Cli) -> Result<Box<dyn IoBackend>> {
    match cli.io {
        IoMode::Posix => {
            let zero_file = cli.zero_file.as_deref().ok_or_else(|| {
                EngineError::new(ErrorKind::InvalidInput, "--io=posix requires a ZERO-FILE argument")
            })?;
            let backend = PosixIoBackend::open(&cli.device, &cli.loop_file, Some(zero_file), backend_storage_path(cli))?;
            Ok(Box::new(backend))
        }
        IoMode::Test => {
            let zero_file = cli.zero_file.as_deref().ok_or_else(|| {
                EngineError::new(ErrorKind::InvalidInput, "--io=test requires a ZERO-FILE argument")
            })?;
            let (device_length, _) = persist::read_extents(&cli.device)?;
            let (_, loop_file_extents) = persist::read_extents(&cli.loop_file)?;
            let (_, free_space_extents) = persist::read_extents(zero_file)?;
            let bitmask = derive_bitmask(&loop_file_extents, &free_space_extents, device_length);
            Ok(Box::new(TestIoBackend::new(
                bitmask.trailing_zeros(),
                device_length,
                loop_file_extents,
                free_space_extents,
                bitmask,
            )))
        }
        IoMode::SelfTest => {
            let (loop_file_extents, free_space_extents, device_length) = synthesize_scenario();
            let bitmask = derive_bitmask(&loop_file_extents, &free_space_extents, device_length);
            Ok(Box::new(TestIoBackend::new(
                bitmask.trailing_zeros(),
                device_length,
                loop_file_extents,
                free_space_extents,
                bitmask,
            )))
        }
    }
}

fn backend_storage_path(cli: &Cli) -> std::path::PathBuf {
    cli.job_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("fsremap-storage.bin")
}

fn derive_bitmask(loop_vec: &ExtentVector, free_vec: &ExtentVector, device_length: u64) -> u64 {
    let mut mask = device_length;
    for e in loop_vec.iter().chain(free_vec.iter()) {
        mask |= e.physical | e.logical | e.length;
    }
    mask
}

/// Zero free blocks after a successful relocation (spec §6's `--x-clear`).
/// `Minimal` clears only the primary scratch extents the run actually used;
/// `All` clears every free block the analyzer found; `None` is a no-op.
fn apply_clear(
    cli: &Cli,
    backend: &mut dyn IoBackend,
    eff_block_size_log2: u32,
    free_space_map: &crate::map::ExtentMap,
    plan: &StoragePlan,
) -> Result<()> {
    let shift = eff_block_size_log2;
    match cli.x_clear {
        ClearMode::None => Ok(()),
        ClearMode::Minimal => {
            for e in plan.primary_extents.iter() {
                backend.zero_device_range(e.physical << shift, e.length << shift)?;
            }
            Ok(())
        }
        ClearMode::All => {
            for e in free_space_map.iter() {
                backend.zero_device_range(e.physical << shift, e.length << shift)?;
            }
            Ok(())
        }
    }
}

fn page_size_bytes() -> u64 {
    // SAFETY: sysconf with a valid, supported name never touches memory
    // and cannot fail in a way that isn't reflected in its return value.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

fn free_ram_bytes() -> u64 {
    // SAFETY: see page_size_bytes.
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pages > 0 {
        (pages as u64).saturating_mul(page_size_bytes())
    } else {
        256 * 1024 * 1024
    }
}

/// Width of the process's virtual address space, used by the storage
/// planner to cap scratch windows at a quarter of it.
fn addressable_memory_bytes() -> u64 {
    u64::try_from(usize::MAX).unwrap_or(u64::MAX)
}

const SELF_TEST_BLOCK_SIZE: u64 = 4096;
const SELF_TEST_DEVICE_BLOCKS: u64 = 4096;

/// Synthesizes a random-but-valid (loop-file extents, free-space extents,
/// device length) triple for `--io=self-test`: walks the device block by
/// block in randomly sized runs, assigning each run to the loop file (at
/// the next sequential logical offset, simulating a scattered physical
/// layout), to free space, or to neither (pre-existing, already correctly
/// placed data). Extents come back in byte units, like a real FIEMAP probe.
fn synthesize_scenario() -> (ExtentVector, ExtentVector, u64) {
    let mut rng = rand::thread_rng();
    let mut loop_vec = ExtentVector::new();
    let mut free_vec = ExtentVector::new();

    let mut physical = 0u64;
    let mut logical_cursor = 0u64;
    while physical < SELF_TEST_DEVICE_BLOCKS {
        let remaining = SELF_TEST_DEVICE_BLOCKS - physical;
        let length = (1 + rng.gen_range(0..64)).min(remaining);
        match rng.gen_range(0..3) {
            0 => {
                loop_vec.push(Extent::new(
                    physical * SELF_TEST_BLOCK_SIZE,
                    logical_cursor * SELF_TEST_BLOCK_SIZE,
                    length * SELF_TEST_BLOCK_SIZE,
                    Tag::LoopFile,
                ));
                logical_cursor += length;
            }
            1 => {
                free_vec.push(Extent::new(
                    physical * SELF_TEST_BLOCK_SIZE,
                    physical * SELF_TEST_BLOCK_SIZE,
                    length * SELF_TEST_BLOCK_SIZE,
                    Tag::Default,
                ));
            }
            _ => {}
        }
        physical += length;
    }

    (loop_vec, free_vec, SELF_TEST_DEVICE_BLOCKS * SELF_TEST_BLOCK_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn synthesized_scenario_extents_are_disjoint_and_in_bounds() {
        let (loop_vec, free_vec, device_length) = synthesize_scenario();

        let mut all: Vec<Extent> = loop_vec.iter().chain(free_vec.iter()).copied().collect();
        all.sort_by_key(|e| e.physical);
        let mut last_end = 0u64;
        for e in &all {
            assert!(e.physical >= last_end, "extents overlap physically");
            assert!(e.physical_end() <= device_length, "extent runs past device length");
            last_end = e.physical_end();
        }

        let mut logical_runs: Vec<Extent> = loop_vec.iter().copied().collect();
        logical_runs.sort_by_key(|e| e.logical);
        let mut last_logical_end = 0u64;
        for e in &logical_runs {
            assert!(e.logical >= last_logical_end, "loop-file logical runs overlap");
            last_logical_end = e.logical_end();
        }
    }

    #[test]
    fn derive_bitmask_folds_in_device_length() {
        let loop_vec = ExtentVector::new();
        let free_vec = ExtentVector::new();
        assert_eq!(derive_bitmask(&loop_vec, &free_vec, 1 << 12), 1 << 12);
    }
}
