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

//! `fsremap` command line (spec §6, SPEC_FULL.md §4.10, component A3).
//!
//! Args are listed in `--help` in the order declared below. Please keep the
//! entire help text to 80 columns.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use clap::{crate_version, ArgEnum, Parser};

use crate::logging::{LogColor, LogFormat, Verbosity};
use crate::storage::ScratchBudget;

#[derive(Debug, Parser)]
#[clap(name = "fsremap", version = crate_version!())]
#[clap(about = "Relocate a loop-file's blocks to match a target filesystem layout in place")]
pub struct Cli {
    /// Block device to transform
    pub device: PathBuf,

    /// Sparse loop-file holding the target filesystem's payload
    pub loop_file: PathBuf,

    /// File whose extents describe the device's free space
    ///
    /// Typically a second sparse file, fully allocated on the device's free
    /// blocks so their physical layout can be read back with FIEMAP.
    pub zero_file: Option<PathBuf>,

    /// Demote sanity-check failures to warnings and keep running
    #[clap(short = 'f', long = "force-run")]
    pub force_run: bool,

    /// Skip all block reads/writes; run the scheduler against a null backend
    #[clap(short = 'n', long = "no-action", alias = "simulate-run")]
    pub no_action: bool,

    /// Extent-discovery and byte-copy backend to use
    #[clap(long = "io", arg_enum, default_value_t = IoMode::Posix)]
    pub io: IoMode,

    /// Upper bound on RAM used for scratch buffering, e.g. 64M, 1G
    #[clap(long = "mem-buffer", value_name = "SIZE")]
    pub mem_buffer: Option<SizeSpec>,

    /// Force the secondary (on-file) scratch storage to this size
    #[clap(long = "secondary-storage", value_name = "SIZE")]
    pub secondary_storage: Option<SizeSpec>,

    /// Force the primary (in-device) scratch storage to this size
    #[clap(long = "primary-storage", value_name = "SIZE")]
    pub primary_storage: Option<SizeSpec>,

    /// Force the total scratch storage (primary + secondary) to this size
    #[clap(long = "storage", value_name = "SIZE")]
    pub storage: Option<SizeSpec>,

    /// Zero free blocks after relocation: all of them, only those used as
    /// scratch, or none
    #[clap(long = "x-clear", arg_enum, default_value_t = ClearMode::None)]
    pub x_clear: ClearMode,

    /// Use this job id instead of the lowest unused one
    #[clap(long = "job-id", value_name = "N")]
    pub job_id: Option<u64>,

    /// Root directory for job directories (default: ~/.fstransform)
    #[clap(long = "job-dir", value_name = "PATH")]
    pub job_dir: Option<PathBuf>,

    /// Accepted for command-line compatibility with fsmove; rejected here
    #[clap(long = "inode-cache-mem", value_name = "SIZE", hide = true)]
    pub inode_cache_mem: Option<String>,

    /// Accepted for command-line compatibility with fsmove; rejected here
    #[clap(long = "inode-cache", value_name = "DIR", hide = true)]
    pub inode_cache: Option<PathBuf>,

    /// Decrease verbosity (repeatable: -q, -qq)
    #[clap(short = 'q', action = clap::ArgAction::Count)]
    #[clap(conflicts_with_all = ["verbose", "quiet_word", "verbose_word"])]
    pub quiet: u8,

    /// Increase verbosity (repeatable: -v, -vv, -vvv)
    #[clap(short = 'v', action = clap::ArgAction::Count)]
    #[clap(conflicts_with_all = ["quiet", "quiet_word", "verbose_word"])]
    pub verbose: u8,

    /// Equivalent to -qq
    #[clap(long = "quiet")]
    #[clap(conflicts_with_all = ["quiet", "verbose", "verbose_word"])]
    pub quiet_word: bool,

    /// Equivalent to -vvv
    #[clap(long = "verbose")]
    #[clap(conflicts_with_all = ["quiet", "verbose", "quiet_word"])]
    pub verbose_word: bool,

    /// When to colorize log output
    #[clap(long = "log-color", arg_enum, default_value_t = LogColor::Auto)]
    pub log_color: LogColor,

    /// Log line format
    #[clap(long = "log-format", arg_enum, default_value_t = LogFormat::LevelMsg)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
pub enum IoMode {
    Posix,
    Test,
    #[clap(name = "self-test")]
    SelfTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ArgEnum)]
pub enum ClearMode {
    All,
    Minimal,
    None,
}

/// A `SIZE[k|M|G|T|P|E|Z|Y]` argument (spec §6), parsed into bytes with
/// `byte-unit`. A bare integer (no suffix) is bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSpec(pub u64);

impl FromStr for SizeSpec {
    type Err = SizeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let byte = byte_unit::Byte::from_str(s).map_err(|e| SizeParseError(format!("invalid size '{s}': {e}")))?;
        let bytes = byte.get_bytes();
        u64::try_from(bytes)
            .map(SizeSpec)
            .map_err(|_| SizeParseError(format!("size '{s}' is too large")))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SizeParseError(String);

impl Cli {
    pub fn parse_args() -> Result<Cli> {
        let cli = <Cli as Parser>::parse();
        if cli.inode_cache_mem.is_some() || cli.inode_cache.is_some() {
            bail!("--inode-cache-mem/--inode-cache belong to fsmove, not fsremap");
        }
        Ok(cli)
    }

    pub fn verbosity(&self) -> Verbosity {
        if self.quiet_word {
            return Verbosity::Quiet1;
        }
        if self.verbose_word {
            return Verbosity::Verbose3;
        }
        match (self.quiet, self.verbose) {
            (q, 0) if q >= 2 => Verbosity::Quiet2,
            (1, 0) => Verbosity::Quiet1,
            (0, 0) => Verbosity::Normal,
            (0, 1) => Verbosity::Verbose1,
            (0, 2) => Verbosity::Verbose2,
            (0, v) if v >= 3 => Verbosity::Verbose3,
            _ => Verbosity::Normal,
        }
    }

    /// Combine `--storage`/`--primary-storage`/`--secondary-storage`/
    /// `--mem-buffer` into a single [`ScratchBudget`] for the storage
    /// planner (spec §4.4). `--storage` wins if given; otherwise the sum of
    /// whichever of primary/secondary/mem-buffer were specified, if any.
    pub fn scratch_budget(&self) -> ScratchBudget {
        if let Some(total) = self.storage {
            return ScratchBudget::Fixed(total.0);
        }
        let mut sum = 0u64;
        let mut any = false;
        for spec in [self.primary_storage, self.secondary_storage, self.mem_buffer].into_iter().flatten() {
            sum = sum.saturating_add(spec.0);
            any = true;
        }
        if any {
            ScratchBudget::Fixed(sum)
        } else {
            ScratchBudget::Auto
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_spec_parses_suffixed_sizes() {
        assert_eq!(SizeSpec::from_str("16M").unwrap().0, 16 * 1024 * 1024);
        assert_eq!(SizeSpec::from_str("1G").unwrap().0, 1024 * 1024 * 1024);
        assert_eq!(SizeSpec::from_str("512").unwrap().0, 512);
    }

    #[test]
    fn size_spec_rejects_garbage() {
        assert!(SizeSpec::from_str("not-a-size").is_err());
    }

    #[test]
    fn verbosity_counts_repeated_flags() {
        let mut cli = <Cli as Parser>::try_parse_from(["fsremap", "dev", "loop"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Normal);
        cli.verbose = 2;
        assert_eq!(cli.verbosity(), Verbosity::Verbose2);
    }

    #[test]
    fn quiet_word_is_equivalent_to_double_q() {
        let cli = <Cli as Parser>::try_parse_from(["fsremap", "dev", "loop", "--quiet"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet1);
    }

    #[test]
    fn scratch_budget_prefers_explicit_storage_total() {
        let mut cli = <Cli as Parser>::try_parse_from(["fsremap", "dev", "loop"]).unwrap();
        cli.storage = Some(SizeSpec(1000));
        cli.primary_storage = Some(SizeSpec(1));
        match cli.scratch_budget() {
            ScratchBudget::Fixed(n) => assert_eq!(n, 1000),
            ScratchBudget::Auto => panic!("expected fixed budget"),
        }
    }

    #[test]
    fn scratch_budget_defaults_to_auto() {
        let cli = <Cli as Parser>::try_parse_from(["fsremap", "dev", "loop"]).unwrap();
        match cli.scratch_budget() {
            ScratchBudget::Auto => {}
            ScratchBudget::Fixed(_) => panic!("expected auto budget"),
        }
    }
}
