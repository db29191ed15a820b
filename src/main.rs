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

use libfsremap::cmdline::Cli;
use libfsremap::logging::{self, Logger};
use libfsremap::{engine, EngineError};

fn main() {
    let cli = match Cli::parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fsremap: {err}");
            std::process::exit(1);
        }
    };

    let logger = Logger::new(cli.verbosity().to_level_filter(), cli.log_format, cli.log_color);
    if logging::init(logger).is_err() {
        eprintln!("fsremap: logger already initialized");
    }

    match engine::run(&cli) {
        Ok(report) => {
            log::info!(
                "job {} done: {} blocks moved, block size {} bytes",
                report.job_id,
                report.blocks_moved,
                report.block_size_bytes
            );
        }
        Err(err) => {
            report_failure(err);
            std::process::exit(1);
        }
    }
}

fn report_failure(err: EngineError) {
    if err.is_reported() {
        return;
    }
    log::error!("{err}");
}
