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

//! `libfsremap`: an in-place block-remapping engine. Given the physical
//! extent layout of a loop-file inside a source device, the free-space
//! layout of that device, and the device length, computes a relocation plan
//! and executes it with bounded scratch storage so that, on completion, the
//! device's physical blocks match the loop-file's logical layout.

pub mod analyzer;
pub mod cmdline;
pub mod engine;
pub mod error;
pub mod extent;
pub mod fiemap;
pub mod io_backend;
pub mod job;
pub mod logging;
pub mod map;
pub mod persist;
pub mod pool;
pub mod scheduler;
pub mod storage;
pub mod vector;

pub use error::{EngineError, ErrorKind, Result};
