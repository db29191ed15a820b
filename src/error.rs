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

//! Error taxonomy for the relocation engine (spec §7).
//!
//! Every fallible engine operation returns [`EngineError`]. Errors that have
//! already been logged via [`EngineError::log_and_mark`] are flagged
//! `reported`, so `main()` does not print them a second time.

use std::cell::Cell;
use std::fmt;

/// The kind of failure, independent of message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyConnected,
    NotConnected,
    Overflow,
    TooLarge,
    NoSpace,
    Io,
    InvalidInput,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AlreadyConnected => "ALREADY_CONNECTED",
            ErrorKind::NotConnected => "NOT_CONNECTED",
            ErrorKind::Overflow => "OVERFLOW",
            ErrorKind::TooLarge => "TOO_LARGE",
            ErrorKind::NoSpace => "NO_SPACE",
            ErrorKind::Io => "IO",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// An engine error: a kind, a human-readable message, and a "reported" flag.
///
/// The flag mirrors the sign-bit-as-reported-marker trick of the original
/// C++ engine, but as a plain `Cell<bool>` rather than bit-stealing an error
/// code, since a Rust `Result` carries an actual error value.
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    reported: Cell<bool>,
    source: Option<std::io::Error>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
            reported: Cell::new(false),
            source: None,
        }
    }

    pub fn io(err: std::io::Error, context: impl Into<String>) -> Self {
        EngineError {
            kind: ErrorKind::Io,
            message: context.into(),
            reported: Cell::new(false),
            source: Some(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_reported(&self) -> bool {
        self.reported.get()
    }

    /// Log this error at `Error` level through the `log` facade and mark it
    /// as reported, so the top-level handler in `main()` does not print a
    /// redundant "failed with unreported error" line.
    pub fn log_and_mark(self) -> Self {
        log::error!("{}", self);
        self.reported.set(true);
        self
    }

    pub fn mark_reported(&self) {
        self.reported.set(true);
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(src) = &self.source {
            write!(f, "{}: {} ({})", self.kind, self.message, src)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::io(err, "I/O error")
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal programming-error assertion: fails with [`ErrorKind::Internal`]
/// instead of panicking on a release build's malformed invariant, matching
/// spec §7's "includes file/function/line" INTERNAL kind. Used only for
/// conditions that would be an assertion failure (`ff_assert`) in the
/// original C++ engine, i.e. "cannot happen" except via a caller bug.
#[macro_export]
macro_rules! internal_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::error::EngineError::new(
                $crate::error::ErrorKind::Internal,
                format!(
                    "{} at {}:{}:{}",
                    format!($($arg)*),
                    file!(),
                    line!(),
                    column!()
                ),
            ));
        }
    };
}
