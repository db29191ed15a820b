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

//! Logging subsystem (spec §6, §9).
//!
//! The engine never writes to stderr directly; it goes through the `log`
//! facade so that a test can inject a [`Sink`] and assert on emitted lines
//! without spawning a process, per spec §9 ("treat the logger as an injected
//! sink so the engine can be exercised headless in tests").

use std::io::Write;
use std::sync::Mutex;

use chrono::Local;
use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Verbosity, controlled by `-q`/`-qq`/`-v`/`-vv`/`-vvv`/`--quiet`/`--verbose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet2,
    Quiet1,
    Normal,
    Verbose1,
    Verbose2,
    Verbose3,
}

impl Verbosity {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Quiet2 => LevelFilter::Off,
            Verbosity::Quiet1 => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose1 => LevelFilter::Debug,
            Verbosity::Verbose2 | Verbosity::Verbose3 => LevelFilter::Trace,
        }
    }
}

/// Message format, selected with `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum LogFormat {
    Msg,
    LevelMsg,
    TimeLevelMsg,
    TimeLevelFunctionMsg,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "msg" => Ok(LogFormat::Msg),
            "level_msg" => Ok(LogFormat::LevelMsg),
            "time_level_msg" => Ok(LogFormat::TimeLevelMsg),
            "time_level_function_msg" => Ok(LogFormat::TimeLevelFunctionMsg),
            other => Err(format!("unrecognized --log-format value '{other}'")),
        }
    }
}

/// Color mode, selected with `--log-color`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum LogColor {
    Auto,
    None,
    Ansi,
}

impl std::str::FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(LogColor::Auto),
            "none" => Ok(LogColor::None),
            "ansi" => Ok(LogColor::Ansi),
            other => Err(format!("unrecognized --log-color value '{other}'")),
        }
    }
}

/// Destination for formatted log lines. Boxed so tests can swap in an
/// in-memory buffer instead of stderr.
pub type Sink = Box<dyn Write + Send>;

struct StderrSink;

impl Write for StderrSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

pub struct Logger {
    filter: LevelFilter,
    format: LogFormat,
    color: LogColor,
    sink: Mutex<Sink>,
    is_tty: bool,
}

impl Logger {
    pub fn new(filter: LevelFilter, format: LogFormat, color: LogColor) -> Self {
        Logger {
            filter,
            format,
            color,
            sink: Mutex::new(Box::new(StderrSink)),
            is_tty: atty_stderr(),
        }
    }

    /// Build a logger writing into `sink` instead of stderr, for tests.
    pub fn with_sink(filter: LevelFilter, format: LogFormat, color: LogColor, sink: Sink) -> Self {
        Logger {
            filter,
            format,
            color,
            sink: Mutex::new(sink),
            is_tty: false,
        }
    }

    fn use_color(&self) -> bool {
        match self.color {
            LogColor::Ansi => true,
            LogColor::None => false,
            LogColor::Auto => self.is_tty,
        }
    }

    fn level_tag(&self, level: Level) -> String {
        let raw = level.to_string();
        if !self.use_color() {
            return raw;
        }
        match level {
            Level::Error => raw.red().bold().to_string(),
            Level::Warn => raw.yellow().bold().to_string(),
            Level::Info => raw.green().to_string(),
            Level::Debug => raw.blue().to_string(),
            Level::Trace => raw.normal().to_string(),
        }
    }

    fn format_line(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Msg => format!("{}", record.args()),
            LogFormat::LevelMsg => format!("{}: {}", self.level_tag(record.level()), record.args()),
            LogFormat::TimeLevelMsg => format!(
                "{} {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                self.level_tag(record.level()),
                record.args()
            ),
            LogFormat::TimeLevelFunctionMsg => format!(
                "{} {} [{}]: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                self.level_tag(record.level()),
                record.target(),
                record.args()
            ),
        }
    }
}

fn atty_stderr() -> bool {
    // SAFETY: isatty() is a read-only query on a valid, always-open fd.
    unsafe { libc::isatty(libc::STDERR_FILENO) == 1 }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format_line(record);
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{line}");
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

/// Install `logger` as the global `log` backend. Call once from `main()`.
pub fn init(logger: Logger) -> std::result::Result<(), log::SetLoggerError> {
    log::set_max_level(logger.filter);
    log::set_boxed_logger(Box::new(logger))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    // A Sink that also keeps a second handle so tests can read back what was
    // written, since Logger owns the boxed Sink exclusively.
    struct SharedBuf(Arc<StdMutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn formats_msg_only() {
        let buf = Arc::new(StdMutex::new(Vec::new()));
        let logger = Logger::with_sink(
            LevelFilter::Info,
            LogFormat::Msg,
            LogColor::None,
            Box::new(SharedBuf(buf.clone())),
        );
        let record = Record::builder()
            .args(format_args!("hello"))
            .level(Level::Info)
            .build();
        logger.log(&record);
        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn respects_filter() {
        let buf = Arc::new(StdMutex::new(Vec::new()));
        let logger = Logger::with_sink(
            LevelFilter::Warn,
            LogFormat::Msg,
            LogColor::None,
            Box::new(SharedBuf(buf.clone())),
        );
        let record = Record::builder()
            .args(format_args!("debug stuff"))
            .level(Level::Debug)
            .build();
        logger.log(&record);
        assert!(buf.lock().unwrap().is_empty());
    }

    #[test]
    fn level_msg_includes_level_tag() {
        let buf = Arc::new(StdMutex::new(Vec::new()));
        let logger = Logger::with_sink(
            LevelFilter::Info,
            LogFormat::LevelMsg,
            LogColor::None,
            Box::new(SharedBuf(buf.clone())),
        );
        let record = Record::builder()
            .args(format_args!("oops"))
            .level(Level::Error)
            .build();
        logger.log(&record);
        let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "ERROR: oops\n");
    }
}
