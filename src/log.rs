//! File logging for wavepilot runs.
//!
//! Log levels:
//! - ERROR: a run could not be planned or a report could not be written
//! - WARN: task-local failures, timeouts, cleanup that had to be skipped
//! - INFO: run lifecycle (planning result, wave boundaries, report paths)
//! - DEBUG: isolation and process lifecycle for each task
//! - TRACE: raw tool output and git plumbing
//!
//! `--debug` or `WAVEPILOT_DEBUG=1` raises the level to DEBUG;
//! `WAVEPILOT_LOG=<level>` picks any level explicitly. Nothing is written
//! until [`init_with_debug`] has run, so the library stays silent when
//! embedded or under test.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Concurrent tasks share one handle so their lines never interleave.
struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Case-insensitive level name.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(name))
    }

    fn from_u8(v: u8) -> Self {
        Self::ALL
            .get(v as usize)
            .copied()
            .unwrap_or(LogLevel::Trace)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Pick the level from the `--debug` flag and the environment.
fn resolve_level(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("WAVEPILOT_LOG")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
    {
        return level;
    }
    if debug || env_flag("WAVEPILOT_DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging to `~/.wavepilot/wavepilot.log`, truncating any previous run.
pub fn init_with_debug(debug: bool) {
    set_level(resolve_level(debug));

    let Some(dir) = dirs::home_dir().map(|h| h.join(".wavepilot")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join("wavepilot.log");
    if let Ok(file) = File::create(&path) {
        let _ = SINK.set(Sink {
            path,
            file: Mutex::new(file),
        });
    }
}

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|sink| sink.path.as_path())
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
    }
}

/// Log at INFO level.
#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
