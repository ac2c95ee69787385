//! Structured file logging for cadre.
//!
//! Log levels:
//! - ERROR: Fatal cascades and failures that abort a session
//! - WARN: Recoverable conditions (optional blockers failing, forced worker closes)
//! - INFO: Session lifecycle (start, gates, drain, close)
//! - DEBUG: Graph mutations and scheduling decisions
//! - TRACE: Message traffic between coordinator and workers
//!
//! Debug mode can be enabled with `--debug` flag or `CADRE_DEBUG=1` env var.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Log levels for filtering messages.
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
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

fn env_debug() -> bool {
    std::env::var("CADRE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Initialize logging to ~/.cadre/cadre.log.
pub fn init_with_debug(debug: bool) {
    match dirs::home_dir().map(|h| h.join(".cadre")) {
        Some(dir) => {
            let _ = std::fs::create_dir_all(&dir);
            init_at(&dir.join("cadre.log"), debug);
        }
        None => set_level(level_for(debug)),
    }
}

/// Initialize logging to an explicit file. The file is truncated.
///
/// Only the first call fixes the path; later calls still adjust the level.
pub fn init_at(path: &Path, debug: bool) {
    set_level(level_for(debug));
    if LOG_PATH.get().is_none() {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(path, "");
        LOG_PATH.set(path.to_path_buf()).ok();
    }
}

fn level_for(debug: bool) -> LogLevel {
    if debug || env_debug() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Path of the active log file, if logging was initialized.
pub fn path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

/// Check if debug-level output is enabled.
pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        // Concurrent workers log from many tasks; keep lines whole.
        let _guard = WRITE_LOCK.lock();
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
