//! Leveled file logging for the coordinator.
//!
//! Log levels:
//! - ERROR: configuration errors that stop a run before scheduling
//! - WARN: degraded paths (stale workers, wave timeouts, halted convergence, orphans)
//! - INFO: phase transitions, wave dispatch, verdicts
//! - DEBUG: ledger updates, registry operations
//! - TRACE: individual worker signals
//!
//! Output goes to `<cadence home>/cadence.log` until a session redirects it
//! with [`redirect`]. Debug mode is enabled with `--debug` or `CADENCE_DEBUG=1`;
//! `CADENCE_LOG=<level>` picks an explicit level.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;

static LOG_PATH: RwLock<Option<PathBuf>> = RwLock::new(None);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static WARNINGS: AtomicU64 = AtomicU64::new(0);

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

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Initialize logging. `debug` raises the level to DEBUG unless
/// `CADENCE_LOG` names a level explicitly.
pub fn init(debug: bool) {
    let env_debug = std::env::var("CADENCE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let level = std::env::var("CADENCE_LOG")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
        .unwrap_or(if debug || env_debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });
    set_level(level);

    if let Ok(home) = crate::config::Config::cadence_dir() {
        let _ = std::fs::create_dir_all(&home);
        redirect(&home.join("cadence.log"));
    }
}

/// Send subsequent log lines to `path` (appending).
pub fn redirect(path: &Path) {
    if let Ok(mut guard) = LOG_PATH.write() {
        *guard = Some(path.to_path_buf());
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Number of WARN lines emitted since startup, logged or not.
pub fn warning_count() -> u64 {
    WARNINGS.load(Ordering::Relaxed)
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level == LogLevel::Warn {
        WARNINGS.fetch_add(1, Ordering::Relaxed);
    }
    if level > self::level() {
        return;
    }

    let path = match LOG_PATH.read() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    if let Some(path) = path {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            let _ = writeln!(file, "{} {:<5} {}", timestamp, level.as_str(), msg);
        }
    }
}

#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
    };
}
