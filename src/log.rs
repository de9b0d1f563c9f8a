//! File logger shared by the coordinator, node agents and the CLI.
//!
//! One process may host a coordinator and several agents (`hive run`), so
//! every line carries the level and a millisecond timestamp and callers put
//! the node or task id in the message itself.
//!
//! The level starts at INFO, or DEBUG with `--debug` / `HIVE_DEBUG=1`.
//! `HIVE_LOG=<level>` overrides both, e.g. `HIVE_LOG=trace` to see every
//! time slice. Lines go to `~/.hive/hive.log`; `mirror_stderr` also echoes
//! them to stderr for headless nodes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static MIRROR_STDERR: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Work lost or a component stopped.
    Error = 0,
    /// Recoverable cluster events: node lost, lease expired, bad frame.
    Warn = 1,
    /// Lifecycle: startup, handshakes, submissions.
    Info = 2,
    /// Scheduling decisions: assignments, steals, retries.
    Debug = 3,
    /// Per-message and per-slice detail.
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

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
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

/// Pick the starting level from the CLI flag and the environment.
fn resolve_level(debug: bool, hive_debug: Option<&str>, hive_log: Option<&str>) -> LogLevel {
    if let Some(level) = hive_log.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = hive_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to `~/.hive/hive.log`, truncating the previous run.
pub fn init_with_debug(debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("HIVE_DEBUG").ok().as_deref(),
        std::env::var("HIVE_LOG").ok().as_deref(),
    );
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(hive_dir) = dirs::home_dir().map(|h| h.join(".hive")) {
        let _ = std::fs::create_dir_all(&hive_dir);
        let path = hive_dir.join("hive.log");
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// Echo every logged line to stderr as well as the log file.
pub fn mirror_stderr(enabled: bool) {
    MIRROR_STDERR.store(enabled, Ordering::SeqCst);
}

fn format_line(timestamp: &str, level: LogLevel, msg: &str) -> String {
    format!("[{}] [{:<5}] {}", timestamp, level.as_str(), msg)
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed)) {
        return;
    }

    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    let line = format_line(&timestamp, level, msg);
    if MIRROR_STDERR.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Log a message at INFO level (default, always logged).
pub fn log(msg: &str) {
    log_at(LogLevel::Info, msg);
}

/// Log a message at ERROR level.
pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

/// Log a message at WARN level.
pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

/// Log a message at DEBUG level (only in debug mode).
pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

/// Log a message at TRACE level (very verbose).
pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! hlog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! hlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! hlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! hlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! hlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
