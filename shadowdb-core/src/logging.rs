// src/logging.rs
// Embedded stderr logging for the engine, controlled by a process-wide level

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted by [`init_from_env`]
pub const LOG_ENV_VAR: &str = "SHADOWDB_LOG";

/// Log levels (ordered by severity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Nothing is printed
    Off = 0,
    /// Failures surfaced to the caller
    Error = 1,
    /// Recoverable oddities (ignored options, unusable indexes)
    Warn = 2,
    /// Index and collection lifecycle
    Info = 3,
    /// Pipeline and query execution
    Debug = 4,
    /// Per-document matcher and index decisions
    Trace = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Case-insensitive parse
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(LogLevel::Off),
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// Default: WARN
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> LogLevel {
    LogLevel::from_u8(GLOBAL_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Apply the level named by `SHADOWDB_LOG`, if set and valid.
///
/// Returns the level that is active afterwards.
pub fn init_from_env() -> LogLevel {
    if let Ok(raw) = std::env::var(LOG_ENV_VAR) {
        if let Ok(level) = raw.parse::<LogLevel>() {
            set_log_level(level);
        }
    }
    get_log_level()
}

#[inline]
pub fn should_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= get_log_level()
}

#[doc(hidden)]
pub fn log_message(level: LogLevel, module: &str, message: &str) {
    if should_log(level) {
        eprintln!("[{:<5}] {}: {}", level.as_str(), module, message);
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

/// Trace output skips formatting entirely unless enabled
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        if $crate::logging::should_log($crate::logging::LogLevel::Trace) {
            $crate::logging::log_message(
                $crate::logging::LogLevel::Trace,
                module_path!(),
                &format!($($arg)*)
            )
        }
    };
}
