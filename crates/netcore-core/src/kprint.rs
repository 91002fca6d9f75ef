//! Leveled stderr logging
//!
//! Each leveled line looks like
//!
//! ```text
//! [INFO]     12.0431 echo-reactor conn 3 connected from 127.0.0.1:51234
//! ^level     ^secs since first log   ^thread name
//! ```
//!
//! Reactor threads are named after their manager and pool workers after
//! their pool, so the thread column identifies the component.
//!
//! # Environment Variables
//!
//! - `NETCORE_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0-5
//! - `NETCORE_FLUSH_EPRINT=1` - flush stderr after every line
//!
//! Both are read once, on the first log call or an explicit [`init`].
//!
//! ```ignore
//! use netcore_core::{kdebug, kinfo, kwarn};
//!
//! kinfo!("[{}] listening on {}", name, addr);
//! kdebug!("conn {} registered fd={}", id, fd);
//! kwarn!("unknown control byte {:#04x}", b);
//! ```

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::env::{env_get_bool, env_get_opt};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Values above 5 saturate to `Trace`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v.min(5))]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN]",
            LogLevel::Info => "[INFO]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    /// Accepts a level name (any case, `warning` too) or a digit 0-5.
    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return if n <= 5 { Ok(Self::from_u8(n)) } else { Err(()) };
        }
        let lower = s.to_ascii_lowercase();
        if lower == "warning" {
            return Ok(LogLevel::Warn);
        }
        Self::ALL.iter().copied().find(|l| l.as_str() == lower).ok_or(())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide logger state, built from the environment on first use.
struct Logger {
    level: AtomicU8,
    flush: AtomicBool,
    epoch: Instant,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| {
        let level = env_get_opt::<String>("NETCORE_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogLevel::Info);
        Logger {
            level: AtomicU8::new(level as u8),
            flush: AtomicBool::new(env_get_bool("NETCORE_FLUSH_EPRINT", false)),
            epoch: Instant::now(),
        }
    })
}

/// Read the environment and pin the timestamp epoch now.
pub fn init() {
    logger();
}

pub fn log_level() -> LogLevel {
    LogLevel::from_u8(logger().level.load(Ordering::Relaxed))
}

/// Overrides `NETCORE_LOG_LEVEL`.
pub fn set_log_level(level: LogLevel) {
    logger().level.store(level as u8, Ordering::Relaxed);
}

pub fn flush_enabled() -> bool {
    logger().flush.load(Ordering::Relaxed)
}

pub fn set_flush_enabled(enabled: bool) {
    logger().flush.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

fn emit(header: Option<LogLevel>, args: fmt::Arguments<'_>) {
    let log = logger();
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if let Some(level) = header {
        let thread = std::thread::current();
        let _ = write!(
            out,
            "{:<7} {:>10.4} {} ",
            level.tag(),
            log.epoch.elapsed().as_secs_f64(),
            thread.name().unwrap_or("-")
        );
    }
    let _ = writeln!(out, "{}", args);
    if log.flush.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: fmt::Arguments<'_>) {
    emit(None, args);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args);
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

/// Unconditional line on stderr, no header.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

/// Per-event noise: readiness, enqueue decisions.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Off < LogLevel::Error);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("DEBUG".parse(), Ok(LogLevel::Debug));
        assert_eq!(" 2 ".parse(), Ok(LogLevel::Warn));
        assert_eq!("warning".parse(), Ok(LogLevel::Warn));
        assert_eq!("9".parse::<LogLevel>(), Err(()));
        assert_eq!("loud".parse::<LogLevel>(), Err(()));
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert_eq!(LogLevel::Info.to_string(), "info");
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!level_enabled(LogLevel::Off));
    }

    #[test]
    fn test_macros_expand() {
        kprintln!();
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info {}", 1);
        kdebug!("debug");
        ktrace!("trace");
    }
}
