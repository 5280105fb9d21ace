//! Kernel logging subsystem
//!
//! Provides structured logging with timestamps and log levels. Records are
//! kept in a bounded in-memory ring (dmesg style) so diagnostics and hosted
//! tests can read back what the subsystems reported.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

/// Global tick counter for timestamps
static TICK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Capacity of the record ring; older records are dropped first.
const RING_CAPACITY: usize = 256;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// One captured log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub tick: u64,
    pub level: LogLevel,
    pub text: String,
}

lazy_static! {
    static ref RING: Mutex<VecDeque<LogRecord>> = Mutex::new(VecDeque::new());
}

/// Get current tick count as timestamp
pub fn get_timestamp() -> u64 {
    TICK_COUNTER.load(Ordering::Relaxed)
}

/// Increment tick counter (called by timer interrupt)
pub fn tick() {
    TICK_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Internal log function
#[doc(hidden)]
pub fn _log(level: LogLevel, args: core::fmt::Arguments) {
    let record = LogRecord {
        tick: get_timestamp(),
        level,
        text: alloc::fmt::format(args),
    };
    let mut ring = RING.lock();
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(record);
}

/// Snapshot of the captured records, oldest first.
pub fn records() -> Vec<LogRecord> {
    RING.lock().iter().cloned().collect()
}

/// Drop all captured records.
pub fn clear() {
    RING.lock().clear();
}

/// Log macro with level
#[macro_export]
macro_rules! log_level {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::_log($level, format_args!($($arg)*))
    };
}

/// Info log (default)
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Info, $($arg)*)
    };
}

/// Debug log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Debug, $($arg)*)
    };
}

/// Warning log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Warn, $($arg)*)
    };
}

/// Error log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Error, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_capture_level_and_text() {
        crate::log_warn!("ring marker {}", 0xB0DE55u32);
        let captured = records();
        let hit = captured
            .iter()
            .find(|r| r.text.contains("ring marker 11591253"))
            .expect("record not captured");
        assert_eq!(hit.level, LogLevel::Warn);
    }
}
