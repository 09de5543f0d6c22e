//! Run log in shared memory
//!
//! Error and warning lines raised by strands end up in the report and in the goodbye.
//! A process-backed strand raises them in a forked child, so the log lives in the
//! shared mapping next to the counters. Appends are lock-free: a writer claims a slot
//! with one `fetch_add`, fills it and publishes it with a release store.
//!
//! The log holds [`LOG_CAPACITY`] lines of at most [`LOG_LINE_LEN`] bytes. Longer lines
//! are cut at a char boundary; lines past capacity are counted and dropped.

use super::shm::{SharedRegion, Zeroable};
use anyhow::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Lines kept per run
pub const LOG_CAPACITY: usize = 128;

/// Bytes kept per line
pub const LOG_LINE_LEN: usize = 500;

/// Severity of a run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

impl LogLevel {
    fn to_raw(self) -> u32 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warning => 2,
            LogLevel::Info => 3,
        }
    }

    fn from_raw(v: u32) -> Self {
        match v {
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[repr(C)]
#[derive(Debug)]
struct LogHead {
    next: AtomicU64,
    dropped: AtomicU64,
}

unsafe impl Zeroable for LogHead {}

#[repr(C, align(64))]
#[derive(Debug)]
struct LogSlot {
    /// 1 once the line is complete
    ready: AtomicU32,
    level: AtomicU32,
    len: AtomicU32,
    bytes: [AtomicU8; LOG_LINE_LEN],
}

unsafe impl Zeroable for LogSlot {}

/// Append-only log shared by the controller and every strand of a run
#[derive(Debug)]
pub struct SharedLog {
    head: SharedRegion<LogHead>,
    slots: SharedRegion<LogSlot>,
}

impl SharedLog {
    pub fn new() -> Result<Self> {
        Ok(Self {
            head: SharedRegion::new(1)?,
            slots: SharedRegion::new(LOG_CAPACITY)?,
        })
    }

    /// Append a line; returns false when the log is full
    pub fn push(&self, level: LogLevel, message: &str) -> bool {
        let idx = self.head[0].next.fetch_add(1, Ordering::AcqRel) as usize;
        let Some(slot) = self.slots.get(idx) else {
            self.head[0].dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let mut end = message.len().min(LOG_LINE_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        for (dst, b) in slot.bytes.iter().zip(&message.as_bytes()[..end]) {
            dst.store(*b, Ordering::Relaxed);
        }
        slot.len.store(end as u32, Ordering::Relaxed);
        slot.level.store(level.to_raw(), Ordering::Relaxed);
        slot.ready.store(1, Ordering::Release);
        true
    }

    /// Completed lines in append order
    pub fn entries(&self) -> Vec<LogEntry> {
        let claimed = self.head[0].next.load(Ordering::Acquire) as usize;
        self.slots[..claimed.min(LOG_CAPACITY)]
            .iter()
            .filter(|s| s.ready.load(Ordering::Acquire) == 1)
            .map(|s| {
                let len = (s.len.load(Ordering::Relaxed) as usize).min(LOG_LINE_LEN);
                let bytes: Vec<u8> = s.bytes[..len]
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .collect();
                LogEntry {
                    level: LogLevel::from_raw(s.level.load(Ordering::Relaxed)),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                }
            })
            .collect()
    }

    /// Lines that did not fit
    pub fn dropped(&self) -> u64 {
        self.head[0].dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read_back() {
        let log = SharedLog::new().unwrap();
        assert!(log.entries().is_empty());
        log.push(LogLevel::Error, "connection refused");
        log.push(LogLevel::Info, "hello");
        assert_eq!(
            log.entries(),
            vec![
                LogEntry {
                    level: LogLevel::Error,
                    message: "connection refused".to_string()
                },
                LogEntry {
                    level: LogLevel::Info,
                    message: "hello".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_long_lines_cut_at_char_boundary() {
        let log = SharedLog::new().unwrap();
        let line = "é".repeat(LOG_LINE_LEN);
        log.push(LogLevel::Warning, &line);
        let msg = &log.entries()[0].message;
        assert!(msg.len() <= LOG_LINE_LEN);
        assert!(msg.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_full_log_counts_dropped_lines() {
        let log = SharedLog::new().unwrap();
        for i in 0..LOG_CAPACITY + 3 {
            log.push(LogLevel::Error, &format!("line {}", i));
        }
        assert_eq!(log.entries().len(), LOG_CAPACITY);
        assert_eq!(log.dropped(), 3);
    }

    #[test]
    fn test_concurrent_writers() {
        let log = std::sync::Arc::new(SharedLog::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = std::sync::Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        log.push(LogLevel::Warning, &format!("t{} line {}", t, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.entries().len(), 40);
    }
}
