//! Where raw disk I/O readings come from.

pub mod diskstats;
pub mod sysinfo;

pub use self::sysinfo::SysinfoSource;

use crate::error::Result;

/// Bytes one process moved since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDelta {
    pub name: String,
    pub exe_path: Option<String>,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// One reading from a [`SampleSource`]. Byte counts are deltas since the
/// previous successful poll, not cumulative values.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub idle_time: f64,
    pub queue_depth: f64,
    pub processes: Vec<ProcessDelta>,
}

impl Default for RawSample {
    fn default() -> Self {
        Self {
            read_bytes: 0,
            write_bytes: 0,
            idle_time: 100.0,
            queue_depth: 0.0,
            processes: Vec::new(),
        }
    }
}

/// Host-specific reader of disk counters. `poll` may block briefly and is
/// called off the async runtime.
#[cfg_attr(test, mockall::automock)]
pub trait SampleSource {
    fn poll(&mut self) -> Result<RawSample>;
}
