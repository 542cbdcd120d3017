//! Disk idle time and queue depth from the kernel's `/proc/diskstats`.
//!
//! Both figures are derived from two snapshots: the share of wall time the
//! disks spent doing I/O (`io_ticks`) gives the idle percentage, and the
//! weighted time in queue divided by wall time gives the average queue depth.

use std::time::{Duration, Instant};

/// Values reported when counters are unavailable.
pub const FALLBACK_PERF: (f64, f64) = (100.0, 0.0);

const IO_TICKS_FIELD: usize = 12;
const WEIGHTED_MS_FIELD: usize = 13;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub disks: usize,
    pub io_ticks_ms: u64,
    pub weighted_ms: u64,
}

/// Sums the busy and weighted-busy counters of every line whose device
/// passes `is_whole_disk`. Malformed lines are skipped.
pub fn parse_diskstats<F>(content: &str, is_whole_disk: F) -> DiskCounters
where
    F: Fn(&str) -> bool,
{
    let mut counters = DiskCounters::default();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= WEIGHTED_MS_FIELD {
            continue;
        }

        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") || !is_whole_disk(name) {
            continue;
        }

        let (Ok(io_ticks), Ok(weighted)) = (
            fields[IO_TICKS_FIELD].parse::<u64>(),
            fields[WEIGHTED_MS_FIELD].parse::<u64>(),
        ) else {
            continue;
        };

        counters.disks += 1;
        counters.io_ticks_ms = counters.io_ticks_ms.saturating_add(io_ticks);
        counters.weighted_ms = counters.weighted_ms.saturating_add(weighted);
    }

    counters
}

/// Idle percentage and average queue depth between two snapshots.
pub fn perf_between(previous: &DiskCounters, current: &DiskCounters, elapsed: Duration) -> (f64, f64) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if elapsed_ms <= 0.0 || current.disks == 0 {
        return FALLBACK_PERF;
    }

    let busy_ms = current.io_ticks_ms.saturating_sub(previous.io_ticks_ms) as f64;
    let queued_ms = current.weighted_ms.saturating_sub(previous.weighted_ms) as f64;

    let busy_share = busy_ms / (elapsed_ms * current.disks as f64);
    let idle = (100.0 - busy_share * 100.0).clamp(0.0, 100.0);
    let queue = (queued_ms / elapsed_ms).max(0.0);

    (idle, queue)
}

/// Keeps the previous snapshot so each call reports activity since the last one.
#[derive(Debug, Default)]
pub struct PerfSampler {
    previous: Option<(Instant, DiskCounters)>,
}

impl PerfSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fresh snapshot. The first one only establishes a baseline.
    pub fn observe(&mut self, counters: DiskCounters, at: Instant) -> (f64, f64) {
        let result = match &self.previous {
            Some((taken_at, previous)) => {
                perf_between(previous, &counters, at.saturating_duration_since(*taken_at))
            }
            None => FALLBACK_PERF,
        };
        self.previous = Some((at, counters));
        result
    }

    #[cfg(target_os = "linux")]
    pub fn sample(&mut self) -> std::io::Result<(f64, f64)> {
        let content = std::fs::read_to_string("/proc/diskstats")?;
        let counters = parse_diskstats(&content, |name| {
            std::path::Path::new("/sys/block").join(name).exists()
        });
        Ok(self.observe(counters, Instant::now()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn sample(&mut self) -> std::io::Result<(f64, f64)> {
        Ok(FALLBACK_PERF)
    }
}
