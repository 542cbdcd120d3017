use super::diskstats::{PerfSampler, FALLBACK_PERF};
use super::{ProcessDelta, RawSample, SampleSource};
use crate::error::{DiskMonError, Result};
use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

/// Host I/O read from per-process disk usage.
///
/// System-wide byte counts are the sum over all processes. A process seen for
/// the first time contributes nothing on that poll; its counters only serve
/// as a baseline.
pub struct SysinfoSource {
    system: System,
    known_pids: HashSet<Pid>,
    perf: PerfSampler,
    perf_refresh_every: u32,
    polls: u64,
    cached_perf: (f64, f64),
}

impl SysinfoSource {
    pub fn new(perf_refresh_every: u32) -> Self {
        Self {
            system: System::new(),
            known_pids: HashSet::new(),
            perf: PerfSampler::new(),
            perf_refresh_every: perf_refresh_every.max(1),
            polls: 0,
            cached_perf: FALLBACK_PERF,
        }
    }

    fn refresh_perf(&mut self) {
        if self.polls % self.perf_refresh_every as u64 != 0 {
            return;
        }
        match self.perf.sample() {
            Ok(perf) => self.cached_perf = perf,
            Err(e) => warn!(error = %e, "Disk performance counters unavailable"),
        }
    }
}

impl SampleSource for SysinfoSource {
    fn poll(&mut self) -> Result<RawSample> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_disk_usage()
                .with_exe(UpdateKind::OnlyIfNotSet),
        );

        if self.system.processes().is_empty() {
            return Err(DiskMonError::SourceError(
                "no processes visible to the sampler".to_string(),
            ));
        }

        let mut read_total: u64 = 0;
        let mut write_total: u64 = 0;
        let mut by_name: HashMap<String, (Option<String>, u64, u64)> = HashMap::new();

        for (pid, process) in self.system.processes() {
            if self.known_pids.insert(*pid) {
                continue;
            }

            let usage = process.disk_usage();
            if usage.read_bytes == 0 && usage.written_bytes == 0 {
                continue;
            }

            read_total = read_total.saturating_add(usage.read_bytes);
            write_total = write_total.saturating_add(usage.written_bytes);

            let entry = by_name
                .entry(process.name().to_string_lossy().to_string())
                .or_insert_with(|| (process.exe().map(|p| p.to_string_lossy().to_string()), 0, 0));
            entry.1 = entry.1.saturating_add(usage.read_bytes);
            entry.2 = entry.2.saturating_add(usage.written_bytes);
        }

        let system = &self.system;
        self.known_pids.retain(|pid| system.process(*pid).is_some());

        self.refresh_perf();
        self.polls += 1;

        debug!(
            read = read_total,
            write = write_total,
            processes = by_name.len(),
            "Sampled host I/O"
        );

        let (idle_time, queue_depth) = self.cached_perf;
        Ok(RawSample {
            read_bytes: read_total,
            write_bytes: write_total,
            idle_time,
            queue_depth,
            processes: by_name
                .into_iter()
                .map(|(name, (exe_path, read_bytes, write_bytes))| ProcessDelta {
                    name,
                    exe_path,
                    read_bytes,
                    write_bytes,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_poll_is_baseline_only() {
        let mut source = SysinfoSource::new(5);
        let first = source.poll().unwrap();

        assert_eq!(first.read_bytes, 0);
        assert_eq!(first.write_bytes, 0);
        assert!(first.processes.is_empty());
        assert!(!source.known_pids.is_empty());
    }

    #[test]
    fn test_perf_values_stay_in_range() {
        let mut source = SysinfoSource::new(1);
        for _ in 0..3 {
            let sample = source.poll().unwrap();
            assert!((0.0..=100.0).contains(&sample.idle_time));
            assert!(sample.queue_depth >= 0.0);
        }
    }
}
