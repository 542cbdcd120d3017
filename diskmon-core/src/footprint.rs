use crate::error::{DiskMonError, Result};
use crate::models::AppMetrics;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Measures the monitor's own memory, CPU and on-disk size, so its observer
/// effect stays visible.
#[derive(Clone)]
pub struct FootprintMeter {
    system: Arc<Mutex<System>>,
    pid: Pid,
}

impl Default for FootprintMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl FootprintMeter {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// CPU usage is measured between consecutive calls, so the first one
    /// reports 0.
    pub async fn measure(&self, database_size: u64) -> Result<AppMetrics> {
        let meter = self.clone();
        tokio::task::spawn_blocking(move || meter.measure_blocking(database_size))
            .await
            .map_err(|e| DiskMonError::SourceError(format!("footprint meter panicked: {}", e)))?
    }

    fn measure_blocking(&self, database_size: u64) -> Result<AppMetrics> {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );

        let process = system.process(self.pid).ok_or_else(|| {
            DiskMonError::SourceError(format!("own process {} not visible", self.pid))
        })?;

        let executable_size = std::env::current_exe()
            .and_then(std::fs::metadata)
            .map(|metadata| metadata.len())
            .unwrap_or(0);

        Ok(AppMetrics {
            ram_usage: process.memory(),
            cpu_usage: process.cpu_usage(),
            database_size,
            executable_size,
            total_disk_size: database_size.saturating_add(executable_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Validate;

    #[tokio::test]
    async fn test_measures_own_process() {
        let meter = FootprintMeter::new();
        let metrics = meter.measure(4096).await.unwrap();

        assert!(metrics.ram_usage > 0);
        assert!(metrics.executable_size > 0);
        assert_eq!(metrics.total_disk_size, 4096 + metrics.executable_size);
        assert!(metrics.validate().is_ok());

        let again = meter.measure(0).await.unwrap();
        assert!(again.cpu_usage >= 0.0);
    }
}
