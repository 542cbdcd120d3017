//! Periodic store upkeep: retention cleanup, statistics refresh and WAL
//! checkpointing, each on its own timer.
//!
//! Every task is a separate failure domain. A run that errors or panics is
//! logged and counted, and the task simply waits for its next tick.

use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::models::unix_now;
use crate::storage::{RetentionManager, RetentionPolicy};
use crate::telemetry::PrometheusExporter;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    Cleanup,
    Analyze,
    Checkpoint,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 3] = [Self::Cleanup, Self::Analyze, Self::Checkpoint];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Analyze => "analyze",
            Self::Checkpoint => "checkpoint",
        }
    }
}

pub struct MaintenanceScheduler {
    retention: Arc<RetentionManager>,
    policy: RetentionPolicy,
    config: MaintenanceConfig,
    metrics: Option<Arc<PrometheusExporter>>,
}

impl MaintenanceScheduler {
    pub fn new(retention: Arc<RetentionManager>, policy: RetentionPolicy, config: MaintenanceConfig) -> Self {
        Self {
            retention,
            policy,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn period(&self, task: MaintenanceTask) -> Duration {
        let secs = match task {
            MaintenanceTask::Cleanup => self.config.cleanup_interval_secs,
            MaintenanceTask::Analyze => self.config.analyze_interval_secs,
            MaintenanceTask::Checkpoint => self.config.checkpoint_interval_secs,
        };
        Duration::from_secs(secs)
    }

    pub async fn run_once(&self, task: MaintenanceTask) -> Result<()> {
        match task {
            MaintenanceTask::Cleanup => self.cleanup().await,
            MaintenanceTask::Analyze => self.retention.analyze().await,
            MaintenanceTask::Checkpoint => self.retention.checkpoint_passive().await,
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let report = self.retention.cleanup_at(&self.policy, unix_now()).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_retention(report.deleted + report.thinned, report.archived);
        }

        if report.deleted + report.thinned > 0 && self.config.vacuum_after_cleanup {
            if let Err(e) = self.retention.vacuum().await {
                warn!(error = %e, "VACUUM after cleanup failed");
            }
        }

        Ok(())
    }

    /// Starts one independent loop per task.
    pub fn spawn_all(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        MaintenanceTask::ALL
            .iter()
            .map(|task| {
                let task = *task;
                let scheduler = Arc::clone(self);
                spawn_periodic(
                    task.name(),
                    self.period(task),
                    shutdown_tx.clone(),
                    self.metrics.clone(),
                    move || {
                        let scheduler = Arc::clone(&scheduler);
                        async move { scheduler.run_once(task).await }
                    },
                )
            })
            .collect()
    }
}

/// Runs `job` every `period` until shutdown. The first run happens
/// immediately. Each run is its own task, so a panic ends that run only.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown_tx: broadcast::Sender<()>,
    metrics: Option<Arc<PrometheusExporter>>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, "Maintenance task scheduled every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ok = match tokio::spawn(job()).await {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            error!(task = name, error = %e, "Maintenance run failed");
                            false
                        }
                        Err(e) => {
                            error!(task = name, error = %e, "Maintenance run panicked");
                            false
                        }
                    };
                    if let Some(metrics) = &metrics {
                        metrics.record_maintenance(name, ok);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(task = name, "Maintenance task shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskMonConfig;
    use crate::error::DiskMonError;
    use crate::models::SECONDS_PER_DAY;
    use crate::storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    async fn wait_for(counter: &AtomicUsize, at_least: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("counter stuck at {}", counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_its_loop_alive() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("flaky", Duration::from_millis(10), shutdown_tx.clone(), None, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run blows up");
                }
                Ok(())
            }
        });

        wait_for(&runs, 3).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_task_does_not_affect_others() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let metrics = Arc::new(PrometheusExporter::new().unwrap());
        let healthy_runs = Arc::new(AtomicUsize::new(0));
        let failing_runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&failing_runs);
        let failing = spawn_periodic("failing", Duration::from_millis(10), shutdown_tx.clone(), Some(Arc::clone(&metrics)), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DiskMonError::ServiceUnavailable("store locked".to_string()))
            }
        });

        let counter = Arc::clone(&healthy_runs);
        let healthy = spawn_periodic("healthy", Duration::from_millis(10), shutdown_tx.clone(), Some(Arc::clone(&metrics)), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        wait_for(&failing_runs, 3).await;
        wait_for(&healthy_runs, 3).await;
        shutdown_tx.send(()).unwrap();
        failing.await.unwrap();
        healthy.await.unwrap();

        let text = metrics.render_metrics().unwrap();
        assert!(text.contains("diskmon_maintenance_failures_total{task=\"failing\"}"));
        assert!(text.contains("diskmon_maintenance_runs_total{task=\"healthy\"}"));
    }

    #[tokio::test]
    async fn test_run_once_executes_every_task() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("maintenance.db"), &DiskMonConfig::default().storage)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO disk_stats (timestamp, read_bytes, write_bytes, read_speed, write_speed)
             VALUES (?, 1, 1, 0, 0), (?, 2, 2, 0, 0)",
        )
        .bind(unix_now() - 90.0 * SECONDS_PER_DAY)
        .bind(unix_now())
        .execute(db.pool())
        .await
        .unwrap();

        let config = DiskMonConfig::default();
        let metrics = Arc::new(PrometheusExporter::new().unwrap());
        let scheduler = MaintenanceScheduler::new(
            Arc::new(RetentionManager::new(db.pool().clone())),
            RetentionPolicy::from(&config.retention),
            config.maintenance.clone(),
        )
        .with_metrics(Arc::clone(&metrics));

        for task in MaintenanceTask::ALL {
            scheduler.run_once(task).await.unwrap();
        }

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM disk_stats")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 1);
        assert!(metrics
            .render_metrics()
            .unwrap()
            .contains("diskmon_retention_deleted_total 1"));
    }

    #[tokio::test]
    async fn test_periods_follow_config() {
        let config = DiskMonConfig::default();
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("periods.db"), &config.storage)
            .await
            .unwrap();

        let scheduler = MaintenanceScheduler::new(
            Arc::new(RetentionManager::new(db.pool().clone())),
            RetentionPolicy::default(),
            config.maintenance.clone(),
        );
        assert_eq!(scheduler.period(MaintenanceTask::Cleanup), Duration::from_secs(86_400));
        assert_eq!(scheduler.period(MaintenanceTask::Analyze), Duration::from_secs(604_800));
        assert_eq!(scheduler.period(MaintenanceTask::Checkpoint), Duration::from_secs(21_600));
    }
}
