use crate::buffer::SampleBuffer;
use crate::collector::SessionCounters;
use crate::error::Result;
use crate::footprint::FootprintMeter;
use crate::models::{AppMetrics, DatabaseStats, IoTotals, ProcessHistory, ResetReport, TopProcesses};
use crate::storage::{PersistenceWriter, QueryService};
use std::sync::Arc;
use tracing::{info, warn};

/// The consumer-facing command surface.
#[derive(Clone)]
pub struct QueryCommands {
    query: QueryService,
    writer: Arc<PersistenceWriter>,
    buffer: Arc<SampleBuffer>,
    counters: Arc<SessionCounters>,
    footprint: FootprintMeter,
}

impl QueryCommands {
    pub fn new(
        query: QueryService,
        writer: Arc<PersistenceWriter>,
        buffer: Arc<SampleBuffer>,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            query,
            writer,
            buffer,
            counters,
            footprint: FootprintMeter::new(),
        }
    }

    pub async fn get_alltime_totals(&self) -> Result<IoTotals> {
        self.query.totals().await
    }

    pub async fn get_process_history(&self) -> Result<ProcessHistory> {
        self.query.process_history().await
    }

    pub async fn get_database_stats(&self) -> Result<DatabaseStats> {
        self.query.database_stats().await
    }

    /// Busiest process groups since startup or the last reset.
    pub async fn get_top_processes(&self) -> TopProcesses {
        self.counters.top_processes().await
    }

    pub async fn get_app_metrics(&self) -> Result<AppMetrics> {
        let database_size = self.query.database_size()?;
        self.footprint.measure(database_size).await
    }

    /// Wipes all collected data.
    ///
    /// Flushes and sample production are held off until the store reset has
    /// either committed or failed. In-memory state is only discarded after a
    /// commit, so a failed reset leaves counters, buffer and store as they were.
    pub async fn reset_database(&self) -> Result<ResetReport> {
        let _flushes = self.writer.block_flushes().await;
        let mut session = self.counters.lock().await;

        let report = match self.query.reset().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Database reset failed, session state kept");
                return Err(e);
            }
        };

        session.clear();
        let discarded = self.buffer.clear();
        drop(session);

        info!(discarded, "Session counters and buffer cleared after reset");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FlushThresholds;
    use crate::collector::Collector;
    use crate::config::DiskMonConfig;
    use crate::events::EventPublisher;
    use crate::models::Sample;
    use crate::source::{MockSampleSource, ProcessDelta, RawSample};
    use crate::storage::Database;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    struct Fixture {
        db: Database,
        buffer: Arc<SampleBuffer>,
        writer: Arc<PersistenceWriter>,
        counters: Arc<SessionCounters>,
        commands: QueryCommands,
    }

    async fn fixture(path: &Path, busy_timeout_ms: u64, max_records: usize) -> Fixture {
        let mut storage = DiskMonConfig::default().storage;
        storage.busy_timeout_ms = busy_timeout_ms;
        let db = Database::new(path, &storage).await.unwrap();
        let buffer = Arc::new(SampleBuffer::new(FlushThresholds {
            max_records,
            max_age: Duration::from_secs(60),
            capacity: 3600,
        }));
        let writer = Arc::new(PersistenceWriter::new(db.pool().clone(), Arc::clone(&buffer), 3, 500));
        let counters = Arc::new(SessionCounters::new());
        let commands = QueryCommands::new(
            QueryService::new(db.pool().clone(), db.files().clone()),
            Arc::clone(&writer),
            Arc::clone(&buffer),
            Arc::clone(&counters),
        );
        Fixture {
            db,
            buffer,
            writer,
            counters,
            commands,
        }
    }

    fn sample(read_bytes: u64) -> Sample {
        Sample {
            timestamp: 1_700_000_000.0 + read_bytes as f64,
            read_bytes,
            write_bytes: read_bytes,
            read_speed: 0,
            write_speed: 0,
            idle_time: 100.0,
            queue_depth: 0.0,
        }
    }

    #[tokio::test]
    async fn test_reset_clears_store_buffer_and_counters() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir.path().join("commands.db"), 5000, 60).await;

        let mut deltas = HashMap::new();
        deltas.insert("java".to_string(), (10, 10));
        fx.writer.flush(&[sample(100), sample(250)], &deltas).await.unwrap();
        fx.counters.seed(IoTotals { read_bytes: 250, write_bytes: 250 }).await;
        fx.buffer.append(sample(400));

        assert_eq!(fx.commands.get_alltime_totals().await.unwrap().read_bytes, 250);
        assert_eq!(fx.commands.get_process_history().await.unwrap().len(), 1);

        let report = fx.commands.reset_database().await.unwrap();
        assert!(report.size_after <= report.size_before);

        assert!(fx.buffer.is_empty());
        assert_eq!(fx.counters.snapshot().await, IoTotals::default());
        assert_eq!(fx.commands.get_alltime_totals().await.unwrap(), IoTotals::default());
        assert!(fx.commands.get_process_history().await.unwrap().is_empty());
        assert_eq!(fx.commands.get_database_stats().await.unwrap().sample_count, 0);

        // Flushing is unblocked again once the reset returns.
        fx.buffer.append(sample(5));
        assert_eq!(fx.writer.flush_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_session_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let fx = fixture(&path, 50, 60).await;
        let other = Database::new(&path, &DiskMonConfig::default().storage).await.unwrap();

        fx.writer.flush(&[sample(100), sample(250)], &HashMap::new()).await.unwrap();
        fx.counters.seed(IoTotals { read_bytes: 250, write_bytes: 250 }).await;
        fx.buffer.append(sample(400));

        // A second connection holds the write lock past the busy timeout.
        let mut tx = other.pool().begin().await.unwrap();
        sqlx::query("INSERT INTO process_history (name, read_bytes, write_bytes) VALUES ('holder', 1, 1)")
            .execute(&mut *tx)
            .await
            .unwrap();

        assert!(fx.commands.reset_database().await.is_err());

        assert_eq!(fx.commands.get_alltime_totals().await.unwrap().read_bytes, 250);
        assert_eq!(fx.buffer.len(), 1);
        assert_eq!(
            fx.counters.snapshot().await,
            IoTotals { read_bytes: 250, write_bytes: 250 }
        );

        tx.rollback().await.unwrap();
        fx.commands.reset_database().await.unwrap();
        assert!(fx.buffer.is_empty());
        assert_eq!(fx.counters.snapshot().await, IoTotals::default());
        other.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_while_collecting_keeps_no_earlier_sample() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir.path().join("busy.db"), 5000, 2).await;

        let mut source = MockSampleSource::new();
        source.expect_poll().returning(|| {
            Ok(RawSample {
                read_bytes: 100,
                write_bytes: 100,
                processes: vec![ProcessDelta {
                    name: "java".to_string(),
                    exe_path: None,
                    read_bytes: 100,
                    write_bytes: 100,
                }],
                ..RawSample::default()
            })
        });
        let collector = Collector::new(
            Box::new(source),
            Arc::clone(&fx.counters),
            Arc::clone(&fx.buffer),
            EventPublisher::new(16),
            Arc::clone(&fx.writer),
            Duration::from_millis(1),
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(collector.run(shutdown_tx.clone()));

        while fx.counters.snapshot().await.read_bytes < 3_000 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // Start a flush so the reset has to wait for one in flight.
        fx.writer.trigger();
        fx.commands.reset_database().await.unwrap();

        while fx.counters.snapshot().await.read_bytes < 500 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        fx.writer.flush_all().await;

        // Every stored value counts up from zero in steps of one tick.
        let stored: Vec<i64> = sqlx::query_scalar("SELECT read_bytes FROM disk_stats ORDER BY id")
            .fetch_all(fx.db.pool())
            .await
            .unwrap();
        assert!(stored.len() >= 5);
        let expected: Vec<i64> = (1..=stored.len() as i64).map(|tick| tick * 100).collect();
        assert_eq!(stored, expected);

        let totals = fx.counters.snapshot().await;
        assert_eq!(totals.read_bytes, stored.len() as u64 * 100);
        let history = fx.commands.get_process_history().await.unwrap();
        assert_eq!(history["java"].read_bytes, totals.read_bytes);
    }

    #[tokio::test]
    async fn test_top_processes_and_app_metrics() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir.path().join("metrics.db"), 5000, 60).await;

        assert!(fx.commands.get_top_processes().await.is_empty());

        let metrics = fx.commands.get_app_metrics().await.unwrap();
        assert!(metrics.database_size > 0);
        assert_eq!(
            metrics.total_disk_size,
            metrics.database_size + metrics.executable_size
        );
    }
}
