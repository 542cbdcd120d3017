use crate::buffer::{BufferedSample, SampleBuffer};
use crate::error::{DiskMonError, Result};
use crate::models::Sample;
use crate::telemetry::PrometheusExporter;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

const SHUTDOWN_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Moves buffered samples into the store, one transaction per flush.
///
/// At most one flush runs at a time. [`PersistenceWriter::trigger`] is a no-op
/// while a flush is in flight; the next tick re-evaluates the thresholds.
pub struct PersistenceWriter {
    pool: SqlitePool,
    buffer: Arc<SampleBuffer>,
    flush_lock: Arc<Mutex<()>>,
    max_retries: u32,
    chunk_rows: usize,
    metrics: Option<Arc<PrometheusExporter>>,
}

impl PersistenceWriter {
    pub fn new(pool: SqlitePool, buffer: Arc<SampleBuffer>, max_retries: u32, chunk_rows: usize) -> Self {
        Self {
            pool,
            buffer,
            flush_lock: Arc::new(Mutex::new(())),
            max_retries,
            chunk_rows: chunk_rows.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Inserts `records` and applies `process_deltas` in a single transaction.
    /// Either everything commits or nothing does.
    pub async fn flush(
        &self,
        records: &[Sample],
        process_deltas: &HashMap<String, (u64, u64)>,
    ) -> Result<usize> {
        if records.is_empty() && process_deltas.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(self.chunk_rows) {
            let mut query_builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO disk_stats (timestamp, read_bytes, write_bytes, read_speed, write_speed, idle_time, queue_depth) ",
            );

            query_builder.push_values(chunk, |mut b, sample| {
                b.push_bind(sample.timestamp)
                    .push_bind(sample.read_bytes as i64)
                    .push_bind(sample.write_bytes as i64)
                    .push_bind(sample.read_speed as i64)
                    .push_bind(sample.write_speed as i64)
                    .push_bind(sample.idle_time)
                    .push_bind(sample.queue_depth);
            });

            query_builder.build().execute(&mut *tx).await?;
        }

        let deltas: Vec<(&String, &(u64, u64))> = process_deltas.iter().collect();
        for chunk in deltas.chunks(self.chunk_rows) {
            let mut query_builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO process_history (name, read_bytes, write_bytes) ",
            );

            query_builder.push_values(chunk, |mut b, (name, (read, write))| {
                b.push_bind(name.as_str())
                    .push_bind(*read as i64)
                    .push_bind(*write as i64);
            });

            query_builder.push(
                " ON CONFLICT(name) DO UPDATE SET
                  read_bytes = read_bytes + excluded.read_bytes,
                  write_bytes = write_bytes + excluded.write_bytes",
            );

            query_builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(records.len())
    }

    /// Waits for any in-flight flush, then flushes whatever is buffered.
    pub async fn flush_pending(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    /// Starts a background flush unless one is already running.
    pub fn trigger(self: &Arc<Self>) {
        let Ok(guard) = Arc::clone(&self.flush_lock).try_lock_owned() else {
            debug!("Flush already in flight, trigger deferred");
            return;
        };

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = writer.flush_locked().await {
                warn!(error = %e, "Background flush failed");
            }
        });
    }

    /// Holds off every flush until the returned guard is dropped.
    pub async fn block_flushes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.flush_lock).lock_owned().await
    }

    /// Drains the buffer completely, used on orderly shutdown. Returns the
    /// number of samples written.
    pub async fn flush_all(&self) -> usize {
        let _guard = self.flush_lock.lock().await;
        let mut written = 0;
        let mut failures = 0;

        while !self.buffer.is_empty() || self.buffer.has_process_deltas() {
            match self.flush_locked().await {
                Ok(count) => {
                    written += count;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.max_retries {
                        let lost = self.buffer.clear();
                        error!(error = %e, lost, "Final flush failed, discarding buffered samples");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_dropped(lost);
                        }
                        break;
                    }
                    warn!(error = %e, attempt = failures, "Final flush failed, retrying");
                    tokio::time::sleep(SHUTDOWN_RETRY_BACKOFF).await;
                }
            }
        }

        info!("Final flush wrote {} sample(s)", written);
        written
    }

    async fn flush_locked(&self) -> Result<usize> {
        let batch = self.buffer.drain_for_flush();
        let deltas = self.buffer.take_process_deltas();
        if batch.is_empty() && deltas.is_empty() {
            return Ok(0);
        }

        let records: Vec<Sample> = batch.iter().map(|b| b.sample.clone()).collect();
        let started = Instant::now();

        match self.flush(&records, &deltas).await {
            Ok(written) => {
                let elapsed = started.elapsed();
                if let Some(metrics) = &self.metrics {
                    metrics.record_flush(written, elapsed.as_secs_f64());
                }
                debug!(
                    written,
                    processes = deltas.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flush committed"
                );
                Ok(written)
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_flush_failure();
                }
                self.buffer.restore_process_deltas(deltas);
                self.requeue_failed(batch);
                Err(e)
            }
        }
    }

    /// Returns failed records to the buffer, dropping those that have used up
    /// their retries.
    fn requeue_failed(&self, batch: Vec<BufferedSample>) {
        let (retry, dropped): (Vec<BufferedSample>, Vec<BufferedSample>) = batch
            .into_iter()
            .map(|mut record| {
                record.attempts += 1;
                record
            })
            .partition(|record| record.attempts <= self.max_retries);

        let retrying = retry.len();
        self.buffer.requeue_front(retry);

        if dropped.is_empty() {
            warn!(retrying, "Flush rolled back, records returned to buffer");
            return;
        }

        let loss = DiskMonError::FlushDropped {
            records: dropped.len(),
            attempts: self.max_retries + 1,
        };
        error!(retrying, "{}", loss);
        if let Some(metrics) = &self.metrics {
            metrics.record_dropped(dropped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FlushThresholds;
    use crate::config::DiskMonConfig;
    use crate::storage::Database;
    use tempfile::{tempdir, TempDir};

    fn sample(timestamp: f64, read_bytes: u64) -> Sample {
        Sample {
            timestamp,
            read_bytes,
            write_bytes: read_bytes / 2,
            read_speed: 10,
            write_speed: 5,
            idle_time: 99.0,
            queue_depth: 0.1,
        }
    }

    async fn setup(max_records: usize, max_retries: u32, chunk_rows: usize) -> (TempDir, Database, Arc<SampleBuffer>, Arc<PersistenceWriter>) {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("writer.db"), &DiskMonConfig::default().storage)
            .await
            .unwrap();
        let buffer = Arc::new(SampleBuffer::new(FlushThresholds {
            max_records,
            max_age: Duration::from_secs(60),
            capacity: 1000,
        }));
        let writer = Arc::new(PersistenceWriter::new(
            db.pool().clone(),
            Arc::clone(&buffer),
            max_retries,
            chunk_rows,
        ));
        (dir, db, buffer, writer)
    }

    async fn count_samples(db: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM disk_stats")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_threshold_of_two_flushes_in_batches() {
        let (_dir, db, buffer, writer) = setup(2, 3, 500).await;

        let mut flushed = Vec::new();
        for i in 1..=5u64 {
            buffer.append(sample(1_700_000_000.0 + i as f64, i * 100));
            if buffer.should_flush() {
                flushed.push(writer.flush_pending().await.unwrap());
            }
        }
        flushed.push(writer.flush_pending().await.unwrap());

        assert_eq!(flushed, vec![2, 2, 1]);
        assert_eq!(count_samples(&db).await, 5);
    }

    #[tokio::test]
    async fn test_samples_keep_append_order() {
        let (_dir, db, buffer, writer) = setup(10, 3, 2).await;
        for i in 1..=5u64 {
            buffer.append(sample(1_700_000_000.0, i));
        }
        writer.flush_pending().await.unwrap();

        let reads: Vec<i64> = sqlx::query_scalar("SELECT read_bytes FROM disk_stats ORDER BY id")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(reads, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_flush_is_all_or_nothing() {
        // Chunks of two rows: the first chunk succeeds before the NaN row fails.
        let (_dir, db, buffer, writer) = setup(10, 3, 2).await;
        buffer.append(sample(1_700_000_001.0, 1));
        buffer.append(sample(1_700_000_002.0, 2));
        buffer.append(sample(f64::NAN, 3));
        buffer.add_process_deltas([("sqlite", 100, 200)]);

        assert!(writer.flush_pending().await.is_err());
        assert_eq!(count_samples(&db).await, 0);

        let processes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process_history")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(processes, 0);

        // Everything is back in the buffer, in order, with one attempt recorded.
        let requeued = buffer.drain_for_flush();
        assert_eq!(requeued.len(), 3);
        assert_eq!(requeued[0].sample.read_bytes, 1);
        assert!(requeued.iter().all(|r| r.attempts == 1));
        assert_eq!(buffer.take_process_deltas()["sqlite"], (100, 200));
    }

    #[tokio::test]
    async fn test_batch_dropped_after_max_retries() {
        let (_dir, db, buffer, writer) = setup(10, 2, 500).await;
        buffer.append(sample(f64::NAN, 1));

        for _ in 0..3 {
            assert!(writer.flush_pending().await.is_err());
        }
        assert!(buffer.is_empty());

        buffer.append(sample(1_700_000_000.0, 2));
        assert_eq!(writer.flush_pending().await.unwrap(), 1);
        assert_eq!(count_samples(&db).await, 1);
    }

    #[tokio::test]
    async fn test_process_history_is_additive() {
        let (_dir, db, buffer, writer) = setup(10, 3, 500).await;
        buffer.add_process_deltas([("firefox", 10, 20), ("cargo", 1, 0)]);
        writer.flush_pending().await.unwrap();
        buffer.add_process_deltas([("firefox", 5, 5)]);
        writer.flush_pending().await.unwrap();

        let (read, write): (i64, i64) = sqlx::query_as(
            "SELECT read_bytes, write_bytes FROM process_history WHERE name = 'firefox'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!((read, write), (15, 25));
    }

    #[tokio::test]
    async fn test_trigger_while_blocked_is_deferred() {
        let (_dir, db, buffer, writer) = setup(1, 3, 500).await;
        buffer.append(sample(1_700_000_000.0, 1));

        let guard = writer.block_flushes().await;
        writer.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.len(), 1);
        drop(guard);

        writer.trigger();
        for _ in 0..50 {
            if count_samples(&db).await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count_samples(&db).await, 1);
    }

    #[tokio::test]
    async fn test_flush_all_empties_buffer() {
        let (_dir, db, buffer, writer) = setup(1000, 3, 7).await;
        for i in 0..25u64 {
            buffer.append(sample(1_700_000_000.0 + i as f64, i));
        }
        assert_eq!(writer.flush_all().await, 25);
        assert!(buffer.is_empty());
        assert_eq!(count_samples(&db).await, 25);
    }
}
