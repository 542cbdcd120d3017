use crate::error::Result;
use crate::models::{DatabaseStats, IoTotals, ProcessHistory, ResetReport};
use crate::storage::db::DatabaseFiles;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Read side of the store, plus the destructive reset.
///
/// Queries only ever see committed rows; a sample still sitting in the buffer
/// is invisible here.
#[derive(Clone)]
pub struct QueryService {
    pool: SqlitePool,
    files: DatabaseFiles,
}

impl QueryService {
    pub fn new(pool: SqlitePool, files: DatabaseFiles) -> Self {
        Self { pool, files }
    }

    /// Cumulative totals as of the most recently committed sample.
    pub async fn totals(&self) -> Result<IoTotals> {
        let latest: Option<(i64, i64)> = sqlx::query_as(
            "SELECT read_bytes, write_bytes FROM disk_stats ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(latest
            .map(|(read, write)| IoTotals {
                read_bytes: read.max(0) as u64,
                write_bytes: write.max(0) as u64,
            })
            .unwrap_or_default())
    }

    pub async fn process_history(&self) -> Result<ProcessHistory> {
        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT name, read_bytes, write_bytes FROM process_history")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(name, read, write)| {
                (
                    name,
                    IoTotals {
                        read_bytes: read.max(0) as u64,
                        write_bytes: write.max(0) as u64,
                    },
                )
            })
            .collect())
    }

    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let sample_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM disk_stats")
            .fetch_one(&self.pool)
            .await?;
        let process_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process_history")
            .fetch_one(&self.pool)
            .await?;
        let sizes = self.files.sizes()?;

        Ok(DatabaseStats {
            main_size: sizes.main,
            wal_size: sizes.wal,
            shm_size: sizes.shm,
            total_size: sizes.total(),
            sample_count: sample_count as u64,
            process_count: process_count as u64,
        })
    }

    /// Main, WAL and shared-memory files together.
    pub fn database_size(&self) -> Result<u64> {
        Ok(self.files.sizes()?.total())
    }

    /// Wipes samples and process history in one transaction, then reclaims
    /// space. Only a failure before commit is returned, and it leaves the store
    /// untouched. Failures while reclaiming space are logged.
    pub async fn reset(&self) -> Result<ResetReport> {
        let size_before = self.files.sizes()?.total();

        let mut tx = self.pool.begin().await?;
        let samples = sqlx::query("DELETE FROM disk_stats")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let processes = sqlx::query("DELETE FROM process_history")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(samples, processes, "Database reset committed");

        if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
            warn!(error = %e, "VACUUM after reset failed");
        }
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, "WAL checkpoint after reset failed");
        }

        // Past the commit nothing may fail the reset; an unreadable size is reported as 0.
        let size_after = match self.files.sizes() {
            Ok(sizes) => sizes.total(),
            Err(e) => {
                warn!(error = %e, "Could not measure database size after reset");
                0
            }
        };
        info!(size_before, size_after, "Database reset complete");

        Ok(ResetReport {
            size_before,
            size_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskMonConfig;
    use crate::models::{Sample, Validate};
    use crate::storage::{Database, PersistenceWriter};
    use crate::buffer::{FlushThresholds, SampleBuffer};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        writer: PersistenceWriter,
        query: QueryService,
    }

    async fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path().join("query.db"), &DiskMonConfig::default().storage)
            .await
            .unwrap();
        let buffer = Arc::new(SampleBuffer::new(FlushThresholds {
            max_records: 60,
            max_age: Duration::from_secs(60),
            capacity: 3600,
        }));
        let writer = PersistenceWriter::new(db.pool().clone(), buffer, 3, 500);
        let query = QueryService::new(db.pool().clone(), db.files().clone());
        Fixture { _dir: dir, writer, query }
    }

    fn sample(timestamp: f64, read_bytes: u64, write_bytes: u64) -> Sample {
        Sample {
            timestamp,
            read_bytes,
            write_bytes,
            read_speed: 0,
            write_speed: 0,
            idle_time: 100.0,
            queue_depth: 0.0,
        }
    }

    #[tokio::test]
    async fn test_totals_empty_store_is_zero() {
        let fx = setup().await;
        assert_eq!(fx.query.totals().await.unwrap(), IoTotals::default());
    }

    #[tokio::test]
    async fn test_totals_follow_latest_cumulative_sample() {
        let fx = setup().await;
        let samples: Vec<Sample> = [100, 250, 400]
            .iter()
            .enumerate()
            .map(|(i, read)| sample(1_700_000_000.0 + i as f64, *read, read / 2))
            .collect();
        fx.writer.flush(&samples, &HashMap::new()).await.unwrap();

        let totals = fx.query.totals().await.unwrap();
        assert_eq!(totals.read_bytes, 400);
        assert_eq!(totals.write_bytes, 200);
    }

    #[tokio::test]
    async fn test_totals_independent_of_batch_boundaries() {
        let single = setup().await;
        let split = setup().await;
        let samples: Vec<Sample> = (1..=6)
            .map(|i| sample(1_700_000_000.0 + i as f64, i * 1000, i * 10))
            .collect();

        single.writer.flush(&samples, &HashMap::new()).await.unwrap();
        for chunk in samples.chunks(4) {
            split.writer.flush(chunk, &HashMap::new()).await.unwrap();
        }

        assert_eq!(
            single.query.totals().await.unwrap(),
            split.query.totals().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_process_history_and_stats() {
        let fx = setup().await;
        let mut deltas = HashMap::new();
        deltas.insert("rustc".to_string(), (4096, 1024));
        deltas.insert("sqlite3".to_string(), (10, 0));
        fx.writer
            .flush(&[sample(1_700_000_000.0, 1, 1)], &deltas)
            .await
            .unwrap();

        let history = fx.query.process_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history["rustc"].read_bytes, 4096);
        assert_eq!(history["rustc"].write_bytes, 1024);

        let stats = fx.query.database_stats().await.unwrap();
        assert_eq!(stats.sample_count, 1);
        assert_eq!(stats.process_count, 2);
        assert!(stats.validate().is_ok());
    }

    #[tokio::test]
    async fn test_reset_wipes_and_is_repeatable() {
        let fx = setup().await;
        let samples: Vec<Sample> = (0..2000)
            .map(|i| sample(1_700_000_000.0 + i as f64, i, i))
            .collect();
        let mut deltas = HashMap::new();
        deltas.insert("dd".to_string(), (1 << 20, 1 << 20));
        fx.writer.flush(&samples, &deltas).await.unwrap();

        let first = fx.query.reset().await.unwrap();
        assert!(first.size_after <= first.size_before);

        let stats = fx.query.database_stats().await.unwrap();
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.process_count, 0);
        assert_eq!(fx.query.totals().await.unwrap(), IoTotals::default());

        let second = fx.query.reset().await.unwrap();
        let drift = second.size_after.abs_diff(first.size_after);
        assert!(drift <= 8192, "reset sizes drifted by {} bytes", drift);
    }
}
