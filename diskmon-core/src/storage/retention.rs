use crate::config::RetentionConfig;
use crate::error::Result;
use crate::models::{unix_now, SECONDS_PER_DAY};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_days: u64,
    /// Keep every n-th live row by id; the rest are moved out at cleanup.
    pub sample_interval: u64,
    pub archive_enabled: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_days: 30,
            sample_interval: 1,
            archive_enabled: true,
        }
    }
}

impl RetentionPolicy {
    pub fn new(keep_days: u64, sample_interval: u64, archive_enabled: bool) -> Self {
        Self {
            keep_days,
            sample_interval: sample_interval.max(1),
            archive_enabled,
        }
    }

    pub fn cutoff(&self, now: f64) -> f64 {
        now - self.keep_days as f64 * SECONDS_PER_DAY
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self::new(config.keep_days, config.sample_interval, config.archive_enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupReport {
    pub cutoff: f64,
    /// Expired rows removed.
    pub deleted: u64,
    /// Live rows removed by thinning.
    pub thinned: u64,
    pub archived: u64,
}

pub struct RetentionManager {
    pool: SqlitePool,
}

impl RetentionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Deletes samples older than `keep_days`. Returns the number removed.
    pub async fn cleanup(&self, policy: &RetentionPolicy) -> Result<u64> {
        Ok(self.cleanup_at(policy, unix_now()).await?.deleted)
    }

    /// Archives and deletes every sample with `timestamp < cutoff` in one
    /// transaction. The cutoff is fixed before any row is touched, so samples
    /// written while the cleanup runs are out of its reach.
    ///
    /// With `sample_interval = n > 1` the same transaction also thins the live
    /// table to rows whose id is a multiple of n, always keeping the newest
    /// row. Thinning is idempotent. With archiving enabled, every removed row
    /// lands in the archive first.
    pub async fn cleanup_at(&self, policy: &RetentionPolicy, now: f64) -> Result<CleanupReport> {
        let cutoff = policy.cutoff(now);
        let interval = policy.sample_interval.max(1) as i64;
        let mut tx = self.pool.begin().await?;

        // Expired rows, plus thinned-out rows when an interval is set. The
        // first statement writes, so no flush can commit in between.
        const DOOMED: &str =
            "timestamp < ?1 OR (?2 > 1 AND id % ?2 != 0 AND id < (SELECT MAX(id) FROM disk_stats))";

        let archived = if policy.archive_enabled {
            sqlx::query(&format!(
                "INSERT INTO disk_stats_archive
                    (id, timestamp, read_bytes, write_bytes, read_speed, write_speed, idle_time, queue_depth, archived_at)
                 SELECT id, timestamp, read_bytes, write_bytes, read_speed, write_speed, idle_time, queue_depth, ?3
                 FROM disk_stats
                 WHERE {}
                 ON CONFLICT(id) DO NOTHING",
                DOOMED
            ))
            .bind(cutoff)
            .bind(interval)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        let deleted = sqlx::query("DELETE FROM disk_stats WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let thinned = if interval > 1 {
            sqlx::query(
                "DELETE FROM disk_stats WHERE id % ?1 != 0 AND id < (SELECT MAX(id) FROM disk_stats)",
            )
            .bind(interval)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        tx.commit().await?;

        info!(
            deleted,
            thinned,
            archived,
            keep_days = policy.keep_days,
            "Retention cleanup finished"
        );

        Ok(CleanupReport {
            cutoff,
            deleted,
            thinned,
            archived,
        })
    }

    /// Counts the rows a cleanup with `policy` would remove right now.
    pub async fn preview(&self, policy: &RetentionPolicy) -> Result<u64> {
        let cutoff = policy.cutoff(unix_now());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM disk_stats WHERE timestamp < ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        debug!("VACUUM completed");
        Ok(())
    }

    pub async fn analyze(&self) -> Result<()> {
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        debug!("ANALYZE completed");
        Ok(())
    }

    /// Passive checkpoint: copies what it can without waiting on readers or writers.
    pub async fn checkpoint_passive(&self) -> Result<()> {
        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(PASSIVE)")
                .fetch_one(&self.pool)
                .await?;

        debug!(busy, log_frames, checkpointed, "WAL checkpoint completed");
        Ok(())
    }
}
