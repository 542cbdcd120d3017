use crate::config::StorageConfig;
use crate::error::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// The three files a WAL-mode SQLite database occupies on disk.
#[derive(Debug, Clone)]
pub struct DatabaseFiles {
    pub main: PathBuf,
    pub wal: PathBuf,
    pub shm: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSizes {
    pub main: u64,
    pub wal: u64,
    pub shm: u64,
}

impl FileSizes {
    pub fn total(&self) -> u64 {
        self.main + self.wal + self.shm
    }
}

impl DatabaseFiles {
    pub fn for_path(db_path: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = OsString::from(db_path.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };

        Self {
            main: db_path.to_path_buf(),
            wal: with_suffix("-wal"),
            shm: with_suffix("-shm"),
        }
    }

    /// Missing files count as zero bytes.
    pub fn sizes(&self) -> Result<FileSizes> {
        Ok(FileSizes {
            main: file_len(&self.main)?,
            wal: file_len(&self.wal)?,
            shm: file_len(&self.shm)?,
        })
    }
}

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    files: DatabaseFiles,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(db_path: P, config: &StorageConfig) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        // Per-connection settings that have no dedicated builder method.
        let pragmas = format!(
            "PRAGMA cache_size = -{}; PRAGMA temp_store = MEMORY; PRAGMA wal_autocheckpoint = {};",
            config.cache_size_kib, config.wal_autocheckpoint_pages
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                let pragmas = pragmas.clone();
                Box::pin(async move {
                    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&pragmas)).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        info!("Database connected at {}", db_path.display());

        let db = Self {
            pool,
            files: DatabaseFiles::for_path(db_path),
        };
        db.initialize_schema().await?;

        Ok(db)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let schema = include_str!("schema.sql");

        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await?;

        info!("Database schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn files(&self) -> &DatabaseFiles {
        &self.files
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
