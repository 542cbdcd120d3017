pub mod db;
pub mod query;
pub mod retention;
pub mod writer;

pub use db::{Database, DatabaseFiles, FileSizes};
pub use query::QueryService;
pub use retention::{CleanupReport, RetentionManager, RetentionPolicy};
pub use writer::PersistenceWriter;

use crate::buffer::SampleBuffer;
use crate::config::DiskMonConfig;
use crate::error::Result;
use crate::telemetry::PrometheusExporter;
use std::sync::Arc;
use tracing::info;

/// Every store-facing component, wired to the same connection pool.
pub struct StorageManager {
    pub database: Database,
    pub writer: Arc<PersistenceWriter>,
    pub retention: Arc<RetentionManager>,
    pub query: QueryService,
}

impl StorageManager {
    pub async fn new(
        config: &DiskMonConfig,
        buffer: Arc<SampleBuffer>,
        metrics: Arc<PrometheusExporter>,
    ) -> Result<Self> {
        let db_path = config.database_path();
        let database = Database::new(&db_path, &config.storage).await?;

        let writer = PersistenceWriter::new(
            database.pool().clone(),
            buffer,
            config.buffer.max_flush_retries,
            config.storage.insert_chunk_rows,
        )
        .with_metrics(metrics);
        let retention = RetentionManager::new(database.pool().clone());
        let query = QueryService::new(database.pool().clone(), database.files().clone());

        info!("Storage manager initialized");
        info!("  Database: {}", db_path.display());
        info!("  Pool size: {}", config.storage.max_connections);

        Ok(Self {
            database,
            writer: Arc::new(writer),
            retention: Arc::new(retention),
            query,
        })
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}
