use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskMonError {
    #[error("Sample source error: {0}")]
    SourceError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Flush dropped {records} record(s) after {attempts} attempt(s)")]
    FlushDropped { records: usize, attempts: u32 },

    #[error("Service not available: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, DiskMonError>;
