use crate::error::{DiskMonError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMonConfig {
    pub service: ServiceConfig,
    pub buffer: BufferConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub maintenance: MaintenanceConfig,
    pub api: ApiConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sub-second sampling makes the monitor itself a visible share of disk activity.
    #[serde(default)]
    pub allow_subsecond_sampling: bool,

    /// Idle/queue counters are refreshed on every n-th poll only.
    #[serde(default = "default_perf_refresh_every")]
    pub perf_refresh_every: u32,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_flush_max_records")]
    pub flush_max_records: usize,

    #[serde(default = "default_flush_max_age_secs")]
    pub flush_max_age_secs: u64,

    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,

    #[serde(default = "default_max_flush_retries")]
    pub max_flush_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_file")]
    pub database_file: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Page cache size in KiB (passed to SQLite as a negative `cache_size`).
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: u32,

    #[serde(default = "default_wal_autocheckpoint_pages")]
    pub wal_autocheckpoint_pages: u32,

    #[serde(default = "default_insert_chunk_rows")]
    pub insert_chunk_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_keep_days")]
    pub keep_days: u64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,

    #[serde(default = "default_true")]
    pub archive_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_analyze_interval_secs")]
    pub analyze_interval_secs: u64,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    #[serde(default = "default_true")]
    pub vacuum_after_cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable_prometheus: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for DiskMonConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                poll_interval_ms: default_poll_interval_ms(),
                allow_subsecond_sampling: false,
                perf_refresh_every: default_perf_refresh_every(),
                data_dir: default_data_dir(),
            },
            buffer: BufferConfig {
                flush_max_records: default_flush_max_records(),
                flush_max_age_secs: default_flush_max_age_secs(),
                capacity: default_buffer_capacity(),
                max_flush_retries: default_max_flush_retries(),
            },
            storage: StorageConfig {
                database_file: default_database_file(),
                max_connections: default_max_connections(),
                busy_timeout_ms: default_busy_timeout_ms(),
                cache_size_kib: default_cache_size_kib(),
                wal_autocheckpoint_pages: default_wal_autocheckpoint_pages(),
                insert_chunk_rows: default_insert_chunk_rows(),
            },
            retention: RetentionConfig {
                keep_days: default_keep_days(),
                sample_interval: default_sample_interval(),
                archive_enabled: true,
            },
            maintenance: MaintenanceConfig {
                cleanup_interval_secs: default_cleanup_interval_secs(),
                analyze_interval_secs: default_analyze_interval_secs(),
                checkpoint_interval_secs: default_checkpoint_interval_secs(),
                vacuum_after_cleanup: true,
            },
            api: ApiConfig {
                enabled: true,
                bind_address: default_bind_address(),
                port: default_api_port(),
                event_channel_capacity: default_event_channel_capacity(),
            },
            telemetry: TelemetryConfig {
                enable_prometheus: true,
                metrics_port: default_metrics_port(),
            },
        }
    }
}

impl DiskMonConfig {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&DiskMonConfig::default())?)
            .add_source(
                config::File::from(config_path)
                    .required(false)
            )
            .add_source(
                config::Environment::with_prefix("DISKMON")
                    .separator("__")
            );

        let config: DiskMonConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.poll_interval_ms == 0 {
            return Err(DiskMonError::InvalidConfig(
                "service.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.service.poll_interval_ms < 1000 && !self.service.allow_subsecond_sampling {
            return Err(DiskMonError::InvalidConfig(format!(
                "service.poll_interval_ms = {} is below one second; set service.allow_subsecond_sampling to opt in",
                self.service.poll_interval_ms
            )));
        }
        if self.buffer.flush_max_records == 0 || self.buffer.flush_max_age_secs == 0 {
            return Err(DiskMonError::InvalidConfig(
                "buffer flush thresholds must be greater than zero".to_string(),
            ));
        }
        if self.buffer.capacity < self.buffer.flush_max_records {
            return Err(DiskMonError::InvalidConfig(format!(
                "buffer.capacity ({}) must be at least buffer.flush_max_records ({})",
                self.buffer.capacity, self.buffer.flush_max_records
            )));
        }
        if self.storage.max_connections == 0 || self.storage.insert_chunk_rows == 0 {
            return Err(DiskMonError::InvalidConfig(
                "storage.max_connections and storage.insert_chunk_rows must be greater than zero"
                    .to_string(),
            ));
        }
        if self.retention.sample_interval == 0 {
            return Err(DiskMonError::InvalidConfig(
                "retention.sample_interval must be at least 1".to_string(),
            ));
        }
        if self.maintenance.cleanup_interval_secs == 0
            || self.maintenance.analyze_interval_secs == 0
            || self.maintenance.checkpoint_interval_secs == 0
        {
            return Err(DiskMonError::InvalidConfig(
                "maintenance intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("diskmon")
            .join("config.toml")
    }

    pub fn data_path(&self) -> PathBuf {
        if self.service.data_dir.is_absolute() {
            self.service.data_dir.clone()
        } else {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("diskmon")
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_path().join(&self.storage.database_file)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.service.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_perf_refresh_every() -> u32 { 5 }
fn default_flush_max_records() -> usize { 60 }
fn default_flush_max_age_secs() -> u64 { 60 }
fn default_buffer_capacity() -> usize { 3600 }
fn default_max_flush_retries() -> u32 { 5 }
fn default_database_file() -> String { "drive_analytics.db".to_string() }
fn default_max_connections() -> u32 { 5 }
fn default_busy_timeout_ms() -> u64 { 5000 }
fn default_cache_size_kib() -> u32 { 8192 }
fn default_wal_autocheckpoint_pages() -> u32 { 1000 }
fn default_insert_chunk_rows() -> usize { 500 }
fn default_keep_days() -> u64 { 30 }
fn default_sample_interval() -> u64 { 1 }
fn default_cleanup_interval_secs() -> u64 { 24 * 3600 }
fn default_analyze_interval_secs() -> u64 { 7 * 24 * 3600 }
fn default_checkpoint_interval_secs() -> u64 { 6 * 3600 }
fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_api_port() -> u16 { 8010 }
fn default_event_channel_capacity() -> usize { 256 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diskmon")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DiskMonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service.poll_interval_ms, 1000);
        assert_eq!(config.buffer.flush_max_records, 60);
        assert_eq!(config.buffer.flush_max_age_secs, 60);
        assert_eq!(config.storage.max_connections, 5);
        assert_eq!(config.retention.keep_days, 30);
        assert_eq!(config.maintenance.cleanup_interval_secs, 86400);
        assert_eq!(config.maintenance.analyze_interval_secs, 604800);
        assert_eq!(config.maintenance.checkpoint_interval_secs, 21600);
    }

    #[test]
    fn test_subsecond_sampling_requires_opt_in() {
        let mut config = DiskMonConfig::default();
        config.service.poll_interval_ms = 250;
        assert!(matches!(config.validate(), Err(DiskMonError::InvalidConfig(_))));

        config.service.allow_subsecond_sampling = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capacity_below_threshold_rejected() {
        let mut config = DiskMonConfig::default();
        config.buffer.capacity = 10;
        config.buffer.flush_max_records = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_maintenance_interval_rejected() {
        let mut config = DiskMonConfig::default();
        config.maintenance.checkpoint_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_uses_absolute_data_dir() {
        let mut config = DiskMonConfig::default();
        config.service.data_dir = PathBuf::from("/tmp/diskmon-test");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/diskmon-test/drive_analytics.db")
        );
    }
}
