//! Records and payload contracts shared by the pipeline and its consumers.
//!
//! Everything that crosses the consumer boundary travels inside an
//! [`Envelope`] carrying [`PAYLOAD_VERSION`]. Receivers decode with
//! [`Envelope::decode`], which rejects unknown versions, unknown fields and
//! values that fail [`Validate`].

use crate::error::{DiskMonError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PAYLOAD_VERSION: u32 = 1;

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Wall-clock seconds since the Unix epoch, with microsecond precision.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub trait Validate {
    /// Payloads whose fields are independent keep the default.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<()> {
        self.iter().try_for_each(Validate::validate)
    }
}

/// Byte counters are stored as SQLite INTEGER, so anything past `i64::MAX`
/// cannot round-trip.
fn check_storable(field: &str, value: u64) -> Result<()> {
    if value > i64::MAX as u64 {
        return Err(DiskMonError::InvalidData(format!(
            "{} {} exceeds the storable range",
            field, value
        )));
    }
    Ok(())
}

/// One disk I/O measurement. `read_bytes`/`write_bytes` are cumulative since
/// the last reset; the speeds are per-second rates over the last tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sample {
    pub timestamp: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_speed: u64,
    pub write_speed: u64,
    pub idle_time: f64,
    pub queue_depth: f64,
}

impl Validate for Sample {
    fn validate(&self) -> Result<()> {
        if !self.timestamp.is_finite() || self.timestamp <= 0.0 {
            return Err(DiskMonError::InvalidData(format!(
                "sample timestamp must be a positive epoch value, got {}",
                self.timestamp
            )));
        }
        if !self.idle_time.is_finite() || !(0.0..=100.0).contains(&self.idle_time) {
            return Err(DiskMonError::InvalidData(format!(
                "idle_time must be a percentage, got {}",
                self.idle_time
            )));
        }
        if !self.queue_depth.is_finite() || self.queue_depth < 0.0 {
            return Err(DiskMonError::InvalidData(format!(
                "queue_depth must be non-negative, got {}",
                self.queue_depth
            )));
        }
        check_storable("read_bytes", self.read_bytes)?;
        check_storable("write_bytes", self.write_bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoTotals {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl Validate for IoTotals {
    fn validate(&self) -> Result<()> {
        check_storable("read_bytes", self.read_bytes)?;
        check_storable("write_bytes", self.write_bytes)
    }
}

/// Cumulative per-process counters, keyed by process name.
pub type ProcessHistory = BTreeMap<String, IoTotals>;

impl Validate for ProcessHistory {
    fn validate(&self) -> Result<()> {
        if self.keys().any(|name| name.is_empty()) {
            return Err(DiskMonError::InvalidData(
                "process history contains an empty process name".to_string(),
            ));
        }
        self.values().try_for_each(Validate::validate)
    }
}

/// Bytes one process group moved since the service started or was last reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessIoStat {
    pub name: String,
    pub exe_path: Option<String>,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub total_bytes: u64,
}

impl Validate for ProcessIoStat {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DiskMonError::InvalidData("process name is empty".to_string()));
        }
        if self.read_bytes.checked_add(self.write_bytes) != Some(self.total_bytes) {
            return Err(DiskMonError::InvalidData(format!(
                "total_bytes {} of {} does not match read plus write",
                self.total_bytes, self.name
            )));
        }
        Ok(())
    }
}

/// The busiest process groups, largest `total_bytes` first.
pub type TopProcesses = Vec<ProcessIoStat>;

/// Resource footprint of the monitor itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppMetrics {
    pub ram_usage: u64,
    pub cpu_usage: f32,
    pub database_size: u64,
    pub executable_size: u64,
    pub total_disk_size: u64,
}

impl Validate for AppMetrics {
    fn validate(&self) -> Result<()> {
        if !self.cpu_usage.is_finite() || self.cpu_usage < 0.0 {
            return Err(DiskMonError::InvalidData(format!(
                "cpu_usage must be non-negative, got {}",
                self.cpu_usage
            )));
        }
        if self.database_size.checked_add(self.executable_size) != Some(self.total_disk_size) {
            return Err(DiskMonError::InvalidData(format!(
                "total_disk_size {} does not match its parts",
                self.total_disk_size
            )));
        }
        Ok(())
    }
}

/// Point-in-time size and row-count snapshot of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseStats {
    pub main_size: u64,
    pub wal_size: u64,
    pub shm_size: u64,
    pub total_size: u64,
    pub sample_count: u64,
    pub process_count: u64,
}

impl Validate for DatabaseStats {
    fn validate(&self) -> Result<()> {
        let sum = self
            .main_size
            .checked_add(self.wal_size)
            .and_then(|s| s.checked_add(self.shm_size));
        if sum != Some(self.total_size) {
            return Err(DiskMonError::InvalidData(format!(
                "total_size {} does not match its parts",
                self.total_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetReport {
    pub size_before: u64,
    pub size_after: u64,
}

// `size_after` may exceed `size_before` when the post-reset checkpoint fails.
impl Validate for ResetReport {}

/// Versioned wrapper for every payload handed to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub version: u32,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            data,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned + Validate> Envelope<T> {
    pub fn decode(json: &str) -> Result<T> {
        let envelope: Envelope<T> = serde_json::from_str(json)?;
        if envelope.version != PAYLOAD_VERSION {
            return Err(DiskMonError::InvalidData(format!(
                "unsupported payload version {} (expected {})",
                envelope.version, PAYLOAD_VERSION
            )));
        }
        envelope.data.validate()?;
        Ok(envelope.data)
    }
}
