use crate::error::{DiskMonError, Result};
use crate::models::Sample;
use axum::{routing::get, Router};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::info;

pub struct PrometheusExporter {
    registry: Registry,

    // Collection
    samples_collected: IntCounter,
    source_failures: IntCounter,
    read_speed: Gauge,
    write_speed: Gauge,
    idle_time: Gauge,
    queue_depth: Gauge,

    // Event push
    events_published: IntCounter,
    events_missed: IntCounter,

    // Buffer / persistence
    buffer_depth: IntGauge,
    buffer_evicted: IntCounter,
    flushes: IntCounter,
    flush_failures: IntCounter,
    records_written: IntCounter,
    records_dropped: IntCounter,
    flush_duration: Histogram,

    // Maintenance
    retention_deleted: IntCounter,
    retention_archived: IntCounter,
    maintenance_runs: IntCounterVec,
    maintenance_failures: IntCounterVec,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_collected = IntCounter::new(
            "diskmon_samples_collected_total",
            "Samples produced by the collector",
        )?;
        let source_failures = IntCounter::new(
            "diskmon_source_failures_total",
            "Ticks skipped because the sample source failed",
        )?;
        let read_speed = Gauge::new("diskmon_read_speed_bytes", "Latest read rate in bytes/s")?;
        let write_speed = Gauge::new("diskmon_write_speed_bytes", "Latest write rate in bytes/s")?;
        let idle_time = Gauge::new("diskmon_disk_idle_percent", "Latest disk idle time percentage")?;
        let queue_depth = Gauge::new("diskmon_disk_queue_depth", "Latest average disk queue depth")?;

        let events_published = IntCounter::new(
            "diskmon_events_published_total",
            "Sample events delivered to at least one consumer",
        )?;
        let events_missed = IntCounter::new(
            "diskmon_events_missed_total",
            "Sample events with no consumer listening",
        )?;

        let buffer_depth = IntGauge::new("diskmon_buffer_depth", "Samples waiting to be flushed")?;
        let buffer_evicted = IntCounter::new(
            "diskmon_buffer_evicted_total",
            "Samples evicted because the buffer was full",
        )?;
        let flushes = IntCounter::new("diskmon_flushes_total", "Committed flush transactions")?;
        let flush_failures = IntCounter::new(
            "diskmon_flush_failures_total",
            "Flush transactions rolled back",
        )?;
        let records_written = IntCounter::new(
            "diskmon_records_written_total",
            "Samples committed to the store",
        )?;
        let records_dropped = IntCounter::new(
            "diskmon_records_dropped_total",
            "Samples dropped after exhausting flush retries",
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("diskmon_flush_duration_seconds", "Flush transaction latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;

        let retention_deleted = IntCounter::new(
            "diskmon_retention_deleted_total",
            "Samples removed by retention cleanup",
        )?;
        let retention_archived = IntCounter::new(
            "diskmon_retention_archived_total",
            "Samples copied to the archive table by retention cleanup",
        )?;
        let maintenance_runs = IntCounterVec::new(
            Opts::new("diskmon_maintenance_runs_total", "Completed maintenance runs by task"),
            &["task"],
        )?;
        let maintenance_failures = IntCounterVec::new(
            Opts::new("diskmon_maintenance_failures_total", "Failed maintenance runs by task"),
            &["task"],
        )?;

        registry.register(Box::new(samples_collected.clone()))?;
        registry.register(Box::new(source_failures.clone()))?;
        registry.register(Box::new(read_speed.clone()))?;
        registry.register(Box::new(write_speed.clone()))?;
        registry.register(Box::new(idle_time.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(events_missed.clone()))?;
        registry.register(Box::new(buffer_depth.clone()))?;
        registry.register(Box::new(buffer_evicted.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(retention_deleted.clone()))?;
        registry.register(Box::new(retention_archived.clone()))?;
        registry.register(Box::new(maintenance_runs.clone()))?;
        registry.register(Box::new(maintenance_failures.clone()))?;

        Ok(Self {
            registry,
            samples_collected,
            source_failures,
            read_speed,
            write_speed,
            idle_time,
            queue_depth,
            events_published,
            events_missed,
            buffer_depth,
            buffer_evicted,
            flushes,
            flush_failures,
            records_written,
            records_dropped,
            flush_duration,
            retention_deleted,
            retention_archived,
            maintenance_runs,
            maintenance_failures,
        })
    }

    pub fn record_sample(&self, sample: &Sample) {
        self.samples_collected.inc();
        self.read_speed.set(sample.read_speed as f64);
        self.write_speed.set(sample.write_speed as f64);
        self.idle_time.set(sample.idle_time);
        self.queue_depth.set(sample.queue_depth);
    }

    pub fn record_source_failure(&self) {
        self.source_failures.inc();
    }

    pub fn record_publish(&self, delivered: bool) {
        if delivered {
            self.events_published.inc();
        } else {
            self.events_missed.inc();
        }
    }

    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth.set(depth as i64);
    }

    pub fn record_evicted(&self, count: usize) {
        self.buffer_evicted.inc_by(count as u64);
    }

    pub fn record_flush(&self, written: usize, seconds: f64) {
        self.flushes.inc();
        self.records_written.inc_by(written as u64);
        self.flush_duration.observe(seconds);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.inc();
    }

    pub fn record_dropped(&self, count: usize) {
        self.records_dropped.inc_by(count as u64);
    }

    pub fn record_retention(&self, deleted: u64, archived: u64) {
        self.retention_deleted.inc_by(deleted);
        self.retention_archived.inc_by(archived);
    }

    pub fn record_maintenance(&self, task: &str, ok: bool) {
        if ok {
            self.maintenance_runs.with_label_values(&[task]).inc();
        } else {
            self.maintenance_failures.with_label_values(&[task]).inc();
        }
    }

    pub fn render_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| DiskMonError::InvalidData(format!("metrics are not UTF-8: {}", e)))
    }

    pub async fn serve(self: Arc<Self>, port: u16) -> Result<()> {
        let app = Router::new().route("/metrics", get(move || async move {
            self.render_metrics().unwrap_or_else(|e| format!("# error: {}\n", e))
        }));

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        info!("Prometheus metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
