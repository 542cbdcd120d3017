pub mod prometheus;

use crate::config::DiskMonConfig;
use crate::error::Result;
use std::sync::Arc;

pub use self::prometheus::PrometheusExporter;

/// Owns the process-wide metrics registry. The exporter always exists so
/// components can record unconditionally; only the HTTP endpoint is optional.
pub struct TelemetryManager {
    pub prometheus: Arc<PrometheusExporter>,
    serve_prometheus: bool,
}

impl TelemetryManager {
    pub fn new(config: &DiskMonConfig) -> Result<Self> {
        tracing::info!("Initializing Prometheus exporter");
        let prometheus = Arc::new(PrometheusExporter::new()?);

        Ok(Self {
            prometheus,
            serve_prometheus: config.telemetry.enable_prometheus,
        })
    }

    pub fn start_prometheus_server(&self, port: u16) -> Option<tokio::task::JoinHandle<()>> {
        if !self.serve_prometheus {
            tracing::info!("Prometheus endpoint disabled");
            return None;
        }

        let prometheus_clone = Arc::clone(&self.prometheus);
        Some(tokio::spawn(async move {
            if let Err(e) = prometheus_clone.serve(port).await {
                tracing::error!("Prometheus server error: {}", e);
            }
        }))
    }
}
