use anyhow::Context;
use diskmon_core::source::SysinfoSource;
use diskmon_core::{init_logging, DiskMonConfig, DiskMonService};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("diskmon - disk I/O telemetry service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match DiskMonConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            info!("Using default configuration");
            DiskMonConfig::default()
        }
    };

    info!("Configuration loaded");
    info!("  Poll interval: {}ms", config.service.poll_interval_ms);
    info!("  Database: {}", config.database_path().display());
    info!(
        "  Flush thresholds: {} samples / {}s",
        config.buffer.flush_max_records, config.buffer.flush_max_age_secs
    );
    info!("  Retention: {} days", config.retention.keep_days);

    let source = SysinfoSource::new(config.service.perf_refresh_every);

    let service = DiskMonService::new(config)
        .await
        .context("failed to initialize service")?;

    service
        .run(Box::new(source))
        .await
        .context("service error")?;

    info!("diskmon terminated gracefully");
    Ok(())
}
