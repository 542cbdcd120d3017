pub mod api;
pub mod buffer;
pub mod collector;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod footprint;
pub mod maintenance;
pub mod models;
pub mod service;
pub mod source;
pub mod storage;
pub mod telemetry;

pub use commands::QueryCommands;
pub use config::DiskMonConfig;
pub use error::{DiskMonError, Result};
pub use events::EventPublisher;
pub use models::{
    AppMetrics, DatabaseStats, Envelope, IoTotals, ProcessHistory, ProcessIoStat, ResetReport, Sample,
    TopProcesses,
};
pub use service::DiskMonService;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,diskmon_core=debug"))
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
