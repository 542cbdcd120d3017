use crate::api::{self, ApiState, ServiceInfo};
use crate::buffer::{FlushThresholds, SampleBuffer};
use crate::collector::{Collector, SessionCounters};
use crate::commands::QueryCommands;
use crate::config::DiskMonConfig;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::maintenance::MaintenanceScheduler;
use crate::source::SampleSource;
use crate::storage::{RetentionPolicy, StorageManager};
use crate::telemetry::TelemetryManager;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

const API_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A group of background tasks sharing one shutdown signal.
pub struct ScheduledUnit {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl ScheduledUnit {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Signals every task and waits for all of them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(unit = self.name, error = %e, "Task ended abnormally");
            }
        }
        info!(unit = self.name, "Stopped");
    }

    /// Like [`ScheduledUnit::stop`], but aborts tasks still running after `grace`.
    pub async fn stop_within(self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        for mut handle in self.handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(unit = self.name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(unit = self.name, "Task did not stop within {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }
        info!(unit = self.name, "Stopped");
    }
}

pub struct DiskMonService {
    config: DiskMonConfig,
    telemetry: TelemetryManager,
    storage: Arc<StorageManager>,
    buffer: Arc<SampleBuffer>,
    counters: Arc<SessionCounters>,
    publisher: EventPublisher,
    commands: QueryCommands,
    shutdown_tx: broadcast::Sender<()>,
}

impl DiskMonService {
    pub async fn new(config: DiskMonConfig) -> Result<Self> {
        info!("Initializing disk monitoring service");

        let telemetry = TelemetryManager::new(&config)?;
        let metrics = Arc::clone(&telemetry.prometheus);

        let buffer = Arc::new(
            SampleBuffer::new(FlushThresholds::from(&config.buffer)).with_metrics(Arc::clone(&metrics)),
        );

        let storage = Arc::new(StorageManager::new(&config, Arc::clone(&buffer), Arc::clone(&metrics)).await?);

        let counters = Arc::new(SessionCounters::new());
        let committed = storage.query.totals().await?;
        counters.seed(committed).await;
        info!(
            read_bytes = committed.read_bytes,
            write_bytes = committed.write_bytes,
            "Session counters resumed from store"
        );

        let publisher = EventPublisher::new(config.api.event_channel_capacity).with_metrics(metrics);

        let commands = QueryCommands::new(
            storage.query.clone(),
            Arc::clone(&storage.writer),
            Arc::clone(&buffer),
            Arc::clone(&counters),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        info!("Disk monitoring service initialized");

        Ok(Self {
            config,
            telemetry,
            storage,
            buffer,
            counters,
            publisher,
            commands,
            shutdown_tx,
        })
    }

    pub fn commands(&self) -> QueryCommands {
        self.commands.clone()
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Sending on this channel makes [`DiskMonService::run`] shut down.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Starts collection, maintenance and the consumer API.
    pub fn start(&self, source: Box<dyn SampleSource + Send>) -> RunningService {
        info!("Starting disk monitoring service");
        let metrics = Arc::clone(&self.telemetry.prometheus);

        let mut collector_unit = ScheduledUnit::new("collector");
        let collector = Collector::new(
            source,
            Arc::clone(&self.counters),
            Arc::clone(&self.buffer),
            self.publisher.clone(),
            Arc::clone(&self.storage.writer),
            self.config.poll_interval(),
        )
        .with_metrics(Arc::clone(&metrics));
        collector_unit.push(tokio::spawn(collector.run(collector_unit.shutdown_sender())));

        let mut maintenance_unit = ScheduledUnit::new("maintenance");
        let scheduler = Arc::new(
            MaintenanceScheduler::new(
                Arc::clone(&self.storage.retention),
                RetentionPolicy::from(&self.config.retention),
                self.config.maintenance.clone(),
            )
            .with_metrics(metrics),
        );
        for handle in scheduler.spawn_all(&maintenance_unit.shutdown_sender()) {
            maintenance_unit.push(handle);
        }

        let api_unit = if self.config.api.enabled {
            let mut unit = ScheduledUnit::new("api");
            let state = ApiState {
                commands: self.commands.clone(),
                publisher: self.publisher.clone(),
                info: ServiceInfo::from_config(&self.config),
            };
            let bind_address = self.config.api.bind_address.clone();
            let port = self.config.api.port;
            let shutdown_tx = unit.shutdown_sender();
            unit.push(tokio::spawn(async move {
                if let Err(e) = api::start_server(&bind_address, port, state, shutdown_tx).await {
                    error!("Consumer API error: {}", e);
                }
            }));
            Some(unit)
        } else {
            info!("Consumer API disabled");
            None
        };

        let metrics_server = self
            .telemetry
            .start_prometheus_server(self.config.telemetry.metrics_port);

        RunningService {
            collector: collector_unit,
            maintenance: maintenance_unit,
            api: api_unit,
            metrics_server,
            storage: Arc::clone(&self.storage),
        }
    }

    pub async fn run(&self, source: Box<dyn SampleSource + Send>) -> Result<()> {
        let running = self.start(source);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
            }
        }

        running.shutdown().await;

        info!("Disk monitoring service stopped");
        Ok(())
    }
}

pub struct RunningService {
    collector: ScheduledUnit,
    maintenance: ScheduledUnit,
    api: Option<ScheduledUnit>,
    metrics_server: Option<JoinHandle<()>>,
    storage: Arc<StorageManager>,
}

impl RunningService {
    /// Stops the collector, flushes what it produced, then stops maintenance
    /// and the API before closing the pool.
    pub async fn shutdown(self) {
        self.collector.stop().await;

        let flushed = self.storage.writer.flush_all().await;
        info!(flushed, "Buffer flushed on shutdown");

        self.maintenance.stop().await;

        if let Some(api) = self.api {
            api.stop_within(API_SHUTDOWN_GRACE).await;
        }
        if let Some(metrics_server) = self.metrics_server {
            metrics_server.abort();
        }

        self.storage.close().await;
    }
}
