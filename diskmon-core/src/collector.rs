use crate::buffer::SampleBuffer;
use crate::events::EventPublisher;
use crate::models::{unix_now, IoTotals, ProcessIoStat, Sample, TopProcesses, Validate};
use crate::source::{ProcessDelta, RawSample, SampleSource};
use crate::storage::PersistenceWriter;
use crate::telemetry::PrometheusExporter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, MutexGuard};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const TOP_PROCESS_LIMIT: usize = 50;

/// What the collector has counted since startup or the last reset.
#[derive(Debug, Default)]
pub struct SessionState {
    pub totals: IoTotals,
    processes: HashMap<String, ProcessIoStat>,
}

impl SessionState {
    fn add_processes(&mut self, deltas: &[ProcessDelta]) {
        for delta in deltas {
            if delta.read_bytes == 0 && delta.write_bytes == 0 {
                continue;
            }
            let stat = self
                .processes
                .entry(delta.name.clone())
                .or_insert_with(|| ProcessIoStat {
                    name: delta.name.clone(),
                    exe_path: None,
                    read_bytes: 0,
                    write_bytes: 0,
                    total_bytes: 0,
                });
            if stat.exe_path.is_none() {
                stat.exe_path = delta.exe_path.clone();
            }
            stat.read_bytes = stat.read_bytes.saturating_add(delta.read_bytes);
            stat.write_bytes = stat.write_bytes.saturating_add(delta.write_bytes);
            stat.total_bytes = stat.read_bytes.saturating_add(stat.write_bytes);
        }
    }

    /// Busiest process groups first; ties are broken by name.
    pub fn top_processes(&self, limit: usize) -> TopProcesses {
        let mut top: TopProcesses = self.processes.values().cloned().collect();
        top.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then_with(|| a.name.cmp(&b.name)));
        top.truncate(limit);
        top
    }

    pub fn clear(&mut self) {
        self.totals = IoTotals::default();
        self.processes.clear();
    }
}

/// Session state shared between the collector and the reset command.
///
/// The lock is async so a reset can hold it across the store wipe; the
/// collector waits rather than producing a sample the wipe would race.
#[derive(Default)]
pub struct SessionCounters {
    state: tokio::sync::Mutex<SessionState>,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Continues from a previously committed total.
    pub async fn seed(&self, totals: IoTotals) {
        self.lock().await.totals = totals;
    }

    pub async fn snapshot(&self) -> IoTotals {
        self.lock().await.totals
    }

    pub async fn top_processes(&self) -> TopProcesses {
        self.lock().await.top_processes(TOP_PROCESS_LIMIT)
    }
}

pub struct Collector {
    source: Arc<Mutex<Box<dyn SampleSource + Send>>>,
    counters: Arc<SessionCounters>,
    buffer: Arc<SampleBuffer>,
    publisher: EventPublisher,
    writer: Arc<PersistenceWriter>,
    metrics: Option<Arc<PrometheusExporter>>,
    poll_interval: Duration,
    last_poll: Option<Instant>,
}

impl Collector {
    pub fn new(
        source: Box<dyn SampleSource + Send>,
        counters: Arc<SessionCounters>,
        buffer: Arc<SampleBuffer>,
        publisher: EventPublisher,
        writer: Arc<PersistenceWriter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            counters,
            buffer,
            publisher,
            writer,
            metrics: None,
            poll_interval,
            last_poll: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Polls the source once. On success the sample is published and
    /// buffered; on failure the tick is skipped. Either way a due flush is
    /// handed to the writer without waiting for it.
    pub async fn tick(&mut self) -> Option<Sample> {
        let sample = match self.poll_source().await {
            Some(raw) => self.record(raw).await,
            None => None,
        };

        if self.buffer.should_flush() {
            self.writer.trigger();
        }

        sample
    }

    async fn poll_source(&mut self) -> Option<RawSample> {
        let source = Arc::clone(&self.source);
        let polled = tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            source.poll()
        })
        .await;

        match polled {
            Ok(Ok(raw)) => Some(raw),
            Ok(Err(e)) => {
                warn!(error = %e, "Sample source failed, skipping tick");
                self.record_failure();
                None
            }
            Err(e) => {
                error!(error = %e, "Sample source panicked, skipping tick");
                self.record_failure();
                None
            }
        }
    }

    async fn record(&mut self, raw: RawSample) -> Option<Sample> {
        let now = Instant::now();
        let elapsed = self
            .last_poll
            .map(|previous| now.duration_since(previous))
            .unwrap_or(self.poll_interval);
        self.last_poll = Some(now);

        let seconds = elapsed.as_secs_f64().max(0.001);

        // Held until the sample is buffered so a reset cannot interleave.
        let mut session = self.counters.lock().await;
        let sample = Sample {
            timestamp: unix_now(),
            read_bytes: session.totals.read_bytes.saturating_add(raw.read_bytes),
            write_bytes: session.totals.write_bytes.saturating_add(raw.write_bytes),
            read_speed: (raw.read_bytes as f64 / seconds).round() as u64,
            write_speed: (raw.write_bytes as f64 / seconds).round() as u64,
            idle_time: raw.idle_time,
            queue_depth: raw.queue_depth,
        };

        if let Err(e) = sample.validate() {
            warn!(error = %e, "Discarding invalid sample");
            drop(session);
            self.record_failure();
            return None;
        }

        session.totals.read_bytes = sample.read_bytes;
        session.totals.write_bytes = sample.write_bytes;
        session.add_processes(&raw.processes);
        let top = session.top_processes(TOP_PROCESS_LIMIT);

        self.publisher.publish(&sample);
        self.publisher.publish_top_processes(top);
        self.buffer.append(sample.clone());
        self.buffer.add_process_deltas(
            raw.processes
                .iter()
                .map(|p| (p.name.as_str(), p.read_bytes, p.write_bytes)),
        );
        drop(session);

        if let Some(metrics) = &self.metrics {
            metrics.record_sample(&sample);
        }
        debug!(
            read_speed = sample.read_speed,
            write_speed = sample.write_speed,
            "Sample collected"
        );

        Some(sample)
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_source_failure();
        }
    }

    pub async fn run(mut self, shutdown_tx: broadcast::Sender<()>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown_tx.subscribe();

        info!("Collector started ({} ms interval)", self.poll_interval.as_millis());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Collector shutting down");
                    break;
                }
            }
        }
    }
}
