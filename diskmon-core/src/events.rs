use crate::models::{Sample, TopProcesses};
use crate::telemetry::PrometheusExporter;
use futures_util::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

/// Pushes each collected sample, and the busiest processes at that tick, to
/// live consumers.
///
/// Delivery is at-most-once: there is no replay, and an event published with
/// nobody listening is gone. Subscribers see events in production order; one
/// that falls more than the channel capacity behind skips ahead.
#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<Sample>,
    top_processes: broadcast::Sender<Arc<TopProcesses>>,
    metrics: Option<Arc<PrometheusExporter>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (top_processes, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            top_processes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether at least one subscriber received the sample.
    pub fn publish(&self, sample: &Sample) -> bool {
        let delivered = match self.sender.send(sample.clone()) {
            Ok(receivers) => {
                trace!(receivers, "Sample published");
                true
            }
            Err(_) => false,
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_publish(delivered);
        }
        delivered
    }

    /// Sent on every successful tick, including an empty list right after a reset.
    pub fn publish_top_processes(&self, top: TopProcesses) -> bool {
        self.top_processes.send(Arc::new(top)).is_ok()
    }

    pub fn subscribe(&self) -> EventSubscription<Sample> {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscribe_top_processes(&self) -> EventSubscription<Arc<TopProcesses>> {
        EventSubscription {
            receiver: self.top_processes.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventSubscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> EventSubscription<T> {
    /// Next event, or `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping ahead");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = T> {
        stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}
