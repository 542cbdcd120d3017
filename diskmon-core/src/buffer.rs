//! In-memory accumulator between the collector and the persistence writer.
//!
//! The buffer is always `Filling`; `drain_for_flush` is the only moment it is
//! `Flushing`, and that state ends when the call returns. Records that fail to
//! persist come back through [`SampleBuffer::requeue_front`].

use crate::config::BufferConfig;
use crate::models::Sample;
use crate::telemetry::PrometheusExporter;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// A buffered sample and the number of failed flushes it has been part of.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedSample {
    pub sample: Sample,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushThresholds {
    pub max_records: usize,
    pub max_age: Duration,
    pub capacity: usize,
}

impl From<&BufferConfig> for FlushThresholds {
    fn from(config: &BufferConfig) -> Self {
        Self {
            max_records: config.flush_max_records,
            max_age: Duration::from_secs(config.flush_max_age_secs),
            capacity: config.capacity,
        }
    }
}

#[derive(Default)]
struct Inner {
    items: VecDeque<BufferedSample>,
    process_deltas: HashMap<String, (u64, u64)>,
    filling_since: Option<Instant>,
}

pub struct SampleBuffer {
    inner: Mutex<Inner>,
    thresholds: FlushThresholds,
    metrics: Option<Arc<PrometheusExporter>>,
}

impl SampleBuffer {
    pub fn new(thresholds: FlushThresholds) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            thresholds,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PrometheusExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends without blocking on persistence. When the buffer is at capacity
    /// the oldest sample is evicted and reported.
    pub fn append(&self, sample: Sample) {
        let mut inner = self.lock();
        if inner.items.is_empty() {
            inner.filling_since = Some(Instant::now());
        }
        inner.items.push_back(BufferedSample { sample, attempts: 0 });

        let evicted = Self::enforce_capacity(&mut inner, self.thresholds.capacity);
        let depth = inner.items.len();
        drop(inner);

        if evicted > 0 {
            warn!(evicted, capacity = self.thresholds.capacity, "Buffer full, evicted oldest samples");
        }
        self.report(depth, evicted);
    }

    /// Adds per-process byte deltas, merged by name until the next flush.
    pub fn add_process_deltas<'a, I>(&self, deltas: I)
    where
        I: IntoIterator<Item = (&'a str, u64, u64)>,
    {
        let mut inner = self.lock();
        for (name, read, write) in deltas {
            if read == 0 && write == 0 {
                continue;
            }
            let entry = inner.process_deltas.entry(name.to_string()).or_insert((0, 0));
            entry.0 = entry.0.saturating_add(read);
            entry.1 = entry.1.saturating_add(write);
        }
    }

    pub fn should_flush(&self) -> bool {
        let inner = self.lock();
        if inner.items.is_empty() {
            return false;
        }
        inner.items.len() >= self.thresholds.max_records
            || inner
                .filling_since
                .map(|since| since.elapsed() >= self.thresholds.max_age)
                .unwrap_or(false)
    }

    /// Removes and returns everything currently held, in append order.
    pub fn drain_for_flush(&self) -> Vec<BufferedSample> {
        let mut inner = self.lock();
        inner.filling_since = None;
        let drained: Vec<BufferedSample> = inner.items.drain(..).collect();
        drop(inner);

        self.report(0, 0);
        drained
    }

    pub fn take_process_deltas(&self) -> HashMap<String, (u64, u64)> {
        std::mem::take(&mut self.lock().process_deltas)
    }

    /// Puts records from a failed flush back ahead of anything appended since.
    pub fn requeue_front(&self, records: Vec<BufferedSample>) {
        if records.is_empty() {
            return;
        }
        let mut inner = self.lock();
        for record in records.into_iter().rev() {
            inner.items.push_front(record);
        }
        if inner.filling_since.is_none() {
            inner.filling_since = Some(Instant::now());
        }

        let evicted = Self::enforce_capacity(&mut inner, self.thresholds.capacity);
        let depth = inner.items.len();
        drop(inner);

        if evicted > 0 {
            warn!(evicted, "Buffer full while requeueing, evicted oldest samples");
        }
        self.report(depth, evicted);
    }

    pub fn restore_process_deltas(&self, deltas: HashMap<String, (u64, u64)>) {
        self.add_process_deltas(
            deltas
                .iter()
                .map(|(name, (read, write))| (name.as_str(), *read, *write)),
        );
    }

    /// Drops all pending samples and process deltas. Returns the sample count discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let discarded = inner.items.len();
        inner.items.clear();
        inner.process_deltas.clear();
        inner.filling_since = None;
        drop(inner);

        self.report(0, 0);
        discarded
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn has_process_deltas(&self) -> bool {
        !self.lock().process_deltas.is_empty()
    }

    fn enforce_capacity(inner: &mut Inner, capacity: usize) -> usize {
        let mut evicted = 0;
        while inner.items.len() > capacity {
            inner.items.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn report(&self, depth: usize, evicted: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_buffer_depth(depth);
            if evicted > 0 {
                metrics.record_evicted(evicted);
            }
        }
    }
}
