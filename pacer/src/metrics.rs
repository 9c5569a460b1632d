//! Collects [`OperationResult`]s from all workers into a [`WorkloadAggregate`].
//!
//! Producers push into a bounded queue, a single consumer thread folds results into
//! the aggregate in batches. Snapshot and shutdown requests travel through the same
//! queue, so a snapshot always reflects every result submitted before it was asked
//! for.
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::{Aggregate, WorkloadAggregate, WorkloadResultsSnapshot},
    error::MetricsCollectionError,
    error_reporter::ConcurrentErrorReporter,
    metric::OperationResult,
    time::TimeUnit,
};

/// Most results folded before the consumer looks for control messages again.
const MAX_BATCH_SIZE: usize = 1024;
/// Attempts a non-blocking producer makes before giving up on a full queue.
const NON_BLOCKING_ATTEMPTS: usize = 3;

pub const DEFAULT_HIGHEST_EXPECTED_RUNTIME: Duration = Duration::from_secs(90 * 60);

/// What a producer does when the metrics queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    /// Wait for space. Workers stall while the consumer catches up.
    #[default]
    Blocking,
    /// Retry briefly, then drop the result and report a warning.
    NonBlocking,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct MetricsOptions {
    #[builder(default)]
    pub discipline: QueueDiscipline,
    #[builder(default = 1024)]
    pub capacity: usize,
    #[builder(default)]
    pub time_unit: TimeUnit,
    #[builder(default = DEFAULT_HIGHEST_EXPECTED_RUNTIME)]
    pub highest_expected_runtime: Duration,
    /// How often a blocked producer checks whether the run was aborted.
    #[builder(default = Duration::from_millis(10))]
    pub poll_interval: Duration,
}

enum MetricsEvent {
    Submit(OperationResult),
    Snapshot(Sender<WorkloadResultsSnapshot>),
    Shutdown(Sender<WorkloadResultsSnapshot>),
}

pub struct MetricsService {
    tx: Sender<MetricsEvent>,
    options: MetricsOptions,
    reporter: Arc<ConcurrentErrorReporter>,
    /// `true` once shut down. Producers hold the read side while enqueueing so that
    /// shutdown observes a queue nobody is still writing to.
    closed: RwLock<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    final_snapshot: Mutex<Option<WorkloadResultsSnapshot>>,
}

impl MetricsService {
    pub fn start(
        options: MetricsOptions,
        reporter: Arc<ConcurrentErrorReporter>,
    ) -> Result<Self, MetricsCollectionError> {
        let aggregate =
            WorkloadAggregate::new(options.time_unit, options.highest_expected_runtime)?;
        let (tx, rx) = crossbeam_channel::bounded(options.capacity);
        let consumer = thread::Builder::new()
            .name("metrics".into())
            .spawn(move || consume(rx, aggregate))
            .map_err(|e| MetricsCollectionError::Spawn(e.to_string()))?;

        tracing::debug!(
            discipline = ?options.discipline,
            capacity = options.capacity,
            "metrics service started"
        );
        Ok(Self {
            tx,
            options,
            reporter,
            closed: RwLock::new(false),
            consumer: Mutex::new(Some(consumer)),
            final_snapshot: Mutex::new(None),
        })
    }

    /// Queues one result for aggregation.
    ///
    /// Fails with `ShutDown` after [`MetricsService::shutdown`]. Under the non-blocking
    /// discipline a full queue drops the result and fails with `QueueFull`.
    pub fn submit_operation_result(
        &self,
        result: OperationResult,
    ) -> Result<(), MetricsCollectionError> {
        let closed = self.closed.read();
        if *closed {
            return Err(MetricsCollectionError::ShutDown);
        }
        match self.options.discipline {
            QueueDiscipline::Blocking => self.send_blocking(MetricsEvent::Submit(result)),
            QueueDiscipline::NonBlocking => self.send_non_blocking(MetricsEvent::Submit(result)),
        }
    }

    fn send_blocking(&self, mut event: MetricsEvent) -> Result<(), MetricsCollectionError> {
        loop {
            match self.tx.send_timeout(event, self.options.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.reporter.is_aborted() {
                        return Err(MetricsCollectionError::Aborted);
                    }
                    event = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(MetricsCollectionError::ConsumerGone);
                }
            }
        }
    }

    fn send_non_blocking(&self, mut event: MetricsEvent) -> Result<(), MetricsCollectionError> {
        for _ in 0..NON_BLOCKING_ATTEMPTS {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    thread::yield_now();
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(MetricsCollectionError::ConsumerGone);
                }
            }
        }
        self.reporter.warn("metrics", MetricsCollectionError::QueueFull);
        Err(MetricsCollectionError::QueueFull)
    }

    /// Point-in-time view of everything submitted so far.
    ///
    /// After shutdown this is the final snapshot.
    pub fn results(&self) -> Result<WorkloadResultsSnapshot, MetricsCollectionError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        {
            let closed = self.closed.read();
            if *closed {
                return self
                    .final_snapshot
                    .lock()
                    .clone()
                    .ok_or(MetricsCollectionError::ShutDown);
            }
            self.send_blocking(MetricsEvent::Snapshot(reply_tx))?;
        }
        reply_rx.recv().map_err(|_| MetricsCollectionError::ConsumerGone)
    }

    /// Drains the queue, stops the consumer and returns the final snapshot.
    pub fn shutdown(&self) -> Result<WorkloadResultsSnapshot, MetricsCollectionError> {
        let mut closed = self.closed.write();
        if *closed {
            return Err(MetricsCollectionError::ShutDown);
        }
        *closed = true;

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(MetricsEvent::Shutdown(reply_tx))
            .map_err(|_| MetricsCollectionError::ConsumerGone)?;
        let snapshot = reply_rx
            .recv()
            .map_err(|_| MetricsCollectionError::ConsumerGone)?;
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                tracing::error!("metrics consumer panicked during shutdown");
            }
        }

        tracing::debug!(operations = snapshot.operation_count, "metrics service shut down");
        *self.final_snapshot.lock() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

impl Drop for MetricsService {
    fn drop(&mut self) {
        if !*self.closed.read() {
            let _ = self.shutdown();
        }
    }
}

fn consume(rx: Receiver<MetricsEvent>, mut aggregate: WorkloadAggregate) {
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    // Wait for the first event, then drain whatever else is queued before folding.
    while let Ok(first) = rx.recv() {
        let mut next = Some(first);
        let mut drained = 0;
        while let Some(event) = next.take() {
            match event {
                MetricsEvent::Submit(result) => batch.push(result),
                MetricsEvent::Snapshot(reply) => {
                    aggregate.aggregate(&batch);
                    batch.clear();
                    // the requester may have given up
                    let _ = reply.send(aggregate.snapshot());
                }
                MetricsEvent::Shutdown(reply) => {
                    aggregate.aggregate(&batch);
                    let _ = reply.send(aggregate.snapshot());
                    return;
                }
            }
            drained += 1;
            if drained < MAX_BATCH_SIZE {
                next = rx.try_recv().ok();
            }
        }
        aggregate.aggregate(&batch);
        batch.clear();
    }
}
