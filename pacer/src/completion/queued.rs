use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{CompletionTimeService, GctPublisher, Tracker, WriterId};
use crate::{error::CompletionTimeError, error_reporter::ConcurrentErrorReporter};

const MAX_BATCH_SIZE: usize = 256;

#[derive(Debug)]
enum Event {
    Initiated(WriterId, i64),
    Completed(WriterId, i64),
    External(String, i64),
    Shutdown,
}

impl Tracker {
    fn apply(&mut self, event: Event) -> Result<(), CompletionTimeError> {
        match event {
            Event::Initiated(writer, time_ms) => self.initiate(writer, time_ms),
            Event::Completed(writer, time_ms) => self.complete(writer, time_ms),
            Event::External(peer, time_ms) => self.external(&peer, time_ms),
            Event::Shutdown => Ok(()),
        }
    }
}

/// Completion time service that hands submissions to a background thread.
///
/// Submitting never blocks and only fails once the service is shut down. Ordering
/// violations are detected on the consumer side and reported as fatal errors, since
/// the submitting worker has already moved on by then.
#[derive(Debug)]
pub struct QueuedCompletionTimeService {
    tx: Sender<Event>,
    writer_count: usize,
    publisher: Arc<GctPublisher>,
    shut_down: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedCompletionTimeService {
    pub fn new(
        writer_count: usize,
        peer_ids: &[String],
        reporter: Arc<ConcurrentErrorReporter>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let publisher = Arc::new(GctPublisher::new());
        let tracker = Tracker::new(writer_count, peer_ids);

        let consumer = {
            let publisher = Arc::clone(&publisher);
            thread::Builder::new()
                .name("completion-time".into())
                .spawn(move || consume(rx, tracker, &publisher, &reporter))?
        };

        Ok(Self {
            tx,
            writer_count,
            publisher,
            shut_down: AtomicBool::new(false),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    fn send(&self, event: Event) -> Result<(), CompletionTimeError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CompletionTimeError::ShutDown);
        }
        self.tx
            .send(event)
            .map_err(|_| CompletionTimeError::ShutDown)
    }

    fn check_writer(&self, writer: WriterId) -> Result<(), CompletionTimeError> {
        if writer.0 < self.writer_count {
            Ok(())
        } else {
            Err(CompletionTimeError::UnknownWriter(writer))
        }
    }
}

fn consume(
    rx: Receiver<Event>,
    mut tracker: Tracker,
    publisher: &GctPublisher,
    reporter: &ConcurrentErrorReporter,
) {
    tracing::debug!("completion time consumer started");
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    // Wait for the first event, then drain whatever else is already queued.
    while let Ok(first) = rx.recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        let mut stop = false;
        for event in batch.drain(..) {
            if matches!(event, Event::Shutdown) {
                stop = true;
                continue;
            }
            if let Err(e) = tracker.apply(event) {
                tracing::error!(error = %e, "completion time ordering violation");
                reporter.fatal("completion-time", e);
            }
        }
        publisher.publish(tracker.global());

        if stop {
            break;
        }
    }
    tracing::debug!("completion time consumer stopped");
}

impl CompletionTimeService for QueuedCompletionTimeService {
    fn submit_initiated_time(
        &self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.check_writer(writer)?;
        self.send(Event::Initiated(writer, time_ms))
    }

    fn submit_completed_time(
        &self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.check_writer(writer)?;
        self.send(Event::Completed(writer, time_ms))
    }

    fn submit_external_completion_time(
        &self,
        peer: &str,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.send(Event::External(peer.to_string(), time_ms))
    }

    fn global_completion_time(&self) -> Option<i64> {
        self.publisher.current()
    }

    fn global_completion_time_future(
        &self,
        target_ms: i64,
    ) -> BoxFuture<'static, Result<i64, CompletionTimeError>> {
        self.publisher.wait_for(target_ms)
    }

    /// Processes everything queued so far, then stops the consumer thread.
    fn shutdown(&self) -> Result<(), CompletionTimeError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The consumer may already be gone if it panicked, joining below reports that.
        let _ = self.tx.send(Event::Shutdown);
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                tracing::error!("completion time consumer panicked");
            }
        }
        Ok(())
    }
}

impl Drop for QueuedCompletionTimeService {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
