//! Completion time tracking.
//!
//! Every writer (a worker slot, the dispatcher, or a remote peer) owns a marker
//! saying "nothing I was handed with a timestamp at or below this value is still
//! running". The global completion time (GCT) is the minimum of all markers and is
//! what dependency gates compare against.
//!
//! Two implementations share the same bookkeeping (`Tracker`):
//! - [`DirectCompletionTimeService`] applies submissions under a lock on the calling
//!   thread and republishes the minimum right away. Errors surface as return values.
//! - [`QueuedCompletionTimeService`] only enqueues submissions; a dedicated thread
//!   applies them in batches and reports ordering violations to the error reporter.
//!   Submitting is cheaper, GCT lags slightly behind.
//!
//! # Invariants
//! - GCT is `None` until every writer has published a marker.
//! - A writer with an operation in flight at timestamp `p` publishes `p - 1`, even
//!   when it already completed another operation at `p`.
//! - GCT is the exact minimum. It only moves forward as long as nobody initiates a
//!   timestamp at or below the current GCT; the workload runner guarantees that by
//!   registering its dispatcher as a writer that holds the timestamp on offer.
pub mod direct;
pub mod queued;

pub use direct::DirectCompletionTimeService;
pub use queued::QueuedCompletionTimeService;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{error::CompletionTimeError, error_reporter::ConcurrentErrorReporter};

/// Identity of a local completion time writer: one per worker slot, then the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(pub usize);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Tracks global completion time for a fixed set of writers and peers.
///
/// Each `WriterId` must only ever be written from one thread.
pub trait CompletionTimeService: Send + Sync {
    /// `writer` is about to start an operation with logical timestamp `time_ms`.
    fn submit_initiated_time(&self, writer: WriterId, time_ms: i64)
    -> Result<(), CompletionTimeError>;

    /// `writer` finished the operation it initiated at `time_ms`.
    fn submit_completed_time(&self, writer: WriterId, time_ms: i64)
    -> Result<(), CompletionTimeError>;

    /// A remote peer reports its own completion time.
    fn submit_external_completion_time(
        &self,
        peer: &str,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError>;

    fn global_completion_time(&self) -> Option<i64>;

    /// Resolves once GCT is at or past `target_ms`, yielding the GCT observed.
    fn global_completion_time_future(
        &self,
        target_ms: i64,
    ) -> BoxFuture<'static, Result<i64, CompletionTimeError>>;

    /// Stops accepting submissions. Calling it again is a no-op.
    fn shutdown(&self) -> Result<(), CompletionTimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTimeMode {
    #[default]
    Direct,
    Queued,
}

/// Builds the completion time service selected by `mode`.
pub fn new_service(
    mode: CompletionTimeMode,
    writer_count: usize,
    peer_ids: &[String],
    reporter: Arc<ConcurrentErrorReporter>,
) -> std::io::Result<Arc<dyn CompletionTimeService>> {
    Ok(match mode {
        CompletionTimeMode::Direct => {
            Arc::new(DirectCompletionTimeService::new(writer_count, peer_ids))
        }
        CompletionTimeMode::Queued => Arc::new(QueuedCompletionTimeService::new(
            writer_count,
            peer_ids,
            reporter,
        )?),
    })
}

/// Per-writer bookkeeping: the operation in flight and the last one completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriterClock {
    pending: Option<i64>,
    completed: Option<i64>,
}

impl WriterClock {
    pub(crate) fn initiate(
        &mut self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        if let Some(pending) = self.pending {
            return Err(CompletionTimeError::AlreadyInitiated {
                writer,
                pending,
                initiated: time_ms,
            });
        }
        match self.completed {
            Some(completed) if time_ms < completed => {
                Err(CompletionTimeError::InitiatedBeforeCompleted {
                    writer,
                    initiated: time_ms,
                    completed,
                })
            }
            _ => {
                self.pending = Some(time_ms);
                Ok(())
            }
        }
    }

    pub(crate) fn complete(
        &mut self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        match self.pending {
            None => Err(CompletionTimeError::CompletedWithoutInitiated {
                writer,
                completed: time_ms,
            }),
            Some(pending) if pending != time_ms => Err(CompletionTimeError::CompletedMismatch {
                writer,
                pending,
                completed: time_ms,
            }),
            Some(_) => {
                self.pending = None;
                self.completed = Some(time_ms);
                Ok(())
            }
        }
    }

    pub(crate) fn lower_bound(&self) -> Option<i64> {
        match self.pending {
            Some(pending) => Some(pending - 1),
            None => self.completed,
        }
    }
}

/// Markers of every writer and peer. Callers serialize access.
#[derive(Debug)]
pub(crate) struct Tracker {
    clocks: Vec<WriterClock>,
    peers: HashMap<String, Option<i64>>,
}

impl Tracker {
    pub(crate) fn new(writer_count: usize, peer_ids: &[String]) -> Self {
        Self {
            clocks: vec![WriterClock::default(); writer_count],
            peers: peer_ids.iter().map(|id| (id.clone(), None)).collect(),
        }
    }

    fn clock(&mut self, writer: WriterId) -> Result<&mut WriterClock, CompletionTimeError> {
        self.clocks
            .get_mut(writer.0)
            .ok_or(CompletionTimeError::UnknownWriter(writer))
    }

    pub(crate) fn initiate(
        &mut self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.clock(writer)?.initiate(writer, time_ms)
    }

    pub(crate) fn complete(
        &mut self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.clock(writer)?.complete(writer, time_ms)
    }

    pub(crate) fn external(&mut self, peer: &str, time_ms: i64) -> Result<(), CompletionTimeError> {
        let slot = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| CompletionTimeError::UnknownPeer(peer.to_string()))?;
        match *slot {
            Some(previous) if time_ms < previous => {
                Err(CompletionTimeError::ExternalTimeRegressed {
                    peer: peer.to_string(),
                    previous,
                    submitted: time_ms,
                })
            }
            _ => {
                *slot = Some(time_ms);
                Ok(())
            }
        }
    }

    pub(crate) fn global(&self) -> Option<i64> {
        global_minimum(
            self.clocks
                .iter()
                .map(WriterClock::lower_bound)
                .chain(self.peers.values().copied()),
        )
    }
}

/// Minimum over all markers, `None` while any marker is missing.
pub(crate) fn global_minimum(markers: impl IntoIterator<Item = Option<i64>>) -> Option<i64> {
    let mut min: Option<i64> = None;
    let mut any = false;
    for marker in markers {
        let marker = marker?;
        any = true;
        min = Some(min.map_or(marker, |m| m.min(marker)));
    }
    if any { min } else { None }
}

const UNSET: i64 = i64::MIN;

pub(crate) fn decode(raw: i64) -> Option<i64> {
    (raw != UNSET).then_some(raw)
}

pub(crate) fn encode(value: Option<i64>) -> i64 {
    value.unwrap_or(UNSET)
}

/// Latest GCT plus a watch channel for waiters.
#[derive(Debug)]
pub(crate) struct GctPublisher {
    gct: AtomicI64,
    tx: watch::Sender<Option<i64>>,
}

impl GctPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            gct: AtomicI64::new(UNSET),
            tx,
        }
    }

    /// Publishes the minimum just computed. Callers serialize publication so the
    /// value seen by readers is never older than the tracker state.
    pub(crate) fn publish(&self, gct: Option<i64>) {
        self.gct.store(encode(gct), Ordering::Release);
        self.tx.send_if_modified(|current| {
            if *current == gct {
                false
            } else {
                *current = gct;
                true
            }
        });
    }

    pub(crate) fn current(&self) -> Option<i64> {
        decode(self.gct.load(Ordering::Acquire))
    }

    pub(crate) fn wait_for(
        &self,
        target_ms: i64,
    ) -> BoxFuture<'static, Result<i64, CompletionTimeError>> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            let reached = rx
                .wait_for(|gct| gct.is_some_and(|g| g >= target_ms))
                .await
                .map(|gct| *gct)
                .map_err(|_| CompletionTimeError::ShutDown)?;
            reached.ok_or(CompletionTimeError::ShutDown)
        })
    }
}
