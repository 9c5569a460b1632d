//! Worker slots and the dispatcher feeding them.
//!
//! Operations are handed over a rendezvous channel: the dispatcher's send only
//! completes once an idle worker takes the operation, so no more than `thread_count`
//! operations are ever past the dispatcher.
//!
//! Each worker owns one completion time writer. It initiates an operation's timestamp
//! as soon as it receives it, before waiting on the spinner, so a worker that is
//! itself blocked on a dependency never holds global completion time below that
//! dependency. A worker with nothing to do raises its marker to just below the
//! dispatch frontier (the timestamp of the operation currently on offer): every
//! operation it may still receive is at or after that point.
//!
//! The dispatcher owns one more writer and keeps the timestamp on offer initiated on
//! it. It only completes that timestamp once every operation it handed out has been
//! initiated by its worker, so an operation travelling through the channel is always
//! covered, even towards a worker whose own marker already sits at that timestamp.
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tokio::task::JoinHandle;

use crate::{
    completion::{CompletionTimeService, WriterId},
    db::Db,
    error::MetricsCollectionError,
    error_reporter::ConcurrentErrorReporter,
    metric::{FAILURE_RESULT_CODE, OperationResult},
    metrics::MetricsService,
    operation::Operation,
    spinner::{SpinResult, Spinner, SpinnerCheck},
    time::TimeSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    WaitingOnScheduleAndDependency,
    Running,
    Reporting,
    ShutDown,
}

/// Lowest timestamp any operation not yet taken by a worker can have.
#[derive(Debug)]
pub struct DispatchFrontier(AtomicI64);

impl DispatchFrontier {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn advance(&self, time_ms: i64) {
        self.0.fetch_max(time_ms, Ordering::AcqRel);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Shared by the dispatcher and every worker of one run.
pub struct ExecutionContext {
    pub completion_time: Arc<dyn CompletionTimeService>,
    pub metrics: Arc<MetricsService>,
    pub reporter: Arc<ConcurrentErrorReporter>,
    pub spinner: Spinner,
    pub check: Box<dyn SpinnerCheck>,
    pub time_source: Arc<dyn TimeSource>,
    pub frontier: DispatchFrontier,
    /// Completion time writer of the dispatcher.
    pub dispatcher: WriterId,
    /// Operations whose initiated time has been submitted by a worker.
    pub initiated: AtomicU64,
    /// How often blocked handoffs look at the abort flag.
    pub poll_interval: Duration,
    pub abort_on_excessive_delay: bool,
    pub completed: AtomicU64,
    pub running: AtomicUsize,
}

impl ExecutionContext {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

struct WorkerSlot {
    id: WriterId,
    state: WorkerState,
    /// Last time this slot submitted as completed.
    marker: i64,
    executed: u64,
}

impl WorkerSlot {
    /// Writers are pinned just below the workload start before any worker runs.
    fn new(id: WriterId, start_ms: i64) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            marker: start_ms - 1,
            executed: 0,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::trace!(worker = %self.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    fn fatal(&self, ctx: &ExecutionContext, message: impl std::fmt::Display) {
        tracing::error!(worker = %self.id, "{message}");
        ctx.reporter.fatal(self.id.to_string(), message);
    }

    fn process<D: Db>(&mut self, operation: &Operation, ctx: &ExecutionContext, db: &D) {
        let time_stamp = operation.time_stamp_ms;
        self.transition(WorkerState::WaitingOnScheduleAndDependency);
        let initiated = ctx.completion_time.submit_initiated_time(self.id, time_stamp);
        // counted either way, the dispatcher waits on it
        ctx.initiated.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = initiated {
            self.fatal(ctx, e);
            self.transition(WorkerState::Idle);
            return;
        }

        match ctx.spinner.spin(operation, ctx.check.as_ref()) {
            SpinResult::Passed => {}
            SpinResult::Aborted => {
                self.transition(WorkerState::Idle);
                return;
            }
            SpinResult::ExcessiveDelay { late_by } => {
                let message = format!(
                    "operation type {} scheduled at {} started {late_by:?} late",
                    operation.op_type, operation.scheduled_start_time_ms
                );
                if ctx.abort_on_excessive_delay {
                    self.fatal(ctx, message);
                } else {
                    tracing::warn!(worker = %self.id, "{message}");
                    ctx.reporter.warn(self.id.to_string(), message);
                }
            }
        }

        self.transition(WorkerState::Running);
        ctx.running.fetch_add(1, Ordering::SeqCst);
        let actual_start = ctx.time_source.now_ms();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| db.execute(operation)));
        let run_duration_ns =
            u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        ctx.running.fetch_sub(1, Ordering::SeqCst);

        let result_code = match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                tracing::debug!(
                    worker = %self.id,
                    op_type = operation.op_type,
                    "operation failed: {e}"
                );
                e.code.unwrap_or(FAILURE_RESULT_CODE)
            }
            Err(_) => {
                tracing::warn!(
                    worker = %self.id,
                    op_type = operation.op_type,
                    "db adapter panicked"
                );
                FAILURE_RESULT_CODE
            }
        };

        self.transition(WorkerState::Reporting);
        if let Err(e) = ctx.completion_time.submit_completed_time(self.id, time_stamp) {
            self.fatal(ctx, e);
        }
        self.marker = self.marker.max(time_stamp);

        let result =
            OperationResult::for_operation(operation, actual_start, run_duration_ns, result_code);
        match ctx.metrics.submit_operation_result(result) {
            // both are recorded by the metrics service or caused by an abort
            Ok(())
            | Err(MetricsCollectionError::QueueFull)
            | Err(MetricsCollectionError::Aborted) => {}
            Err(e) => self.fatal(ctx, e),
        }

        self.executed += 1;
        ctx.completed.fetch_add(1, Ordering::Relaxed);
        self.transition(WorkerState::Idle);
    }

    /// Vouches that nothing below the dispatch frontier is pending here.
    fn advance_idle(&mut self, ctx: &ExecutionContext) {
        let target = ctx.frontier.get().saturating_sub(1);
        if target <= self.marker {
            return;
        }
        let submitted = ctx
            .completion_time
            .submit_initiated_time(self.id, target)
            .and_then(|()| ctx.completion_time.submit_completed_time(self.id, target));
        match submitted {
            Ok(()) => self.marker = target,
            Err(e) => self.fatal(ctx, e),
        }
    }
}

/// Body of one worker thread. Returns how many operations it executed.
pub fn run_worker<D: Db>(
    id: WriterId,
    ctx: &ExecutionContext,
    db: &D,
    operations: Receiver<Operation>,
    start_ms: i64,
) -> u64 {
    let mut slot = WorkerSlot::new(id, start_ms);
    let idle_poll = ctx.poll_interval.max(Duration::from_millis(1));

    while !ctx.reporter.is_aborted() {
        match operations.recv_timeout(idle_poll) {
            Ok(operation) => slot.process(&operation, ctx, db),
            Err(RecvTimeoutError::Timeout) => slot.advance_idle(ctx),
            Err(RecvTimeoutError::Disconnected) => {
                // stream exhausted, let whoever is still spinning move past us
                slot.advance_idle(ctx);
                break;
            }
        }
    }

    slot.transition(WorkerState::ShutDown);
    tracing::debug!(worker = %id, executed = slot.executed, "worker stopped");
    slot.executed
}

pub fn spawn_workers<D: Db>(
    ctx: &Arc<ExecutionContext>,
    db: &Arc<D>,
    operations: &Receiver<Operation>,
    workers: usize,
    start_ms: i64,
) -> Vec<JoinHandle<u64>> {
    (0..workers)
        .map(|i| {
            let ctx = ctx.clone();
            let db = db.clone();
            let operations = operations.clone();
            tokio::task::spawn_blocking(move || {
                run_worker(WriterId(i), &ctx, &*db, operations, start_ms)
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: u64,
    pub last_time_stamp_ms: Option<i64>,
}

/// Pulls operations in order and hands each to the next idle worker.
///
/// Blocks while every worker is busy. Stops early, without error, once the run is
/// aborted; the reporter already holds the reason.
pub fn dispatch(
    operations: impl Iterator<Item = Operation>,
    workers: Sender<Operation>,
    ctx: &ExecutionContext,
    compressed_gct_delta_ms: i64,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();
    // timestamp initiated on the dispatcher's writer
    let mut holding: Option<i64> = None;

    for mut operation in operations {
        if ctx.reporter.is_aborted() {
            break;
        }
        let time_stamp = operation.time_stamp_ms;
        let frontier = ctx.frontier.get();
        if time_stamp < frontier {
            let message = format!(
                "operation timestamp {time_stamp} is before {frontier}, the stream is out of order"
            );
            tracing::error!("{message}");
            ctx.reporter.fatal("dispatcher", message);
            break;
        }
        if let Some(dependency) = operation.dependency_time_ms {
            // A worker holds completion time below its own timestamp while the operation
            // is pending, so a dependency at or after it could never be met.
            if dependency >= time_stamp {
                ctx.reporter.warn(
                    "dispatcher",
                    format!(
                        "dependency {dependency} is not before operation at {time_stamp}, \
                         waiting for {} instead",
                        time_stamp - 1
                    ),
                );
                operation.dependency_time_ms = Some(time_stamp - 1);
            } else if dependency > time_stamp - compressed_gct_delta_ms {
                ctx.reporter.warn(
                    "dispatcher",
                    format!(
                        "dependency {dependency} is within {compressed_gct_delta_ms}ms \
                         of operation at {time_stamp}"
                    ),
                );
            }
        }

        if holding != Some(time_stamp) {
            if !hold(ctx, holding, time_stamp, summary.dispatched) {
                break;
            }
            holding = Some(time_stamp);
        }
        if !hand_off(&workers, operation, ctx) {
            break;
        }
        summary.dispatched += 1;
        summary.last_time_stamp_ms = Some(time_stamp);
    }

    if let Some(last) = holding {
        if release(ctx, last, summary.dispatched) {
            ctx.frontier.advance(last.saturating_add(1));
        }
    }
    tracing::debug!(dispatched = summary.dispatched, "dispatcher finished");
    summary
}

/// Waits until every operation handed out so far has been initiated by its worker.
fn await_initiated(ctx: &ExecutionContext, dispatched: u64) -> bool {
    while ctx.initiated.load(Ordering::SeqCst) < dispatched {
        if ctx.reporter.is_aborted() {
            return false;
        }
        thread::yield_now();
    }
    true
}

/// Moves the dispatcher's writer from the timestamp it holds to `next`.
fn hold(ctx: &ExecutionContext, holding: Option<i64>, next: i64, dispatched: u64) -> bool {
    if !await_initiated(ctx, dispatched) {
        return false;
    }
    let moved = holding
        .map_or(Ok(()), |held| {
            ctx.completion_time.submit_completed_time(ctx.dispatcher, held)
        })
        .and_then(|()| ctx.completion_time.submit_initiated_time(ctx.dispatcher, next));
    if let Err(e) = moved {
        tracing::error!("dispatcher could not hold {next}: {e}");
        ctx.reporter.fatal("dispatcher", e);
        return false;
    }
    ctx.frontier.advance(next);
    true
}

/// Completes the last held timestamp once the stream is exhausted.
fn release(ctx: &ExecutionContext, last: i64, dispatched: u64) -> bool {
    if !await_initiated(ctx, dispatched) {
        return false;
    }
    match ctx.completion_time.submit_completed_time(ctx.dispatcher, last) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("dispatcher could not release {last}: {e}");
            ctx.reporter.fatal("dispatcher", e);
            false
        }
    }
}

fn hand_off(workers: &Sender<Operation>, mut operation: Operation, ctx: &ExecutionContext) -> bool {
    loop {
        match workers.send_timeout(operation, ctx.poll_interval.max(Duration::from_millis(1))) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if ctx.reporter.is_aborted() {
                    return false;
                }
                operation = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                if !ctx.reporter.is_aborted() {
                    ctx.reporter
                        .fatal("dispatcher", "every worker stopped before the stream ended");
                }
                return false;
            }
        }
    }
}
