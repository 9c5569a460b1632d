//! Executor: replays an operation stream against a [`Db`].
//!
//! The `Executor` trait is the runtime hook a [`crate::Scenario`] runs through. The
//! provided [`WorkloadRunner`] replays operations at their scheduled wall clock
//! times on a fixed pool of worker threads, gating dependent operations on global
//! completion time.
//!
//! # High-level flow
//! 1. Initialize the db adapter and the run's services: error reporter, completion
//!    time service, metrics service.
//! 2. Pin every completion time writer, one per worker plus the dispatcher's, just
//!    below the workload start time and wait until global completion time reflects it.
//! 3. Spawn `thread_count` workers, each on its own blocking thread, and one
//!    dispatcher pulling the stream in order.
//! 4. The dispatcher hands each operation to the next idle worker over a rendezvous
//!    channel, blocking while every worker is busy. That is the only admission control.
//!    It keeps the timestamp on offer initiated on its own writer and only moves on to
//!    a later timestamp once every operation handed out so far has been initiated.
//! 5. Each worker initiates the operation's timestamp, spins until its schedule and
//!    dependency allow it to start, executes it, completes the timestamp and submits
//!    the result to the metrics service.
//! 6. Once the stream is exhausted and workers are drained, shut down the completion
//!    time service, then the metrics service, then clean up the db adapter. Cleanup
//!    also runs when setting up the run fails after the adapter was initialized.
//!
//! # Failure handling
//! - An adapter error or panic is a failed operation, recorded with a nonzero result
//!   code. The run goes on.
//! - Schedule slippage beyond the tolerated delay is a warning, or fatal when
//!   `abort_on_excessive_delay` is set.
//! - Completion time ordering violations and submissions to a shut down service are
//!   fatal. The first fatal error sets the abort flag; the spinner, the dispatcher's
//!   handoff and blocking metrics submissions all poll it, so the run winds down
//!   within one poll interval and the metrics gathered so far are returned along
//!   with the error.
//!
//! # Tuning knobs
//! - `thread_count`: the most operations ever in flight. Workers block on the adapter,
//!   so size it for the adapter's concurrency, not the core count.
//! - `spinner_sleep_duration`: a shorter sleep starts operations closer to their
//!   schedule at the cost of CPU. Zero turns the spinner into a yield loop.
//! - `metrics_queue`: `blocking` throttles workers when the metrics consumer falls
//!   behind, `non_blocking` drops results instead and reports it.
pub mod runner;
pub mod worker;

pub use runner::WorkloadRunner;

use crate::{
    aggregate::WorkloadResultsSnapshot, db::Db, error::RunnerError, operation::Operation,
};

pub trait Executor<D, I>
where
    Self: Send + Sync + Sized,
    D: Db,
    I: IntoIterator<Item = Operation> + Send,
    I::IntoIter: Send + 'static,
{
    /// Replay `operations` against `db` and return the final metrics.
    fn exec(
        &self,
        name: &str,
        db: D,
        operations: I,
    ) -> impl Future<Output = Result<WorkloadResultsSnapshot, RunnerError>> + Send;
}
