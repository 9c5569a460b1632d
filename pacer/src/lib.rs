//! Pacer: a benchmark driver that replays timestamped database operations at
//! their scheduled wall clock times.
//!
//! Pacer takes a lazily produced, time ordered stream of operations and a fixed pool
//! of worker threads and guarantees that each operation starts no earlier than its
//! scheduled time and, if it depends on earlier operations, no earlier than all of
//! them have globally completed. Start time slippage is detected and reported, and
//! latency metrics are collected without letting collection throttle the schedule.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: glue that ties a [`Db`] adapter, an operation stream and an
//!   [`Executor`] together.
//! - [`WorkloadRunner`]: the provided executor. It dispatches operations in order to
//!   a fixed pool of workers, the pool size being the only admission control.
//! - [`CompletionTimeService`]: tracks global completion time (GCT), the point before
//!   which every operation is known to have finished.
//! - [`Spinner`]: holds a worker until an operation's schedule and dependency allow
//!   it to start.
//! - [`MetricsService`]: folds [`OperationResult`]s from all workers into per
//!   operation type latency histograms.
//! - [`Report`] and [`Reporter`]: turn the final [`WorkloadResultsSnapshot`] into
//!   something a human or another program can read.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use pacer::{DriverConfig, DummyDb, Operation, Reporter, Scenario, WorkloadRunner};
//! use pacer::report::{StdoutReporter, WorkloadReport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let operations = (0..100).map(|i| Operation::at(i % 3, i as i64 * 10));
//!     let snapshot = Scenario::builder()
//!         .name("dummy")
//!         .db(DummyDb::new(Duration::from_millis(2)))
//!         .operations(operations)
//!         .executor(
//!             WorkloadRunner::builder()
//!                 .config(DriverConfig::builder().thread_count(4).build())
//!                 .build(),
//!         )
//!         .build()
//!         .run()
//!         .await
//!         .unwrap();
//!
//!     StdoutReporter.report(WorkloadReport::from(&snapshot)).await.unwrap();
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: re-exports the `#[metric]` attribute for declaring custom metrics.
//!   (Enabled by default)
//! - `builtins`: provides `DummyDb`, `WorkloadReport`, `StdoutReporter` and
//!   `JsonReporter` for dry runs and demos. (Enabled by default)
//!
//! See `examples/dummy.rs` for a runnable workload.

/// Metric aggregators and snapshots
pub mod aggregate;
/// Global completion time tracking
pub mod completion;
pub mod config;
/// The adapter for the system under test
pub mod db;
pub mod error;
pub mod error_reporter;
/// Orchestrators that define how a workload actually runs
pub mod executor;
/// Single measurements
pub mod metric;
pub mod metrics;
pub mod operation;
/// Reports and Reporters
pub mod report;
/// Main module of the framework that glues everything together
pub mod scenario;
pub mod spinner;
pub mod time;

pub use aggregate::{Aggregate, WorkloadResultsSnapshot};
pub use completion::{CompletionTimeMode, CompletionTimeService, WriterId};
pub use config::DriverConfig;
#[cfg(feature = "builtins")]
pub use db::DummyDb;
pub use db::Db;
pub use error::{CompletionTimeError, ConfigError, DbError, MetricsCollectionError, RunnerError};
pub use error_reporter::ConcurrentErrorReporter;
pub use executor::{Executor, WorkloadRunner};
pub use metric::{Metric, OperationResult};
pub use metrics::{MetricsService, QueueDiscipline};
pub use operation::{Operation, OperationStreamExt};
pub use report::{Report, Reporter};
pub use scenario::Scenario;
pub use spinner::{SpinResult, Spinner, SpinnerCheck, SpinnerCheckResult};

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use pacer_macros::*;
}
