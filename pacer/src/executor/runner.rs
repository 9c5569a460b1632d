use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize},
    },
    time::Duration,
};

use futures::future::join_all;
use typed_builder::TypedBuilder;

use super::{
    Executor,
    worker::{self, DispatchFrontier, ExecutionContext},
};
use crate::{
    aggregate::WorkloadResultsSnapshot,
    completion::{self, CompletionTimeService, WriterId},
    config::DriverConfig,
    db::Db,
    error::RunnerError,
    error_reporter::{ConcurrentErrorReporter, Severity},
    metrics::{MetricsOptions, MetricsService},
    operation::{Operation, OperationStreamExt},
    spinner::{GctDependencyCheck, Spinner},
    time::{SystemTimeSource, TimeSource},
};

/// Replays an operation stream on a fixed pool of blocking worker threads.
///
/// See the [module docs](super) for the execution model.
#[derive(TypedBuilder)]
pub struct WorkloadRunner {
    #[builder(default)]
    pub config: DriverConfig,
    #[builder(default = Arc::new(SystemTimeSource))]
    pub time_source: Arc<dyn TimeSource>,
    /// Use this service instead of building one from `completion_time_mode`.
    ///
    /// It needs `thread_count + 1` writers, the last one belongs to the dispatcher.
    /// Needed when `peer_ids` is set: peers start just below the workload start time
    /// and only move when their completion times are submitted to this service. It is
    /// shut down at the end of the run.
    #[builder(default, setter(strip_option))]
    pub completion_time: Option<Arc<dyn CompletionTimeService>>,
    /// Collect warnings and fatal errors here instead of in a reporter private to the
    /// run. `max_reported_errors` is then up to whoever built it.
    #[builder(default, setter(strip_option))]
    pub error_reporter: Option<Arc<ConcurrentErrorReporter>>,
}

impl<D, I> Executor<D, I> for WorkloadRunner
where
    D: Db,
    I: IntoIterator<Item = Operation> + Send,
    I::IntoIter: Send + 'static,
{
    async fn exec(
        &self,
        name: &str,
        mut db: D,
        operations: I,
    ) -> Result<WorkloadResultsSnapshot, RunnerError> {
        let config = &self.config;
        config.validate()?;

        tracing::info!("Initializing db adapter...");
        db.init(&config.db_properties)?;
        let db = Arc::new(db);

        let reporter = self.error_reporter.clone().unwrap_or_else(|| {
            Arc::new(ConcurrentErrorReporter::new(config.max_reported_errors))
        });
        let replayed = self.replay(name, &db, operations.into_iter(), &reporter).await;

        tracing::info!("Cleaning up db adapter...");
        let cleanup = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || db.cleanup()).await
        };
        let cleanup_failure = match cleanup {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("cleanup failed: {e}")),
            Err(e) => Some(format!("cleanup task failed: {e}")),
        };

        let snapshot = match replayed {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // the setup error is the one worth returning
                if let Some(message) = cleanup_failure {
                    tracing::error!("{message}");
                }
                return Err(e);
            }
        };
        if let Some(message) = cleanup_failure {
            reporter.fatal("db", message);
        }

        if reporter.is_aborted() {
            tracing::error!(
                "Workload {name} aborted after {} operations",
                snapshot.operation_count
            );
            return Err(RunnerError::Aborted {
                errors: reporter.to_string(),
                partial: Box::new(snapshot),
            });
        }
        let warnings = reporter.count(Severity::Warning);
        if warnings > 0 {
            tracing::warn!("{warnings} warnings reported during the run:\n{reporter}");
        }
        tracing::info!("Done running workload: {name}!");
        Ok(snapshot)
    }
}

impl WorkloadRunner {
    /// Everything between adapter init and cleanup. Returns the final snapshot once
    /// both services are shut down.
    async fn replay<D, O>(
        &self,
        name: &str,
        db: &Arc<D>,
        operations: O,
        reporter: &Arc<ConcurrentErrorReporter>,
    ) -> Result<WorkloadResultsSnapshot, RunnerError>
    where
        D: Db,
        O: Iterator<Item = Operation> + Send + 'static,
    {
        let config = &self.config;
        let writers = config.thread_count + 1;
        let completion_time = match &self.completion_time {
            Some(service) => service.clone(),
            None => completion::new_service(
                config.completion_time_mode,
                writers,
                &config.peer_ids,
                reporter.clone(),
            )?,
        };
        let metrics = match MetricsService::start(
            MetricsOptions::builder()
                .discipline(config.metrics_queue)
                .capacity(config.metrics_queue_capacity)
                .time_unit(config.time_unit)
                .highest_expected_runtime(config.highest_expected_runtime)
                .build(),
            reporter.clone(),
        ) {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                if let Err(e) = completion_time.shutdown() {
                    tracing::debug!("completion time service shutdown: {e}");
                }
                return Err(e.into());
            }
        };

        let start_ms = self.time_source.now_ms() + millis(config.start_delay);
        tracing::info!("Initializing completion time below {start_ms}...");
        let initialized =
            initialize_completion_time(completion_time.as_ref(), config, writers, start_ms).await;
        if let Err(e) = initialized {
            if let Err(e) = shut_down(&completion_time, &metrics).await {
                tracing::debug!("services shutdown after failed setup: {e}");
            }
            return Err(e);
        }

        let ctx = Arc::new(ExecutionContext {
            completion_time: completion_time.clone(),
            metrics: metrics.clone(),
            reporter: reporter.clone(),
            spinner: Spinner::new(
                self.time_source.clone(),
                config.spinner_sleep_duration,
                config.tolerated_execution_delay,
                config.ignore_scheduled_start_times,
                reporter.clone(),
            ),
            check: Box::new(GctDependencyCheck::new(completion_time.clone())),
            time_source: self.time_source.clone(),
            frontier: DispatchFrontier::new(start_ms),
            dispatcher: WriterId(config.thread_count),
            initiated: AtomicU64::new(0),
            poll_interval: config.spinner_sleep_duration,
            abort_on_excessive_delay: config.abort_on_excessive_delay,
            completed: AtomicU64::new(0),
            running: AtomicUsize::new(0),
        });

        tracing::info!("Spawning {} workers...", config.thread_count);
        let (tx, rx) = crossbeam_channel::bounded(0);
        let workers = worker::spawn_workers(&ctx, db, &rx, config.thread_count, start_ms);
        drop(rx);

        tracing::info!("Running workload: {name}");
        let dispatcher = {
            let ctx = ctx.clone();
            let stream =
                operations.time_offset_and_compress(start_ms, config.time_compression_ratio);
            let delta = millis(config.compressed_gct_delta_duration);
            tokio::task::spawn_blocking(move || worker::dispatch(stream, tx, &ctx, delta))
        };
        let work = async move { (dispatcher.await, join_all(workers).await) };
        let (dispatched, executed) = match config.status_interval {
            Some(every) => with_progress(work, every, &ctx).await,
            None => work.await,
        };

        match dispatched {
            Ok(summary) => tracing::info!("Dispatched {} operations", summary.dispatched),
            Err(e) => reporter.fatal("dispatcher", format!("dispatcher task failed: {e}")),
        }
        for result in executed {
            if let Err(e) = result {
                reporter.fatal("runner", format!("worker task failed: {e}"));
            }
        }

        tracing::info!("Shutting down completion time and metrics services...");
        shut_down(&completion_time, &metrics).await
    }
}

/// Completion time first, then metrics, whose final snapshot is returned.
async fn shut_down(
    completion_time: &Arc<dyn CompletionTimeService>,
    metrics: &Arc<MetricsService>,
) -> Result<WorkloadResultsSnapshot, RunnerError> {
    let completion_time = completion_time.clone();
    let metrics = metrics.clone();
    tokio::task::spawn_blocking(move || -> Result<_, RunnerError> {
        completion_time.shutdown()?;
        Ok(metrics.shutdown()?)
    })
    .await
    .map_err(|e| RunnerError::Join(e.to_string()))?
}

/// Pins every writer and peer to `start_ms - 1`, then waits until global completion
/// time shows exactly that value.
async fn initialize_completion_time(
    completion_time: &dyn CompletionTimeService,
    config: &DriverConfig,
    writers: usize,
    start_ms: i64,
) -> Result<(), RunnerError> {
    let below_start = start_ms - 1;
    let reached = completion_time.global_completion_time_future(below_start);
    for writer in (0..writers).map(WriterId) {
        completion_time.submit_initiated_time(writer, below_start)?;
        completion_time.submit_completed_time(writer, below_start)?;
    }
    for peer in &config.peer_ids {
        completion_time.submit_external_completion_time(peer, below_start)?;
    }

    match tokio::time::timeout(config.gct_init_timeout, reached).await {
        Err(_) => Err(RunnerError::Initialization(format!(
            "global completion time did not reach {below_start} within {:?}",
            config.gct_init_timeout
        ))),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(gct)) if gct != below_start => Err(RunnerError::Initialization(format!(
            "expected global completion time {below_start}, found {gct}"
        ))),
        Ok(Ok(_)) => Ok(()),
    }
}

async fn with_progress<T>(
    work: impl Future<Output = T>,
    every: Duration,
    ctx: &ExecutionContext,
) -> T {
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(every);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => tracing::info!(
                completed = ctx.completed(),
                running = ctx.running(),
                gct = ?ctx.completion_time.global_completion_time(),
                "workload progress"
            ),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicI64, Ordering},
        thread,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        completion::{CompletionTimeMode, DirectCompletionTimeService},
        error::{CompletionTimeError, DbError},
        metric::FAILURE_RESULT_CODE,
        scenario::Scenario,
    };

    fn config(threads: usize) -> DriverConfig {
        DriverConfig::builder()
            .thread_count(threads)
            .tolerated_execution_delay(Duration::from_millis(100))
            .start_delay(Duration::from_millis(20))
            .build()
    }

    /// Records execution order and peak concurrency, sleeps `sleep` per operation
    /// except for type 4, which returns at once.
    #[derive(Default)]
    struct RecordingDb {
        sleep: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        log: Mutex<Vec<(u32, &'static str)>>,
        properties: BTreeMap<String, String>,
        cleaned_up: Arc<AtomicUsize>,
    }

    impl RecordingDb {
        fn sleeping(sleep: Duration) -> Self {
            Self {
                sleep,
                ..Default::default()
            }
        }
    }

    impl Db for RecordingDb {
        fn init(&mut self, properties: &BTreeMap<String, String>) -> Result<(), DbError> {
            self.properties = properties.clone();
            Ok(())
        }

        fn execute(&self, operation: &Operation) -> Result<i32, DbError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().push((operation.op_type, "start"));
            if operation.op_type != 4 {
                thread::sleep(self.sleep);
            }
            self.log.lock().push((operation.op_type, "end"));
            self.running.fetch_sub(1, Ordering::SeqCst);
            match operation.op_type {
                90 => Err(DbError::with_code(7, "constraint violated")),
                91 => Err(DbError::new("connection reset")),
                92 => panic!("adapter bug"),
                _ => Ok(0),
            }
        }

        fn cleanup(&self) -> Result<(), DbError> {
            self.cleaned_up.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replays_scheduled_operations() {
        let cleaned_up = Arc::new(AtomicUsize::new(0));
        let db = RecordingDb {
            cleaned_up: cleaned_up.clone(),
            ..RecordingDb::sleeping(Duration::from_millis(1))
        };
        let operations = vec![Operation::at(1, 0), Operation::at(2, 10), Operation::at(1, 20)];
        let reporter = Arc::new(ConcurrentErrorReporter::new(10));

        let snapshot = Scenario::builder()
            .name("three operations")
            .db(db)
            .operations(operations)
            .executor(
                WorkloadRunner::builder()
                    .config(config(2))
                    .error_reporter(reporter.clone())
                    .build(),
            )
            .build()
            .run()
            .await
            .unwrap();

        assert!(!reporter.has_errors(), "{reporter}");
        assert_eq!(snapshot.operation_count, 3);
        assert!(snapshot.operations.iter().all(|o| o.failure_count() == 0));
        assert_eq!(snapshot.for_type(1).map(|o| o.count), Some(2));
        assert!(snapshot.start_time_ms <= snapshot.latest_finish_time_ms);
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_runs_more_than_thread_count_operations() {
        let runner = WorkloadRunner::builder()
            .config(DriverConfig {
                ignore_scheduled_start_times: true,
                ..config(3)
            })
            .build();
        let db = Arc::new(RecordingDb::sleeping(Duration::from_millis(5)));
        let operations: Vec<_> = (0..30).map(|i| Operation::at(1, i)).collect();

        let snapshot = runner
            .exec("admission", SharedDb(db.clone()), operations)
            .await
            .unwrap();

        assert_eq!(snapshot.operation_count, 30);
        let peak = db.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependent_operation_waits_for_its_dependency() {
        for mode in [CompletionTimeMode::Direct, CompletionTimeMode::Queued] {
            let runner = WorkloadRunner::builder()
                .config(DriverConfig {
                    ignore_scheduled_start_times: true,
                    completion_time_mode: mode,
                    ..config(2)
                })
                .build();
            let db = Arc::new(RecordingDb::sleeping(Duration::from_millis(30)));
            // B (type 2) depends on A (type 1) and is free to start right away otherwise
            let operations = vec![Operation::at(1, 10), Operation::at(2, 20).depends_on(10)];

            runner
                .exec("dependency", SharedDb(db.clone()), operations)
                .await
                .unwrap();

            let log = db.log.lock().clone();
            assert_eq!(
                log,
                vec![(1, "start"), (1, "end"), (2, "start"), (2, "end")],
                "{mode:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependency_on_the_first_operation_is_honoured() {
        for mode in [CompletionTimeMode::Direct, CompletionTimeMode::Queued] {
            let runner = WorkloadRunner::builder()
                .config(DriverConfig {
                    ignore_scheduled_start_times: true,
                    completion_time_mode: mode,
                    ..config(2)
                })
                .build();
            let db = Arc::new(RecordingDb::sleeping(Duration::from_millis(30)));
            // the dependency maps onto the workload start itself
            let operations = vec![Operation::at(1, 0), Operation::at(2, 5).depends_on(0)];

            runner
                .exec("first dependency", SharedDb(db.clone()), operations)
                .await
                .unwrap();

            let log = db.log.lock().clone();
            assert_eq!(
                log,
                vec![(1, "start"), (1, "end"), (2, "start"), (2, "end")],
                "{mode:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependent_waits_for_every_operation_at_the_dependency_time() {
        for mode in [CompletionTimeMode::Direct, CompletionTimeMode::Queued] {
            let runner = WorkloadRunner::builder()
                .config(DriverConfig {
                    ignore_scheduled_start_times: true,
                    completion_time_mode: mode,
                    ..config(2)
                })
                .build();
            let db = Arc::new(RecordingDb::sleeping(Duration::from_millis(30)));
            // type 4 finishes at once and its worker picks up the dependent
            let operations = vec![
                Operation::at(4, 10),
                Operation::at(1, 10),
                Operation::at(2, 20).depends_on(10),
            ];

            runner
                .exec("equal timestamps", SharedDb(db.clone()), operations)
                .await
                .unwrap();

            let log = db.log.lock().clone();
            let position = |entry: (u32, &str)| log.iter().position(|e| *e == entry).unwrap();
            assert!(position((2, "start")) > position((1, "end")), "{mode:?}: {log:?}");
        }
    }

    #[tokio::test]
    async fn adapter_is_cleaned_up_when_setup_fails() {
        let completion_time = Arc::new(DirectCompletionTimeService::new(3, &[]));
        completion_time.shutdown().unwrap();
        let runner = WorkloadRunner::builder()
            .config(config(2))
            .completion_time(completion_time)
            .build();
        let cleaned_up = Arc::new(AtomicUsize::new(0));
        let db = RecordingDb {
            cleaned_up: cleaned_up.clone(),
            ..Default::default()
        };

        let result = runner.exec("setup failure", db, vec![Operation::at(1, 0)]).await;

        assert!(matches!(
            result,
            Err(RunnerError::CompletionTime(CompletionTimeError::ShutDown))
        ));
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_operations_are_recorded_and_the_run_continues() {
        let runner = WorkloadRunner::builder()
            .config(DriverConfig {
                ignore_scheduled_start_times: true,
                ..config(2)
            })
            .build();
        let operations = vec![
            Operation::at(90, 0),
            Operation::at(91, 1),
            Operation::at(92, 2),
            Operation::at(1, 3),
        ];

        let snapshot = runner
            .exec("failures", RecordingDb::default(), operations)
            .await
            .unwrap();

        assert_eq!(snapshot.operation_count, 4);
        let codes = |op_type| snapshot.for_type(op_type).unwrap().result_codes.clone();
        assert_eq!(codes(90), BTreeMap::from([(7, 1)]));
        assert_eq!(codes(91), BTreeMap::from([(FAILURE_RESULT_CODE, 1)]));
        assert_eq!(codes(92), BTreeMap::from([(FAILURE_RESULT_CODE, 1)]));
        assert_eq!(codes(1), BTreeMap::from([(0, 1)]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn out_of_order_stream_aborts_with_partial_results() {
        let runner = WorkloadRunner::builder()
            .config(DriverConfig {
                ignore_scheduled_start_times: true,
                ..config(1)
            })
            .build();
        let mut late = Operation::at(1, 10);
        late.time_stamp_ms = 5;
        let operations = vec![Operation::at(1, 0), Operation::at(1, 10), late];

        match runner.exec("out of order", RecordingDb::default(), operations).await {
            Err(RunnerError::Aborted { errors, partial }) => {
                assert!(errors.contains("out of order"), "{errors}");
                // the second operation may be cut short by the abort
                assert!(partial.operation_count <= 2);
            }
            other => panic!("expected an aborted run, got {other:?}"),
        }
    }

    /// Every read is a second after the previous one, so every operation starts late.
    struct SteppingClock(AtomicI64);

    impl TimeSource for SteppingClock {
        fn now_ms(&self) -> i64 {
            self.0.fetch_add(1_000, Ordering::SeqCst)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_start_is_a_warning_unless_configured_fatal() {
        for abort_on_excessive_delay in [false, true] {
            let reporter = Arc::new(ConcurrentErrorReporter::new(10));
            let runner = WorkloadRunner::builder()
                .config(DriverConfig {
                    abort_on_excessive_delay,
                    ..config(1)
                })
                .time_source(Arc::new(SteppingClock(AtomicI64::new(0))))
                .error_reporter(reporter.clone())
                .build();
            let result = runner
                .exec("late", RecordingDb::default(), vec![Operation::at(1, 0)])
                .await;

            if abort_on_excessive_delay {
                match result {
                    Err(RunnerError::Aborted { errors, partial }) => {
                        assert!(errors.contains("late"), "{errors}");
                        assert_eq!(partial.operation_count, 1);
                    }
                    other => panic!("expected an aborted run, got {other:?}"),
                }
            } else {
                assert_eq!(result.unwrap().operation_count, 1);
                assert!(reporter.errors().iter().any(|e| {
                    e.severity == Severity::Warning && e.message.contains("late")
                }));
            }
        }
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_before_running() {
        let runner = WorkloadRunner::builder().config(config(0)).build();
        let result = runner
            .exec("invalid", RecordingDb::default(), Vec::<Operation>::new())
            .await;
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }

    /// Lets a test keep a handle on the adapter the runner owns.
    struct SharedDb(Arc<RecordingDb>);

    impl Db for SharedDb {
        fn execute(&self, operation: &Operation) -> Result<i32, DbError> {
            self.0.execute(operation)
        }
    }
}
