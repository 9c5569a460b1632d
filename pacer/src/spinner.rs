//! Gate that holds a worker until an operation may start.
//!
//! The spinner polls a [`SpinnerCheck`] with a fixed sleep between polls, then waits
//! for the operation's scheduled start time. Sleeping trades start latency for CPU:
//! a zero sleep yields instead and keeps one core busy per waiting worker.
use std::{sync::Arc, thread, time::Duration};

use crate::{
    completion::CompletionTimeService, error_reporter::ConcurrentErrorReporter,
    operation::Operation, time::TimeSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinnerCheckResult {
    StillChecking,
    Passed,
    ExcessiveDelay,
}

/// A condition evaluated on every spinner poll.
pub trait SpinnerCheck: Send + Sync {
    fn do_check(&self, operation: &Operation) -> SpinnerCheckResult;
}

/// Passes once global completion time has reached the operation's dependency time.
pub struct GctDependencyCheck {
    completion_time: Arc<dyn CompletionTimeService>,
}

impl GctDependencyCheck {
    pub fn new(completion_time: Arc<dyn CompletionTimeService>) -> Self {
        Self { completion_time }
    }
}

impl SpinnerCheck for GctDependencyCheck {
    fn do_check(&self, operation: &Operation) -> SpinnerCheckResult {
        let Some(dependency) = operation.dependency_time_ms else {
            return SpinnerCheckResult::Passed;
        };
        match self.completion_time.global_completion_time() {
            Some(gct) if gct >= dependency => SpinnerCheckResult::Passed,
            _ => SpinnerCheckResult::StillChecking,
        }
    }
}

/// Check that never holds anything back.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPass;

impl SpinnerCheck for AlwaysPass {
    fn do_check(&self, _: &Operation) -> SpinnerCheckResult {
        SpinnerCheckResult::Passed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinResult {
    Passed,
    /// The operation may run, but it starts later than the tolerated delay allows.
    ExcessiveDelay { late_by: Duration },
    /// A fatal error was reported elsewhere, the operation must not run.
    Aborted,
}

pub struct Spinner {
    time_source: Arc<dyn TimeSource>,
    sleep: Duration,
    tolerated_delay: Duration,
    ignore_scheduled_start_time: bool,
    reporter: Arc<ConcurrentErrorReporter>,
}

impl Spinner {
    pub fn new(
        time_source: Arc<dyn TimeSource>,
        sleep: Duration,
        tolerated_delay: Duration,
        ignore_scheduled_start_time: bool,
        reporter: Arc<ConcurrentErrorReporter>,
    ) -> Self {
        Self {
            time_source,
            sleep,
            tolerated_delay,
            ignore_scheduled_start_time,
            reporter,
        }
    }

    /// Blocks the calling thread until `check` passes and the scheduled start time
    /// has been reached, or until the run is aborted.
    pub fn spin(&self, operation: &Operation, check: &dyn SpinnerCheck) -> SpinResult {
        loop {
            if self.reporter.is_aborted() {
                return SpinResult::Aborted;
            }
            match check.do_check(operation) {
                SpinnerCheckResult::Passed => break,
                SpinnerCheckResult::StillChecking => self.pause(self.sleep),
                SpinnerCheckResult::ExcessiveDelay => {
                    return SpinResult::ExcessiveDelay {
                        late_by: self.lateness(operation),
                    };
                }
            }
        }

        if self.ignore_scheduled_start_time {
            return SpinResult::Passed;
        }

        loop {
            if self.reporter.is_aborted() {
                return SpinResult::Aborted;
            }
            let remaining = operation.scheduled_start_time_ms - self.time_source.now_ms();
            if remaining <= 0 {
                break;
            }
            let remaining = Duration::from_millis(remaining as u64);
            self.pause(if self.sleep.is_zero() {
                Duration::ZERO
            } else {
                self.sleep.min(remaining)
            });
        }

        let late_by = self.lateness(operation);
        if late_by > self.tolerated_delay {
            SpinResult::ExcessiveDelay { late_by }
        } else {
            SpinResult::Passed
        }
    }

    fn lateness(&self, operation: &Operation) -> Duration {
        let late = self.time_source.now_ms() - operation.scheduled_start_time_ms;
        Duration::from_millis(late.max(0) as u64)
    }

    fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        completion::{DirectCompletionTimeService, WriterId},
        time::{ManualTimeSource, SystemTimeSource},
    };

    fn spinner(
        time_source: Arc<dyn TimeSource>,
        ignore_schedule: bool,
        reporter: Arc<ConcurrentErrorReporter>,
    ) -> Spinner {
        Spinner::new(
            time_source,
            Duration::from_millis(1),
            Duration::from_millis(100),
            ignore_schedule,
            reporter,
        )
    }

    #[test]
    fn dependency_passes_once_gct_reaches_it() {
        let cts = Arc::new(DirectCompletionTimeService::new(1, &[]));
        let check = GctDependencyCheck::new(cts.clone());
        let operation = Operation::at(1, -1).depends_on(5);

        assert_eq!(check.do_check(&operation), SpinnerCheckResult::StillChecking);
        for (gct, expected) in [
            (0, SpinnerCheckResult::StillChecking),
            (4, SpinnerCheckResult::StillChecking),
            (5, SpinnerCheckResult::Passed),
            (6, SpinnerCheckResult::Passed),
            (10, SpinnerCheckResult::Passed),
        ] {
            cts.submit_initiated_time(WriterId(0), gct).unwrap();
            cts.submit_completed_time(WriterId(0), gct).unwrap();
            assert_eq!(check.do_check(&operation), expected, "gct = {gct}");
        }
    }

    #[test]
    fn operation_without_dependency_passes_immediately() {
        let cts = Arc::new(DirectCompletionTimeService::new(1, &[]));
        let check = GctDependencyCheck::new(cts);
        assert_eq!(
            check.do_check(&Operation::at(1, 100)),
            SpinnerCheckResult::Passed
        );
    }

    #[test]
    fn late_operation_reports_excessive_delay() {
        let clock = Arc::new(ManualTimeSource::new(1_000));
        let reporter = Arc::new(ConcurrentErrorReporter::default());
        let operation = Operation::at(1, 0);

        let strict = spinner(clock.clone(), false, reporter.clone());
        assert_eq!(
            strict.spin(&operation, &AlwaysPass),
            SpinResult::ExcessiveDelay {
                late_by: Duration::from_millis(1_000)
            }
        );

        clock.set(50);
        assert_eq!(strict.spin(&operation, &AlwaysPass), SpinResult::Passed);

        clock.set(1_000);
        let lenient = spinner(clock, true, reporter);
        assert_eq!(lenient.spin(&operation, &AlwaysPass), SpinResult::Passed);
    }

    #[test]
    fn waits_for_scheduled_start_time() {
        let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
        let reporter = Arc::new(ConcurrentErrorReporter::default());
        let scheduled = clock.now_ms() + 30;

        let result = spinner(clock.clone(), false, reporter)
            .spin(&Operation::at(1, scheduled), &AlwaysPass);

        assert_eq!(result, SpinResult::Passed);
        assert!(clock.now_ms() >= scheduled);
    }

    struct CountingCheck {
        polls: AtomicUsize,
        reporter: Arc<ConcurrentErrorReporter>,
    }

    impl SpinnerCheck for CountingCheck {
        fn do_check(&self, _: &Operation) -> SpinnerCheckResult {
            if self.polls.fetch_add(1, Ordering::SeqCst) == 3 {
                self.reporter.fatal("worker-1", "ordering violation");
            }
            SpinnerCheckResult::StillChecking
        }
    }

    #[test]
    fn abort_interrupts_a_pending_check() {
        let reporter = Arc::new(ConcurrentErrorReporter::default());
        let check = CountingCheck {
            polls: AtomicUsize::new(0),
            reporter: reporter.clone(),
        };
        let result = spinner(Arc::new(ManualTimeSource::new(0)), false, reporter)
            .spin(&Operation::at(1, 0), &check);

        assert_eq!(result, SpinResult::Aborted);
        assert_eq!(check.polls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn abort_interrupts_wait_for_schedule() {
        let reporter = Arc::new(ConcurrentErrorReporter::default());
        reporter.fatal("runner", "stop");
        let result = spinner(Arc::new(ManualTimeSource::new(0)), false, reporter)
            .spin(&Operation::at(1, 10_000), &AlwaysPass);
        assert_eq!(result, SpinResult::Aborted);
    }
}
