use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;

use crate::aggregate::WorkloadResultsSnapshot;

/// A presentation of the final metrics of a run.
pub trait Report
where
    Self: Send + Sync + Debug + Serialize + for<'a> From<&'a WorkloadResultsSnapshot>,
{
}

#[async_trait]
pub trait Reporter<R: Report> {
    async fn report(&self, report: R) -> Result<(), Box<dyn std::error::Error>>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::io::Write;

    use parking_lot::Mutex;

    use super::*;
    use crate::{aggregate::OperationMetricsSnapshot, time::TimeUnit};

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct OperationReport {
        pub op_type: u32,
        pub count: u64,
        pub failures: u64,
        pub min: u64,
        pub mean: f64,
        pub p50: u64,
        pub p90: u64,
        pub p95: u64,
        pub p99: u64,
        pub max: u64,
        pub max_start_delay_ms: i64,
    }

    impl From<&OperationMetricsSnapshot> for OperationReport {
        fn from(value: &OperationMetricsSnapshot) -> Self {
            Self {
                op_type: value.op_type,
                count: value.count,
                failures: value.failure_count(),
                min: value.min,
                mean: value.mean,
                p50: value.p50,
                p90: value.p90,
                p95: value.p95,
                p99: value.p99,
                max: value.max,
                max_start_delay_ms: value.max_start_delay_ms,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct WorkloadReport {
        pub operation_count: u64,
        pub start_time_ms: Option<i64>,
        pub latest_finish_time_ms: Option<i64>,
        pub total_run_duration_ms: Option<i64>,
        /// Operations per second.
        pub throughput: Option<f64>,
        pub time_unit: TimeUnit,
        pub operations: Vec<OperationReport>,
    }

    impl From<&WorkloadResultsSnapshot> for WorkloadReport {
        fn from(value: &WorkloadResultsSnapshot) -> Self {
            Self {
                operation_count: value.operation_count,
                start_time_ms: value.start_time_ms,
                latest_finish_time_ms: value.latest_finish_time_ms,
                total_run_duration_ms: value.total_run_duration_ms(),
                throughput: value.throughput(),
                time_unit: value.time_unit,
                operations: value.operations.iter().map(OperationReport::from).collect(),
            }
        }
    }

    impl Report for WorkloadReport {}

    impl WorkloadReport {
        /// Plain text table, one row per operation type.
        pub fn to_table(&self) -> String {
            let unit = self.time_unit.suffix();
            let mut out = format!(
                "operations: {}  duration: {}  throughput: {}\n",
                self.operation_count,
                self.total_run_duration_ms
                    .map_or_else(|| "-".to_string(), |d| format!("{d}ms")),
                self.throughput
                    .map_or_else(|| "-".to_string(), |t| format!("{t:.2} op/s")),
            );
            out.push_str(&format!(
                "{:>6} {:>9} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>12}\n",
                "type", "count", "failed", "mean", "p50", "p95", "p99", "max", "max delay"
            ));
            for op in &self.operations {
                out.push_str(&format!(
                    "{:>6} {:>9} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>12}\n",
                    op.op_type,
                    op.count,
                    op.failures,
                    format!("{:.1}{unit}", op.mean),
                    format!("{}{unit}", op.p50),
                    format!("{}{unit}", op.p95),
                    format!("{}{unit}", op.p99),
                    format!("{}{unit}", op.max),
                    format!("{}ms", op.max_start_delay_ms),
                ));
            }
            out
        }
    }

    pub struct StdoutReporter;

    #[async_trait]
    impl Reporter<WorkloadReport> for StdoutReporter {
        async fn report(&self, report: WorkloadReport) -> Result<(), Box<dyn std::error::Error>> {
            print!("{}", report.to_table());
            Ok(())
        }
    }

    /// Writes the report as pretty printed JSON.
    pub struct JsonReporter<W> {
        writer: Mutex<W>,
    }

    impl<W: Write + Send> JsonReporter<W> {
        pub fn new(writer: W) -> Self {
            Self {
                writer: Mutex::new(writer),
            }
        }

        pub fn into_inner(self) -> W {
            self.writer.into_inner()
        }
    }

    #[async_trait]
    impl<W: Write + Send> Reporter<WorkloadReport> for JsonReporter<W> {
        async fn report(&self, report: WorkloadReport) -> Result<(), Box<dyn std::error::Error>> {
            let mut writer = self.writer.lock();
            serde_json::to_writer_pretty(&mut *writer, &report)?;
            writeln!(writer)?;
            writer.flush()?;
            Ok(())
        }
    }

}
