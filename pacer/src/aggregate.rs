use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::{
    error::MetricsCollectionError,
    metric::{Metric, OperationResult},
    time::TimeUnit,
};

/// Folds raw [`Metric`]s into a compact representation.
///
/// Aggregates keep what is needed to derive final statistics later (counts,
/// bounds, histograms) but do not derive those statistics themselves; that happens
/// when a snapshot is taken.
///
/// `consume` runs on the metrics consumer thread for every result, keep it cheap.
pub trait Aggregate
where
    Self: Send + Debug,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Aggregate multiple metrics into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);
}

/// Three significant figures keeps percentile error under 0.1%.
const SIGNIFICANT_FIGURES: u8 = 3;

/// Latency statistics for a single operation type.
///
/// Durations are recorded in the configured reporting unit. The histogram is bounded
/// by the highest expected runtime; slower samples are clamped to that bound while
/// `min`/`max` stay exact.
#[derive(Debug, Clone)]
pub struct OperationTypeAggregate {
    op_type: u32,
    unit: TimeUnit,
    histogram: Histogram<u64>,
    count: u64,
    total: u128,
    min: Option<u64>,
    max: u64,
    max_start_delay_ms: i64,
    result_codes: BTreeMap<i32, u64>,
}

impl OperationTypeAggregate {
    fn with_histogram(op_type: u32, unit: TimeUnit, histogram: Histogram<u64>) -> Self {
        Self {
            op_type,
            unit,
            histogram,
            count: 0,
            total: 0,
            min: None,
            max: 0,
            max_start_delay_ms: 0,
            result_codes: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> OperationMetricsSnapshot {
        let mean = if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        };
        OperationMetricsSnapshot {
            op_type: self.op_type,
            count: self.count,
            min: self.min.unwrap_or(0),
            max: self.max,
            mean,
            p50: self.histogram.value_at_quantile(0.50),
            p90: self.histogram.value_at_quantile(0.90),
            p95: self.histogram.value_at_quantile(0.95),
            p99: self.histogram.value_at_quantile(0.99),
            max_start_delay_ms: self.max_start_delay_ms,
            result_codes: self.result_codes.clone(),
        }
    }
}

impl Aggregate for OperationTypeAggregate {
    type Metric = OperationResult;

    fn consume(&mut self, metric: &Self::Metric) {
        let value = self.unit.from_nanos(metric.run_duration_ns);
        // lowest trackable value is 1
        self.histogram.saturating_record(value.max(1));
        self.count += 1;
        self.total += u128::from(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = self.max.max(value);
        self.max_start_delay_ms = self.max_start_delay_ms.max(metric.start_delay_ms());
        *self.result_codes.entry(metric.result_code).or_default() += 1;
    }
}

/// Everything the metrics service knows about a run.
///
/// Owned by the metrics consumer thread. Run start is the earliest actual start
/// observed and run finish is the latest `actual start + duration`; both are order
/// independent so results may arrive in any order.
#[derive(Debug, Clone)]
pub struct WorkloadAggregate {
    unit: TimeUnit,
    template: Histogram<u64>,
    start_time_ms: Option<i64>,
    latest_finish_time_ms: Option<i64>,
    operation_count: u64,
    by_type: BTreeMap<u32, OperationTypeAggregate>,
}

impl WorkloadAggregate {
    pub fn new(
        unit: TimeUnit,
        highest_expected: Duration,
    ) -> Result<Self, MetricsCollectionError> {
        let high = unit.from_duration(highest_expected).max(2);
        let template = Histogram::new_with_bounds(1, high, SIGNIFICANT_FIGURES)
            .map_err(|e| MetricsCollectionError::Histogram(format!("{e:?}")))?;
        Ok(Self {
            unit,
            template,
            start_time_ms: None,
            latest_finish_time_ms: None,
            operation_count: 0,
            by_type: BTreeMap::new(),
        })
    }

    pub fn snapshot(&self) -> WorkloadResultsSnapshot {
        WorkloadResultsSnapshot {
            start_time_ms: self.start_time_ms,
            latest_finish_time_ms: self.latest_finish_time_ms,
            operation_count: self.operation_count,
            time_unit: self.unit,
            operations: self.by_type.values().map(|a| a.snapshot()).collect(),
        }
    }
}

impl Aggregate for WorkloadAggregate {
    type Metric = OperationResult;

    fn consume(&mut self, metric: &Self::Metric) {
        let start = metric.actual_start_time_ms;
        let finish = metric.finish_time_ms();
        self.start_time_ms = Some(self.start_time_ms.map_or(start, |s| s.min(start)));
        self.latest_finish_time_ms =
            Some(self.latest_finish_time_ms.map_or(finish, |f| f.max(finish)));
        self.operation_count += 1;

        let (unit, template) = (self.unit, &self.template);
        self.by_type
            .entry(metric.operation_type)
            .or_insert_with(|| {
                OperationTypeAggregate::with_histogram(
                    metric.operation_type,
                    unit,
                    Histogram::new_from(template),
                )
            })
            .consume(metric);
    }
}

/// Point-in-time statistics of one operation type, in the snapshot's time unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetricsSnapshot {
    pub op_type: u32,
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub max_start_delay_ms: i64,
    pub result_codes: BTreeMap<i32, u64>,
}

impl OperationMetricsSnapshot {
    pub fn failure_count(&self) -> u64 {
        self.result_codes
            .iter()
            .filter(|(code, _)| **code != 0)
            .map(|(_, n)| n)
            .sum()
    }
}

/// Immutable copy of the metrics gathered so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadResultsSnapshot {
    /// Earliest actual start time observed, `None` before any result arrived.
    pub start_time_ms: Option<i64>,
    /// Latest finish time observed, `None` before any result arrived.
    pub latest_finish_time_ms: Option<i64>,
    pub operation_count: u64,
    pub time_unit: TimeUnit,
    /// Per operation type, ordered by type.
    pub operations: Vec<OperationMetricsSnapshot>,
}

impl WorkloadResultsSnapshot {
    pub fn empty(time_unit: TimeUnit) -> Self {
        Self {
            start_time_ms: None,
            latest_finish_time_ms: None,
            operation_count: 0,
            time_unit,
            operations: Vec::new(),
        }
    }

    pub fn total_run_duration_ms(&self) -> Option<i64> {
        Some(self.latest_finish_time_ms? - self.start_time_ms?)
    }

    /// Operations per second over the whole run.
    pub fn throughput(&self) -> Option<f64> {
        let duration = self.total_run_duration_ms()?;
        if duration <= 0 {
            return None;
        }
        Some(self.operation_count as f64 * 1_000.0 / duration as f64)
    }

    pub fn for_type(&self, op_type: u32) -> Option<&OperationMetricsSnapshot> {
        self.operations.iter().find(|o| o.op_type == op_type)
    }
}
