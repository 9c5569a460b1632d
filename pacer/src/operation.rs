use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// One unit of work replayed against the system under test.
///
/// Operations are produced by an operation stream, handed to exactly one worker and
/// dropped once their result has been recorded. `parameters` is opaque to the driver
/// and only interpreted by the [`crate::Db`] adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Operation {
    /// Dense, small identifier of the operation kind.
    pub op_type: u32,
    /// Absolute time (ms) the operation should start at.
    pub scheduled_start_time_ms: i64,
    /// Logical timestamp used to advance completion time.
    pub time_stamp_ms: i64,
    /// The operation may not start until global completion time reaches this value.
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_time_ms: Option<i64>,
    #[builder(default)]
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Operation {
    /// Operation whose logical timestamp equals its scheduled start time.
    pub fn at(op_type: u32, time_ms: i64) -> Self {
        Self::builder()
            .op_type(op_type)
            .scheduled_start_time_ms(time_ms)
            .time_stamp_ms(time_ms)
            .build()
    }

    pub fn depends_on(mut self, dependency_time_ms: i64) -> Self {
        self.dependency_time_ms = Some(dependency_time_ms);
        self
    }
}

/// Adapters over lazy operation streams.
///
/// Streams are plain iterators, ordered by scheduled start time. The workload runner
/// aborts on a stream whose logical timestamps go backwards.
pub trait OperationStreamExt: Iterator<Item = Operation> + Sized {
    /// Shifts the stream so its first operation is scheduled at `start_ms` and scales
    /// every gap by `ratio`.
    ///
    /// Scheduled times, logical timestamps and dependency times all go through the same
    /// mapping `t' = start + (t - first_scheduled) * ratio`, so ordering and dependency
    /// relations survive. A ratio below 1 compresses the workload.
    fn time_offset_and_compress(self, start_ms: i64, ratio: f64) -> TimeMapped<Self> {
        TimeMapped {
            inner: self,
            start_ms,
            ratio,
            first_ms: None,
        }
    }
}

impl<I: Iterator<Item = Operation>> OperationStreamExt for I {}

#[derive(Debug, Clone)]
pub struct TimeMapped<I> {
    inner: I,
    start_ms: i64,
    ratio: f64,
    first_ms: Option<i64>,
}

impl<I> TimeMapped<I> {
    fn remap(&self, first_ms: i64, t: i64) -> i64 {
        let offset = (t - first_ms) as f64 * self.ratio;
        self.start_ms + offset.round() as i64
    }
}

impl<I: Iterator<Item = Operation>> Iterator for TimeMapped<I> {
    type Item = Operation;

    fn next(&mut self) -> Option<Self::Item> {
        let mut operation = self.inner.next()?;
        let first = *self
            .first_ms
            .get_or_insert(operation.scheduled_start_time_ms);
        operation.scheduled_start_time_ms = self.remap(first, operation.scheduled_start_time_ms);
        operation.time_stamp_ms = self.remap(first, operation.time_stamp_ms);
        operation.dependency_time_ms = operation
            .dependency_time_ms
            .map(|d| self.remap(first, d));
        Some(operation)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
