use std::fmt::Debug;

use pacer_macros::metric;
use serde::{Serialize, de::DeserializeOwned};

use crate::operation::Operation;

/// A single observed measurement produced by a worker.
///
/// Metrics are the most granular level of data the driver collects. They are later
/// folded into an [`crate::Aggregate`] and exposed as an immutable snapshot.
///
/// Metrics cross thread boundaries through the metrics queue, so they must be
/// `Send`, `Sync` and `Clone`. The `#[metric]` attribute derives everything needed.
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// Result code recorded when the adapter fails without providing its own code.
pub const FAILURE_RESULT_CODE: i32 = -1;

/// Outcome of executing one [`Operation`].
#[metric]
#[derive(Copy)]
pub struct OperationResult {
    pub operation_type: u32,
    pub scheduled_start_time_ms: i64,
    pub actual_start_time_ms: i64,
    pub run_duration_ns: u64,
    /// `0` is success, anything else is adapter defined.
    pub result_code: i32,
    /// Logical timestamp of the operation.
    pub time_stamp_ms: i64,
}

impl OperationResult {
    pub fn for_operation(
        operation: &Operation,
        actual_start_time_ms: i64,
        run_duration_ns: u64,
        result_code: i32,
    ) -> Self {
        Self {
            operation_type: operation.op_type,
            scheduled_start_time_ms: operation.scheduled_start_time_ms,
            actual_start_time_ms,
            run_duration_ns,
            result_code,
            time_stamp_ms: operation.time_stamp_ms,
        }
    }

    /// Wall clock time (ms) the operation finished at.
    pub fn finish_time_ms(&self) -> i64 {
        self.actual_start_time_ms + (self.run_duration_ns / 1_000_000) as i64
    }

    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    /// How late the operation started relative to its schedule, never negative.
    pub fn start_delay_ms(&self) -> i64 {
        (self.actual_start_time_ms - self.scheduled_start_time_ms).max(0)
    }
}
