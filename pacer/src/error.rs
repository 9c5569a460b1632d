use thiserror::Error;

use crate::{aggregate::WorkloadResultsSnapshot, completion::WriterId};

/// Misuse of a completion time service.
///
/// Every variant except `ShutDown` means operations were handed to workers out of
/// order, which is a dispatch bug and not something a run can recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionTimeError {
    #[error("completion time service is shut down")]
    ShutDown,
    #[error(
        "{writer} initiated time {initiated} which is before its last completed time {completed}"
    )]
    InitiatedBeforeCompleted {
        writer: WriterId,
        initiated: i64,
        completed: i64,
    },
    #[error("{writer} initiated time {initiated} while {pending} is still pending")]
    AlreadyInitiated {
        writer: WriterId,
        pending: i64,
        initiated: i64,
    },
    #[error("{writer} completed time {completed} without initiating it")]
    CompletedWithoutInitiated { writer: WriterId, completed: i64 },
    #[error("{writer} completed time {completed} but {pending} is pending")]
    CompletedMismatch {
        writer: WriterId,
        pending: i64,
        completed: i64,
    },
    #[error("unknown writer {0}")]
    UnknownWriter(WriterId),
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
    #[error("peer {peer:?} submitted {submitted} which is before its previous time {previous}")]
    ExternalTimeRegressed {
        peer: String,
        previous: i64,
        submitted: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsCollectionError {
    #[error("metrics service is shut down")]
    ShutDown,
    #[error("metrics queue is full, result dropped")]
    QueueFull,
    #[error("run aborted while waiting for metrics queue space")]
    Aborted,
    #[error("metrics consumer thread is gone")]
    ConsumerGone,
    #[error("could not build latency histogram: {0}")]
    Histogram(String),
    #[error("could not start metrics consumer: {0}")]
    Spawn(String),
}

/// Failure raised by a [`crate::Db`] adapter.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DbError {
    /// Result code recorded for the operation, `None` falls back to the generic failure code.
    pub code: Option<i32>,
    pub message: String,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("db adapter failed: {0}")]
    Db(#[from] DbError),
    #[error(transparent)]
    CompletionTime(#[from] CompletionTimeError),
    #[error(transparent)]
    Metrics(#[from] MetricsCollectionError),
    #[error("could not initialize global completion time: {0}")]
    Initialization(String),
    #[error("background task failed: {0}")]
    Join(String),
    #[error("could not spawn driver thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The run was torn down after a fatal error. Metrics gathered up to that
    /// point are kept for diagnostics.
    #[error("workload aborted:\n{errors}")]
    Aborted {
        errors: String,
        partial: Box<WorkloadResultsSnapshot>,
    },
}
