use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to open, configure, duplicate or close a connection.
///
/// Fatal to the task that requested the connection; never retried.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The engine refused to open the database file.
    #[error("failed to open database '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A per-connection setting could not be applied.
    #[error("failed to apply `{pragma}`: {source}")]
    Configure {
        pragma: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The root connection no longer hands out duplicates.
    #[error("root connection is closed to duplication")]
    RootClosed,

    /// Opening another connection would exceed the engine limit.
    #[error("connection limit reached: {limit} connections already open")]
    LimitExceeded { limit: usize },

    /// An engine option was not recognised or carried an unusable value.
    #[error("invalid engine option {key}={value}: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: &'static str,
    },

    /// Closing the underlying handle failed.
    #[error("failed to close connection: {source}")]
    Close {
        #[source]
        source: rusqlite::Error,
    },
}

/// Failure while staging, submitting or committing writes.
///
/// The transaction is left uncommitted; the engine guarantees none of its
/// rows become visible.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to prepare `{sql}`: {source}")]
    Prepare {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    /// `bind_param` was called with an index the statement does not have.
    #[error("parameter ?{index} out of range (statement takes {count})")]
    ParamOutOfRange { index: usize, count: usize },

    /// `add_to_batch` was called before every parameter was bound.
    #[error("staged row {row} is missing parameter ?{index}")]
    MissingParam { row: usize, index: usize },

    #[error("failed to begin transaction: {source}")]
    Begin {
        #[source]
        source: rusqlite::Error,
    },

    /// A staged row was rejected by the engine during batch submission.
    #[error("batch row {row} rejected: {source}")]
    Submit {
        row: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("statement failed `{sql}`: {source}")]
    Execute {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("commit failed: {source}")]
    Commit {
        #[source]
        source: rusqlite::Error,
    },

    #[error("rollback failed: {source}")]
    Rollback {
        #[source]
        source: rusqlite::Error,
    },
}

/// Failure of an aggregate read query.
#[derive(Error, Debug)]
#[error("query failed `{sql}`: {source}")]
pub struct QueryError {
    pub sql: String,
    #[source]
    pub source: rusqlite::Error,
}

/// Terminal error of a single scheduled task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    /// The task body panicked; the payload message is preserved.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was never picked up because the worker pool went away.
    #[error("task never ran: worker pool exited before claiming it")]
    Abandoned,
}

/// A failed task together with its index.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: usize,
    pub error: TaskError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}: {}", self.task, self.error)
    }
}

/// Run-level errors surfaced by the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Setup statements (schema creation) failed.
    #[error("setup: {0}")]
    Write(#[from] WriteError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// At least one task failed; every other task still ran to completion.
    #[error("{} of {total} tasks failed ({rows_visible} rows visible)", .failures.len())]
    TasksFailed {
        failures: Vec<TaskFailure>,
        total: usize,
        rows_visible: u64,
    },

    /// The final aggregate disagrees with what the tasks reported.
    #[error(
        "verification mismatch: expected {expected} rows, found {found} ({distinct} distinct keys, min={min:?}, max={max:?})"
    )]
    VerificationMismatch {
        expected: u64,
        found: u64,
        distinct: u64,
        min: Option<i64>,
        max: Option<i64>,
    },
}

/// Result alias for run-level operations.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

impl HarnessError {
    /// Indices of failed tasks, in ascending order. Empty for other variants.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<usize> {
        match self {
            Self::TasksFailed { failures, .. } => {
                let mut tasks: Vec<usize> = failures.iter().map(|f| f.task).collect();
                tasks.sort_unstable();
                tasks
            }
            _ => Vec::new(),
        }
    }
}
