//! Run report assembled once every task has reached a terminal state.

use serde::Serialize;

use fanload_error::{HarnessError, TaskFailure};

use crate::scheduler::TaskOutcome;
use crate::verify::Verification;

/// JSON schema version for the run report printed with `--json`.
pub const REPORT_SCHEMA_V1: &str = "fanload.report.v1";

/// Everything a finished run knows about itself.
///
/// Serializes to a flat JSON object; task failures keep their typed errors
/// in memory for [`RunReport::into_result`] and appear in the JSON as
/// rendered messages.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub db_path: String,
    pub table: String,
    pub connection_threads: usize,
    /// Engine-internal thread count, when one was configured.
    pub engine_threads: Option<u32>,
    pub num_batches: usize,
    pub batch_size: usize,
    /// Keys drawn from the sequence, including those of failed batches.
    pub keys_issued: u64,
    /// Rows the successful tasks reported committing.
    pub rows_reported: u64,
    pub elapsed_ms: u64,
    pub deadline_exceeded: bool,
    pub verification: Verification,
    pub tasks: Vec<TaskReport>,
    #[serde(skip)]
    failures: Vec<TaskFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task: usize,
    pub status: TaskStatus,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run parameters echoed into the report.
#[derive(Debug, Clone)]
pub(crate) struct RunSummary {
    pub db_path: String,
    pub table: String,
    pub connection_threads: usize,
    pub engine_threads: Option<u32>,
    pub num_batches: usize,
    pub batch_size: usize,
    pub keys_issued: u64,
    pub elapsed_ms: u64,
    pub deadline_exceeded: bool,
}

impl RunReport {
    pub(crate) fn new(
        summary: RunSummary,
        outcomes: Vec<TaskOutcome>,
        verification: Verification,
    ) -> Self {
        let mut tasks = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        let mut rows_reported = 0_u64;
        for (task, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                TaskOutcome::Succeeded { rows } => {
                    rows_reported += rows;
                    tasks.push(TaskReport {
                        task,
                        status: TaskStatus::Succeeded,
                        rows,
                        error: None,
                    });
                }
                TaskOutcome::Failed(error) => {
                    tasks.push(TaskReport {
                        task,
                        status: TaskStatus::Failed,
                        rows: 0,
                        error: Some(error.to_string()),
                    });
                    failures.push(TaskFailure { task, error });
                }
            }
        }

        Self {
            schema_version: REPORT_SCHEMA_V1.to_owned(),
            db_path: summary.db_path,
            table: summary.table,
            connection_threads: summary.connection_threads,
            engine_threads: summary.engine_threads,
            num_batches: summary.num_batches,
            batch_size: summary.batch_size,
            keys_issued: summary.keys_issued,
            rows_reported,
            elapsed_ms: summary.elapsed_ms,
            deadline_exceeded: summary.deadline_exceeded,
            verification,
            tasks,
            failures,
        }
    }

    /// Every task succeeded and the table matched the expected total.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.verification.is_match()
    }

    /// Rows visible in the table after the run.
    #[must_use]
    pub fn rows_visible(&self) -> u64 {
        self.verification.count
    }

    /// Indices of failed tasks, ascending.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.task).collect()
    }

    /// Failures with their typed errors, ascending by task.
    #[must_use]
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    /// Collapse the report into the run-level verdict.
    ///
    /// Task failures take precedence over a verification mismatch, since a
    /// failed batch already explains a short count.
    ///
    /// # Errors
    ///
    /// [`HarnessError::TasksFailed`] if any task failed, otherwise
    /// [`HarnessError::VerificationMismatch`] if the aggregate disagrees.
    pub fn into_result(self) -> Result<Verification, HarnessError> {
        if !self.failures.is_empty() {
            return Err(HarnessError::TasksFailed {
                total: self.tasks.len(),
                rows_visible: self.verification.count,
                failures: self.failures,
            });
        }
        self.verification.check()
    }
}
