//! Fixed-size worker pool that runs one duplicate-and-write cycle per task.
//!
//! # Dispatch
//!
//! `worker_threads` scoped threads claim task indices from a shared atomic
//! counter until it runs past the task count. Each claimed task duplicates
//! the root, runs the task body on that connection, closes the connection
//! and sends its outcome over a results channel. The dispatcher fills one
//! slot per task as results arrive, in whatever order they complete.
//!
//! # Failure policy
//!
//! Failures are collected, never propagated early: a failed or panicking
//! task does not cancel anything else, and the report lists every failure.
//! The optional deadline seals the root once it elapses, so tasks still
//! queued fail fast with `RootClosed` while running ones finish normally.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use fanload_engine::{RootConnection, WorkerConnection};
use fanload_error::{TaskError, TaskFailure};
use tracing::{debug, info, warn};

/// Terminal state of one task.
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded { rows: u64 },
    Failed(TaskError),
}

impl TaskOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Rows the task committed; zero for failed tasks.
    #[must_use]
    pub fn rows(&self) -> u64 {
        match self {
            Self::Succeeded { rows } => *rows,
            Self::Failed(_) => 0,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// Outcome of every dispatched task, indexed by task.
#[derive(Debug)]
pub struct SchedulerReport {
    outcomes: Vec<TaskOutcome>,
    elapsed: Duration,
    deadline_exceeded: bool,
}

impl SchedulerReport {
    #[must_use]
    pub fn outcomes(&self) -> &[TaskOutcome] {
        &self.outcomes
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.outcomes.iter().map(TaskOutcome::rows).sum()
    }

    /// Indices of failed tasks in ascending order.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_success())
            .map(|(task, _)| task)
            .collect()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether the deadline elapsed and the root was sealed.
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline_exceeded
    }

    #[must_use]
    pub fn into_outcomes(self) -> Vec<TaskOutcome> {
        self.outcomes
    }

    /// Every failure, ascending by task index.
    #[must_use]
    pub fn into_failures(self) -> Vec<TaskFailure> {
        self.outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(task, outcome)| match outcome {
                TaskOutcome::Succeeded { .. } => None,
                TaskOutcome::Failed(error) => Some(TaskFailure { task, error }),
            })
            .collect()
    }
}

/// A bounded pool dispatching independent tasks against one root.
#[derive(Debug, Clone)]
pub struct WorkScheduler {
    worker_threads: usize,
    deadline: Option<Duration>,
}

impl WorkScheduler {
    /// A pool of `worker_threads` threads (at least one).
    #[must_use]
    pub fn new(worker_threads: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            deadline: None,
        }
    }

    /// Seal the root once `deadline` has elapsed since dispatch began.
    ///
    /// The deadline only stops new tasks from obtaining a connection.
    /// `run` still waits for tasks already in flight, so a run can outlast
    /// the deadline by up to one task's duration, which includes waiting on
    /// the engine busy timeout for the write lock.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Run `tasks` tasks, each on a fresh duplicate of `root`, and block
    /// until every one of them has reached a terminal state.
    ///
    /// `body` receives the task index and the task's connection and returns
    /// the number of rows it committed.
    pub fn run<F>(&self, root: &RootConnection, tasks: usize, body: F) -> SchedulerReport
    where
        F: Fn(usize, &WorkerConnection<'_>) -> Result<u64, TaskError> + Sync,
    {
        let started = Instant::now();
        let deadline_at = self.deadline.map(|d| started + d);
        let pool_size = self.worker_threads.min(tasks.max(1));
        let next_task = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, TaskOutcome)>();
        let mut slots: Vec<Option<TaskOutcome>> =
            std::iter::repeat_with(|| None).take(tasks).collect();
        let mut deadline_exceeded = false;

        info!(tasks, worker_threads = pool_size, "dispatching tasks");

        thread::scope(|s| {
            for worker in 0..pool_size {
                let tx = tx.clone();
                let next_task = &next_task;
                let body = &body;
                let spawned = thread::Builder::new()
                    .name(format!("fanload-worker-{worker}"))
                    .spawn_scoped(s, move || {
                        loop {
                            let task = next_task.fetch_add(1, Ordering::Relaxed);
                            if task >= tasks {
                                break;
                            }
                            let outcome = run_task(root, task, body);
                            if tx.send((task, outcome)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!(worker, error = %err, "failed to spawn worker thread");
                }
            }
            drop(tx);

            let mut filled = 0_usize;
            while filled < tasks {
                let received = match deadline_at {
                    Some(at) if !deadline_exceeded => {
                        let Some(remaining) = at.checked_duration_since(Instant::now()) else {
                            deadline_exceeded = true;
                            root.seal();
                            warn!(
                                completed = filled,
                                tasks, "run deadline elapsed; queued tasks will fail"
                            );
                            continue;
                        };
                        match rx.recv_timeout(remaining) {
                            Ok(message) => Some(message),
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => None,
                        }
                    }
                    _ => rx.recv().ok(),
                };
                let Some((task, outcome)) = received else {
                    break;
                };
                if slots[task].replace(outcome).is_none() {
                    filled += 1;
                }
            }
        });

        let outcomes: Vec<TaskOutcome> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or(TaskOutcome::Failed(TaskError::Abandoned)))
            .collect();
        let report = SchedulerReport {
            outcomes,
            elapsed: started.elapsed(),
            deadline_exceeded,
        };
        info!(
            tasks,
            succeeded = report.succeeded(),
            failed = tasks - report.succeeded(),
            rows = report.rows_written(),
            elapsed_ms = duration_to_u64_ms(report.elapsed),
            "all tasks reached a terminal state"
        );
        report
    }
}

fn run_task<F>(root: &RootConnection, task: usize, body: &F) -> TaskOutcome
where
    F: Fn(usize, &WorkerConnection<'_>) -> Result<u64, TaskError> + Sync,
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| execute_task(root, task, body)));
    match result {
        Ok(Ok(rows)) => {
            debug!(task, rows, "task succeeded");
            TaskOutcome::Succeeded { rows }
        }
        Ok(Err(err)) => {
            warn!(task, error = %err, "task failed");
            TaskOutcome::Failed(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(task, panic = %message, "task panicked");
            TaskOutcome::Failed(TaskError::Panicked(message))
        }
    }
}

fn execute_task<F>(root: &RootConnection, task: usize, body: &F) -> Result<u64, TaskError>
where
    F: Fn(usize, &WorkerConnection<'_>) -> Result<u64, TaskError> + Sync,
{
    let conn = root.duplicate()?;
    let result = body(task, &conn);
    if let Err(err) = conn.close() {
        warn!(task, error = %err, "closing worker connection failed");
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

pub(crate) fn duration_to_u64_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use fanload_engine::EngineConfig;
    use fanload_error::{ConnectionError, WriteError};
    use tempfile::TempDir;

    use super::*;
    use crate::batch::BatchWriter;
    use crate::schema::create_table_sql;
    use crate::sequence::SequenceGenerator;

    fn root_with_table(dir: &TempDir, config: EngineConfig) -> RootConnection {
        let root = RootConnection::open(dir.path().join("sched.db"), config).unwrap();
        root.execute_batch(&create_table_sql("tab1")).unwrap();
        root
    }

    fn count(root: &RootConnection) -> i64 {
        root.query_row("SELECT COUNT(*) FROM tab1", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn every_task_runs_once_across_a_smaller_pool() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir, EngineConfig::default());
        let sequence = SequenceGenerator::new();
        let writer = BatchWriter::new(&sequence, "tab1");

        let report = WorkScheduler::new(3).run(&root, 10, |_, conn| {
            writer.write_batch(conn, 20).map_err(TaskError::from)
        });

        assert_eq!(report.total(), 10);
        assert_eq!(report.succeeded(), 10);
        assert_eq!(report.rows_written(), 200);
        assert!(report.failed_tasks().is_empty());
        assert!(!report.deadline_exceeded());
        assert_eq!(count(&root), 200);
        assert_eq!(root.open_connections(), 1, "case=all_workers_closed");
    }

    #[test]
    fn one_failing_task_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir, EngineConfig::default());
        let sequence = SequenceGenerator::new();
        let writer = BatchWriter::new(&sequence, "tab1");
        let broken = BatchWriter::new(&sequence, "missing_table");

        let report = WorkScheduler::new(4).run(&root, 16, |task, conn| {
            let writer = if task == 3 { &broken } else { &writer };
            writer.write_batch(conn, 100).map_err(TaskError::from)
        });

        assert_eq!(report.failed_tasks(), vec![3], "case=only_task_3_failed");
        assert_eq!(report.succeeded(), 15);
        assert_eq!(count(&root), 1_500);

        let failures = report.into_failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].error,
            TaskError::Write(WriteError::Prepare { .. })
        ));
    }

    #[test]
    fn panicking_task_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir, EngineConfig::default());

        let report = WorkScheduler::new(2).run(&root, 4, |task, _| {
            assert_ne!(task, 2, "boom in task {task}");
            Ok(0)
        });

        assert_eq!(report.failed_tasks(), vec![2]);
        match report.outcomes()[2].error() {
            Some(TaskError::Panicked(message)) => assert!(message.contains("boom in task 2")),
            other => panic!("expected panic capture, got {other:?}"),
        }
    }

    #[test]
    fn connection_limit_failures_are_reported_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            max_connections: 1,
            ..EngineConfig::default()
        };
        let root = root_with_table(&dir, config);

        let report = WorkScheduler::new(2).run(&root, 5, |_, _| Ok(1));

        assert_eq!(report.failed_tasks(), vec![0, 1, 2, 3, 4]);
        assert!(report.outcomes().iter().all(|o| matches!(
            o.error(),
            Some(TaskError::Connection(ConnectionError::LimitExceeded { limit: 1 }))
        )));
    }

    #[test]
    fn deadline_seals_root_and_fails_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir, EngineConfig::default());

        let report = WorkScheduler::new(1)
            .with_deadline(Duration::from_millis(10))
            .run(&root, 8, |_, _| {
                thread::sleep(Duration::from_millis(50));
                Ok(1)
            });

        assert!(report.deadline_exceeded());
        assert!(root.is_sealed());
        if report.outcomes()[0].is_success() {
            // The in-flight task was waited for, not cut off at the deadline.
            assert!(
                report.elapsed() >= Duration::from_millis(50),
                "case=in_flight_task_outlasts_deadline"
            );
        }
        assert_eq!(report.total(), 8);
        let failed = report.failed_tasks();
        assert!(!failed.is_empty(), "case=queued_tasks_failed");
        assert!(failed.contains(&7));
        for task in failed {
            assert!(
                matches!(
                    report.outcomes()[task].error(),
                    Some(TaskError::Connection(ConnectionError::RootClosed))
                ),
                "case=failure_is_root_closed task={task}"
            );
        }
    }

    #[test]
    fn zero_tasks_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir, EngineConfig::default());
        let report = WorkScheduler::new(4).run(&root, 0, |_, _| Ok(1));
        assert_eq!(report.total(), 0);
        assert_eq!(report.rows_written(), 0);
    }
}
