//! Run configuration, database bootstrap and the end-to-end run.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fanload_engine::{EngineConfig, RootConnection, WorkerConnection};
use fanload_error::{HarnessError, TaskError};
use tracing::{debug, info};

use crate::batch::{BatchWriter, DEFAULT_PROGRESS_INTERVAL};
use crate::report::{RunReport, RunSummary};
use crate::scheduler::{WorkScheduler, duration_to_u64_ms};
use crate::schema;
use crate::sequence::SequenceGenerator;
use crate::verify::verify;

/// Default database file, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "test.db";
pub const DEFAULT_TABLE: &str = "tab1";
pub const DEFAULT_CONNECTION_THREADS: usize = 2;
pub const DEFAULT_NUM_BATCHES: usize = 256;
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Engine-internal threads used when none are requested: half the cores.
#[must_use]
pub fn default_engine_threads() -> u32 {
    let cores = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    u32::try_from(cores / 2).unwrap_or(u32::MAX).max(1)
}

/// Settings for one load run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub db_path: PathBuf,
    pub table: String,
    /// Worker pool size; how many batches are in flight at once.
    pub connection_threads: usize,
    /// Number of tasks, one batch each.
    pub num_batches: usize,
    /// Rows per batch.
    pub batch_size: usize,
    pub engine: EngineConfig,
    /// Seal the root once this much time has passed.
    pub deadline: Option<Duration>,
    /// Keys between progress events; `0` disables them.
    pub progress_interval: i64,
    /// Delete any existing database (and WAL sidecars) before the run.
    pub fresh_database: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            table: DEFAULT_TABLE.to_owned(),
            connection_threads: DEFAULT_CONNECTION_THREADS,
            num_batches: DEFAULT_NUM_BATCHES,
            batch_size: DEFAULT_BATCH_SIZE,
            engine: EngineConfig {
                threads: Some(default_engine_threads()),
                ..EngineConfig::default()
            },
            deadline: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            fresh_database: true,
        }
    }
}

impl RunConfig {
    /// `num_batches * batch_size`, the row count a clean run ends with.
    #[must_use]
    pub fn expected_rows(&self) -> u64 {
        let batches = u64::try_from(self.num_batches).unwrap_or(u64::MAX);
        let size = u64::try_from(self.batch_size).unwrap_or(u64::MAX);
        batches.saturating_mul(size)
    }

    /// # Errors
    ///
    /// [`HarnessError::InvalidConfig`] naming the first unusable setting.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |msg: &str| Err(HarnessError::InvalidConfig(msg.to_owned()));
        if self.connection_threads == 0 {
            return invalid("connection threads must be positive");
        }
        if self.num_batches == 0 {
            return invalid("batch count must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive");
        }
        if self.table.is_empty() {
            return invalid("table name must not be empty");
        }
        // The root holds one connection; every pool thread holds one more.
        if self.connection_threads.saturating_add(1) > self.engine.max_connections {
            return Err(HarnessError::InvalidConfig(format!(
                "{} connection threads plus the root exceed max connections ({})",
                self.connection_threads, self.engine.max_connections
            )));
        }
        if self.progress_interval < 0 {
            return invalid("progress interval must not be negative");
        }
        if i64::try_from(self.expected_rows()).is_err() {
            return invalid("batch count times batch size overflows the key range");
        }
        Ok(())
    }
}

/// Remove the database at `path` together with its `-wal`/`-shm` files.
/// Files that do not exist are skipped.
///
/// # Errors
///
/// Any I/O error other than `NotFound`.
pub fn bootstrap_database(path: &Path) -> io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = OsString::from(path.as_os_str());
        target.push(suffix);
        let target = PathBuf::from(target);
        match std::fs::remove_file(&target) {
            Ok(()) => debug!(path = %target.display(), "removed stale database file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// State owned by one run: its configuration and its key sequence.
#[derive(Debug)]
pub struct RunContext {
    config: RunConfig,
    sequence: SequenceGenerator,
}

impl RunContext {
    /// # Errors
    ///
    /// [`HarnessError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: RunConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Self {
            config,
            sequence: SequenceGenerator::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every batch, verify the table and report.
    ///
    /// Task failures do not make this return `Err`; they are listed in the
    /// report. See [`RunReport::into_result`] for the run-level verdict.
    ///
    /// # Errors
    ///
    /// Bootstrap, root open, schema setup or verification query failures.
    pub fn run(self) -> Result<RunReport, HarnessError> {
        let batch_size = self.config.batch_size;
        self.run_with(move |_, conn, writer| {
            writer.write_batch(conn, batch_size).map_err(TaskError::from)
        })
    }

    /// Like [`RunContext::run`] with a custom task body.
    ///
    /// `body` receives the task index, the task's worker connection and the
    /// run's batch writer, and returns the rows it committed.
    ///
    /// # Errors
    ///
    /// See [`RunContext::run`].
    pub fn run_with<F>(self, body: F) -> Result<RunReport, HarnessError>
    where
        F: Fn(usize, &WorkerConnection<'_>, &BatchWriter<'_>) -> Result<u64, TaskError> + Sync,
    {
        let Self { config, sequence } = self;
        info!(
            db = %config.db_path.display(),
            table = %config.table,
            connection_threads = config.connection_threads,
            engine_threads = ?config.engine.threads,
            num_batches = config.num_batches,
            batch_size = config.batch_size,
            "run starting"
        );

        if config.fresh_database {
            bootstrap_database(&config.db_path)?;
        }
        let root = RootConnection::open(&config.db_path, config.engine.clone())?;
        root.execute_batch(&schema::create_table_sql(&config.table))?;

        let writer = BatchWriter::new(&sequence, &config.table)
            .with_progress_interval(config.progress_interval);
        let mut scheduler = WorkScheduler::new(config.connection_threads);
        if let Some(deadline) = config.deadline {
            scheduler = scheduler.with_deadline(deadline);
        }
        let outcome = scheduler.run(&root, config.num_batches, |task, conn| {
            body(task, conn, &writer)
        });

        let verification = verify(&root, &config.table, config.expected_rows())?;
        root.close()?;

        let summary = RunSummary {
            db_path: config.db_path.display().to_string(),
            table: config.table,
            connection_threads: config.connection_threads,
            engine_threads: config.engine.threads,
            num_batches: config.num_batches,
            batch_size: config.batch_size,
            keys_issued: u64::try_from(sequence.issued()).unwrap_or(0),
            elapsed_ms: duration_to_u64_ms(outcome.elapsed()),
            deadline_exceeded: outcome.deadline_exceeded(),
        };
        let report = RunReport::new(summary, outcome.into_outcomes(), verification);
        info!(
            rows_visible = report.rows_visible(),
            failed = report.failures().len(),
            "run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reproducer_settings() {
        let config = RunConfig::default();
        assert_eq!(config.connection_threads, 2);
        assert_eq!(config.num_batches, 256);
        assert_eq!(config.batch_size, 1024);
        assert_eq!(config.expected_rows(), 262_144);
        assert!(config.engine.threads.is_some_and(|t| t >= 1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let cases: Vec<(&str, RunConfig)> = vec![
            (
                "zero_threads",
                RunConfig {
                    connection_threads: 0,
                    ..RunConfig::default()
                },
            ),
            (
                "zero_batches",
                RunConfig {
                    num_batches: 0,
                    ..RunConfig::default()
                },
            ),
            (
                "zero_batch_size",
                RunConfig {
                    batch_size: 0,
                    ..RunConfig::default()
                },
            ),
            (
                "empty_table",
                RunConfig {
                    table: String::new(),
                    ..RunConfig::default()
                },
            ),
            (
                "pool_exceeds_connection_limit",
                RunConfig {
                    connection_threads: 80,
                    num_batches: 160,
                    batch_size: 10,
                    ..RunConfig::default()
                },
            ),
            (
                "pool_fills_connection_limit",
                RunConfig {
                    connection_threads: 64,
                    ..RunConfig::default()
                },
            ),
            (
                "no_worker_room",
                RunConfig {
                    engine: EngineConfig {
                        max_connections: 1,
                        ..EngineConfig::default()
                    },
                    ..RunConfig::default()
                },
            ),
        ];
        for (case, config) in cases {
            assert!(
                matches!(config.validate(), Err(HarnessError::InvalidConfig(_))),
                "case={case}"
            );
            assert!(RunContext::new(config).is_err(), "case={case}_context");
        }
    }

    #[test]
    fn pool_one_below_connection_limit_is_accepted() {
        let config = RunConfig {
            connection_threads: 63,
            ..RunConfig::default()
        };
        assert_eq!(config.engine.max_connections, 64);
        assert!(config.validate().is_ok(), "case=root_plus_63_workers");
    }

    #[test]
    fn bootstrap_removes_database_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        for name in ["test.db", "test.db-wal", "test.db-shm", "other.db"] {
            std::fs::write(dir.path().join(name), b"stale").unwrap();
        }

        bootstrap_database(&db).unwrap();

        assert!(!db.exists());
        assert!(!dir.path().join("test.db-wal").exists());
        assert!(!dir.path().join("test.db-shm").exists());
        assert!(dir.path().join("other.db").exists(), "case=unrelated_kept");
        bootstrap_database(&db).unwrap();
    }
}
