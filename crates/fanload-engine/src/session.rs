//! Per-connection session: one engine handle plus its transaction state.

use std::cell::Cell;
use std::path::Path;

use fanload_error::{ConnectionError, QueryError, WriteError};
use rusqlite::{Connection, OpenFlags, Row};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::statement::PreparedStatement;

/// Transaction and handle state owned by exactly one connection.
///
/// Sessions are `Send` but not `Sync`: a worker session is only ever used by
/// the thread that duplicated it, and the root keeps its session behind a
/// mutex.
pub(crate) struct Session {
    conn: Connection,
    auto_commit: Cell<bool>,
    in_transaction: Cell<bool>,
}

impl Session {
    /// Open a fresh engine handle on `path` and apply per-connection settings.
    pub(crate) fn open(path: &Path, config: &EngineConfig) -> Result<Self, ConnectionError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|source| {
            ConnectionError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        conn.busy_timeout(config.busy_timeout)
            .map_err(|source| ConnectionError::Configure {
                pragma: format!("PRAGMA busy_timeout={};", config.busy_timeout.as_millis()),
                source,
            })?;
        conn.pragma_update(None, "synchronous", &config.synchronous)
            .map_err(|source| ConnectionError::Configure {
                pragma: format!("PRAGMA synchronous={};", config.synchronous),
                source,
            })?;
        if let Some(threads) = config.threads {
            // Reports back the effective limit, which the engine may clamp.
            let effective: i64 = conn
                .pragma_update_and_check(None, "threads", i64::from(threads), |row| row.get(0))
                .map_err(|source| ConnectionError::Configure {
                    pragma: format!("PRAGMA threads={threads};"),
                    source,
                })?;
            debug!(requested = threads, effective, "engine worker threads set");
        }

        Ok(Self {
            conn,
            auto_commit: Cell::new(true),
            in_transaction: Cell::new(false),
        })
    }

    /// Switch the database journal mode. Persistent, so only the root does it.
    pub(crate) fn set_journal_mode(&self, mode: &str) -> Result<String, ConnectionError> {
        self.conn
            .pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))
            .map_err(|source| ConnectionError::Configure {
                pragma: format!("PRAGMA journal_mode={mode};"),
                source,
            })
    }

    pub(crate) fn auto_commit(&self) -> bool {
        self.auto_commit.get()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    /// Turning autocommit back on commits any open transaction first.
    pub(crate) fn set_auto_commit(&self, enabled: bool) -> Result<(), WriteError> {
        if enabled && self.in_transaction.get() {
            self.commit()?;
        }
        self.auto_commit.set(enabled);
        Ok(())
    }

    /// Open the explicit transaction lazily, on the first write after
    /// autocommit was disabled.
    ///
    /// `BEGIN IMMEDIATE` takes the engine write lock up front (waiting up to
    /// the busy timeout), so a transaction never has to upgrade a stale read
    /// snapshot mid-flight.
    pub(crate) fn begin_if_needed(&self) -> Result<(), WriteError> {
        if self.auto_commit.get() || self.in_transaction.get() {
            return Ok(());
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|source| WriteError::Begin { source })?;
        self.in_transaction.set(true);
        Ok(())
    }

    pub(crate) fn execute(&self, sql: &str) -> Result<usize, WriteError> {
        self.begin_if_needed()?;
        self.conn
            .execute(sql, [])
            .map_err(|source| WriteError::Execute {
                sql: sql.to_owned(),
                source,
            })
    }

    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), WriteError> {
        self.begin_if_needed()?;
        self.conn
            .execute_batch(sql)
            .map_err(|source| WriteError::Execute {
                sql: sql.to_owned(),
                source,
            })
    }

    pub(crate) fn query_row<T, F>(&self, sql: &str, f: F) -> Result<T, QueryError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.conn
            .query_row(sql, [], f)
            .map_err(|source| QueryError {
                sql: sql.to_owned(),
                source,
            })
    }

    pub(crate) fn prepare(&self, sql: &str) -> Result<PreparedStatement<'_>, WriteError> {
        let stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|source| WriteError::Prepare {
                sql: sql.to_owned(),
                source,
            })?;
        Ok(PreparedStatement::new(self, stmt, sql))
    }

    /// Commit the open transaction, if any.
    ///
    /// A failed `COMMIT` is followed by a rollback so the engine never keeps
    /// a half-finished transaction on this handle.
    pub(crate) fn commit(&self) -> Result<(), WriteError> {
        if !self.in_transaction.get() {
            return Ok(());
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.in_transaction.set(false);
                Ok(())
            }
            Err(source) => {
                if let Err(rollback) = self.rollback() {
                    warn!(error = %rollback, "rollback after failed commit also failed");
                }
                self.in_transaction.set(false);
                Err(WriteError::Commit { source })
            }
        }
    }

    pub(crate) fn rollback(&self) -> Result<(), WriteError> {
        if !self.in_transaction.replace(false) {
            return Ok(());
        }
        // The engine may already have rolled back on its own (e.g. I/O error).
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|source| WriteError::Rollback { source })
    }

    /// Close the engine handle, rolling back anything still open.
    pub(crate) fn close(self) -> Result<(), ConnectionError> {
        if let Err(err) = self.rollback() {
            warn!(error = %err, "rollback on close failed");
        }
        self.conn
            .close()
            .map_err(|(_, source)| ConnectionError::Close { source })
    }
}
