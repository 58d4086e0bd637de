//! Root and duplicated worker connections.

use std::path::Path;

use fanload_error::{ConnectionError, QueryError, WriteError};
use parking_lot::Mutex;
use rusqlite::Row;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::{ConnectionSlot, EngineCore};
use crate::session::Session;
use crate::statement::PreparedStatement;

/// The single connection owning the database for a run.
///
/// Owns the engine core that every duplicate borrows, so no
/// [`WorkerConnection`] can outlive it. `RootConnection` is `Sync`:
/// [`RootConnection::duplicate`] may be called from many threads at once.
pub struct RootConnection {
    core: EngineCore,
    session: Mutex<Session>,
}

impl RootConnection {
    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Open`] or [`ConnectionError::Configure`] if the
    /// engine refuses the file or one of the settings.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, ConnectionError> {
        let path = path.as_ref();
        let session = Session::open(path, &config)?;
        let journal_mode = session.set_journal_mode(&config.journal_mode)?;
        info!(
            path = %path.display(),
            journal_mode = %journal_mode,
            threads = ?config.threads,
            max_connections = config.max_connections,
            "root connection opened"
        );
        debug!(pragmas = ?config.to_pragmas(), "engine settings");
        Ok(Self {
            core: EngineCore::new(path.to_path_buf(), config),
            session: Mutex::new(session),
        })
    }

    /// Produce an independent connection sharing this root's engine.
    ///
    /// The duplicate has its own transaction state; it sees committed data
    /// from every other connection and nothing uncommitted.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::RootClosed`] once the root is sealed,
    /// [`ConnectionError::LimitExceeded`] when the connection limit is
    /// reached, or an open/configure failure from the engine.
    pub fn duplicate(&self) -> Result<WorkerConnection<'_>, ConnectionError> {
        let slot = self.core.acquire_slot()?;
        let session = Session::open(self.core.path(), self.core.config())?;
        debug!(
            open_connections = self.core.open_connections(),
            "root connection duplicated"
        );
        Ok(WorkerConnection { session, slot })
    }

    /// Stop handing out duplicates. Existing workers are unaffected.
    ///
    /// Returns `true` if this call sealed the root.
    pub fn seal(&self) -> bool {
        let sealed = self.core.seal();
        if sealed {
            info!(
                open_connections = self.core.open_connections(),
                "root connection sealed against duplication"
            );
        }
        sealed
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.core.is_sealed()
    }

    /// Connections currently open against this engine, root included.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.core.open_connections()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.core.path()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.core.config()
    }

    /// Run a single statement in autocommit mode.
    ///
    /// # Errors
    ///
    /// [`WriteError::Execute`] if the engine rejects the statement.
    pub fn execute(&self, sql: &str) -> Result<usize, WriteError> {
        self.session.lock().execute(sql)
    }

    /// Run several `;`-separated statements, typically schema setup.
    ///
    /// # Errors
    ///
    /// [`WriteError::Execute`] on the first statement the engine rejects.
    pub fn execute_batch(&self, sql: &str) -> Result<(), WriteError> {
        self.session.lock().execute_batch(sql)
    }

    /// Run a query expected to produce one row and map it with `f`.
    ///
    /// # Errors
    ///
    /// [`QueryError`] if the query fails or returns no row.
    pub fn query_row<T, F>(&self, sql: &str, f: F) -> Result<T, QueryError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.session.lock().query_row(sql, f)
    }

    /// Close the root and release the database.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Close`] if the engine fails to release the handle.
    pub fn close(self) -> Result<(), ConnectionError> {
        let Self { core, session } = self;
        session.into_inner().close()?;
        info!(path = %core.path().display(), "root connection closed");
        Ok(())
    }
}

/// A connection duplicated from a [`RootConnection`].
///
/// Owns its transaction state exclusively; borrows the root's engine core.
/// Dropping it (or calling [`WorkerConnection::close`]) rolls back anything
/// uncommitted and frees its connection slot.
pub struct WorkerConnection<'r> {
    // Field order matters: the handle closes before the slot is released.
    session: Session,
    slot: ConnectionSlot<'r>,
}

impl WorkerConnection<'_> {
    /// Path of the shared database.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.slot.core().path()
    }

    /// Run a single statement, inside the open transaction when autocommit
    /// is disabled.
    ///
    /// # Errors
    ///
    /// [`WriteError::Begin`] or [`WriteError::Execute`].
    pub fn execute(&self, sql: &str) -> Result<usize, WriteError> {
        self.session.execute(sql)
    }

    /// Run a one-row query; sees this connection's own uncommitted writes.
    ///
    /// # Errors
    ///
    /// [`QueryError`] if the query fails or returns no row.
    pub fn query_row<T, F>(&self, sql: &str, f: F) -> Result<T, QueryError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.session.query_row(sql, f)
    }

    /// Prepare a statement for client-side batch staging.
    ///
    /// # Errors
    ///
    /// [`WriteError::Prepare`] if the engine rejects the SQL.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement<'_>, WriteError> {
        self.session.prepare(sql)
    }

    /// Enable or disable implicit per-statement commit.
    ///
    /// Re-enabling it commits an open transaction.
    ///
    /// # Errors
    ///
    /// [`WriteError::Commit`] if that implicit commit fails.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<(), WriteError> {
        self.session.set_auto_commit(enabled)
    }

    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.session.auto_commit()
    }

    /// Whether an explicit transaction is currently open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    /// Commit the open transaction. A no-op when none is open.
    ///
    /// # Errors
    ///
    /// [`WriteError::Commit`]; the transaction has been rolled back.
    pub fn commit(&self) -> Result<(), WriteError> {
        self.session.commit()
    }

    /// Discard the open transaction. A no-op when none is open.
    ///
    /// # Errors
    ///
    /// [`WriteError::Rollback`] if the engine refuses.
    pub fn rollback(&self) -> Result<(), WriteError> {
        self.session.rollback()
    }

    /// Close this connection, rolling back anything uncommitted.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Close`] if the engine fails to release the handle.
    pub fn close(self) -> Result<(), ConnectionError> {
        let Self { session, slot } = self;
        let result = session.close();
        drop(slot);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    const COUNT_SQL: &str = "SELECT COUNT(*) FROM t";

    fn open_root(dir: &TempDir, config: EngineConfig) -> RootConnection {
        let root = RootConnection::open(dir.path().join("engine.db"), config).unwrap();
        root.execute_batch("CREATE TABLE t (k BIGINT, v VARCHAR)")
            .unwrap();
        root
    }

    fn count(root: &RootConnection) -> i64 {
        root.query_row(COUNT_SQL, |row| row.get(0)).unwrap()
    }

    #[test]
    fn duplicate_shares_schema_and_committed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        root.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();

        let worker = root.duplicate().unwrap();
        assert_eq!(root.open_connections(), 2);
        let seen: i64 = worker.query_row(COUNT_SQL, |row| row.get(0)).unwrap();
        assert_eq!(seen, 1, "case=duplicate_sees_root_commit");

        worker.execute("INSERT INTO t VALUES (2, '2foo')").unwrap();
        assert_eq!(count(&root), 2, "case=autocommit_write_visible_to_root");

        worker.close().unwrap();
        assert_eq!(root.open_connections(), 1, "case=slot_released_on_close");
        root.close().unwrap();
    }

    #[test]
    fn duplicate_fails_once_limit_reached() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            max_connections: 2,
            ..EngineConfig::default()
        };
        let root = open_root(&dir, config);

        let first = root.duplicate().unwrap();
        let err = root.duplicate().err().unwrap();
        assert!(
            matches!(err, ConnectionError::LimitExceeded { limit: 2 }),
            "case=limit_exceeded err={err}"
        );

        drop(first);
        assert!(root.duplicate().is_ok(), "case=limit_frees_after_drop");
    }

    #[test]
    fn sealed_root_refuses_duplication_but_keeps_workers() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        let worker = root.duplicate().unwrap();

        assert!(root.seal());
        assert!(root.is_sealed());
        assert!(matches!(
            root.duplicate().err(),
            Some(ConnectionError::RootClosed)
        ));

        worker.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();
        assert_eq!(count(&root), 1, "case=existing_worker_still_writes");
    }

    #[test]
    fn uncommitted_rows_stay_private_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        let worker = root.duplicate().unwrap();

        worker.set_auto_commit(false).unwrap();
        worker.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();
        assert!(worker.in_transaction());

        let own: i64 = worker.query_row(COUNT_SQL, |row| row.get(0)).unwrap();
        assert_eq!(own, 1, "case=read_your_writes");
        assert_eq!(count(&root), 0, "case=invisible_before_commit");

        worker.commit().unwrap();
        assert!(!worker.in_transaction());
        assert_eq!(count(&root), 1, "case=visible_after_commit");
    }

    #[test]
    fn rollback_and_close_discard_uncommitted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());

        let worker = root.duplicate().unwrap();
        worker.set_auto_commit(false).unwrap();
        worker.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();
        worker.rollback().unwrap();
        assert_eq!(count(&root), 0, "case=rollback");

        worker.execute("INSERT INTO t VALUES (2, '2foo')").unwrap();
        worker.close().unwrap();
        assert_eq!(count(&root), 0, "case=close_rolls_back");
    }

    #[test]
    fn re_enabling_autocommit_commits_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        let worker = root.duplicate().unwrap();

        worker.set_auto_commit(false).unwrap();
        worker.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();
        worker.set_auto_commit(true).unwrap();

        assert!(worker.auto_commit());
        assert!(!worker.in_transaction());
        assert_eq!(count(&root), 1);
    }

    #[test]
    fn failed_commit_rolls_back_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        root.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (pid INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED);",
        )
        .unwrap();

        let worker = root.duplicate().unwrap();
        worker.execute("PRAGMA foreign_keys = ON").unwrap();
        worker.set_auto_commit(false).unwrap();
        worker.execute("INSERT INTO t VALUES (1, '1foo')").unwrap();
        // Deferred constraint: accepted now, rejected at COMMIT.
        worker.execute("INSERT INTO child VALUES (99)").unwrap();

        let err = worker.commit().unwrap_err();
        assert!(
            matches!(err, WriteError::Commit { .. }),
            "case=commit_error err={err}"
        );
        assert!(!worker.in_transaction(), "case=transaction_closed");

        let own: i64 = worker.query_row(COUNT_SQL, |row| row.get(0)).unwrap();
        assert_eq!(own, 0, "case=rows_gone_for_writer");
        assert_eq!(count(&root), 0, "case=rows_gone_for_root");
        let children: i64 = root
            .query_row("SELECT COUNT(*) FROM child", |row| row.get(0))
            .unwrap();
        assert_eq!(children, 0, "case=child_rows_gone");

        worker.execute("INSERT INTO t VALUES (2, '2foo')").unwrap();
        worker.commit().unwrap();
        assert_eq!(count(&root), 1, "case=connection_usable_after_failed_commit");
    }

    #[test]
    fn prepared_batch_requires_every_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_root(&dir, EngineConfig::default());
        let worker = root.duplicate().unwrap();
        let mut stmt = worker.prepare("INSERT INTO t VALUES (?, ?)").unwrap();
        assert_eq!(stmt.parameter_count(), 2);

        stmt.bind_param(1, 1_i64).unwrap();
        let err = stmt.add_to_batch().unwrap_err();
        assert!(
            matches!(err, WriteError::MissingParam { row: 0, index: 2 }),
            "case=missing_param err={err}"
        );

        assert!(matches!(
            stmt.bind_param(3, 0_i64),
            Err(WriteError::ParamOutOfRange { index: 3, count: 2 })
        ));
        assert!(matches!(
            stmt.bind_param(0, 0_i64),
            Err(WriteError::ParamOutOfRange { index: 0, count: 2 })
        ));

        stmt.bind_param(2, "1foo".to_owned()).unwrap();
        stmt.add_to_batch().unwrap();
        assert_eq!(stmt.staged_rows(), 1);
        assert_eq!(stmt.execute_batch().unwrap(), 1);
        assert_eq!(stmt.staged_rows(), 0);
        drop(stmt);
        assert_eq!(count(&root), 1, "case=autocommit_batch_visible");
    }

    #[test]
    fn configured_threads_are_applied_to_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::from_options([("threads", "2")]).unwrap();
        let root = open_root(&dir, config);
        let worker = root.duplicate().unwrap();
        let threads: i64 = worker.query_row("PRAGMA threads", |row| row.get(0)).unwrap();
        assert!(threads <= 2, "case=threads_applied threads={threads}");
        assert_eq!(worker.path(), root.path());
    }
}
