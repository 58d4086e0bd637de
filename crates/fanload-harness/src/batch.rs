//! Batch construction and the atomic batch write.

use fanload_engine::WorkerConnection;
use fanload_error::WriteError;
use tracing::{debug, info, warn};

use crate::schema;
use crate::sequence::SequenceGenerator;

/// Suffix appended to a key's decimal form to produce its value.
pub const VALUE_SUFFIX: &str = "foo";

/// Keys between progress log events.
pub const DEFAULT_PROGRESS_INTERVAL: i64 = 10_000;

/// The value stored alongside `key`; a pure function of the key.
#[must_use]
pub fn derive_value(key: i64) -> String {
    format!("{key}{VALUE_SUFFIX}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub key: i64,
    pub value: String,
}

/// Rows built entirely client-side before anything is staged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    rows: Vec<BatchRow>,
}

impl Batch {
    /// Draw `size` fresh keys and pair each with its derived value.
    #[must_use]
    pub fn draw(sequence: &SequenceGenerator, size: usize) -> Self {
        let rows = (0..size)
            .map(|_| {
                let key = sequence.next();
                BatchRow {
                    key,
                    value: derive_value(key),
                }
            })
            .collect();
        Self { rows }
    }

    #[must_use]
    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Writes one batch per call through a worker connection, committing it
/// as a single transaction.
#[derive(Debug)]
pub struct BatchWriter<'a> {
    sequence: &'a SequenceGenerator,
    insert_sql: String,
    progress_interval: i64,
}

impl<'a> BatchWriter<'a> {
    #[must_use]
    pub fn new(sequence: &'a SequenceGenerator, table: &str) -> Self {
        Self {
            sequence,
            insert_sql: schema::insert_sql(table),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Log progress every `every` keys; `0` disables progress events.
    #[must_use]
    pub fn with_progress_interval(mut self, every: i64) -> Self {
        self.progress_interval = every;
        self
    }

    #[must_use]
    pub fn sequence(&self) -> &'a SequenceGenerator {
        self.sequence
    }

    #[must_use]
    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    /// Draw a batch, emitting a progress event for every key that lands on
    /// the progress interval.
    #[must_use]
    pub fn draw(&self, size: usize) -> Batch {
        let batch = Batch::draw(self.sequence, size);
        if self.progress_interval > 0 {
            for row in batch.rows() {
                if row.key % self.progress_interval == 0 {
                    info!(key = row.key, "keys issued");
                }
            }
        }
        batch
    }

    /// Stage `size` fresh rows on `conn` and commit them atomically.
    ///
    /// On any failure the transaction is rolled back and the error returned;
    /// keys drawn for the batch stay consumed. Rows become visible to other
    /// connections only once this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Any [`WriteError`] from staging, submission or commit.
    pub fn write_batch(&self, conn: &WorkerConnection<'_>, size: usize) -> Result<u64, WriteError> {
        let result = self.stage_and_commit(conn, size);
        if let Err(err) = &result {
            debug!(error = %err, size, "batch abandoned");
            if let Err(rollback) = conn.rollback() {
                warn!(error = %rollback, "rollback of abandoned batch failed");
            }
        }
        result
    }

    fn stage_and_commit(&self, conn: &WorkerConnection<'_>, size: usize) -> Result<u64, WriteError> {
        conn.set_auto_commit(false)?;
        let batch = self.draw(size);

        let mut stmt = conn.prepare(&self.insert_sql)?;
        for row in batch.rows() {
            stmt.bind_param(1, row.key)?;
            stmt.bind_param(2, row.value.clone())?;
            stmt.add_to_batch()?;
        }
        let written = stmt.execute_batch()?;
        drop(stmt);

        conn.commit()?;
        Ok(u64::try_from(written).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use fanload_engine::{EngineConfig, RootConnection};
    use tempfile::TempDir;

    use super::*;
    use crate::schema::create_table_sql;

    fn root_with_table(dir: &TempDir) -> RootConnection {
        let root = RootConnection::open(dir.path().join("batch.db"), EngineConfig::default())
            .unwrap();
        root.execute_batch(&create_table_sql("tab1")).unwrap();
        root
    }

    fn count(root: &RootConnection) -> i64 {
        root.query_row("SELECT COUNT(*) FROM tab1", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn derived_value_appends_suffix() {
        assert_eq!(derive_value(42), "42foo");
    }

    #[test]
    fn drawn_batch_pairs_consecutive_keys_with_values() {
        let sequence = SequenceGenerator::new();
        let batch = Batch::draw(&sequence, 3);
        let keys: Vec<i64> = batch.rows().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert!(batch.rows().iter().all(|r| r.value == derive_value(r.key)));
        assert!(Batch::draw(&sequence, 0).is_empty());
    }

    #[test]
    fn write_batch_commits_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir);
        let sequence = SequenceGenerator::new();
        let writer = BatchWriter::new(&sequence, "tab1").with_progress_interval(0);

        let conn = root.duplicate().unwrap();
        assert_eq!(writer.write_batch(&conn, 25).unwrap(), 25);
        assert!(!conn.in_transaction(), "case=transaction_closed_after_commit");
        conn.close().unwrap();

        assert_eq!(count(&root), 25);
        let value: String = root
            .query_row("SELECT col2 FROM tab1 WHERE col1 = 7", |row| row.get(0))
            .unwrap();
        assert_eq!(value, "7foo");
    }

    #[test]
    fn failed_submission_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir);
        root.execute_batch("CREATE UNIQUE INDEX tab1_col1 ON tab1 (col1)")
            .unwrap();
        // Key 50 is taken, so row 49 of the batch violates the index.
        root.execute("INSERT INTO tab1 VALUES (50, 'taken')").unwrap();
        let before = count(&root);

        let sequence = SequenceGenerator::new();
        let writer = BatchWriter::new(&sequence, "tab1");
        let conn = root.duplicate().unwrap();
        let err = writer.write_batch(&conn, 100).unwrap_err();
        assert!(
            matches!(err, WriteError::Submit { row: 49, .. }),
            "case=submit_error err={err}"
        );
        assert!(!conn.in_transaction(), "case=rolled_back");

        assert_eq!(count(&root), before, "case=atomic_absence_root");
        let seen_by_worker: i64 = conn
            .query_row("SELECT COUNT(*) FROM tab1", |row| row.get(0))
            .unwrap();
        assert_eq!(seen_by_worker, before, "case=atomic_absence_worker");
        assert_eq!(sequence.issued(), 100, "case=keys_stay_consumed");
    }

    #[test]
    fn missing_table_fails_at_prepare_after_drawing() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_with_table(&dir);
        let sequence = SequenceGenerator::new();
        let writer = BatchWriter::new(&sequence, "no_such_table");

        let conn = root.duplicate().unwrap();
        let err = writer.write_batch(&conn, 10).unwrap_err();
        assert!(matches!(err, WriteError::Prepare { .. }), "err={err}");
        assert_eq!(sequence.issued(), 10);
        assert_eq!(count(&root), 0);
    }
}
