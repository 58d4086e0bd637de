//! Prepared statements with client-side batch staging.

use fanload_error::WriteError;
use rusqlite::types::Value;
use rusqlite::{CachedStatement, params_from_iter};

use crate::session::Session;

/// A prepared statement bound to one connection.
///
/// Rows are staged entirely client-side: `bind_param` fills the current
/// row, `add_to_batch` moves it onto the staged list, and nothing reaches
/// the engine until [`PreparedStatement::execute_batch`].
pub struct PreparedStatement<'c> {
    session: &'c Session,
    stmt: CachedStatement<'c>,
    sql: String,
    current: Vec<Option<Value>>,
    staged: Vec<Vec<Value>>,
}

impl<'c> PreparedStatement<'c> {
    pub(crate) fn new(session: &'c Session, stmt: CachedStatement<'c>, sql: &str) -> Self {
        let count = stmt.parameter_count();
        Self {
            session,
            stmt,
            sql: sql.to_owned(),
            current: vec![None; count],
            staged: Vec::new(),
        }
    }

    /// The SQL text this statement was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of `?` parameters the statement takes.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.current.len()
    }

    /// Bind the 1-based parameter `index` of the row being built.
    ///
    /// # Errors
    ///
    /// [`WriteError::ParamOutOfRange`] if the statement has no such parameter.
    pub fn bind_param(&mut self, index: usize, value: impl Into<Value>) -> Result<(), WriteError> {
        let count = self.current.len();
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.current.get_mut(i))
            .ok_or(WriteError::ParamOutOfRange { index, count })?;
        *slot = Some(value.into());
        Ok(())
    }

    /// Stage the current row and clear the bindings for the next one.
    ///
    /// # Errors
    ///
    /// [`WriteError::MissingParam`] if any parameter of the row is unbound;
    /// the partially bound row is kept so the caller can finish it.
    pub fn add_to_batch(&mut self) -> Result<(), WriteError> {
        if let Some(missing) = self.current.iter().position(Option::is_none) {
            return Err(WriteError::MissingParam {
                row: self.staged.len(),
                index: missing + 1,
            });
        }
        let row = self.current.iter_mut().filter_map(Option::take).collect();
        self.staged.push(row);
        Ok(())
    }

    /// Rows staged and not yet submitted.
    #[must_use]
    pub fn staged_rows(&self) -> usize {
        self.staged.len()
    }

    /// Submit every staged row to the engine as one batched write request.
    ///
    /// With autocommit disabled the rows land in the connection's open
    /// transaction and stay invisible to other connections until commit.
    /// The staged list is emptied whether or not submission succeeds.
    ///
    /// # Errors
    ///
    /// [`WriteError::Begin`] if the transaction could not be opened, or
    /// [`WriteError::Submit`] naming the first row the engine rejected.
    pub fn execute_batch(&mut self) -> Result<usize, WriteError> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(0);
        }
        self.session.begin_if_needed()?;

        let mut written = 0_usize;
        for (row, values) in staged.iter().enumerate() {
            written += self
                .stmt
                .execute(params_from_iter(values.iter()))
                .map_err(|source| WriteError::Submit { row, source })?;
        }
        Ok(written)
    }
}
