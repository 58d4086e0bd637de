//! Post-run aggregate check of the load table.

use fanload_engine::RootConnection;
use fanload_error::{HarnessError, QueryError};
use serde::Serialize;
use tracing::{info, warn};

use crate::schema;

/// Aggregate state of the load table compared against the expected total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub expected: u64,
    pub count: u64,
    pub distinct_keys: u64,
    pub min_key: Option<i64>,
    pub max_key: Option<i64>,
}

impl Verification {
    /// Every expected key is present exactly once and the keys form the
    /// dense range `1..=expected`.
    #[must_use]
    pub fn is_match(&self) -> bool {
        let dense = if self.expected == 0 {
            self.min_key.is_none() && self.max_key.is_none()
        } else {
            let max = self.max_key.and_then(|m| u64::try_from(m).ok());
            self.min_key == Some(1) && max == Some(self.expected)
        };
        self.count == self.expected && self.distinct_keys == self.expected && dense
    }

    /// Turn a mismatch into an error; never corrects anything.
    ///
    /// # Errors
    ///
    /// [`HarnessError::VerificationMismatch`] when [`Self::is_match`] is false.
    pub fn check(self) -> Result<Self, HarnessError> {
        if self.is_match() {
            Ok(self)
        } else {
            Err(HarnessError::VerificationMismatch {
                expected: self.expected,
                found: self.count,
                distinct: self.distinct_keys,
                min: self.min_key,
                max: self.max_key,
            })
        }
    }
}

/// Read the aggregate state of `table` through the root connection.
///
/// Read-only: running it twice without intervening writes returns the same
/// result.
///
/// # Errors
///
/// [`QueryError`] if the aggregate query fails.
pub fn verify(root: &RootConnection, table: &str, expected: u64) -> Result<Verification, QueryError> {
    let sql = schema::aggregate_sql(table);
    let (count, distinct, min_key, max_key): (i64, i64, Option<i64>, Option<i64>) =
        root.query_row(&sql, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;

    let verification = Verification {
        expected,
        count: u64::try_from(count).unwrap_or(0),
        distinct_keys: u64::try_from(distinct).unwrap_or(0),
        min_key,
        max_key,
    };
    if verification.is_match() {
        info!(
            table,
            count = verification.count,
            min = ?min_key,
            max = ?max_key,
            "verification passed"
        );
    } else {
        warn!(
            table,
            expected,
            count = verification.count,
            distinct = verification.distinct_keys,
            min = ?min_key,
            max = ?max_key,
            "verification mismatch"
        );
    }
    Ok(verification)
}
