//! SQL text for the load table.
//!
//! The column layout is fixed: `col1 BIGINT` holds the sequence key and
//! `col2 VARCHAR` the value derived from it. Only the table name varies.

/// Quote an identifier for direct inclusion in SQL text.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[must_use]
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (col1 BIGINT, col2 VARCHAR)",
        quote_ident(table)
    )
}

#[must_use]
pub fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {} VALUES (?, ?)", quote_ident(table))
}

/// Row count, distinct keys, smallest and largest key, in that order.
#[must_use]
pub fn aggregate_sql(table: &str) -> String {
    format!(
        "SELECT COUNT(*), COUNT(DISTINCT col1), MIN(col1), MAX(col1) FROM {}",
        quote_ident(table)
    )
}
