//! Connection layer for fanload over embedded SQLite (`rusqlite`, bundled).
//!
//! A [`RootConnection`] owns the database for a run and the engine core
//! (path, [`EngineConfig`], open-connection accounting). Any number of threads
//! can call [`RootConnection::duplicate`] concurrently to obtain a
//! [`WorkerConnection`]: an independent engine handle with its own
//! transaction state, opened against the same database with the same engine
//! configuration.
//!
//! # Transaction model
//!
//! - Autocommit is on by default; every statement commits on its own.
//! - With autocommit off, the first write opens a `BEGIN IMMEDIATE`
//!   transaction, which waits on the engine's busy timeout for the single
//!   write lock. `commit`/`rollback` end it.
//! - The database runs in WAL mode by default, so readers never block and
//!   uncommitted rows are never visible to other connections.
//! - A connection closed or dropped with an open transaction rolls it back.

mod config;
mod connection;
mod engine;
mod session;
mod statement;

pub use config::EngineConfig;
pub use connection::{RootConnection, WorkerConnection};
pub use rusqlite::Row;
pub use rusqlite::types::Value;
pub use statement::PreparedStatement;
