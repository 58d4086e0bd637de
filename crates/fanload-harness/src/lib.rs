//! Concurrent batch-ingestion load harness.
//!
//! A run fans `num_batches` tasks out over a fixed pool of
//! `connection_threads` workers. Each task duplicates the root connection,
//! writes one batch of `batch_size` rows keyed by a shared
//! [`SequenceGenerator`] inside a single transaction, commits and closes.
//! After every task has finished, one aggregate query through the root
//! checks that the table holds exactly the keys `1..=num_batches * batch_size`.
//!
//! ```text
//! RunContext::run
//!   bootstrap_database -> RootConnection::open -> CREATE TABLE
//!   WorkScheduler::run   (duplicate -> BatchWriter::write_batch -> close) x N
//!   verify               (COUNT, COUNT DISTINCT, MIN, MAX)
//!   RunReport
//! ```

pub mod batch;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod schema;
pub mod sequence;
pub mod verify;

pub use batch::{Batch, BatchRow, BatchWriter, derive_value};
pub use report::{RunReport, TaskReport, TaskStatus};
pub use run::{RunConfig, RunContext, bootstrap_database};
pub use scheduler::{SchedulerReport, TaskOutcome, WorkScheduler};
pub use sequence::SequenceGenerator;
pub use verify::{Verification, verify};
