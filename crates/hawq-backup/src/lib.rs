//! # hawq-backup
//!
//! Backup and restore for HAWQ/HDB databases, with HDFS as the backup medium.
//!
//! A backup has two parts:
//!
//! - **Metadata**: a schema-only `pg_dump` archive and, for whole-database
//!   backups, a globals-only `pg_dumpall`, both streamed into HDFS
//! - **Data**: every selected table copied through a PXF bridge external
//!   table into `<data_dir>/<schema>/<relation>/`
//!
//! Restore runs the same two phases in reverse. Table locks are taken before
//! any data moves, and the bridge schema is always dropped at the end.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hawq_backup::{
//!     AutoConfirm, BackupCoordinator, BackupJob, FilterSet, JobContext, NoProgress,
//!     PhaseSelection, Settings,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hawq_backup::Result<()> {
//!     let settings = Settings::load_or_default("hawq-backup.yaml")?;
//!     let ctx = JobContext::production(settings, Arc::new(AutoConfirm), Arc::new(NoProgress));
//!     let job = BackupJob::new("orders", FilterSet::default(), PhaseSelection::Both)?;
//!     let report = BackupCoordinator::new(job, ctx)
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("Backup {} moved {} rows", report.backup_id, report.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod catalog;
pub mod command;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod progress;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use command::{preflight, CommandRunner, ProcessRunner, REQUIRED_PROGRAMS};
pub use config::{
    BackupJob, FailurePolicy, FilterOptions, FilterSet, JobConfig, PhaseSelection, RestoreJob,
    RestoreSelection, Settings,
};
pub use crate::core::TableRef;
pub use db::{Connector, Database, PgConnector};
pub use error::{HdbError, Result};
pub use orchestrator::{
    health_check, BackupCoordinator, HealthReport, JobContext, JobReport, PhaseOutcome,
    RestoreCoordinator, TableOutcome, TableStatus,
};
pub use paths::{BackupId, BackupPaths};
pub use progress::{AutoConfirm, ConfirmationGate, NoProgress, ProgressEvent, ProgressReporter};
