//! Backup and restore coordinators.
//!
//! Both coordinators run a metadata phase through the `pg_*` tools and a data
//! phase through PXF bridge tables, and both return a [`JobReport`].

pub mod backup;
pub mod restore;
pub mod transfer;

pub use backup::{BackupCoordinator, BackupState};
pub use restore::{tables_in_list, RestoreCoordinator, RestoreState};
pub use transfer::{BridgeSchemaLease, DataPhase, TableOutcome, TableStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::command::{CommandBuilder, CommandRunner, ProcessRunner, REQUIRED_PROGRAMS};
use crate::config::Settings;
use crate::db::{Connector, PgConnector};
use crate::error::{HdbError, Result};
use crate::paths::{BackupId, BackupPaths};
use crate::progress::{ConfirmationGate, ProgressReporter};
use crate::storage::{BackupStore, HdfsStore};

/// Settings plus every collaborator a coordinator talks to.
#[derive(Clone)]
pub struct JobContext {
    pub settings: Settings,
    pub connector: Arc<dyn Connector>,
    pub runner: Arc<dyn CommandRunner>,
    pub store: Arc<dyn BackupStore>,
    pub gate: Arc<dyn ConfirmationGate>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl JobContext {
    /// Real database, real processes, HDFS through the `hdfs` client.
    pub fn production(
        settings: Settings,
        gate: Arc<dyn ConfirmationGate>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let commands = CommandBuilder::new(settings.connection.clone(), settings.storage.clone());
        Self {
            connector: Arc::new(PgConnector::new(settings.connection.clone())),
            store: Arc::new(HdfsStore::new(runner.clone(), commands)),
            runner,
            settings,
            gate,
            progress,
        }
    }

    pub fn commands(&self) -> CommandBuilder {
        CommandBuilder::new(
            self.settings.connection.clone(),
            self.settings.storage.clone(),
        )
    }

    /// Pool size for a data phase: one per worker, plus the lock holder and
    /// the control session.
    pub fn sessions(&self) -> usize {
        self.settings.execution.workers + 2
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Skipped,
    Completed,
    /// Failed, but `ignore_error` let the job continue.
    Ignored { error: String },
}

/// Which coordinator produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
}

/// Result of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobKind,

    /// Unique id of this run, for correlating logs.
    pub run_id: String,

    /// Final status: "completed" or "list_generated".
    pub status: String,

    pub backup_id: BackupId,

    /// Database backed up, or restored into.
    pub database: String,

    pub paths: BackupPaths,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub metadata: PhaseOutcome,
    pub globals: PhaseOutcome,
    pub data: PhaseOutcome,

    /// Per-table results, in transfer order.
    pub tables: Vec<TableOutcome>,

    pub rows_transferred: u64,

    /// Table of contents written by a list-generating restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_file: Option<PathBuf>,
}

impl JobReport {
    fn new(job: JobKind, backup_id: BackupId, database: &str, paths: BackupPaths, started_at: DateTime<Utc>) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Run {} started", run_id);
        Self {
            job,
            run_id,
            status: "completed".to_string(),
            backup_id,
            database: database.to_string(),
            paths,
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            metadata: PhaseOutcome::Skipped,
            globals: PhaseOutcome::Skipped,
            data: PhaseOutcome::Skipped,
            tables: Vec::new(),
            rows_transferred: 0,
            list_file: None,
        }
    }

    fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self.duration_seconds =
            (self.completed_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.rows_transferred = self.tables.iter().map(|t| t.rows).sum();
        self
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub database: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Required programs not found on `PATH`.
    pub missing_programs: Vec<String>,
    /// Whether the backup base directory exists yet.
    pub backup_base_present: bool,
    pub healthy: bool,
}

/// Check connectivity to `database`, the external programs and the backup base.
pub async fn health_check(ctx: &JobContext, database: &str) -> Result<HealthReport> {
    let start = Instant::now();
    let connection = match ctx.connector.connect(database, 1).await {
        Ok(db) => db.ping().await,
        Err(e) => Err(e),
    };
    let latency_ms = start.elapsed().as_millis() as u64;

    let mut missing_programs = Vec::new();
    for program in REQUIRED_PROGRAMS {
        if !ctx.runner.probe(program).await? {
            missing_programs.push(program.to_string());
        }
    }

    let base = &ctx.settings.storage.backup_base;
    let backup_base_present = match ctx.store.exists(base).await {
        Ok(present) => present,
        Err(e) => {
            warn!("Cannot check {}: {}", base, e);
            false
        }
    };

    let connected = connection.is_ok();
    Ok(HealthReport {
        database: database.to_string(),
        connected,
        latency_ms,
        error: connection.err().map(|e| e.to_string()),
        healthy: connected && missing_programs.is_empty(),
        missing_programs,
        backup_base_present,
    })
}

/// Run a metadata-phase step, demoting its failure when `ignore_error` is set.
async fn metadata_step<F>(what: &str, ignore_error: bool, step: F) -> Result<PhaseOutcome>
where
    F: std::future::Future<Output = Result<()>>,
{
    match step.await {
        Ok(()) => {
            info!("{} completed", what);
            Ok(PhaseOutcome::Completed)
        }
        Err(e @ HdbError::ExternalCommand { .. }) if ignore_error => {
            warn!("{} failed, continuing because errors are ignored: {}", what, e);
            Ok(PhaseOutcome::Ignored {
                error: e.to_string(),
            })
        }
        Err(e) => Err(e),
    }
}

/// Ask the gate unless the job skips prompting.
async fn confirm(gate: &dyn ConfirmationGate, no_prompt: bool, summary: &str) -> Result<()> {
    if no_prompt {
        return Ok(());
    }
    if gate.confirm(summary).await? {
        Ok(())
    } else {
        info!("Operator declined; nothing was changed");
        Err(HdbError::Aborted)
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
