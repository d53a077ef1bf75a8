//! Backup coordinator.
//!
//! `Init -> PreparingDirectories -> BackingUpMetadata? -> BackingUpData? -> Done`,
//! with `Failed` reachable from every non-terminal state.

use chrono::{DateTime, Utc};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{confirm, metadata_step, yes_no, DataPhase, JobContext, JobKind, JobReport, PhaseOutcome};
use crate::bridge::BridgeBuilder;
use crate::catalog::TableCatalog;
use crate::command::preflight;
use crate::config::{BackupJob, Inclusion, JobConfig};
use crate::error::{HdbError, Result};
use crate::paths::{BackupId, BackupPaths};
use crate::progress::{Phase, ProgressEvent};
use crate::storage::{BackupManifest, MANIFEST_VERSION};

/// How many later ids are tried when the first one is taken.
const MAX_ID_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Init,
    PreparingDirectories,
    BackingUpMetadata,
    BackingUpData,
    Done,
    Failed,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Init => "init",
            BackupState::PreparingDirectories => "preparing directories",
            BackupState::BackingUpMetadata => "backing up metadata",
            BackupState::BackingUpData => "backing up data",
            BackupState::Done => "done",
            BackupState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs one backup job.
pub struct BackupCoordinator {
    job: BackupJob,
    ctx: JobContext,
    state: BackupState,
    started_at: Option<DateTime<Utc>>,
    paths: Option<BackupPaths>,
}

impl BackupCoordinator {
    pub fn new(job: BackupJob, ctx: JobContext) -> Self {
        Self {
            job,
            ctx,
            state: BackupState::Init,
            started_at: None,
            paths: None,
        }
    }

    /// Fix the start time the backup id is derived from.
    pub fn started_at(mut self, ts: DateTime<Utc>) -> Self {
        self.started_at = Some(ts);
        self
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn transition(&mut self, next: BackupState) {
        info!("Backup of {}: {} -> {}", self.job.database, self.state, next);
        self.state = next;
    }

    /// Human-readable summary of the resolved job.
    pub fn describe(&self) -> String {
        let conn = &self.ctx.settings.connection;
        let filter = &self.job.filter;
        let mut out = String::from("Backup parameters:\n");
        out.push_str(&format!("  Database:          {}\n", self.job.database));
        out.push_str(&format!(
            "  Server:            {}:{} as {}\n",
            conn.host, conn.port, conn.user
        ));
        match &self.paths {
            Some(paths) => {
                out.push_str(&format!("  Backup id:         {}\n", paths.backup_id));
                out.push_str(&format!("  Metadata dir:      {}\n", paths.metadata_dir));
                out.push_str(&format!("  Data dir:          {}\n", paths.data_dir));
            }
            None => out.push_str(&format!(
                "  Backup base:       {}\n",
                self.ctx.settings.storage.backup_base
            )),
        }
        let phases = match (self.job.phases.includes_metadata(), self.job.phases.includes_data()) {
            (true, true) => "schema and data",
            (true, false) => "schema only",
            _ => "data only",
        };
        out.push_str(&format!("  Phases:            {}\n", phases));
        let include = match &filter.include {
            Inclusion::All => "all tables".to_string(),
            Inclusion::Tables(tables) => format!(
                "tables {}",
                tables.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
            ),
            Inclusion::Schemas(schemas) => format!("schemas {}", schemas.join(", ")),
        };
        out.push_str(&format!("  Include:           {}\n", include));
        if !filter.exclude_tables.is_empty() {
            out.push_str(&format!(
                "  Exclude tables:    {}\n",
                filter
                    .exclude_tables
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if !filter.exclude_schemas.is_empty() {
            out.push_str(&format!(
                "  Exclude schemas:   {}\n",
                filter.exclude_schemas.join(", ")
            ));
        }
        out.push_str(&format!(
            "  Global objects:    {}\n",
            yes_no(self.job.wants_global_dump())
        ));
        out.push_str(&format!(
            "  Bridge schema:     {}\n",
            self.ctx.settings.bridge.backup_schema
        ));
        out.push_str(&format!(
            "  Workers:           {}\n",
            self.ctx.settings.execution.workers
        ));
        out.push_str(&format!("  Force:             {}\n", yes_no(self.job.force)));
        out.push_str(&format!(
            "  Ignore errors:     {}\n",
            yes_no(self.job.ignore_error)
        ));
        out
    }

    /// Run the backup to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<JobReport> {
        let started_at = self.started_at.unwrap_or_else(Utc::now);
        match self.execute(started_at, &cancel).await {
            Ok(report) => {
                self.transition(BackupState::Done);
                Ok(report.finish())
            }
            Err(e) => {
                error!("Backup of {} failed in state '{}': {}", self.job.database, self.state, e);
                self.transition(BackupState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        let ctx = self.ctx.clone();
        let settings = &ctx.settings;

        if self.job.phases.includes_metadata() {
            preflight(ctx.runner.as_ref(), &["pg_dump", "pg_dumpall"]).await?;
        }
        let db = ctx
            .connector
            .connect(&self.job.database, ctx.sessions())
            .await?;

        self.transition(BackupState::PreparingDirectories);
        // Include filters are verified before anything is written.
        let filtered = !matches!(self.job.filter.include, Inclusion::All);
        let tables = if self.job.phases.includes_data() || filtered {
            let catalog = TableCatalog::new(
                db.clone(),
                vec![
                    settings.bridge.backup_schema.clone(),
                    settings.bridge.restore_schema.clone(),
                ],
            );
            catalog.resolve(&self.job.filter).await?
        } else {
            Vec::new()
        };

        // Only a forced run can drop anything.
        if self.job.force && self.job.phases.includes_data() {
            confirm(ctx.gate.as_ref(), self.job.no_prompt, &self.describe()).await?;
        }

        let backup_id = self.reserve_backup_id(started_at).await?;
        let paths = BackupPaths::resolve(&settings.storage.backup_base, &backup_id, &self.job.database);
        info!("Backup id {}; writing to {}", backup_id, paths.root);
        self.paths = Some(paths.clone());

        let mut report = JobReport::new(
            JobKind::Backup,
            backup_id.clone(),
            &self.job.database,
            paths.clone(),
            started_at,
        );

        if self.job.phases.includes_metadata() {
            self.transition(BackupState::BackingUpMetadata);
            ctx.progress.report(&ProgressEvent::PhaseStarted {
                phase: Phase::Metadata,
            });
            ctx.store.make_dirs(&paths.metadata_dir).await?;

            let commands = ctx.commands();
            let dump = commands.pg_dump(&self.job);
            let put = commands.hdfs_put(&paths.ddl_file());
            report.metadata = metadata_step("Schema dump", self.job.ignore_error, async {
                ctx.runner.pipe(&dump, &put).await.map(|_| ())
            })
            .await?;
            ctx.progress.report(&ProgressEvent::PhaseFinished {
                phase: Phase::Metadata,
            });

            if self.job.wants_global_dump() {
                ctx.progress.report(&ProgressEvent::PhaseStarted {
                    phase: Phase::Globals,
                });
                let dumpall = commands.pg_dumpall_globals();
                let put = commands.hdfs_put(&paths.global_file());
                report.globals = metadata_step("Global objects dump", self.job.ignore_error, async {
                    ctx.runner.pipe(&dumpall, &put).await.map(|_| ())
                })
                .await?;
                ctx.progress.report(&ProgressEvent::PhaseFinished {
                    phase: Phase::Globals,
                });
            } else {
                info!("Filter active; skipping global objects dump");
            }
        }

        if cancel.is_cancelled() {
            return Err(HdbError::Cancelled);
        }

        let mut backed_up = Vec::new();
        if self.job.phases.includes_data() {
            self.transition(BackupState::BackingUpData);
            ctx.progress.report(&ProgressEvent::PhaseStarted { phase: Phase::Data });

            let mut builder = BridgeBuilder::new(
                settings.bridge.backup_schema.clone(),
                settings.bridge.pxf_host.clone(),
                settings.bridge.pxf_port,
                paths.data_dir.clone(),
            );
            let specs = tables
                .iter()
                .map(|t| builder.build_outbound(t))
                .collect::<Result<Vec<_>>>()?;

            let phase = DataPhase {
                db: db.clone(),
                bridge_schema: settings.bridge.backup_schema.clone(),
                force: self.job.force,
                specs,
                workers: settings.execution.workers,
                failure_policy: settings.execution.failure_policy,
            };
            report.tables = phase.run(cancel, ctx.progress.clone()).await?;
            report.data = PhaseOutcome::Completed;
            backed_up = tables;
            ctx.progress.report(&ProgressEvent::PhaseFinished { phase: Phase::Data });
        }

        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            backup_id,
            database: self.job.database.clone(),
            started_at,
            completed_at: Utc::now(),
            phases: self.job.phases,
            global_dump: matches!(report.globals, PhaseOutcome::Completed),
            tables: backed_up,
            job_fingerprint: JobConfig::Backup(self.job.clone()).fingerprint(),
        };
        ctx.store.make_dirs(&paths.metadata_dir).await?;
        ctx.store
            .write_file(&paths.manifest_file(), &manifest.to_json()?)
            .await?;
        info!("Wrote completion manifest {}", paths.manifest_file());

        Ok(report)
    }

    /// Derive the id from the start time and claim `<base>/<id>/<db>` for it,
    /// stepping past ids already taken for this database.
    async fn reserve_backup_id(&self, started_at: DateTime<Utc>) -> Result<BackupId> {
        let base = &self.ctx.settings.storage.backup_base;
        let mut id = BackupId::from_timestamp(started_at);
        for _ in 0..MAX_ID_ATTEMPTS {
            let root = BackupPaths::resolve(base, &id, &self.job.database).root;
            if let Some((parent, _)) = root.rsplit_once('/') {
                self.ctx.store.make_dirs(parent).await?;
            }
            if self.ctx.store.create_dir(&root).await? {
                return Ok(id);
            }
            info!("{} already exists, trying the next id", root);
            id = id.next();
        }
        Err(HdbError::Config(format!(
            "No free backup id within {} seconds of {}",
            MAX_ID_ATTEMPTS,
            BackupId::from_timestamp(started_at)
        )))
    }
}
