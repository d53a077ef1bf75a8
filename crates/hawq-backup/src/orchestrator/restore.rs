//! Restore coordinator.
//!
//! `Init -> Validating -> RestoringMetadata? -> RestoringData? -> Done`,
//! with `Failed` reachable from every non-terminal state. A list-generating
//! restore stops after writing the archive's table of contents.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{confirm, metadata_step, yes_no, DataPhase, JobContext, JobKind, JobReport, PhaseOutcome};
use crate::bridge::BridgeBuilder;
use crate::command::{preflight, RestoreListMode};
use crate::config::{RestoreJob, RestoreSelection};
use crate::core::{quote_literal, quote_pg, TableRef};
use crate::db::Database;
use crate::error::{HdbError, Result};
use crate::paths::BackupPaths;
use crate::progress::{Phase, ProgressEvent};
use crate::storage::{tables_from_listing, BackupManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Init,
    Validating,
    RestoringMetadata,
    RestoringData,
    Done,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreState::Init => "init",
            RestoreState::Validating => "validating",
            RestoreState::RestoringMetadata => "restoring metadata",
            RestoreState::RestoringData => "restoring data",
            RestoreState::Done => "done",
            RestoreState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs one restore job.
pub struct RestoreCoordinator {
    job: RestoreJob,
    ctx: JobContext,
    state: RestoreState,
    paths: BackupPaths,
}

impl RestoreCoordinator {
    pub fn new(job: RestoreJob, ctx: JobContext) -> Self {
        let paths = BackupPaths::resolve(
            &ctx.settings.storage.backup_base,
            &job.backup_id,
            &job.source_database,
        );
        Self {
            job,
            ctx,
            state: RestoreState::Init,
            paths,
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    fn transition(&mut self, next: RestoreState) {
        info!(
            "Restore of {} into {}: {} -> {}",
            self.job.backup_id, self.job.target_database, self.state, next
        );
        self.state = next;
    }

    /// Human-readable summary of the resolved job.
    pub fn describe(&self) -> String {
        let conn = &self.ctx.settings.connection;
        let mode = match &self.job.selection {
            RestoreSelection::Full => "schema and data".to_string(),
            RestoreSelection::SchemaOnly => "schema only".to_string(),
            RestoreSelection::DataOnly => "data only".to_string(),
            RestoreSelection::GenerateList(path) => {
                format!("write table of contents to {}", path.display())
            }
            RestoreSelection::UserList(path) => format!("entries listed in {}", path.display()),
        };
        let mut out = String::from("Restore parameters:\n");
        out.push_str(&format!("  Backup id:         {}\n", self.job.backup_id));
        out.push_str(&format!("  Source database:   {}\n", self.job.source_database));
        out.push_str(&format!("  Target database:   {}\n", self.job.target_database));
        out.push_str(&format!(
            "  Server:            {}:{} as {}\n",
            conn.host, conn.port, conn.user
        ));
        out.push_str(&format!("  Metadata dir:      {}\n", self.paths.metadata_dir));
        out.push_str(&format!("  Data dir:          {}\n", self.paths.data_dir));
        out.push_str(&format!("  Mode:              {}\n", mode));
        if let Some(encoding) = &self.job.create_database {
            out.push_str(&format!("  Create database:   yes, encoding {}\n", encoding));
        }
        out.push_str(&format!("  Clean:             {}\n", yes_no(self.job.clean)));
        out.push_str(&format!(
            "  No privileges:     {}\n",
            yes_no(self.job.no_privileges)
        ));
        out.push_str(&format!(
            "  Bridge schema:     {}\n",
            self.ctx.settings.bridge.restore_schema
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

    /// Run the restore to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<JobReport> {
        let started_at = Utc::now();
        match self.execute(started_at, &cancel).await {
            Ok(report) => {
                self.transition(RestoreState::Done);
                Ok(report.finish())
            }
            Err(e) => {
                error!(
                    "Restore of {} failed in state '{}': {}",
                    self.job.backup_id, self.state, e
                );
                self.transition(RestoreState::Failed);
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
        let paths = self.paths.clone();
        let target = self.job.target_database.clone();

        self.transition(RestoreState::Validating);
        self.job.validate()?;
        if !ctx.store.exists(&paths.root).await? {
            return Err(HdbError::InvalidBackup(format!(
                "backup {} of database {} not found at {}",
                self.job.backup_id, self.job.source_database, paths.root
            )));
        }
        if self.job.selection.includes_metadata() {
            preflight(ctx.runner.as_ref(), &["pg_restore", "psql"]).await?;
        }

        // A database that is about to be created can only be reached through
        // the maintenance database.
        let (maintenance, mut target_db) = match self.job.create_database {
            Some(_) => {
                let name = &settings.connection.maintenance_database;
                (Some(ctx.connector.connect(name, 1).await?), None)
            }
            None => (None, Some(ctx.connector.connect(&target, ctx.sessions()).await?)),
        };

        let manifest = self.load_manifest().await?;

        confirm(ctx.gate.as_ref(), self.job.no_prompt, &self.describe()).await?;

        let mut report = JobReport::new(
            JobKind::Restore,
            self.job.backup_id.clone(),
            &target,
            paths.clone(),
            started_at,
        );

        if self.job.selection.includes_metadata() {
            self.transition(RestoreState::RestoringMetadata);
            let commands = ctx.commands();
            let cat = commands.hdfs_cat(&paths.ddl_file());

            if let RestoreSelection::GenerateList(list_file) = &self.job.selection {
                let list = commands.pg_restore(
                    &target,
                    self.job.clean,
                    self.job.no_privileges,
                    RestoreListMode::Generate,
                );
                let toc = ctx.runner.pipe(&cat, &list).await?;
                tokio::fs::write(list_file, toc).await?;
                info!("Wrote table of contents to {}", list_file.display());
                report.status = "list_generated".to_string();
                report.list_file = Some(list_file.clone());
                return Ok(report);
            }

            ctx.progress.report(&ProgressEvent::PhaseStarted {
                phase: Phase::Metadata,
            });
            if let (Some(encoding), Some(maintenance)) = (&self.job.create_database, &maintenance) {
                let sql = format!(
                    "CREATE DATABASE {} ENCODING {}",
                    quote_pg(&target)?,
                    quote_literal(encoding)?
                );
                debug!("{}", sql);
                maintenance.execute(&sql).await?;
                info!("Created database {} with encoding {}", target, encoding);
            }

            let mode = match &self.job.selection {
                RestoreSelection::UserList(path) => RestoreListMode::Use(path),
                _ => RestoreListMode::All,
            };
            let restore =
                commands.pg_restore(&target, self.job.clean, self.job.no_privileges, mode);
            report.metadata = metadata_step("Schema restore", self.job.ignore_error, async {
                ctx.runner.pipe(&cat, &restore).await.map(|_| ())
            })
            .await?;
            ctx.progress.report(&ProgressEvent::PhaseFinished {
                phase: Phase::Metadata,
            });

            if self.job.selection.includes_globals() {
                if ctx.store.exists(&paths.global_file()).await? {
                    ctx.progress.report(&ProgressEvent::PhaseStarted {
                        phase: Phase::Globals,
                    });
                    let cat = commands.hdfs_cat(&paths.global_file());
                    let psql = commands.psql_script(&target);
                    report.globals =
                        metadata_step("Global objects restore", self.job.ignore_error, async {
                            ctx.runner.pipe(&cat, &psql).await.map(|_| ())
                        })
                        .await?;
                    ctx.progress.report(&ProgressEvent::PhaseFinished {
                        phase: Phase::Globals,
                    });
                } else {
                    info!("Backup has no global objects file; skipping");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(HdbError::Cancelled);
        }

        if self.job.selection.includes_data() {
            self.transition(RestoreState::RestoringData);
            ctx.progress.report(&ProgressEvent::PhaseStarted { phase: Phase::Data });

            let db = match target_db.take() {
                Some(db) => db,
                None => ctx.connector.connect(&target, ctx.sessions()).await?,
            };
            let tables = self.tables_to_restore(manifest.as_ref()).await?;

            if tables.is_empty() {
                warn!("No table data to restore in {}", paths.data_dir);
            } else {
                report.tables = self.restore_tables(db, &tables, cancel).await?;
            }
            report.data = PhaseOutcome::Completed;
            ctx.progress.report(&ProgressEvent::PhaseFinished { phase: Phase::Data });
        }

        Ok(report)
    }

    async fn load_manifest(&self) -> Result<Option<BackupManifest>> {
        let path = self.paths.manifest_file();
        if self.ctx.store.exists(&path).await? {
            let manifest = BackupManifest::from_json(&self.ctx.store.read_file(&path).await?)?;
            debug!("Manifest lists {} table(s)", manifest.tables.len());
            return Ok(Some(manifest));
        }
        if self.ctx.settings.execution.require_manifest {
            return Err(HdbError::InvalidBackup(format!(
                "completion manifest {} is missing",
                path
            )));
        }
        warn!(
            "Backup {} has no completion manifest; it may be incomplete",
            self.job.backup_id
        );
        Ok(None)
    }

    /// Tables in the backup's data directory, narrowed by a user list.
    async fn tables_to_restore(&self, manifest: Option<&BackupManifest>) -> Result<Vec<TableRef>> {
        let entries = self.ctx.store.list_table_dirs(&self.paths.data_dir).await?;
        let mut tables = tables_from_listing(&self.paths.data_dir, &entries)?;
        if let Some(manifest) = manifest {
            manifest.check_listing(&tables)?;
        }

        if let RestoreSelection::UserList(path) = &self.job.selection {
            let contents = tokio::fs::read_to_string(path).await?;
            let wanted = tables_in_list(&contents)?;
            tables.retain(|t| wanted.contains(t));
            info!(
                "{} of the backup's tables are named in {}",
                tables.len(),
                path.display()
            );
        }
        Ok(tables)
    }

    async fn restore_tables(
        &self,
        db: Arc<dyn Database>,
        tables: &[TableRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<super::TableOutcome>> {
        let settings = &self.ctx.settings;
        let mut builder = BridgeBuilder::new(
            settings.bridge.restore_schema.clone(),
            settings.bridge.pxf_host.clone(),
            settings.bridge.pxf_port,
            self.paths.data_dir.clone(),
        );
        let specs = tables
            .iter()
            .map(|t| builder.build_inbound(t))
            .collect::<Result<Vec<_>>>()?;

        DataPhase {
            db,
            bridge_schema: settings.bridge.restore_schema.clone(),
            force: self.job.force,
            specs,
            workers: settings.execution.workers,
            failure_policy: settings.execution.failure_policy,
        }
        .run(cancel, self.ctx.progress.clone())
        .await
    }
}

/// Tables named in a restore list file.
///
/// Accepts `pg_restore --list` output, keeping `TABLE` and `TABLE DATA`
/// entries (`<id>; <catoid> <oid> TABLE [DATA] <schema> <name> <owner>`),
/// or one qualified name per line. Lines starting with `;` are comments.
pub fn tables_in_list(contents: &str) -> Result<Vec<TableRef>> {
    let mut tables: Vec<TableRef> = Vec::new();

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let table = match line.split_once(';') {
            Some((_, entry)) => {
                let fields: Vec<&str> = entry.split_whitespace().collect();
                let rest = match fields.get(2..) {
                    Some(["TABLE", "DATA", rest @ ..]) | Some(["TABLE", rest @ ..]) => rest,
                    _ => continue,
                };
                match rest {
                    [schema, name, ..] => TableRef::new(*schema, *name)?,
                    _ => {
                        return Err(HdbError::Config(format!(
                            "Malformed table of contents entry: {}",
                            line
                        )))
                    }
                }
            }
            None => TableRef::parse(line)?,
        };
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::BackupId;
    use crate::testing::{Harness, Refuse};

    const ROOT: &str = "/hawq_backup/20240101120000/orders";
    const DATA: &str = "/hawq_backup/20240101120000/orders/data";

    fn t(schema: &str, relation: &str) -> TableRef {
        TableRef::new(schema, relation).unwrap()
    }

    fn job(selection: RestoreSelection) -> RestoreJob {
        let id = BackupId::parse("20240101120000").unwrap();
        let mut job = RestoreJob::new(id, "orders", None, selection).unwrap();
        job.no_prompt = true;
        job
    }

    /// A backup of `orders` holding `s.a`, `s.b` and `s.c`.
    fn harness() -> Harness {
        let h = Harness::new("orders");
        h.store.add_dir(ROOT);
        h.store.set_listing(
            DATA,
            &[
                format!("{}/s/a", DATA),
                format!("{}/s/b", DATA),
                format!("{}/s/c", DATA),
            ],
        );
        h
    }

    #[test]
    fn test_tables_in_toc_listing() {
        let toc = ";\n; Archive created at 2024-01-01 12:00:00 UTC\n;\n\
            2150; 1259 16390 TABLE s a gpadmin\n\
            2151; 1259 16393 SEQUENCE s a_id_seq gpadmin\n\
            2152; 0 16390 TABLE DATA s a gpadmin\n\
            2153; 1259 16400 TABLE s c gpadmin\n";
        assert_eq!(tables_in_list(toc).unwrap(), vec![t("s", "a"), t("s", "c")]);
    }

    #[test]
    fn test_tables_in_plain_list() {
        let list = "s.c\n\"My Schema\".t\n\ns.c\n";
        assert_eq!(
            tables_in_list(list).unwrap(),
            vec![t("s", "c"), t("My Schema", "t")]
        );
    }

    #[tokio::test]
    async fn test_full_restore_replays_metadata_and_data() {
        let h = harness();
        h.store.add_file(&format!("{}/metadata/hdb_dump_20240101120000_global.dmp", ROOT), "");
        let report = RestoreCoordinator::new(job(RestoreSelection::Full), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.metadata, PhaseOutcome::Completed);
        assert_eq!(report.globals, PhaseOutcome::Completed);
        assert_eq!(report.tables.len(), 3);

        let pipes = h.runner.pipes();
        assert_eq!(pipes.len(), 2);
        assert!(pipes[0].contains("-cat /hawq_backup/20240101120000/orders/metadata/hdb_dump_20240101120000_ddl.dmp | pg_restore"));
        assert!(pipes[0].ends_with("--dbname=orders"));
        assert!(pipes[1].contains("| psql"));

        let log = h.db.log();
        assert!(log.iter().any(|s| s.starts_with("CREATE SCHEMA \"hawqrestore_schema\"")));
        assert!(log.iter().any(|s| s.starts_with("INSERT INTO \"s\".\"c\"")));
    }

    #[tokio::test]
    async fn test_user_list_restores_listed_subset_in_listing_order() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("restore.list");
        std::fs::write(&list, "s.c\ns.a\n").unwrap();

        let report = RestoreCoordinator::new(job(RestoreSelection::UserList(list.clone())), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let restored: Vec<TableRef> = report.tables.iter().map(|o| o.table.clone()).collect();
        assert_eq!(restored, vec![t("s", "a"), t("s", "c")]);
        assert_eq!(report.globals, PhaseOutcome::Skipped);
        let pipes = h.runner.pipes();
        assert_eq!(pipes.len(), 1);
        assert!(pipes[0].contains(&format!("--use-list={}", list.display())));
    }

    #[tokio::test]
    async fn test_generate_list_writes_toc_and_stops() {
        let h = harness();
        h.runner.set_output("pg_restore", "2150; 1259 16390 TABLE s a gpadmin\n");
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("toc.list");

        let report = RestoreCoordinator::new(job(RestoreSelection::GenerateList(list.clone())), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, "list_generated");
        assert_eq!(report.list_file.as_deref(), Some(list.as_path()));
        assert_eq!(
            std::fs::read_to_string(&list).unwrap(),
            "2150; 1259 16390 TABLE s a gpadmin\n"
        );
        assert!(h.runner.pipes()[0].ends_with("pg_restore --list"));
        assert!(h.db.log().is_empty());
    }

    #[tokio::test]
    async fn test_existing_restore_schema_needs_force() {
        let h = harness();
        h.db.add_schema("hawqrestore_schema");
        let err = RestoreCoordinator::new(job(RestoreSelection::DataOnly), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::BridgeSchemaConflict(_)));
        assert!(!h.db.log().iter().any(|s| s.starts_with("LOCK") || s.starts_with("INSERT")));

        let h = harness();
        h.db.add_schema("hawqrestore_schema");
        let mut forced = job(RestoreSelection::DataOnly);
        forced.force = true;
        let report = RestoreCoordinator::new(forced, h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.tables.len(), 3);
        assert!(!h.db.schema_present("hawqrestore_schema"));
    }

    #[tokio::test]
    async fn test_missing_backup_is_invalid() {
        let h = Harness::new("orders");
        let err = RestoreCoordinator::new(job(RestoreSelection::Full), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::InvalidBackup(_)));
        assert!(h.runner.pipes().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_required_when_configured() {
        let h = harness();
        let mut ctx = h.context();
        ctx.settings.execution.require_manifest = true;
        let err = RestoreCoordinator::new(job(RestoreSelection::DataOnly), ctx)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::InvalidBackup(_)));
    }

    #[tokio::test]
    async fn test_listing_outside_manifest_is_rejected() {
        let h = harness();
        let manifest = BackupManifest {
            version: crate::storage::MANIFEST_VERSION,
            backup_id: BackupId::parse("20240101120000").unwrap(),
            database: "orders".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            phases: crate::config::PhaseSelection::Both,
            global_dump: true,
            tables: vec![t("s", "a"), t("s", "b")],
            job_fingerprint: String::new(),
        };
        h.store.add_file(
            &format!("{}/metadata/hdb_dump_20240101120000_manifest.json", ROOT),
            &manifest.to_json().unwrap(),
        );
        let err = RestoreCoordinator::new(job(RestoreSelection::DataOnly), h.context())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::InvalidBackup(_)));
        assert!(h.db.log().is_empty());
    }

    #[tokio::test]
    async fn test_create_database_goes_through_maintenance_db() {
        let h = harness();
        let mut j = job(RestoreSelection::SchemaOnly);
        j.target_database = "orders_copy".into();
        j.create_database = Some("UTF8".into());
        RestoreCoordinator::new(j, h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.connector.connected(), vec!["template1".to_string()]);
        assert_eq!(
            h.db.log(),
            vec!["CREATE DATABASE \"orders_copy\" ENCODING 'UTF8'".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_database_with_data_only_rejected_up_front() {
        let h = harness();
        let mut j = job(RestoreSelection::DataOnly);
        j.target_database = "orders_copy".into();
        j.create_database = Some("UTF8".into());
        let err = RestoreCoordinator::new(j, h.context())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HdbError::Config(_)));
        assert!(h.connector.connected().is_empty());
        assert!(h.db.log().is_empty());
        assert!(h.runner.pipes().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_failure_demoted_with_ignore_error() {
        let h = harness();
        h.runner.fail_program("pg_restore");
        let mut j = job(RestoreSelection::SchemaOnly);
        j.ignore_error = true;
        let report = RestoreCoordinator::new(j, h.context())
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(report.metadata, PhaseOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn test_declined_prompt_aborts_without_changes() {
        let h = harness();
        let mut ctx = h.context();
        ctx.gate = Arc::new(Refuse);
        let mut j = job(RestoreSelection::Full);
        j.no_prompt = false;
        let err = RestoreCoordinator::new(j, ctx)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::Aborted));
        assert!(h.runner.pipes().is_empty());
        assert!(h.db.log().is_empty());
    }

    #[test]
    fn test_describe_names_target_and_mode() {
        let h = Harness::new("orders");
        let mut j = job(RestoreSelection::DataOnly);
        j.target_database = "orders_copy".into();
        let text = RestoreCoordinator::new(j, h.context()).describe();
        assert!(text.contains("Target database:   orders_copy"));
        assert!(text.contains("Mode:              data only"));
    }
}
