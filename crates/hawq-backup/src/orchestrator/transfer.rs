//! The data phase shared by backup and restore.
//!
//! Order of events:
//!
//! 1. create the bridge schema (dropping a stale one only with `force`)
//! 2. lock every table in one statement on a dedicated session
//! 3. move each table in its own transaction, `workers` at a time
//! 4. release the locks, then drop the bridge schema
//!
//! Step 4 runs whatever happened in steps 2 and 3.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{create_schema_sql, drop_schema_sql, BridgeTableSpec};
use crate::config::FailurePolicy;
use crate::core::TableRef;
use crate::db::Database;
use crate::error::{HdbError, Result};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Owns the bridge schema for the duration of one data phase.
pub struct BridgeSchemaLease {
    db: Arc<dyn Database>,
    schema: String,
    released: bool,
}

impl BridgeSchemaLease {
    /// Create the bridge schema. An existing one is dropped first when `force`
    /// is set, and is a [`HdbError::BridgeSchemaConflict`] otherwise.
    pub async fn acquire(db: Arc<dyn Database>, schema: &str, force: bool) -> Result<Self> {
        if db.schema_exists(schema).await? {
            if !force {
                return Err(HdbError::BridgeSchemaConflict(schema.to_string()));
            }
            warn!("Dropping leftover bridge schema {}", schema);
            db.execute(&drop_schema_sql(schema)?).await?;
        }
        db.execute(&create_schema_sql(schema)?).await?;
        info!("Created bridge schema {}", schema);
        Ok(Self {
            db,
            schema: schema.to_string(),
            released: false,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Drop the schema and every bridge table in it.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.execute(&drop_schema_sql(&self.schema)?).await?;
        info!("Dropped bridge schema {}", self.schema);
        Ok(())
    }
}

impl Drop for BridgeSchemaLease {
    fn drop(&mut self) {
        if !self.released {
            error!(
                "Bridge schema {} was not dropped; remove it or rerun with --force",
                self.schema
            );
        }
    }
}

/// How one table fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    /// Never started because the job stopped scheduling.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub table: TableRef,
    pub bridge_name: String,
    pub status: TableStatus,
    pub rows: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableOutcome {
    fn skipped(spec: &BridgeTableSpec) -> Self {
        Self {
            table: spec.source_table.clone(),
            bridge_name: spec.bridge_name.clone(),
            status: TableStatus::Skipped,
            rows: 0,
            duration_ms: 0,
            error: None,
        }
    }
}

/// One data phase, fully resolved before anything is created.
pub struct DataPhase {
    pub db: Arc<dyn Database>,
    pub bridge_schema: String,
    pub force: bool,
    /// Bridge pairs in transfer order; their tables are the ones locked.
    pub specs: Vec<BridgeTableSpec>,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
}

impl DataPhase {
    /// Run the phase. Fails with [`HdbError::PartialTransfer`] if any table
    /// failed and with [`HdbError::Cancelled`] if the job was interrupted,
    /// in both cases after cleanup.
    pub async fn run(
        self,
        cancel: &CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<TableOutcome>> {
        let lease = BridgeSchemaLease::acquire(self.db.clone(), &self.bridge_schema, self.force).await?;

        let result = self.transfer_under_locks(cancel, progress).await;

        match lease.release().await {
            Ok(()) => {}
            Err(e) if result.is_err() => {
                error!("Failed to drop bridge schema {}: {}", self.bridge_schema, e)
            }
            Err(e) => return Err(e),
        }

        let outcomes = result?;
        let failed: Vec<&TableOutcome> = outcomes
            .iter()
            .filter(|o| o.status == TableStatus::Failed)
            .collect();
        if let Some(first) = failed.first() {
            let names: Vec<String> = failed.iter().map(|o| o.table.to_string()).collect();
            return Err(HdbError::transfer(
                names.join(", "),
                first.error.clone().unwrap_or_default(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(HdbError::Cancelled);
        }
        Ok(outcomes)
    }

    async fn transfer_under_locks(
        &self,
        cancel: &CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<TableOutcome>> {
        let tables: Vec<TableRef> = self.specs.iter().map(|s| s.source_table.clone()).collect();
        let locks = self.db.lock_tables(&tables).await?;

        let result = self.transfer_all(cancel, progress).await;

        match locks.release().await {
            Ok(()) => {}
            Err(e) if result.is_err() => error!("Failed to release table locks: {}", e),
            Err(e) => return Err(e),
        }
        result
    }

    async fn transfer_all(
        &self,
        cancel: &CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<TableOutcome>> {
        let workers = self.workers.max(1);
        let total = self.specs.len();
        let semaphore = Arc::new(Semaphore::new(workers));
        // Fail-fast stops scheduling through this child without cancelling the job.
        let stop = cancel.child_token();
        let completed = Arc::new(AtomicUsize::new(0));
        let fail_fast = self.failure_policy == FailurePolicy::FailFast;

        info!("Transferring {} table(s) with {} worker(s)", total, workers);

        let mut handles = Vec::new();
        let mut scheduled = 0;

        for spec in &self.specs {
            if stop.is_cancelled() {
                info!("Stopping: no new transfers will be scheduled");
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Stopping: no new transfers will be scheduled");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| HdbError::pool(e, "waiting for a transfer worker"))?
                }
            };
            // A failing worker may have stopped the job while we waited.
            if stop.is_cancelled() {
                break;
            }

            let db = self.db.clone();
            let task_spec = spec.clone();
            let progress = progress.clone();
            let completed = completed.clone();
            let stop = stop.clone();

            let handle = tokio::spawn(async move {
                let spec = task_spec;
                progress.report(&ProgressEvent::TableStarted {
                    table: spec.source_table.clone(),
                    total,
                });
                let start = Instant::now();
                let result = db
                    .run_in_transaction(&[spec.create_sql.clone(), spec.transfer_sql.clone()])
                    .await;
                let duration_ms = start.elapsed().as_millis() as u64;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

                let outcome = match result {
                    Ok(rows) => {
                        info!("{}: {} rows ({} ms)", spec.source_table, rows, duration_ms);
                        progress.report(&ProgressEvent::TableFinished {
                            table: spec.source_table.clone(),
                            rows,
                            duration_ms,
                            completed: done,
                            total,
                        });
                        TableOutcome {
                            table: spec.source_table,
                            bridge_name: spec.bridge_name,
                            status: TableStatus::Completed,
                            rows,
                            duration_ms,
                            error: None,
                        }
                    }
                    Err(e) => {
                        error!("{}: failed - {}", spec.source_table, e);
                        progress.report(&ProgressEvent::TableFailed {
                            table: spec.source_table.clone(),
                            error: e.to_string(),
                            completed: done,
                            total,
                        });
                        if fail_fast {
                            stop.cancel();
                        }
                        TableOutcome {
                            table: spec.source_table,
                            bridge_name: spec.bridge_name,
                            status: TableStatus::Failed,
                            rows: 0,
                            duration_ms,
                            error: Some(e.to_string()),
                        }
                    }
                };
                drop(permit);
                outcome
            });

            handles.push((spec.clone(), handle));
            scheduled += 1;
        }

        let mut outcomes = Vec::with_capacity(total);
        for (spec, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("{}: task panicked - {}", spec.source_table, e);
                    outcomes.push(TableOutcome {
                        status: TableStatus::Failed,
                        error: Some(format!("Task panicked: {}", e)),
                        ..TableOutcome::skipped(&spec)
                    });
                }
            }
        }
        for spec in &self.specs[scheduled..] {
            outcomes.push(TableOutcome::skipped(spec));
        }
        if scheduled < total {
            warn!("{} table(s) were not transferred", total - scheduled);
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeBuilder;
    use crate::progress::NoProgress;
    use crate::testing::{FakeDatabase, RecordingProgress};

    fn specs(names: &[&str]) -> Vec<BridgeTableSpec> {
        let mut builder = BridgeBuilder::new("hawqbackup_schema", "localhost", 51200, "/b/1/db/data");
        names
            .iter()
            .map(|n| builder.build_outbound(&TableRef::new("s", *n).unwrap()).unwrap())
            .collect()
    }

    fn phase(db: Arc<FakeDatabase>, names: &[&str], policy: FailurePolicy) -> DataPhase {
        DataPhase {
            db,
            bridge_schema: "hawqbackup_schema".into(),
            force: false,
            specs: specs(names),
            workers: 1,
            failure_policy: policy,
        }
    }

    #[tokio::test]
    async fn test_locks_precede_every_transfer_and_cleanup_follows() {
        let db = FakeDatabase::new("orders");
        let outcomes = phase(db.clone(), &["a", "b"], FailurePolicy::FailFast)
            .run(&CancellationToken::new(), Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);

        let log = db.log();
        let lock = log.iter().position(|s| s.starts_with("LOCK TABLE")).unwrap();
        let create_schema = log.iter().position(|s| s.starts_with("CREATE SCHEMA")).unwrap();
        let first_bridge = log
            .iter()
            .position(|s| s.starts_with("CREATE WRITABLE EXTERNAL TABLE"))
            .unwrap();
        let unlock = log.iter().position(|s| s == "RELEASE LOCKS").unwrap();
        let drop_schema = log.iter().position(|s| s.starts_with("DROP SCHEMA")).unwrap();

        assert!(create_schema < lock);
        assert!(lock < first_bridge);
        assert!(log.iter().rposition(|s| s.starts_with("INSERT INTO")).unwrap() < unlock);
        assert!(unlock < drop_schema);
        assert_eq!(
            log[lock],
            "LOCK TABLE \"s\".\"a\", \"s\".\"b\" IN ACCESS SHARE MODE"
        );
        assert!(!db.schema_present("hawqbackup_schema"));
    }

    #[tokio::test]
    async fn test_stale_schema_conflicts_without_force() {
        let db = FakeDatabase::new("orders").with_schemas(&["hawqbackup_schema"]);
        let err = phase(db.clone(), &["a"], FailurePolicy::FailFast)
            .run(&CancellationToken::new(), Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::BridgeSchemaConflict(_)));
        assert!(!db.log().iter().any(|s| s.starts_with("LOCK") || s.starts_with("INSERT")));
        assert!(db.schema_present("hawqbackup_schema"));
    }

    #[tokio::test]
    async fn test_force_drops_stale_schema() {
        let db = FakeDatabase::new("orders").with_schemas(&["hawqbackup_schema"]);
        let mut p = phase(db.clone(), &["a"], FailurePolicy::FailFast);
        p.force = true;
        p.run(&CancellationToken::new(), Arc::new(NoProgress))
            .await
            .unwrap();
        let log = db.log();
        assert!(log[0].starts_with("DROP SCHEMA"));
        assert!(log[1].starts_with("CREATE SCHEMA"));
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_and_cleans_up() {
        let db = FakeDatabase::new("orders").fail_on("\"s\".\"b\"");
        let err = phase(db.clone(), &["a", "b", "c"], FailurePolicy::FailFast)
            .run(&CancellationToken::new(), Arc::new(NoProgress))
            .await
            .unwrap_err();
        match err {
            HdbError::PartialTransfer { tables, .. } => assert_eq!(tables, "\"s\".\"b\""),
            other => panic!("unexpected {}", other),
        }
        let log = db.log();
        assert!(!log.iter().any(|s| s.contains("\"s_c\"")));
        assert!(log.last().unwrap().starts_with("DROP SCHEMA"));
    }

    #[tokio::test]
    async fn test_continue_policy_transfers_everything() {
        let db = FakeDatabase::new("orders").fail_on("\"s\".\"b\"");
        let progress = RecordingProgress::new();
        let err = phase(db.clone(), &["a", "b", "c"], FailurePolicy::Continue)
            .run(&CancellationToken::new(), progress.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::PartialTransfer { .. }));
        assert!(db.log().iter().any(|s| s.contains("\"s_c\"")));
        assert_eq!(progress.finished(), 2);
        assert_eq!(progress.failed(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_job_schedules_nothing_and_cleans_up() {
        let db = FakeDatabase::new("orders");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = phase(db.clone(), &["a", "b"], FailurePolicy::FailFast)
            .run(&cancel, Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, HdbError::Cancelled));
        assert!(!db.log().iter().any(|s| s.starts_with("INSERT")));
        assert!(!db.schema_present("hawqbackup_schema"));
    }

    #[tokio::test]
    async fn test_parallel_workers_transfer_every_table_once() {
        let db = FakeDatabase::new("orders");
        let mut p = phase(db.clone(), &["a", "b", "c", "d", "e"], FailurePolicy::FailFast);
        p.workers = 3;
        let outcomes = p
            .run(&CancellationToken::new(), Arc::new(NoProgress))
            .await
            .unwrap();
        let order: Vec<&str> = outcomes.iter().map(|o| o.table.relation.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(
            db.log().iter().filter(|s| s.starts_with("INSERT")).count(),
            5
        );
    }
}
