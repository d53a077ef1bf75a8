//! In-memory collaborators for driving the coordinators in unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::Settings;
use crate::core::TableRef;
use crate::db::{lock_statement, Connector, Database, LockSession};
use crate::error::{HdbError, Result};
use crate::orchestrator::JobContext;
use crate::progress::{AutoConfirm, ConfirmationGate, NoProgress, ProgressEvent, ProgressReporter};
use crate::storage::BackupStore;

fn simulated(what: &str) -> HdbError {
    HdbError::Io(std::io::Error::other(format!("simulated failure: {}", what)))
}

/// First double-quoted identifier in a statement.
fn quoted_name(sql: &str) -> Option<String> {
    sql.split('"').nth(1).map(str::to_string)
}

/// Database that records every statement it is asked to run.
pub struct FakeDatabase {
    name: String,
    tables: Mutex<Vec<TableRef>>,
    schemas: Mutex<HashSet<String>>,
    fail_patterns: Mutex<Vec<String>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeDatabase {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tables: Mutex::new(Vec::new()),
            schemas: Mutex::new(HashSet::new()),
            fail_patterns: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Rows returned by every catalog query.
    pub fn with_tables(self: Arc<Self>, tables: &[TableRef]) -> Arc<Self> {
        self.set_tables(tables);
        self
    }

    pub fn set_tables(&self, tables: &[TableRef]) {
        *self.tables.lock().unwrap() = tables.to_vec();
    }

    pub fn with_schemas(self: Arc<Self>, schemas: &[&str]) -> Arc<Self> {
        for schema in schemas {
            self.add_schema(schema);
        }
        self
    }

    pub fn add_schema(&self, schema: &str) {
        self.schemas.lock().unwrap().insert(schema.to_string());
    }

    /// Fail any statement containing `pattern`.
    pub fn fail_on(self: Arc<Self>, pattern: &str) -> Arc<Self> {
        self.fail_patterns.lock().unwrap().push(pattern.to_string());
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn schema_present(&self, schema: &str) -> bool {
        self.schemas.lock().unwrap().contains(schema)
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.log.lock().unwrap().push(sql.to_string());
        let fails = self
            .fail_patterns
            .lock()
            .unwrap()
            .iter()
            .any(|p| sql.contains(p.as_str()));
        if fails {
            Err(simulated(sql))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Database for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn query_tables(&self, _sql: &str) -> Result<Vec<TableRef>> {
        Ok(self.tables.lock().unwrap().clone())
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        Ok(self.schema_present(schema))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.record(sql)?;
        if sql.starts_with("CREATE SCHEMA") {
            if let Some(name) = quoted_name(sql) {
                self.add_schema(&name);
            }
        } else if sql.starts_with("DROP SCHEMA") {
            if let Some(name) = quoted_name(sql) {
                self.schemas.lock().unwrap().remove(&name);
            }
        }
        Ok(0)
    }

    async fn run_in_transaction(&self, statements: &[String]) -> Result<u64> {
        for sql in statements {
            self.record(sql)?;
        }
        Ok(1)
    }

    async fn lock_tables(&self, tables: &[TableRef]) -> Result<Box<dyn LockSession>> {
        self.log.lock().unwrap().push(lock_statement(tables)?);
        Ok(Box::new(FakeLocks {
            log: self.log.clone(),
        }))
    }
}

struct FakeLocks {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LockSession for FakeLocks {
    async fn release(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().push("RELEASE LOCKS".to_string());
        Ok(())
    }
}

/// Hands out one shared [`FakeDatabase`] under any name.
pub struct FakeConnector {
    db: Arc<FakeDatabase>,
    refused: Mutex<HashSet<String>>,
    connected: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(db: Arc<FakeDatabase>) -> Arc<Self> {
        Arc::new(Self {
            db,
            refused: Mutex::new(HashSet::new()),
            connected: Mutex::new(Vec::new()),
        })
    }

    pub fn refuse(&self, database: &str) {
        self.refused.lock().unwrap().insert(database.to_string());
    }

    /// Names connected to, in order.
    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, database: &str, _max_sessions: usize) -> Result<Arc<dyn Database>> {
        if self.refused.lock().unwrap().contains(database) {
            return Err(HdbError::connectivity(database, "connection refused"));
        }
        self.connected.lock().unwrap().push(database.to_string());
        Ok(self.db.clone())
    }
}

/// Records commands instead of running them.
#[derive(Default)]
pub struct FakeRunner {
    commands: Mutex<Vec<String>>,
    pipes: Mutex<Vec<String>>,
    missing: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    passing: Mutex<HashSet<String>>,
    outputs: Mutex<HashMap<String, String>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Programs `probe` reports as absent.
    pub fn without_programs(self: Arc<Self>, programs: &[&str]) -> Arc<Self> {
        self.missing
            .lock()
            .unwrap()
            .extend(programs.iter().map(|p| p.to_string()));
        self
    }

    /// Make every invocation of `program` fail.
    pub fn fail_program(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    /// Make `status` report success for commands carrying `arg`.
    pub fn pass_status(&self, arg: &str) {
        self.passing.lock().unwrap().insert(arg.to_string());
    }

    /// Stdout returned when `program` is the last command run.
    pub fn set_output(&self, program: &str, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(program.to_string(), output.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Pipelines run, as `producer | consumer`.
    pub fn pipes(&self) -> Vec<String> {
        self.pipes.lock().unwrap().clone()
    }

    fn run(&self, command: &CommandSpec) -> Result<String> {
        let shown = command.to_string();
        self.commands.lock().unwrap().push(shown.clone());
        let failing = self.failing.lock().unwrap();
        if failing.contains(&command.program) || command.args.iter().any(|a| failing.contains(a)) {
            return Err(HdbError::command(shown, "simulated failure"));
        }
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(&command.program)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn pipe(&self, producer: &CommandSpec, consumer: &CommandSpec) -> Result<String> {
        self.pipes
            .lock()
            .unwrap()
            .push(format!("{} | {}", producer, consumer));
        self.run(producer)?;
        self.run(consumer)
    }

    async fn capture(&self, command: &CommandSpec) -> Result<String> {
        self.run(command)
    }

    async fn feed(&self, command: &CommandSpec, _input: Vec<u8>) -> Result<()> {
        self.run(command).map(|_| ())
    }

    async fn status(&self, command: &CommandSpec) -> Result<bool> {
        self.run(command)?;
        let passing = self.passing.lock().unwrap();
        Ok(command.args.iter().any(|a| passing.contains(a)))
    }

    async fn probe(&self, program: &str) -> Result<bool> {
        Ok(!self.missing.lock().unwrap().contains(program))
    }
}

/// Backup tree held in memory.
#[derive(Default)]
pub struct FakeStore {
    dirs: Mutex<HashSet<String>>,
    files: Mutex<HashMap<String, String>>,
    listings: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.to_string());
    }

    pub fn add_file(&self, path: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
    }

    /// Raw entries returned when `data_dir` is listed.
    pub fn set_listing(&self, data_dir: &str, entries: &[String]) {
        self.listings
            .lock()
            .unwrap()
            .insert(data_dir.to_string(), entries.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl BackupStore for FakeStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let below = format!("{}/", path);
        let in_dirs = self
            .dirs
            .lock()
            .unwrap()
            .iter()
            .any(|d| d == path || d.starts_with(&below));
        let in_files = self
            .files
            .lock()
            .unwrap()
            .keys()
            .any(|f| f == path || f.starts_with(&below));
        Ok(in_dirs || in_files)
    }

    async fn make_dirs(&self, path: &str) -> Result<()> {
        self.add_dir(path);
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<bool> {
        if self.exists(path).await? {
            return Ok(false);
        }
        self.add_dir(path);
        Ok(true)
    }

    async fn list_table_dirs(&self, data_dir: &str) -> Result<Vec<String>> {
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(data_dir)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.file(path)
            .ok_or_else(|| HdbError::command(format!("hdfs dfs -cat {}", path), "No such file"))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }
}

/// Keeps every progress event.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn finished(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::TableFinished { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::TableFailed { .. }))
            .count()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Operator who always says no.
pub struct Refuse;

#[async_trait]
impl ConfirmationGate for Refuse {
    async fn confirm(&self, _summary: &str) -> Result<bool> {
        Ok(false)
    }
}

/// A full set of fakes around one database.
pub struct Harness {
    pub db: Arc<FakeDatabase>,
    pub connector: Arc<FakeConnector>,
    pub runner: Arc<FakeRunner>,
    pub store: Arc<FakeStore>,
}

impl Harness {
    pub fn new(database: &str) -> Self {
        let db = FakeDatabase::new(database);
        Self {
            connector: FakeConnector::new(db.clone()),
            db,
            runner: FakeRunner::new(),
            store: FakeStore::new(),
        }
    }

    pub fn with_tables(self, tables: &[TableRef]) -> Self {
        self.db.set_tables(tables);
        self
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            settings: Settings::default(),
            connector: self.connector.clone(),
            runner: self.runner.clone(),
            store: self.store.clone(),
            gate: Arc::new(AutoConfirm),
            progress: Arc::new(NoProgress),
        }
    }
}
