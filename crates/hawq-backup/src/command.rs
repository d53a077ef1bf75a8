//! External programs: argument lists and the process runner.
//!
//! Every invocation is an immutable [`CommandSpec`] built from validated
//! settings and a validated job. Nothing goes through a shell, so names are
//! passed exactly as the catalog spells them.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::{BackupJob, ConnectionConfig, Inclusion, StorageConfig};
use crate::db::tls::SslMode;
use crate::error::{HdbError, Result};

/// Programs a full backup or restore needs on `PATH`.
pub const REQUIRED_PROGRAMS: &[&str] = &["pg_dump", "pg_dumpall", "pg_restore", "psql"];

/// One program invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment. Not shown by `Display`.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Whether any argument equals `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('"') {
                write!(f, " '{}'", arg.replace('\'', "'\\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("command", &self.to_string())
            .field("env", &keys)
            .finish()
    }
}

/// How `pg_restore` treats the archive's table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreListMode<'a> {
    /// Restore everything.
    All,
    /// Print the table of contents instead of restoring.
    Generate,
    /// Restore only the entries in this list file.
    Use(&'a Path),
}

/// Builds the argument lists for `pg_*` tools and `hdfs`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    connection: ConnectionConfig,
    storage: StorageConfig,
}

impl CommandBuilder {
    pub fn new(connection: ConnectionConfig, storage: StorageConfig) -> Self {
        Self {
            connection,
            storage,
        }
    }

    fn pg_tool(&self, program: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(program).args([
            format!("--username={}", self.connection.user),
            format!("--host={}", self.connection.host),
            format!("--port={}", self.connection.port),
        ]);
        if let Some(ref password) = self.connection.password {
            spec = spec.env("PGPASSWORD", password.clone());
        }
        if let Ok(mode) = SslMode::parse(&self.connection.ssl_mode) {
            if mode.requires_tls() {
                spec = spec.env("PGSSLMODE", mode.as_libpq());
            }
        }
        spec
    }

    /// Schema-only dump of the job's tables, custom archive on stdout.
    pub fn pg_dump(&self, job: &BackupJob) -> CommandSpec {
        let mut spec = self
            .pg_tool("pg_dump")
            .args(["--schema-only", "--format=c"]);
        if job.clean {
            spec = spec.arg("--clean");
        }
        if job.no_privileges {
            spec = spec.arg("--no-privileges");
        }
        if job.create {
            spec = spec.arg("--create");
        }

        match &job.filter.include {
            Inclusion::All => {}
            Inclusion::Tables(tables) => {
                spec = spec.args(tables.iter().map(|t| format!("--table={}", t)));
            }
            Inclusion::Schemas(schemas) => {
                spec = spec.args(schemas.iter().map(|s| format!("--schema={}", quote_pattern(s))));
            }
        }
        spec = spec.args(
            job.filter
                .exclude_tables
                .iter()
                .map(|t| format!("--exclude-table={}", t)),
        );
        spec = spec.args(
            job.filter
                .exclude_schemas
                .iter()
                .map(|s| format!("--exclude-schema={}", quote_pattern(s))),
        );

        spec.arg(&job.database)
    }

    /// Roles and tablespaces, plain SQL on stdout.
    pub fn pg_dumpall_globals(&self) -> CommandSpec {
        self.pg_tool("pg_dumpall").arg("--globals-only")
    }

    /// Restore a custom archive read from stdin into `target`.
    pub fn pg_restore(
        &self,
        target: &str,
        clean: bool,
        no_privileges: bool,
        mode: RestoreListMode<'_>,
    ) -> CommandSpec {
        if mode == RestoreListMode::Generate {
            return CommandSpec::new("pg_restore").arg("--list");
        }
        let mut spec = self.pg_tool("pg_restore");
        if clean {
            spec = spec.arg("--clean");
        }
        if no_privileges {
            spec = spec.arg("--no-privileges");
        }
        if let RestoreListMode::Use(path) = mode {
            spec = spec.arg(format!("--use-list={}", path.display()));
        }
        spec.arg(format!("--dbname={}", target))
    }

    /// Replay a plain SQL script from stdin into `target`.
    pub fn psql_script(&self, target: &str) -> CommandSpec {
        self.pg_tool("psql").args([
            format!("--dbname={}", target),
            "--no-psqlrc".to_string(),
            "--quiet".to_string(),
            "--file=-".to_string(),
        ])
    }

    /// `hdfs dfs <args>`, through `sudo -u <hdfs_user>` when configured.
    pub fn hdfs<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = if self.storage.hdfs_user.is_empty() {
            CommandSpec::new(self.storage.hdfs_command.clone())
        } else {
            CommandSpec::new("sudo").args([
                "-u",
                self.storage.hdfs_user.as_str(),
                self.storage.hdfs_command.as_str(),
            ])
        };
        spec.arg("dfs").args(args)
    }

    /// Write stdin to `path`.
    pub fn hdfs_put(&self, path: &str) -> CommandSpec {
        self.hdfs(["-put", "-f", "-", path])
    }

    /// Stream `path` to stdout.
    pub fn hdfs_cat(&self, path: &str) -> CommandSpec {
        self.hdfs(["-cat", path])
    }

    pub fn hdfs_mkdir(&self, path: &str) -> CommandSpec {
        self.hdfs(["-mkdir", "-p", path])
    }

    /// Fails when `path` already exists.
    pub fn hdfs_create_dir(&self, path: &str) -> CommandSpec {
        self.hdfs(["-mkdir", path])
    }

    /// Exit status tells whether `path` exists.
    pub fn hdfs_test_exists(&self, path: &str) -> CommandSpec {
        self.hdfs(["-test", "-e", path])
    }

    /// List the children of every directory directly under `dir`.
    pub fn hdfs_list_two_levels(&self, dir: &str) -> CommandSpec {
        self.hdfs(["-ls".to_string(), format!("{}/*", dir.trim_end_matches('/'))])
    }
}

/// pg_dump treats quoted patterns literally.
fn quote_pattern(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `producer | consumer` and return the consumer's stdout. Fails if
    /// either side exits non-zero or writes to stderr.
    async fn pipe(&self, producer: &CommandSpec, consumer: &CommandSpec) -> Result<String>;

    /// Run a command and return its stdout, with the same failure rules.
    async fn capture(&self, command: &CommandSpec) -> Result<String>;

    /// Feed `input` to a command's stdin.
    async fn feed(&self, command: &CommandSpec, input: Vec<u8>) -> Result<()>;

    /// Run a command for its exit status alone.
    async fn status(&self, command: &CommandSpec) -> Result<bool>;

    /// Whether `program` resolves on `PATH`.
    async fn probe(&self, program: &str) -> Result<bool>;
}

/// [`CommandRunner`] on top of `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        // Session options from the caller's shell must not leak into the tools.
        cmd.env_remove("PGOPTIONS");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(spec: &CommandSpec, e: std::io::Error) -> HdbError {
        HdbError::command(spec.to_string(), format!("cannot start: {}", e))
    }
}

/// Turn a finished process into an error if it failed or complained.
fn check_output(spec: &CommandSpec, output: &std::process::Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        let message = if stderr.trim().is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!("exited with {}: {}", output.status, stderr.trim())
        };
        return Err(HdbError::command(spec.to_string(), message));
    }
    if !stderr.trim().is_empty() {
        return Err(HdbError::command(spec.to_string(), stderr.trim().to_string()));
    }
    Ok(())
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn pipe(&self, producer: &CommandSpec, consumer: &CommandSpec) -> Result<String> {
        debug!("Running: {} | {}", producer, consumer);

        let mut first = Self::command(producer)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(producer, e))?;
        let stdout = first
            .stdout
            .take()
            .ok_or_else(|| HdbError::command(producer.to_string(), "stdout not captured"))?;
        let stdin: Stdio = stdout.try_into()?;

        let second = Self::command(consumer)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(consumer, e))?;

        let (first_out, second_out) =
            tokio::join!(first.wait_with_output(), second.wait_with_output());
        check_output(producer, &first_out?)?;
        let second_out = second_out?;
        check_output(consumer, &second_out)?;
        Ok(String::from_utf8_lossy(&second_out.stdout).into_owned())
    }

    async fn capture(&self, command: &CommandSpec) -> Result<String> {
        debug!("Running: {}", command);
        let output = Self::command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Self::spawn_error(command, e))?;
        check_output(command, &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn feed(&self, command: &CommandSpec, input: Vec<u8>) -> Result<()> {
        debug!("Running: {} (<{} bytes)", command, input.len());
        let mut child = Self::command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(command, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        check_output(command, &output)
    }

    async fn status(&self, command: &CommandSpec) -> Result<bool> {
        debug!("Running: {}", command);
        let status = Self::command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Self::spawn_error(command, e))?;
        Ok(status.success())
    }

    async fn probe(&self, program: &str) -> Result<bool> {
        self.status(&CommandSpec::new("which").arg(program)).await
    }
}

/// Check that every program in `programs` resolves on `PATH`.
pub async fn preflight(runner: &dyn CommandRunner, programs: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for program in programs {
        if !runner.probe(program).await? {
            missing.push(program.to_string());
        }
    }
    if std::env::var_os("GPHOME").is_none() {
        tracing::warn!("GPHOME is not set; source greenplum_path.sh if the HAWQ tools are not found");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HdbError::command(
            "which",
            format!("not found on PATH: {}", missing.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterOptions, FilterSet, PhaseSelection};
    use crate::testing::FakeRunner;

    fn builder() -> CommandBuilder {
        let connection = ConnectionConfig {
            password: Some("secret".into()),
            ..Default::default()
        };
        CommandBuilder::new(connection, StorageConfig::default())
    }

    fn job(tables: &[&str], exclude_schemas: &[&str]) -> BackupJob {
        let filter = FilterSet::from_options(&FilterOptions {
            tables: tables.iter().map(|s| s.to_string()).collect(),
            exclude_schemas: exclude_schemas.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap();
        BackupJob::new("orders", filter, PhaseSelection::Both).unwrap()
    }

    #[test]
    fn test_pg_dump_full_database() {
        let spec = builder().pg_dump(&job(&[], &[]));
        assert_eq!(spec.program, "pg_dump");
        assert_eq!(
            spec.args,
            vec![
                "--username=gpadmin",
                "--host=localhost",
                "--port=5432",
                "--schema-only",
                "--format=c",
                "orders",
            ]
        );
        assert_eq!(spec.env, vec![("PGPASSWORD".to_string(), "secret".to_string())]);
    }

    #[test]
    fn test_pg_dump_one_flag_per_filter_entry() {
        let mut j = job(&["s.a", "\"Mixed\".\"T.x\""], &["tmp"]);
        j.clean = true;
        j.no_privileges = true;
        let spec = builder().pg_dump(&j);
        assert!(spec.has_arg("--clean"));
        assert!(spec.has_arg("--no-privileges"));
        assert!(!spec.has_arg("--create"));
        assert!(spec.has_arg("--table=\"s\".\"a\""));
        assert!(spec.has_arg("--table=\"Mixed\".\"T.x\""));
        assert!(spec.has_arg("--exclude-schema=\"tmp\""));
        assert_eq!(spec.args.last().map(String::as_str), Some("orders"));
    }

    #[test]
    fn test_display_hides_password() {
        let spec = builder().pg_dumpall_globals();
        let shown = format!("{} {:?}", spec, spec);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("--globals-only"));
    }

    #[test]
    fn test_pg_restore_modes() {
        let b = builder();
        let full = b.pg_restore("orders", true, true, RestoreListMode::All);
        assert!(full.has_arg("--clean"));
        assert!(full.has_arg("--no-privileges"));
        assert!(full.has_arg("--dbname=orders"));

        let list = b.pg_restore("orders", true, true, RestoreListMode::Generate);
        assert_eq!(list.args, vec!["--list"]);

        let path = Path::new("/tmp/edited.list");
        let user = b.pg_restore("orders_copy", false, false, RestoreListMode::Use(path));
        assert!(user.has_arg("--use-list=/tmp/edited.list"));
        assert!(user.has_arg("--dbname=orders_copy"));
        assert!(!user.has_arg("--clean"));
    }

    #[test]
    fn test_hdfs_runs_as_configured_user() {
        let b = builder();
        let put = b.hdfs_put("/hawq_backup/1/db/metadata/f.dmp");
        assert_eq!(put.program, "sudo");
        assert_eq!(
            put.args,
            vec!["-u", "hdfs", "hdfs", "dfs", "-put", "-f", "-", "/hawq_backup/1/db/metadata/f.dmp"]
        );

        let storage = StorageConfig {
            hdfs_user: String::new(),
            ..Default::default()
        };
        let direct = CommandBuilder::new(ConnectionConfig::default(), storage);
        let ls = direct.hdfs_list_two_levels("/b/data/");
        assert_eq!(ls.program, "hdfs");
        assert_eq!(ls.args, vec!["dfs", "-ls", "/b/data/*"]);
    }

    #[test]
    fn test_tls_mode_exported_to_tools() {
        let connection = ConnectionConfig {
            ssl_mode: "verify-full".into(),
            ..Default::default()
        };
        let spec = CommandBuilder::new(connection, StorageConfig::default()).psql_script("db");
        assert!(spec
            .env
            .contains(&("PGSSLMODE".to_string(), "verify-full".to_string())));
        assert!(spec.has_arg("--file=-"));
    }

    #[tokio::test]
    async fn test_preflight_names_missing_programs() {
        let runner = FakeRunner::new().without_programs(&["pg_restore", "psql"]);
        let err = preflight(runner.as_ref(), REQUIRED_PROGRAMS).await.unwrap_err();
        assert!(err.to_string().contains("pg_restore, psql"));

        let runner = FakeRunner::new();
        assert!(preflight(runner.as_ref(), REQUIRED_PROGRAMS).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_reports_stderr() {
        let runner = ProcessRunner::new();
        let ok = CommandSpec::new("sh").args(["-c", "printf hello"]);
        assert_eq!(runner.capture(&ok).await.unwrap(), "hello");

        let noisy = CommandSpec::new("sh").args(["-c", "echo oops >&2"]);
        let err = runner.capture(&noisy).await.unwrap_err();
        assert!(err.to_string().contains("oops"));

        let piped = runner
            .pipe(
                &CommandSpec::new("sh").args(["-c", "printf abc"]),
                &CommandSpec::new("tr").args(["a-z", "A-Z"]),
            )
            .await
            .unwrap();
        assert_eq!(piped, "ABC");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_strips_pgoptions() {
        std::env::set_var("PGOPTIONS", "-c search_path=evil");
        let spec = CommandSpec::new("sh").args(["-c", "printf \"${PGOPTIONS:-unset}\""]);
        let out = ProcessRunner::new().capture(&spec).await.unwrap();
        assert_eq!(out, "unset");
    }
}
