//! hawq-backup CLI - backup and restore of HAWQ/HDB databases to HDFS.

mod prompt;
mod reporter;

use clap::{Args, Parser, Subcommand};
use hawq_backup::error::EXIT_CONFIG_ERROR;
use hawq_backup::{
    health_check, AutoConfirm, BackupCoordinator, BackupId, BackupJob, ConfirmationGate,
    FilterOptions, FilterSet, HdbError, JobContext, JobReport, NoProgress, PhaseOutcome,
    PhaseSelection, ProgressReporter, RestoreCoordinator, RestoreJob, RestoreSelection, Settings,
    TableStatus,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use prompt::TerminalGate;
use reporter::{JsonProgress, TextProgress};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "hawq-backup")]
#[command(about = "Backup and restore HAWQ/HDB databases to HDFS through PXF")]
#[command(version)]
struct Cli {
    /// Path to YAML settings file (read only when present)
    #[arg(short, long, global = true, default_value = "hawq-backup.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long, global = true)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print progress updates as JSON lines to stderr
    #[arg(long, global = true)]
    progress_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a database's schema and table data to HDFS
    #[command(disable_help_flag = true)]
    Backup(BackupArgs),

    /// Restore a backup from HDFS
    #[command(disable_help_flag = true)]
    Restore(RestoreArgs),

    /// Test the database connection and the required programs
    #[command(disable_help_flag = true)]
    Check(CheckArgs),
}

/// Connection flags shared by every subcommand. `-h` is the host, as in psql.
#[derive(Args)]
struct ConnectionArgs {
    /// Database host
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Database port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Database user
    #[arg(short = 'U', long)]
    username: Option<String>,

    /// Database password
    #[arg(short = 'w', long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

impl ConnectionArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(ref host) = self.host {
            settings.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.connection.port = port;
        }
        if let Some(ref user) = self.username {
            settings.connection.user = user.clone();
        }
        if let Some(ref password) = self.password {
            settings.connection.password = Some(password.clone());
        }
    }
}

#[derive(Args)]
struct BackupArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Database to back up
    #[arg(short = 'd', long)]
    database: String,

    /// Back up only these schemas (repeatable, comma lists allowed)
    #[arg(short = 's', long = "schema", value_name = "SCHEMA")]
    schemas: Vec<String>,

    /// Back up only these tables as schema.table (repeatable, comma lists allowed)
    #[arg(short = 't', long = "table", value_name = "TABLE")]
    tables: Vec<String>,

    /// Skip these tables
    #[arg(long = "exclude-table", value_name = "TABLE")]
    exclude_tables: Vec<String>,

    /// Skip these schemas
    #[arg(long = "exclude-schema", value_name = "SCHEMA")]
    exclude_schemas: Vec<String>,

    /// Back up metadata only
    #[arg(long)]
    schema_only: bool,

    /// Back up table data only
    #[arg(long)]
    data_only: bool,

    /// Dump roles and tablespaces even when a filter is active
    #[arg(long)]
    global_dump: bool,

    /// Emit DROP statements before CREATE in the schema dump
    #[arg(long)]
    clean: bool,

    /// Leave GRANT/REVOKE out of the schema dump
    #[arg(long)]
    no_privileges: bool,

    /// Include CREATE DATABASE in the schema dump
    #[arg(long)]
    create: bool,

    /// Log metadata dump failures and continue
    #[arg(long)]
    ignore_error: bool,

    /// Drop a leftover bridge schema instead of failing
    #[arg(short = 'F', long)]
    force: bool,

    /// Tables transferred in parallel
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

impl BackupArgs {
    fn to_job(&self) -> Result<BackupJob, HdbError> {
        let phases = PhaseSelection::from_flags(self.schema_only, self.data_only)?;
        let filter = FilterSet::from_options(&FilterOptions {
            tables: self.tables.clone(),
            schemas: self.schemas.clone(),
            exclude_tables: self.exclude_tables.clone(),
            exclude_schemas: self.exclude_schemas.clone(),
        })?;
        let mut job = BackupJob::new(self.database.clone(), filter, phases)?;
        job.global_dump = self.global_dump;
        job.clean = self.clean;
        job.no_privileges = self.no_privileges;
        job.create = self.create;
        job.ignore_error = self.ignore_error;
        job.force = self.force;
        job.no_prompt = self.yes;
        Ok(job)
    }
}

#[derive(Args)]
struct RestoreArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Database the backup was taken from
    #[arg(short = 'd', long)]
    database: String,

    /// Backup id (YYYYMMDDHHMMSS)
    #[arg(short = 'k', long)]
    backup_id: String,

    /// Restore into this database instead of the source database
    #[arg(long)]
    target_database: Option<String>,

    /// Restore metadata only
    #[arg(long)]
    schema_only: bool,

    /// Restore table data only
    #[arg(long)]
    data_only: bool,

    /// Write the archive's table of contents to this file and stop
    #[arg(long, value_name = "PATH")]
    output_to_file: Option<PathBuf>,

    /// Restore only the entries kept in this list file
    #[arg(long, value_name = "PATH")]
    input_file: Option<PathBuf>,

    /// Create the target database before restoring
    #[arg(long)]
    create_database: bool,

    /// Encoding of a created database
    #[arg(long, default_value = "UTF8")]
    encoding: String,

    /// Drop objects before recreating them
    #[arg(long)]
    clean: bool,

    /// Skip GRANT/REVOKE
    #[arg(long)]
    no_privileges: bool,

    /// Log metadata restore failures and continue
    #[arg(long)]
    ignore_error: bool,

    /// Drop a leftover bridge schema instead of failing
    #[arg(short = 'F', long)]
    force: bool,

    /// Tables transferred in parallel
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

impl RestoreArgs {
    fn to_job(&self) -> Result<RestoreJob, HdbError> {
        let backup_id = BackupId::parse(&self.backup_id)?;
        let selection = RestoreSelection::from_flags(
            self.schema_only,
            self.data_only,
            self.output_to_file.clone(),
            self.input_file.clone(),
        )?;
        if let RestoreSelection::UserList(ref path) = selection {
            if !path.is_file() {
                return Err(HdbError::Config(format!(
                    "List file not found: {}",
                    path.display()
                )));
            }
        }
        let mut job = RestoreJob::new(
            backup_id,
            self.database.clone(),
            self.target_database.clone(),
            selection,
        )?;
        job.create_database = self.create_database.then(|| self.encoding.clone());
        job.clean = self.clean;
        job.no_privileges = self.no_privileges;
        job.ignore_error = self.ignore_error;
        job.force = self.force;
        job.no_prompt = self.yes;
        job.validate()?;
        Ok(job)
    }
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Database to connect to (default: the maintenance database)
    #[arg(short = 'd', long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors are configuration errors; help and version are not errors.
            return if e.use_stderr() {
                ExitCode::from(EXIT_CONFIG_ERROR)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), HdbError> {
    let verbosity = if cli.quiet { "error" } else { cli.verbosity.as_str() };
    setup_logging(verbosity, &cli.log_format).map_err(HdbError::Config)?;

    let mut settings = Settings::load_or_default(&cli.config)?;

    match &cli.command {
        Commands::Backup(args) => {
            args.connection.apply(&mut settings);
            if let Some(workers) = args.workers {
                settings.execution.workers = workers;
            }
            settings.validate()?;
            let job = args.to_job()?;

            let ctx = job_context(&cli, settings, args.yes);
            let cancel_token = setup_signal_handler()?;
            info!("Starting backup of {}", job.database);
            let report = BackupCoordinator::new(job, ctx).run(cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::Restore(args) => {
            args.connection.apply(&mut settings);
            if let Some(workers) = args.workers {
                settings.execution.workers = workers;
            }
            settings.validate()?;
            let job = args.to_job()?;

            let ctx = job_context(&cli, settings, args.yes);
            let cancel_token = setup_signal_handler()?;
            info!(
                "Starting restore of backup {} into {}",
                job.backup_id, job.target_database
            );
            let report = RestoreCoordinator::new(job, ctx).run(cancel_token).await?;
            print_report(&report, cli.output_json)?;
        }

        Commands::Check(args) => {
            args.connection.apply(&mut settings);
            settings.validate()?;
            let database = args
                .database
                .clone()
                .unwrap_or_else(|| settings.connection.maintenance_database.clone());

            let ctx = JobContext::production(settings, Arc::new(AutoConfirm), Arc::new(NoProgress));
            let result = health_check(&ctx, &database).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Database {}: {} ({}ms)",
                    result.database,
                    if result.connected { "OK" } else { "FAILED" },
                    result.latency_ms
                );
                if let Some(ref err) = result.error {
                    println!("    Error: {}", err);
                }
                if result.missing_programs.is_empty() {
                    println!("  Programs: OK");
                } else {
                    println!("  Programs: missing {}", result.missing_programs.join(", "));
                }
                println!(
                    "  Backup base {}: {}",
                    ctx.settings.storage.backup_base,
                    if result.backup_base_present { "present" } else { "not created yet" }
                );
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.connected {
                return Err(HdbError::connectivity(
                    database,
                    result.error.unwrap_or_else(|| "health check failed".into()),
                ));
            }
            if !result.missing_programs.is_empty() {
                return Err(HdbError::command(
                    "which",
                    format!("not found on PATH: {}", result.missing_programs.join(", ")),
                ));
            }
        }
    }

    Ok(())
}

fn job_context(cli: &Cli, settings: Settings, yes: bool) -> JobContext {
    let gate: Arc<dyn ConfirmationGate> = if yes {
        Arc::new(AutoConfirm)
    } else {
        Arc::new(TerminalGate)
    };
    let progress: Arc<dyn ProgressReporter> = if cli.progress_json {
        Arc::new(JsonProgress)
    } else if cli.quiet || cli.output_json || !std::io::stderr().is_terminal() {
        Arc::new(NoProgress)
    } else {
        Arc::new(TextProgress)
    };
    JobContext::production(settings, gate, progress)
}

fn phase_label(outcome: &PhaseOutcome) -> String {
    match outcome {
        PhaseOutcome::Skipped => "skipped".to_string(),
        PhaseOutcome::Completed => "completed".to_string(),
        PhaseOutcome::Ignored { error } => format!("failed, ignored ({})", error),
    }
}

fn print_report(report: &JobReport, output_json: bool) -> Result<(), HdbError> {
    if output_json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    if let Some(ref path) = report.list_file {
        println!("\nTable of contents written to {}", path.display());
        println!("  Edit it and rerun with --input-file to restore a subset.");
        return Ok(());
    }

    let done = report
        .tables
        .iter()
        .filter(|t| t.status == TableStatus::Completed)
        .count();
    println!("\n{:?} completed!", report.job);
    println!("  Run ID: {}", report.run_id);
    println!("  Backup ID: {}", report.backup_id);
    println!("  Database: {}", report.database);
    println!("  Location: {}", report.paths.root);
    println!("  Metadata: {}", phase_label(&report.metadata));
    println!("  Global objects: {}", phase_label(&report.globals));
    println!("  Data: {}", phase_label(&report.data));
    println!("  Tables: {}/{}", done, report.tables.len());
    println!("  Rows: {}", report.rows_transferred);
    println!("  Duration: {:.2}s", report.duration_seconds);
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format '{}'", other)),
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM. Running transfers finish
/// or roll back; no new table is started.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, HdbError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Finishing running tables and cleaning up...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, HdbError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing running tables and cleaning up...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
