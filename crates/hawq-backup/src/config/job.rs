//! Job configuration: one tagged type per job kind.
//!
//! Mutually exclusive options are represented as enums, so a constructed job
//! can never carry both `schema_only` and `data_only`, or both a table and a
//! schema inclusion list. Validation happens in the constructors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::{parse_identifier, parse_schema_names, parse_table_names, split_list, TableRef};
use crate::error::{HdbError, Result};
use crate::paths::BackupId;

/// Which relations a job covers, before exclusions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "names")]
pub enum Inclusion {
    /// Every eligible user table.
    #[default]
    All,
    /// Only these tables.
    Tables(Vec<TableRef>),
    /// Only tables in these schemas.
    Schemas(Vec<String>),
}

/// Raw filter options as typed by the operator.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub tables: Vec<String>,
    pub schemas: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub exclude_schemas: Vec<String>,
}

/// Validated include/exclude filter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSet {
    pub include: Inclusion,
    #[serde(default)]
    pub exclude_tables: Vec<TableRef>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
}

impl FilterSet {
    /// Parse and validate raw filter options.
    pub fn from_options(options: &FilterOptions) -> Result<Self> {
        if !options.tables.is_empty() && !options.schemas.is_empty() {
            return Err(HdbError::Config(
                "--table and --schema cannot be used together".into(),
            ));
        }

        let tables = flatten(&options.tables);
        let schemas = flatten(&options.schemas);
        let include = if !tables.is_empty() {
            Inclusion::Tables(dedup(parse_table_names(&tables)?))
        } else if !schemas.is_empty() {
            Inclusion::Schemas(dedup(parse_schema_names(&schemas)?))
        } else {
            Inclusion::All
        };

        Ok(Self {
            include,
            exclude_tables: dedup(parse_table_names(&flatten(&options.exclude_tables))?),
            exclude_schemas: dedup(parse_schema_names(&flatten(&options.exclude_schemas))?),
        })
    }

    /// True when no include or exclude filter is active.
    pub fn is_whole_database(&self) -> bool {
        matches!(self.include, Inclusion::All)
            && self.exclude_tables.is_empty()
            && self.exclude_schemas.is_empty()
    }
}

/// Split comma lists (`s.a,s.b`) given to a single flag.
fn flatten(items: &[String]) -> Vec<String> {
    items.iter().flat_map(|item| split_list(item)).collect()
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Which phases a backup runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSelection {
    #[default]
    Both,
    SchemaOnly,
    DataOnly,
}

impl PhaseSelection {
    /// Build from the two CLI flags, rejecting the combination.
    pub fn from_flags(schema_only: bool, data_only: bool) -> Result<Self> {
        match (schema_only, data_only) {
            (true, true) => Err(HdbError::Config(
                "--schema-only and --data-only cannot be used together".into(),
            )),
            (true, false) => Ok(Self::SchemaOnly),
            (false, true) => Ok(Self::DataOnly),
            (false, false) => Ok(Self::Both),
        }
    }

    pub fn includes_metadata(&self) -> bool {
        !matches!(self, Self::DataOnly)
    }

    pub fn includes_data(&self) -> bool {
        !matches!(self, Self::SchemaOnly)
    }
}

/// Backup job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    /// Database to back up.
    pub database: String,

    /// Table selection.
    pub filter: FilterSet,

    /// Phases to run.
    pub phases: PhaseSelection,

    /// Also dump global objects when a filter is active.
    pub global_dump: bool,

    /// Emit DROP statements before CREATE in the dump.
    pub clean: bool,

    /// Omit GRANT/REVOKE from the dump.
    pub no_privileges: bool,

    /// Include CREATE DATABASE in the dump.
    pub create: bool,

    /// Log metadata-phase command failures instead of aborting.
    pub ignore_error: bool,

    /// Drop a stale bridge schema instead of failing.
    pub force: bool,

    /// Skip the confirmation prompt.
    pub no_prompt: bool,
}

impl BackupJob {
    /// Create a backup job with default options.
    pub fn new(database: impl Into<String>, filter: FilterSet, phases: PhaseSelection) -> Result<Self> {
        let database = database.into();
        parse_identifier(&database)?;
        Ok(Self {
            database,
            filter,
            phases,
            global_dump: false,
            clean: false,
            no_privileges: false,
            create: false,
            ignore_error: false,
            force: false,
            no_prompt: false,
        })
    }

    /// Whether the globals-only dump runs for this job.
    pub fn wants_global_dump(&self) -> bool {
        self.global_dump || self.filter.is_whole_database()
    }
}

/// What a restore does.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "path")]
pub enum RestoreSelection {
    /// Metadata, globals and data.
    #[default]
    Full,
    /// Metadata and globals only.
    SchemaOnly,
    /// Data only; the target objects must already exist.
    DataOnly,
    /// Write the archive's table of contents to this file and stop.
    GenerateList(PathBuf),
    /// Restore only the entries kept in this (edited) list file.
    UserList(PathBuf),
}

impl RestoreSelection {
    /// Build from the CLI flags, rejecting conflicting combinations.
    pub fn from_flags(
        schema_only: bool,
        data_only: bool,
        output_list: Option<PathBuf>,
        input_list: Option<PathBuf>,
    ) -> Result<Self> {
        let phases = PhaseSelection::from_flags(schema_only, data_only)?;
        match (phases, output_list, input_list) {
            (_, Some(_), Some(_)) => Err(HdbError::Config(
                "--output-to-file and --input-file cannot be used together".into(),
            )),
            (PhaseSelection::Both, Some(path), None) => Ok(Self::GenerateList(path)),
            (PhaseSelection::Both, None, Some(path)) => Ok(Self::UserList(path)),
            (_, Some(_), None) | (_, None, Some(_)) => Err(HdbError::Config(
                "list files cannot be combined with --schema-only or --data-only".into(),
            )),
            (PhaseSelection::Both, None, None) => Ok(Self::Full),
            (PhaseSelection::SchemaOnly, None, None) => Ok(Self::SchemaOnly),
            (PhaseSelection::DataOnly, None, None) => Ok(Self::DataOnly),
        }
    }

    pub fn includes_metadata(&self) -> bool {
        !matches!(self, Self::DataOnly)
    }

    pub fn includes_data(&self) -> bool {
        matches!(self, Self::Full | Self::DataOnly | Self::UserList(_))
    }

    /// Globals are replayed unless a list mode narrows the restore.
    pub fn includes_globals(&self) -> bool {
        matches!(self, Self::Full | Self::SchemaOnly)
    }
}

/// Restore job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    /// Backup to restore.
    pub backup_id: BackupId,

    /// Database name the backup was taken from.
    pub source_database: String,

    /// Database to restore into.
    pub target_database: String,

    /// Restore mode.
    pub selection: RestoreSelection,

    /// Log metadata-phase command failures instead of aborting.
    pub ignore_error: bool,

    /// Create the target database with this encoding before restoring.
    pub create_database: Option<String>,

    /// Drop objects before recreating them.
    pub clean: bool,

    /// Skip GRANT/REVOKE.
    pub no_privileges: bool,

    /// Drop a stale bridge schema instead of failing.
    pub force: bool,

    /// Skip the confirmation prompt.
    pub no_prompt: bool,
}

impl RestoreJob {
    /// Create a restore job. The target defaults to the source database.
    pub fn new(
        backup_id: BackupId,
        source_database: impl Into<String>,
        target_database: Option<String>,
        selection: RestoreSelection,
    ) -> Result<Self> {
        let source_database = source_database.into();
        parse_identifier(&source_database)?;
        let target_database = match target_database {
            Some(name) if !name.trim().is_empty() => name,
            _ => source_database.clone(),
        };
        parse_identifier(&target_database)?;

        Ok(Self {
            backup_id,
            source_database,
            target_database,
            selection,
            ignore_error: false,
            create_database: None,
            clean: false,
            no_privileges: false,
            force: false,
            no_prompt: false,
        })
    }

    /// Reject option combinations the restore cannot honor.
    pub fn validate(&self) -> Result<()> {
        let creates_in_metadata = matches!(
            self.selection,
            RestoreSelection::Full | RestoreSelection::SchemaOnly | RestoreSelection::UserList(_)
        );
        if self.create_database.is_some() && !creates_in_metadata {
            return Err(HdbError::Config(
                "--create-database cannot be combined with --data-only or --output-to-file".into(),
            ));
        }
        Ok(())
    }
}

/// A validated job of either kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "job")]
pub enum JobConfig {
    Backup(BackupJob),
    Restore(RestoreJob),
}

impl JobConfig {
    /// Database the job connects to for its data phase.
    pub fn database(&self) -> &str {
        match self {
            JobConfig::Backup(job) => &job.database,
            JobConfig::Restore(job) => &job.target_database,
        }
    }
}
