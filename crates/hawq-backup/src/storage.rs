//! Backup storage on HDFS.
//!
//! The restore side learns what a backup holds by listing
//! `<data_dir>/<schema>/<relation>`. That listing is read back from a shell
//! tool and treated like operator input: every entry must sit exactly two
//! levels under the data directory and name valid identifiers. A completion
//! manifest written at the end of a successful backup is checked against it
//! when present.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::command::{CommandBuilder, CommandRunner};
use crate::config::PhaseSelection;
use crate::core::TableRef;
use crate::error::{HdbError, Result};
use crate::paths::BackupId;

/// Manifest format written by this version.
pub const MANIFEST_VERSION: u32 = 1;

/// Access to the backup tree.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn make_dirs(&self, path: &str) -> Result<()>;

    /// Create `path` under an existing parent. `false` when it already exists.
    async fn create_dir(&self, path: &str) -> Result<bool>;

    /// Raw directory entries two levels under `data_dir`.
    async fn list_table_dirs(&self, data_dir: &str) -> Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;
}

/// [`BackupStore`] that shells out to `hdfs dfs`.
pub struct HdfsStore {
    runner: Arc<dyn CommandRunner>,
    commands: CommandBuilder,
}

impl HdfsStore {
    pub fn new(runner: Arc<dyn CommandRunner>, commands: CommandBuilder) -> Self {
        Self { runner, commands }
    }
}

#[async_trait]
impl BackupStore for HdfsStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        self.runner
            .status(&self.commands.hdfs_test_exists(path))
            .await
    }

    async fn make_dirs(&self, path: &str) -> Result<()> {
        self.runner
            .capture(&self.commands.hdfs_mkdir(path))
            .await
            .map(|_| ())
    }

    async fn create_dir(&self, path: &str) -> Result<bool> {
        if self.runner.status(&self.commands.hdfs_create_dir(path)).await? {
            return Ok(true);
        }
        if self.exists(path).await? {
            return Ok(false);
        }
        Err(HdbError::command(
            self.commands.hdfs_create_dir(path).to_string(),
            "could not create directory",
        ))
    }

    async fn list_table_dirs(&self, data_dir: &str) -> Result<Vec<String>> {
        if !self.exists(data_dir).await? {
            warn!("Data directory {} does not exist", data_dir);
            return Ok(Vec::new());
        }
        let output = self
            .runner
            .capture(&self.commands.hdfs_list_two_levels(data_dir))
            .await?;
        Ok(parse_ls_directories(&output))
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        self.runner.capture(&self.commands.hdfs_cat(path)).await
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        self.runner
            .feed(&self.commands.hdfs_put(path), contents.as_bytes().to_vec())
            .await
    }
}

/// Directory paths from `hdfs dfs -ls` output.
///
/// Lines look like
/// `drwxr-xr-x   - hdfs supergroup          0 2024-01-01 12:00 /path`;
/// the path is everything after the seventh field, so spaces survive.
pub fn parse_ls_directories(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with('d'))
        .filter_map(|line| {
            let mut rest = line;
            for _ in 0..7 {
                rest = rest.trim_start();
                let end = rest.find(char::is_whitespace)?;
                rest = &rest[end..];
            }
            let path = rest.trim();
            if path.is_empty() {
                None
            } else {
                Some(path.to_string())
            }
        })
        .collect()
}

/// Validate listed directories and turn them into tables, in listing order.
pub fn tables_from_listing(data_dir: &str, entries: &[String]) -> Result<Vec<TableRef>> {
    let prefix = format!("{}/", data_dir.trim_end_matches('/'));
    let mut tables: Vec<TableRef> = Vec::with_capacity(entries.len());

    for entry in entries {
        // Fully qualified listings carry a scheme and authority.
        let path = match entry.find("://") {
            Some(i) => entry[i + 3..]
                .find('/')
                .map(|j| &entry[i + 3 + j..])
                .unwrap_or(""),
            None => entry.as_str(),
        };
        let rest = path.strip_prefix(&prefix).ok_or_else(|| {
            HdbError::InvalidBackup(format!("{} is outside {}", entry, data_dir))
        })?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
            return Err(HdbError::InvalidBackup(format!(
                "{} is not a <schema>/<relation> directory",
                entry
            )));
        }
        let table = TableRef::new(parts[0], parts[1])
            .map_err(|e| HdbError::InvalidBackup(format!("{}: {}", entry, e)))?;
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    debug!("Backup data directory lists {} table(s)", tables.len());
    Ok(tables)
}

/// Written last by a successful backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub backup_id: BackupId,
    pub database: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub phases: PhaseSelection,
    pub global_dump: bool,
    pub tables: Vec<TableRef>,
    /// Fingerprint of the job that produced the backup.
    pub job_fingerprint: String,
}

impl BackupManifest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| HdbError::InvalidBackup(format!("unreadable manifest: {}", e)))?;
        if manifest.version > MANIFEST_VERSION {
            return Err(HdbError::InvalidBackup(format!(
                "manifest version {} is newer than supported version {}",
                manifest.version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Listed tables must all be recorded. Recorded tables without a
    /// directory only warn, since an empty table may leave none.
    pub fn check_listing(&self, listed: &[TableRef]) -> Result<()> {
        let unknown: Vec<String> = listed
            .iter()
            .filter(|t| !self.tables.contains(t))
            .map(|t| t.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(HdbError::InvalidBackup(format!(
                "data directory holds tables not recorded in the manifest: {}",
                unknown.join(", ")
            )));
        }
        for table in self.tables.iter().filter(|t| !listed.contains(t)) {
            warn!("{} is recorded in the manifest but has no data directory", table);
        }
        Ok(())
    }
}
