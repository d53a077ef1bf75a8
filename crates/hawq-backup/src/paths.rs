//! Backup identifiers and the HDFS directory layout.
//!
//! ```text
//! <base>/<backup_id>/<database>/metadata/hdb_dump_<backup_id>_ddl.dmp
//! <base>/<backup_id>/<database>/metadata/hdb_dump_<backup_id>_global.dmp
//! <base>/<backup_id>/<database>/metadata/hdb_dump_<backup_id>_manifest.json
//! <base>/<backup_id>/<database>/data/<schema>/<relation>/
//! ```

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::TableRef;
use crate::error::{HdbError, Result};

const BACKUP_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Timestamp-derived backup identifier (`YYYYMMDDHHMMSS`, UTC).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupId(String);

impl BackupId {
    /// Derive an id from a point in time, truncated to the second.
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format(BACKUP_ID_FORMAT).to_string())
    }

    /// Parse and validate an id supplied by the operator.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.len() != 14 || !input.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HdbError::Config(format!(
                "Backup id must be 14 digits (YYYYMMDDHHMMSS), got '{}'",
                input
            )));
        }
        NaiveDateTime::parse_from_str(input, BACKUP_ID_FORMAT).map_err(|e| {
            HdbError::Config(format!("Backup id '{}' is not a valid timestamp: {}", input, e))
        })?;
        Ok(Self(input.to_string()))
    }

    /// The id one second later, used to step past an existing backup.
    pub fn next(&self) -> Self {
        match NaiveDateTime::parse_from_str(&self.0, BACKUP_ID_FORMAT) {
            Ok(ts) => Self::from_timestamp((ts + Duration::seconds(1)).and_utc()),
            Err(_) => self.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BackupId {
    type Error = HdbError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BackupId> for String {
    fn from(id: BackupId) -> Self {
        id.0
    }
}

/// Resolved directories and files of one backup of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPaths {
    pub backup_id: BackupId,
    pub database: String,
    /// `<base>/<backup_id>/<database>`
    pub root: String,
    pub metadata_dir: String,
    pub data_dir: String,
}

impl BackupPaths {
    /// Map (base, backup id, database) to the backup's directories. Pure.
    pub fn resolve(base: &str, backup_id: &BackupId, database: &str) -> Self {
        let base = base.trim_end_matches('/');
        let root = format!("{}/{}/{}", base, backup_id, database);
        Self {
            backup_id: backup_id.clone(),
            database: database.to_string(),
            metadata_dir: format!("{}/metadata", root),
            data_dir: format!("{}/data", root),
            root,
        }
    }

    /// Schema-only dump archive.
    pub fn ddl_file(&self) -> String {
        format!("{}/hdb_dump_{}_ddl.dmp", self.metadata_dir, self.backup_id)
    }

    /// Globals-only dump.
    pub fn global_file(&self) -> String {
        format!("{}/hdb_dump_{}_global.dmp", self.metadata_dir, self.backup_id)
    }

    /// Completion manifest written at the end of a successful backup.
    pub fn manifest_file(&self) -> String {
        format!("{}/hdb_dump_{}_manifest.json", self.metadata_dir, self.backup_id)
    }

    /// Directory PXF writes one table's rows into.
    pub fn table_data_dir(&self, table: &TableRef) -> String {
        format!("{}/{}/{}", self.data_dir, table.schema, table.relation)
    }
}
