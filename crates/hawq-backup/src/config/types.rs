//! Settings file types.
//!
//! Every section is optional in the YAML file; missing values fall back to
//! the defaults the HAWQ tooling has always used.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root settings structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Database connection parameters.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Where backups live on HDFS and how to reach it.
    #[serde(default)]
    pub storage: StorageConfig,

    /// PXF bridge table settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Worker pool and failure handling.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Database connection parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host (default: "localhost").
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username (default: "gpadmin").
    #[serde(default = "default_user")]
    pub user: String,

    /// Password. Also exported as PGPASSWORD to the dump/restore programs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "disable").
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Database used for CREATE DATABASE and health checks (default: "template1").
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("ssl_mode", &self.ssl_mode)
            .field("maintenance_database", &self.maintenance_database)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            ssl_mode: default_ssl_mode(),
            maintenance_database: default_maintenance_database(),
        }
    }
}

/// HDFS storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory of all backups (default: "/hawq_backup").
    #[serde(default = "default_backup_base")]
    pub backup_base: String,

    /// Run `hdfs` through `sudo -u <user>` (default: "hdfs"). Empty disables sudo.
    #[serde(default = "default_hdfs_user")]
    pub hdfs_user: String,

    /// The hdfs client executable (default: "hdfs").
    #[serde(default = "default_hdfs_command")]
    pub hdfs_command: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_base: default_backup_base(),
            hdfs_user: default_hdfs_user(),
            hdfs_command: default_hdfs_command(),
        }
    }
}

/// PXF bridge table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host PXF listens on, as seen from the segments (default: "localhost").
    #[serde(default = "default_host")]
    pub pxf_host: String,

    /// PXF port (default: 51200).
    #[serde(default = "default_pxf_port")]
    pub pxf_port: u16,

    /// Schema holding writable bridge tables during backup.
    #[serde(default = "default_backup_schema")]
    pub backup_schema: String,

    /// Schema holding readable bridge tables during restore.
    #[serde(default = "default_restore_schema")]
    pub restore_schema: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pxf_host: default_host(),
            pxf_port: default_pxf_port(),
            backup_schema: default_backup_schema(),
            restore_schema: default_restore_schema(),
        }
    }
}

/// What to do when a single table fails to transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling new tables after the first failure.
    #[default]
    FailFast,
    /// Transfer every table and report all failures at the end.
    Continue,
}

/// Worker pool and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Concurrent table transfers (default: 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-table failure policy (default: fail_fast).
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Refuse to restore a backup that has no completion manifest.
    #[serde(default)]
    pub require_manifest: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            failure_policy: FailurePolicy::default(),
            require_manifest: false,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "gpadmin".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_maintenance_database() -> String {
    "template1".to_string()
}

fn default_backup_base() -> String {
    "/hawq_backup".to_string()
}

fn default_hdfs_user() -> String {
    "hdfs".to_string()
}

fn default_hdfs_command() -> String {
    "hdfs".to_string()
}

fn default_pxf_port() -> u16 {
    51200
}

fn default_backup_schema() -> String {
    "hawqbackup_schema".to_string()
}

fn default_restore_schema() -> String {
    "hawqrestore_schema".to_string()
}

fn default_workers() -> usize {
    1
}
