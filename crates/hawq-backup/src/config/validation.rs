//! Settings validation.

use super::Settings;
use crate::core::identifier::validate_identifier;
use crate::db::tls::SslMode;
use crate::error::{HdbError, Result};

/// Validate the settings.
pub fn validate(settings: &Settings) -> Result<()> {
    if settings.connection.host.is_empty() {
        return Err(HdbError::Config("connection.host is required".into()));
    }
    if settings.connection.user.is_empty() {
        return Err(HdbError::Config("connection.user is required".into()));
    }
    if settings.connection.port == 0 {
        return Err(HdbError::Config("connection.port must be non-zero".into()));
    }
    SslMode::parse(&settings.connection.ssl_mode)?;
    if settings.connection.maintenance_database.is_empty() {
        return Err(HdbError::Config(
            "connection.maintenance_database is required".into(),
        ));
    }

    let base = &settings.storage.backup_base;
    if !base.starts_with('/') {
        return Err(HdbError::Config(format!(
            "storage.backup_base must be an absolute HDFS path, got '{}'",
            base
        )));
    }
    if base.contains('\'') || base.contains('?') {
        return Err(HdbError::Config(format!(
            "storage.backup_base contains characters not allowed in a PXF location: '{}'",
            base
        )));
    }
    if settings.storage.hdfs_command.is_empty() {
        return Err(HdbError::Config("storage.hdfs_command is required".into()));
    }

    if settings.bridge.pxf_host.is_empty() {
        return Err(HdbError::Config("bridge.pxf_host is required".into()));
    }
    if settings.bridge.pxf_port == 0 {
        return Err(HdbError::Config("bridge.pxf_port must be non-zero".into()));
    }
    validate_identifier(&settings.bridge.backup_schema)?;
    validate_identifier(&settings.bridge.restore_schema)?;

    if settings.execution.workers == 0 {
        return Err(HdbError::Config(
            "execution.workers must be at least 1".into(),
        ));
    }

    Ok(())
}
