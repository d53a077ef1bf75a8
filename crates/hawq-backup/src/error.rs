//! Error types for backup and restore jobs.

use thiserror::Error;

/// Main error type for backup and restore operations.
#[derive(Error, Debug)]
pub enum HdbError {
    /// Configuration error (invalid YAML, conflicting options, bad identifiers)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cannot reach the database
    #[error("Cannot connect to database {database}: {message}")]
    Connectivity { database: String, message: String },

    /// A table or schema filter did not fully resolve against the catalog
    #[error("{kind} filter did not resolve: expected {expected}, found {found} (missing: {})", .missing.join(", "))]
    FilterResolution {
        kind: &'static str,
        expected: usize,
        found: usize,
        missing: Vec<String>,
    },

    /// A bridge schema left behind by a previous run is still present
    #[error("Schema {0} already exists; rerun with --force to drop it or drop it manually")]
    BridgeSchemaConflict(String),

    /// Two distinct tables map to the same bridge table name
    #[error("Bridge table name {name} is shared by {first} and {second}")]
    BridgeNamingCollision {
        name: String,
        first: String,
        second: String,
    },

    /// An external program exited non-zero or wrote to stderr
    #[error("Command \"{command}\" failed: {message}")]
    ExternalCommand { command: String, message: String },

    /// One or more tables failed to transfer
    #[error("Transfer failed for table(s) {tables}: {message}")]
    PartialTransfer { tables: String, message: String },

    /// The backup directory tree does not look like a usable backup
    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// IO error (file operations, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operator declined the confirmation prompt
    #[error("Aborted by user")]
    Aborted,

    /// Job was cancelled (SIGINT, etc.)
    #[error("Job cancelled")]
    Cancelled,
}

pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CONNECTIVITY_ERROR: u8 = 2;
pub const EXIT_FILTER_ERROR: u8 = 3;
pub const EXIT_BRIDGE_ERROR: u8 = 4;
pub const EXIT_COMMAND_ERROR: u8 = 5;
pub const EXIT_TRANSFER_ERROR: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;
pub const EXIT_ABORTED: u8 = 8;
pub const EXIT_CANCELLED: u8 = 130;

impl HdbError {
    /// Create a Connectivity error
    pub fn connectivity(database: impl Into<String>, message: impl ToString) -> Self {
        HdbError::Connectivity {
            database: database.into(),
            message: message.to_string(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        HdbError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an ExternalCommand error
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        HdbError::ExternalCommand {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a PartialTransfer error
    pub fn transfer(tables: impl Into<String>, message: impl Into<String>) -> Self {
        HdbError::PartialTransfer {
            tables: tables.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            HdbError::Config(_) | HdbError::Yaml(_) | HdbError::Json(_) => EXIT_CONFIG_ERROR,
            HdbError::Connectivity { .. } | HdbError::Pool { .. } | HdbError::Database(_) => {
                EXIT_CONNECTIVITY_ERROR
            }
            HdbError::FilterResolution { .. } | HdbError::InvalidBackup(_) => EXIT_FILTER_ERROR,
            HdbError::BridgeSchemaConflict(_) | HdbError::BridgeNamingCollision { .. } => {
                EXIT_BRIDGE_ERROR
            }
            HdbError::ExternalCommand { .. } => EXIT_COMMAND_ERROR,
            HdbError::PartialTransfer { .. } => EXIT_TRANSFER_ERROR,
            HdbError::Io(_) => EXIT_IO_ERROR,
            HdbError::Aborted => EXIT_ABORTED,
            HdbError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for backup and restore operations.
pub type Result<T> = std::result::Result<T, HdbError>;
