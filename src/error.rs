use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Connection error: {0}")]
    ConnectionError(String), // Store unreachable or misconfigured, fatal before any stage

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Plan error: {0}")]
    PlanError(String),

    #[error("Migration cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into MigrateError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl MigrateError {
    /// Short taxonomy name used in stage narratives and JSON outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::ConnectionError(_) => "ConnectionError",
            MigrateError::SchemaError(_) => "SchemaError",
            MigrateError::MigrationError(_) => "MigrationError",
            MigrateError::ValidationError(_) => "ValidationError",
            MigrateError::BackupError(_) => "BackupError",
            MigrateError::ConfigError(_) => "ConfigError",
            MigrateError::PlanError(_) => "PlanError",
            MigrateError::Cancelled(_) => "Cancelled",
            MigrateError::IoError(_) => "IoError",
            MigrateError::DatabaseError(_) => "DatabaseError",
            MigrateError::Error(_) => "Error",
        }
    }
}
