use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriveCatError {
    #[error("Error: {0}")]
    Error(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Could not open catalog database: {0}")]
    StoreOpen(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error), // Converts io::Error into DriveCatError automatically

    #[error("Database error: {0}")]
    Database(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Scan cancelled")]
    ScanCancelled,
}

impl DriveCatError {
    /// True for database failures that `Database::recover` has a chance of
    /// repairing (torn pages, missing FTS shadow tables). Constraint
    /// violations and other logic errors are not in this class.
    pub fn is_recoverable_corruption(&self) -> bool {
        match self {
            DriveCatError::Database(RusqliteError::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }

    /// Short class name used in user-facing failure notifications.
    pub fn class(&self) -> &'static str {
        match self {
            DriveCatError::Error(_) => "error",
            DriveCatError::Config(_) => "configuration",
            DriveCatError::StoreOpen(_) => "database open",
            DriveCatError::Io(_) => "filesystem",
            DriveCatError::Database(_) => "database",
            DriveCatError::Pool(_) => "database",
            DriveCatError::Watch(_) => "change stream",
            DriveCatError::Image(_) => "thumbnail",
            DriveCatError::ScanCancelled => "cancelled",
        }
    }
}
