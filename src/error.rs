use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Modifier error: {0}")]
    Modifier(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Status document error: {0}")]
    Status(String),

    #[error("Another instance of tlm-backup is running")]
    LockBusy,

    #[error("Deadline of {0} seconds exceeded")]
    DeadlineExceeded(u64),

    #[error("Backup run cancelled")]
    Cancelled,
}

impl BackupError {
    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::LockBusy => 2,
            BackupError::DeadlineExceeded(_) => 3,
            BackupError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<mysql_async::Error> for BackupError {
    fn from(err: mysql_async::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
