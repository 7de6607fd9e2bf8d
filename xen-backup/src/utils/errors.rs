//! Custom error types for backup and restore operations.

use crate::xapi::XapiError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Management API error: {0}")]
    Protocol(#[from] XapiError),

    #[error("No disk in slot {slot} of {generation}")]
    DiskSlotNotFound { slot: String, generation: String },

    #[error("No full backup to diff against for vm {0}")]
    NoFullBackup(String),

    #[error("Backup set not found: {0}")]
    SetNotFound(String),

    #[error("Backup set already exists: {0}")]
    SetExists(String),

    #[error("Metadata file not found: {}", .0.display())]
    MetadataMissing(PathBuf),

    #[error("Malformed metadata in {}: {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Disk image not found: {}", .0.display())]
    ImageMissing(PathBuf),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task {task} ended with status {status}")]
    TaskFailed { task: String, status: String },

    #[error("Invalid endpoint selection: {0}")]
    InvalidEndpoint(String),

    #[error("No reachable endpoint: {0}")]
    NoEndpoint(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
