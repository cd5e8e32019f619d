//! Error types for DOS drive emulation.

use std::io;

use thiserror::Error;

/// Errors that can occur while serving DOS drive operations.
#[derive(Error, Debug)]
pub enum DosError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Operation not supported on path: {0}")]
    PathNotSupported(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid access mode: {0:#04X}")]
    InvalidAccessMode(u8),

    #[error("Path too long ({0} characters)")]
    PathTooLong(usize),

    #[error("Invalid drive: {0}")]
    InvalidDrive(char),

    #[error("Drive not mounted: {0}")]
    DriveNotMounted(char),

    #[error("Invalid mount: {0}")]
    InvalidMount(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DosError {
    /// Map a host I/O error onto the drive error taxonomy.
    pub fn from_host(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => DosError::NotFound(name.to_string()),
            io::ErrorKind::PermissionDenied => DosError::AccessDenied(name.to_string()),
            io::ErrorKind::AlreadyExists => DosError::AlreadyExists(name.to_string()),
            _ => DosError::Io(err),
        }
    }

    /// True for the "nothing visible under this name" family.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DosError::NotFound(_) | DosError::PathNotFound(_))
    }
}

/// Result type for DOS drive operations.
pub type DosResult<T> = Result<T, DosError>;
